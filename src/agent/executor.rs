use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobExecutionError;
use crate::protocol::EndStatus;

/// Result of job execution
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub status: EndStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Runs a job's executable as a child process.
///
/// The child runs with its working directory set to the job directory,
/// stdin closed and stdout/stderr captured. Cancellation is cooperative: the
/// token passed to [`execute`](Self::execute) is the only way to stop a
/// running child, and it kills the process.
#[derive(Debug, Clone, Default)]
pub struct JobExecutor {
    env: Vec<(String, String)>,
}

impl JobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra environment variable for every spawned job.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run `program args...` in `workdir` until it exits or `cancel` fires.
    pub async fn execute(
        &self,
        job_id: Uuid,
        program: &str,
        args: &[String],
        workdir: &Path,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        tracing::info!(job_id = %job_id, program, ?args, workdir = %workdir.display(), "Executing job");

        let spawned = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let error = JobExecutionError::Spawn {
                    program: program.to_string(),
                    reason: e.to_string(),
                };
                tracing::error!(job_id = %job_id, error = %error, "Job execution failed");
                return ExecutionResult {
                    job_id,
                    status: EndStatus::Error,
                    exit_code: None,
                    output: None,
                    error: Some(error.to_string()),
                };
            }
        };

        let mut stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let mut stderr = tokio::spawn(read_pipe(child.stderr.take()));

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let Some(waited) = waited else {
            if let Err(e) = child.start_kill() {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to kill job process");
            }
            let _ = child.wait().await;
            // Grandchildren may still hold the pipes open.
            stdout.abort();
            stderr.abort();
            return Self::cancelled(job_id);
        };

        // A background grandchild can keep the pipes open after the child
        // exited.
        let (stdout, stderr) = tokio::select! {
            (out, err) = async { tokio::join!(&mut stdout, &mut stderr) } => {
                (out.unwrap_or_default(), err.unwrap_or_default())
            }
            _ = cancel.cancelled() => {
                stdout.abort();
                stderr.abort();
                return Self::cancelled(job_id);
            }
        };
        Self::process_output(job_id, waited, stdout, stderr)
    }

    fn cancelled(job_id: Uuid) -> ExecutionResult {
        tracing::info!(job_id = %job_id, "Job cancelled");
        ExecutionResult {
            job_id,
            status: EndStatus::Cancelled,
            exit_code: None,
            output: None,
            error: None,
        }
    }

    fn process_output(
        job_id: Uuid,
        result: std::io::Result<std::process::ExitStatus>,
        stdout: String,
        stderr: String,
    ) -> ExecutionResult {
        match result {
            Ok(status) => {
                let exit_code = status.code();

                let (status, error) = if status.success() {
                    (EndStatus::Completed, None)
                } else {
                    let error = JobExecutionError::NonZeroExit {
                        code: exit_code,
                        stderr: stderr.trim_end().to_string(),
                    };
                    (EndStatus::Error, Some(error.to_string()))
                };

                tracing::info!(
                    job_id = %job_id,
                    status = %status,
                    exit_code = ?exit_code,
                    "Job finished"
                );

                ExecutionResult {
                    job_id,
                    status,
                    exit_code,
                    output: if stdout.is_empty() { None } else { Some(stdout) },
                    error,
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Waiting for job process failed");
                ExecutionResult {
                    job_id,
                    status: EndStatus::Error,
                    exit_code: None,
                    output: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}
