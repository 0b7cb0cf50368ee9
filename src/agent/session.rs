//! Agent side of one job-transfer connection.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::executor::JobExecutor;
use crate::agent::heartbeat::Heartbeat;
use crate::config::AgentConfig;
use crate::error::{HerdError, JobExecutionError, ProtocolError};
use crate::protocol::{EndStatus, JobEnd, JobFile, JobQuery, MessageStream, Record};

/// How a session ended, reported to the agent control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The dispatcher released the reservation with `<Free>`.
    Released,
    /// No valid job query arrived.
    Aborted(String),
    /// A job ran (or failed to start) and its end record was produced.
    Finished { job: String, status: EndStatus },
}

/// Serves a single connection: receive the query, run it, stream results.
#[derive(Debug, Clone)]
pub struct JobSession {
    config: Arc<AgentConfig>,
    executor: JobExecutor,
}

impl JobSession {
    pub fn new(config: Arc<AgentConfig>, executor: JobExecutor) -> Self {
        Self { config, executor }
    }

    pub async fn run<S>(&self, io: S, peer: SocketAddr, cancel: CancellationToken) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = MessageStream::new(io);

        let query = match stream.recv_record(self.config.io_timeout).await {
            Ok(Some(Record::Job(query))) => query,
            Ok(Some(Record::Free)) => {
                tracing::info!(peer = %peer, "Reservation released by dispatcher");
                return SessionEnd::Released;
            }
            Ok(Some(other)) => {
                let error = ProtocolError::UnexpectedTag {
                    expected: "Job".to_string(),
                    got: other.tag().to_string(),
                };
                tracing::warn!(peer = %peer, error = %error, "Invalid first record");
                return SessionEnd::Aborted(error.to_string());
            }
            Ok(None) => {
                tracing::warn!(peer = %peer, "Connection closed before a job query arrived");
                return SessionEnd::Aborted("connection closed".to_string());
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Failed to read job query");
                return SessionEnd::Aborted(e.to_string());
            }
        };

        let job = query.name.clone();
        if let Err(e) = stream.send_record(&Record::Ack(job.clone())).await {
            tracing::warn!(peer = %peer, job = %job, error = %e, "Failed to acknowledge job");
            return SessionEnd::Aborted(e.to_string());
        }

        let job_id = Uuid::new_v4();
        let workdir = self.config.scratch_root.join(job_id.to_string());
        let status = match self
            .execute(&mut stream, &query, job_id, &workdir, cancel, peer)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(peer = %peer, job = %job, error = %e, "Job transfer failed");
                EndStatus::Error
            }
        };

        if !self.config.keep_scratch {
            if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(workdir = %workdir.display(), error = %e, "Failed to remove job directory");
                }
            }
        }

        SessionEnd::Finished { job, status }
    }

    async fn execute<S>(
        &self,
        stream: &mut MessageStream<S>,
        query: &JobQuery,
        job_id: Uuid,
        workdir: &Path,
        cancel: CancellationToken,
        peer: SocketAddr,
    ) -> Result<EndStatus, HerdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let program = match prepare_workspace(workdir, query).await {
            Ok(program) => program,
            Err(e) => {
                let end = JobEnd::error(e.to_string());
                stream.send_record(&Record::End(end)).await?;
                return Ok(EndStatus::Error);
            }
        };

        let mut args = query.args.clone();
        args.push(query.config.path.clone());

        let exec = self
            .executor
            .execute(job_id, &program, &args, workdir, cancel.clone());
        tokio::pin!(exec);

        let mut heartbeat = Heartbeat::new(self.config.heartbeat_interval).ticker();
        let mut peer_open = true;
        let result = loop {
            tokio::select! {
                result = &mut exec => break result,
                _ = heartbeat.tick(), if peer_open => {
                    if let Err(e) = stream.send_record(&Record::Alive).await {
                        tracing::warn!(peer = %peer, error = %e, "Dispatcher unreachable, cancelling job");
                        peer_open = false;
                        cancel.cancel();
                    }
                }
                incoming = stream.read_next(), if peer_open => match incoming {
                    Ok(Some(msg)) => {
                        tracing::warn!(peer = %peer, tag = %msg.tag, "Protocol violation: record received while busy, ignoring");
                    }
                    Ok(None) | Err(_) => {
                        tracing::warn!(peer = %peer, "Dispatcher connection lost, cancelling job");
                        peer_open = false;
                        cancel.cancel();
                    }
                },
            }
        };

        if !peer_open {
            return Ok(result.status);
        }

        let end = match result.status {
            EndStatus::Completed => JobEnd::completed(),
            EndStatus::Cancelled => JobEnd::cancelled(),
            _ => JobEnd::error(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "job failed".to_string()),
            ),
        };
        stream.send_record(&Record::End(end)).await?;

        for output in &query.outputs {
            let path = workdir.join(output);
            match tokio::fs::read(&path).await {
                Ok(data) => {
                    stream
                        .send_record(&Record::File(JobFile::new(output.clone(), data)))
                        .await?;
                }
                Err(e) => {
                    tracing::debug!(output = %output, error = %e, "Declared output not produced");
                }
            }
        }

        Ok(result.status)
    }
}

/// Materialize the job directory. Returns the program to spawn.
async fn prepare_workspace(workdir: &Path, query: &JobQuery) -> Result<String, JobExecutionError> {
    let workspace_err = |e: std::io::Error| JobExecutionError::Workspace(e.to_string());

    tokio::fs::create_dir_all(workdir).await.map_err(workspace_err)?;
    write_file(workdir, &query.config).await.map_err(workspace_err)?;

    let mut program = query.exe.clone();
    for input in &query.inputs {
        let path = write_file(workdir, input).await.map_err(workspace_err)?;
        if input.path == query.exe {
            make_executable(&path).await.map_err(workspace_err)?;
            program = path.to_string_lossy().into_owned();
        }
    }
    Ok(program)
}

async fn write_file(workdir: &Path, file: &JobFile) -> std::io::Result<PathBuf> {
    let path = workdir.join(&file.path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &file.data).await?;
    Ok(path)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session(root: &Path) -> JobSession {
        let config = AgentConfig {
            io_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(50),
            ..AgentConfig::default()
        }
        .with_scratch_root(root);
        JobSession::new(Arc::new(config), JobExecutor::new())
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    fn shell_job(script: &str) -> JobQuery {
        JobQuery {
            name: "test-job".to_string(),
            exe: "/bin/sh".to_string(),
            args: Vec::new(),
            config: JobFile::new("run.sh", script),
            inputs: vec![JobFile::new("data/in.txt", "payload")],
            outputs: vec!["out.log".to_string(), "missing.log".to_string()],
        }
    }

    #[tokio::test]
    async fn runs_job_and_streams_outputs() {
        let root = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(1024);
        let session = session(root.path());
        let agent = tokio::spawn(async move {
            session
                .run(server, peer(), CancellationToken::new())
                .await
        });

        let mut dispatcher = MessageStream::new(client);
        dispatcher
            .send_record(&Record::from(shell_job("cat data/in.txt > out.log")))
            .await
            .unwrap();

        let idle = Duration::from_secs(5);
        let mut records = Vec::new();
        while let Some(record) = dispatcher.recv_record(idle).await.unwrap() {
            if record != Record::Alive {
                records.push(record);
            }
        }

        assert_eq!(records[0], Record::Ack("test-job".to_string()));
        assert_eq!(records[1], Record::End(JobEnd::completed()));
        assert_eq!(
            records[2],
            Record::File(JobFile::new("out.log", "payload"))
        );
        assert_eq!(records.len(), 3, "missing outputs are skipped");

        assert_eq!(
            agent.await.unwrap(),
            SessionEnd::Finished {
                job: "test-job".to_string(),
                status: EndStatus::Completed
            }
        );
        assert_eq!(
            std::fs::read_dir(root.path()).unwrap().count(),
            0,
            "job directory is removed"
        );
    }

    #[tokio::test]
    async fn failing_job_reports_error_with_diagnostic() {
        let root = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(1024);
        let session = session(root.path());
        tokio::spawn(async move { session.run(server, peer(), CancellationToken::new()).await });

        let mut dispatcher = MessageStream::new(client);
        dispatcher
            .send_record(&Record::from(shell_job("echo boom >&2; exit 4")))
            .await
            .unwrap();

        let idle = Duration::from_secs(5);
        let mut end = None;
        while let Some(record) = dispatcher.recv_record(idle).await.unwrap() {
            if let Record::End(e) = record {
                end = Some(e);
            }
        }
        let end = end.expect("end record");
        assert_eq!(end.status, EndStatus::Error);
        assert!(end.message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn free_record_releases_reservation() {
        let root = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64);
        let mut dispatcher = MessageStream::new(client);
        dispatcher.send_record(&Record::Free).await.unwrap();

        let end = session(root.path())
            .run(server, peer(), CancellationToken::new())
            .await;
        assert_eq!(end, SessionEnd::Released);
    }

    #[tokio::test]
    async fn unexpected_first_record_aborts() {
        let root = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64);
        let mut dispatcher = MessageStream::new(client);
        dispatcher.send_record(&Record::Alive).await.unwrap();

        let end = session(root.path())
            .run(server, peer(), CancellationToken::new())
            .await;
        assert!(matches!(end, SessionEnd::Aborted(_)));
    }

    #[tokio::test]
    async fn cancellation_kills_job_and_reports_cancelled() {
        let root = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let session = session(root.path());
        let token = cancel.clone();
        let agent = tokio::spawn(async move { session.run(server, peer(), token).await });

        let mut dispatcher = MessageStream::new(client);
        dispatcher
            .send_record(&Record::from(shell_job("exec sleep 30")))
            .await
            .unwrap();
        let idle = Duration::from_secs(5);
        assert!(matches!(
            dispatcher.recv_record(idle).await.unwrap(),
            Some(Record::Ack(_))
        ));

        cancel.cancel();

        let mut end = None;
        while let Some(record) = dispatcher.recv_record(idle).await.unwrap() {
            if let Record::End(e) = record {
                end = Some(e);
            }
        }
        assert_eq!(end, Some(JobEnd::cancelled()));
        assert!(matches!(
            agent.await.unwrap(),
            SessionEnd::Finished {
                status: EndStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn shipped_executable_is_resolved_in_job_directory() {
        let dir = tempfile::tempdir().unwrap();
        let query = JobQuery {
            name: "shipped".to_string(),
            exe: "bin/tool.sh".to_string(),
            args: Vec::new(),
            config: JobFile::new("cfg.txt", ""),
            inputs: vec![JobFile::new("bin/tool.sh", "#!/bin/sh\necho ok > out.log\n")],
            outputs: vec!["out.log".to_string()],
        };
        let program = prepare_workspace(dir.path(), &query).await.unwrap();
        assert_eq!(
            PathBuf::from(&program),
            dir.path().join("bin/tool.sh")
        );
        assert!(dir.path().join("cfg.txt").exists());
    }
}
