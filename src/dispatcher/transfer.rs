//! Dispatcher side of one job-transfer connection.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::batch::UnitId;
use crate::error::{ConnectionError, HerdError, ProtocolError, Result};
use crate::protocol::{EndStatus, JobEnd, JobFile, JobQuery, MessageStream, Record};

/// Everything needed to build the job query of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub exe: String,
    pub args: Vec<String>,
    /// File name of the configuration inside the job directory.
    pub config_name: String,
    pub config: String,
    /// Shipped inputs: path inside the job directory, path on disk.
    pub inputs: Vec<(String, PathBuf)>,
    pub outputs: Vec<String>,
    /// Where returned outputs are written.
    pub output_dir: PathBuf,
}

impl JobSpec {
    /// Read the input files and assemble the query.
    pub async fn to_query(&self) -> Result<JobQuery> {
        let mut inputs = Vec::with_capacity(self.inputs.len());
        for (relative, path) in &self.inputs {
            let data = tokio::fs::read(path).await?;
            inputs.push(JobFile::new(relative.clone(), data));
        }
        Ok(JobQuery {
            name: self.name.clone(),
            exe: self.exe.clone(),
            args: self.args.clone(),
            config: JobFile::new(self.config_name.clone(), self.config.clone()),
            inputs,
            outputs: self.outputs.clone(),
        })
    }
}

/// What the agent reported for a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub end: JobEnd,
    pub files: Vec<JobFile>,
}

/// Progress of a transfer, sent to the scheduler loop.
#[derive(Debug)]
pub enum TransferEvent {
    /// The agent acknowledged the job query.
    Accepted { agent: SocketAddr, unit: UnitId },
    Finished {
        agent: SocketAddr,
        unit: UnitId,
        outcome: Result<JobReport>,
    },
}

/// One dispatch attempt of a unit to an agent.
#[derive(Debug, Clone)]
pub struct JobTransfer {
    /// Identifies the agent in events (its discovery address).
    pub agent: SocketAddr,
    pub job_addr: SocketAddr,
    pub unit: UnitId,
    pub spec: JobSpec,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl JobTransfer {
    /// Run the transfer to completion and report it. Outputs of a completed
    /// job are written to the unit's directory before `Finished` is sent.
    pub async fn run(self, events: mpsc::Sender<TransferEvent>) {
        let outcome = match self.exchange(&events).await {
            Ok(report) if report.end.status == EndStatus::Completed => {
                write_outputs(&self.spec.output_dir, &report.files)
                    .await
                    .map(|()| report)
            }
            other => other,
        };

        if let Err(e) = &outcome {
            tracing::warn!(agent = %self.agent, unit = %self.unit, error = %e, "Job transfer failed");
        }
        let _ = events
            .send(TransferEvent::Finished {
                agent: self.agent,
                unit: self.unit,
                outcome,
            })
            .await;
    }

    async fn exchange(&self, events: &mpsc::Sender<TransferEvent>) -> Result<JobReport> {
        let query = self.spec.to_query().await?;
        let mut stream = MessageStream::new(connect(self.job_addr, self.connect_timeout).await?);

        tracing::info!(agent = %self.agent, unit = %self.unit, job = %query.name, "Sending job");
        stream.send_record(&Record::from(query)).await?;

        match stream.recv_record(self.io_timeout).await? {
            Some(Record::Ack(name)) => {
                tracing::debug!(agent = %self.agent, job = %name, "Job acknowledged");
                let _ = events
                    .send(TransferEvent::Accepted {
                        agent: self.agent,
                        unit: self.unit,
                    })
                    .await;
            }
            // A busy agent answers with an end record straight away.
            Some(Record::End(end)) => {
                return Ok(JobReport {
                    end,
                    files: Vec::new(),
                })
            }
            Some(other) => return Err(unexpected("Ack", &other)),
            None => return Err(ConnectionError::Closed.into()),
        }

        let end = loop {
            match stream.recv_record(self.io_timeout).await? {
                Some(Record::Alive) => continue,
                Some(Record::End(end)) => break end,
                Some(other) => return Err(unexpected("End", &other)),
                None => return Err(ConnectionError::Closed.into()),
            }
        };

        let mut files = Vec::new();
        while let Some(record) = stream.recv_record(self.io_timeout).await? {
            match record {
                Record::File(file) => files.push(file),
                Record::Alive => {}
                other => return Err(unexpected("File", &other)),
            }
        }

        tracing::info!(
            agent = %self.agent,
            unit = %self.unit,
            status = %end.status,
            files = files.len(),
            "Job transfer finished"
        );
        Ok(JobReport { end, files })
    }
}

/// Release a reservation without giving the agent a job.
pub async fn send_free(job_addr: SocketAddr, connect_timeout: Duration) -> Result<()> {
    let mut stream = MessageStream::new(connect(job_addr, connect_timeout).await?);
    stream.send_record(&Record::Free).await?;
    tracing::debug!(agent = %job_addr, "Reservation released");
    Ok(())
}

async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ConnectionError::Connect { addr, source }.into()),
        Err(_) => Err(ConnectionError::ConnectTimeout(addr).into()),
    }
}

fn unexpected(expected: &str, got: &Record) -> HerdError {
    ProtocolError::UnexpectedTag {
        expected: expected.to_string(),
        got: got.tag().to_string(),
    }
    .into()
}

/// Outputs land next to the unit's configuration, by file name only.
async fn write_outputs(dir: &Path, files: &[JobFile]) -> Result<()> {
    for file in files {
        let Some(name) = Path::new(&file.path).file_name() else {
            return Err(ProtocolError::UnsafePath(file.path.clone()).into());
        };
        tokio::fs::write(dir.join(name), &file.data).await?;
    }
    Ok(())
}
