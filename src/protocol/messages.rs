//! Records of the job-transfer protocol.
//!
//! Dispatcher to agent: `<Job>` or `<Free>`. Agent to dispatcher: `<Ack>`,
//! any number of `<Alive>` heartbeats, one `<End>`, then one `<File>` per
//! produced output. The agent closes the connection after the last file.

use std::path::{Component, Path};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{HerdError, ProtocolError};
use crate::protocol::framing::{FramedMessage, MessageStream};

pub const TAG_JOB: &str = "Job";
pub const TAG_FREE: &str = "Free";
pub const TAG_ACK: &str = "Ack";
pub const TAG_ALIVE: &str = "Alive";
pub const TAG_END: &str = "End";
pub const TAG_FILE: &str = "File";

const TAG_NAME: &str = "Name";
const TAG_EXE: &str = "Exe";
const TAG_ARG: &str = "Arg";
const TAG_CONFIG: &str = "Config";
const TAG_INPUT: &str = "Input";
const TAG_OUTPUT: &str = "Output";
const TAG_PATH: &str = "Path";
const TAG_DATA: &str = "Data";
const TAG_STATUS: &str = "Status";
const TAG_MESSAGE: &str = "Message";

/// A file travelling with a job, addressed relative to the job directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFile {
    pub path: String,
    pub data: Vec<u8>,
}

impl JobFile {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }

    fn to_children(&self) -> [FramedMessage; 2] {
        [
            FramedMessage::text(TAG_PATH, &self.path),
            FramedMessage::raw(TAG_DATA, STANDARD.encode(&self.data)),
        ]
    }

    fn from_message(msg: &FramedMessage) -> Result<Self, ProtocolError> {
        let children = msg.children()?;
        let path = required_text(&msg.tag, &children, TAG_PATH)?;
        validate_relative_path(&path)?;
        let data = match find(&children, TAG_DATA) {
            Some(data) => STANDARD
                .decode(data.body.trim())
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?,
            None => Vec::new(),
        };
        Ok(Self { path, data })
    }
}

/// Everything an agent needs to run one experimental unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQuery {
    /// Display name, echoed back in `<Ack>`.
    pub name: String,
    /// Executable, either shipped in `inputs` or resolved on the agent.
    pub exe: String,
    pub args: Vec<String>,
    /// Serialized unit configuration; its path is passed as the last argument.
    pub config: JobFile,
    pub inputs: Vec<JobFile>,
    /// Relative paths the agent sends back after the job ends.
    pub outputs: Vec<String>,
}

impl JobQuery {
    fn to_message(&self) -> FramedMessage {
        let mut children = vec![
            FramedMessage::text(TAG_NAME, &self.name),
            FramedMessage::text(TAG_EXE, &self.exe),
        ];
        children.extend(self.args.iter().map(|a| FramedMessage::text(TAG_ARG, a)));
        children.push(FramedMessage::composite(TAG_CONFIG, &self.config.to_children()));
        children.extend(
            self.inputs
                .iter()
                .map(|f| FramedMessage::composite(TAG_INPUT, &f.to_children())),
        );
        children.extend(
            self.outputs
                .iter()
                .map(|o| FramedMessage::text(TAG_OUTPUT, o)),
        );
        FramedMessage::composite(TAG_JOB, &children)
    }

    fn from_message(msg: &FramedMessage) -> Result<Self, ProtocolError> {
        let children = msg.children()?;
        let name = required_text(TAG_JOB, &children, TAG_NAME)?;
        let exe = required_text(TAG_JOB, &children, TAG_EXE)?;
        let config = find(&children, TAG_CONFIG)
            .ok_or_else(|| missing(TAG_JOB, TAG_CONFIG))
            .and_then(JobFile::from_message)?;

        let mut args = Vec::new();
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for child in &children {
            match child.tag.as_str() {
                TAG_ARG => args.push(child.as_text()?),
                TAG_INPUT => inputs.push(JobFile::from_message(child)?),
                TAG_OUTPUT => {
                    let output = child.as_text()?;
                    validate_relative_path(&output)?;
                    outputs.push(output);
                }
                _ => {}
            }
        }

        Ok(Self {
            name,
            exe,
            args,
            config,
            inputs,
            outputs,
        })
    }
}

/// Final status of a job as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndStatus {
    Completed,
    Cancelled,
    Error,
    /// The agent was busy and never started the job.
    Rejected,
}

impl std::fmt::Display for EndStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndStatus::Completed => write!(f, "Completed"),
            EndStatus::Cancelled => write!(f, "Cancelled"),
            EndStatus::Error => write!(f, "Error"),
            EndStatus::Rejected => write!(f, "Rejected"),
        }
    }
}

impl std::str::FromStr for EndStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Completed" => Ok(EndStatus::Completed),
            "Cancelled" => Ok(EndStatus::Cancelled),
            "Error" => Ok(EndStatus::Error),
            "Rejected" => Ok(EndStatus::Rejected),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEnd {
    pub status: EndStatus,
    pub message: Option<String>,
}

impl JobEnd {
    pub fn completed() -> Self {
        Self {
            status: EndStatus::Completed,
            message: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: EndStatus::Cancelled,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: EndStatus::Error,
            message: Some(message.into()),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: EndStatus::Rejected,
            message: Some(message.into()),
        }
    }
}

/// One protocol record, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Job(Box<JobQuery>),
    Free,
    Ack(String),
    Alive,
    End(JobEnd),
    File(JobFile),
}

impl Record {
    pub fn tag(&self) -> &'static str {
        match self {
            Record::Job(_) => TAG_JOB,
            Record::Free => TAG_FREE,
            Record::Ack(_) => TAG_ACK,
            Record::Alive => TAG_ALIVE,
            Record::End(_) => TAG_END,
            Record::File(_) => TAG_FILE,
        }
    }

    pub fn to_message(&self) -> FramedMessage {
        match self {
            Record::Job(query) => query.to_message(),
            Record::Free => FramedMessage::empty(TAG_FREE),
            Record::Ack(name) => FramedMessage::text(TAG_ACK, name),
            Record::Alive => FramedMessage::empty(TAG_ALIVE),
            Record::End(end) => {
                let mut children = vec![FramedMessage::text(TAG_STATUS, &end.status.to_string())];
                if let Some(message) = &end.message {
                    children.push(FramedMessage::text(TAG_MESSAGE, message));
                }
                FramedMessage::composite(TAG_END, &children)
            }
            Record::File(file) => FramedMessage::composite(TAG_FILE, &file.to_children()),
        }
    }

    pub fn from_message(msg: &FramedMessage) -> Result<Self, ProtocolError> {
        match msg.tag.as_str() {
            TAG_JOB => Ok(Record::Job(Box::new(JobQuery::from_message(msg)?))),
            TAG_FREE => Ok(Record::Free),
            TAG_ACK => Ok(Record::Ack(msg.as_text()?)),
            TAG_ALIVE => Ok(Record::Alive),
            TAG_END => {
                let children = msg.children()?;
                let status = required_text(TAG_END, &children, TAG_STATUS)?.parse::<EndStatus>()?;
                let message = find(&children, TAG_MESSAGE)
                    .map(FramedMessage::as_text)
                    .transpose()?;
                Ok(Record::End(JobEnd { status, message }))
            }
            TAG_FILE => Ok(Record::File(JobFile::from_message(msg)?)),
            other => Err(ProtocolError::Malformed(format!("unknown record <{}>", other))),
        }
    }
}

impl From<JobQuery> for Record {
    fn from(query: JobQuery) -> Self {
        Record::Job(Box::new(query))
    }
}

impl<T> MessageStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn send_record(&mut self, record: &Record) -> Result<(), HerdError> {
        self.write_message(record.to_message()).await?;
        Ok(())
    }

    /// Next decoded record, `None` on orderly close.
    pub async fn recv_record(&mut self, idle: Duration) -> Result<Option<Record>, HerdError> {
        match self.read_next_timeout(idle).await? {
            Some(msg) => Ok(Some(Record::from_message(&msg)?)),
            None => Ok(None),
        }
    }
}

/// Accept only plain relative paths that stay inside the job directory.
pub fn validate_relative_path(path: &str) -> Result<(), ProtocolError> {
    if path.is_empty() || path.contains('\\') {
        return Err(ProtocolError::UnsafePath(path.to_string()));
    }
    let mut normal = 0usize;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            _ => return Err(ProtocolError::UnsafePath(path.to_string())),
        }
    }
    if normal == 0 {
        return Err(ProtocolError::UnsafePath(path.to_string()));
    }
    Ok(())
}

fn find<'a>(children: &'a [FramedMessage], tag: &str) -> Option<&'a FramedMessage> {
    children.iter().find(|c| c.tag == tag)
}

fn missing(tag: &str, field: &str) -> ProtocolError {
    ProtocolError::MissingField {
        tag: tag.to_string(),
        field: field.to_string(),
    }
}

fn required_text(tag: &str, children: &[FramedMessage], field: &str) -> Result<String, ProtocolError> {
    find(children, field)
        .ok_or_else(|| missing(tag, field))?
        .as_text()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_query() -> JobQuery {
        JobQuery {
            name: "exp-1/unit-0".to_string(),
            exe: "bin/simulate".to_string(),
            args: vec!["-pipe".to_string(), "a <b>".to_string()],
            config: JobFile::new("unit-0.simion.exp", "<Config gamma=\"0.9\"/>"),
            inputs: vec![
                JobFile::new("bin/simulate", vec![0u8, 159, 146, 150]),
                JobFile::new("data/table.csv", "x,y\n1,2\n"),
            ],
            outputs: vec![
                "unit-0.simion.log".to_string(),
                "unit-0.simion.log.bin".to_string(),
            ],
        }
    }

    #[test]
    fn job_query_roundtrip_preserves_fields() {
        let query = sample_query();
        let msg = Record::from(query.clone()).to_message();
        let decoded = Record::from_message(&msg).unwrap();
        assert_eq!(decoded, Record::Job(Box::new(query)));
    }

    #[test]
    fn end_record_with_message() {
        let end = JobEnd::error("exit code 3: <stderr>");
        let msg = Record::End(end.clone()).to_message();
        assert_eq!(Record::from_message(&msg).unwrap(), Record::End(end));
    }

    #[test]
    fn end_record_unknown_status() {
        let msg = FramedMessage::composite(TAG_END, &[FramedMessage::text(TAG_STATUS, "Maybe")]);
        assert_eq!(
            Record::from_message(&msg),
            Err(ProtocolError::UnknownStatus("Maybe".to_string()))
        );
    }

    #[test]
    fn job_without_config_is_rejected() {
        let msg = FramedMessage::composite(
            TAG_JOB,
            &[
                FramedMessage::text(TAG_NAME, "n"),
                FramedMessage::text(TAG_EXE, "sh"),
            ],
        );
        assert!(matches!(
            Record::from_message(&msg),
            Err(ProtocolError::MissingField { field, .. }) if field == TAG_CONFIG
        ));
    }

    #[test]
    fn file_with_traversal_path_is_rejected() {
        let msg = FramedMessage::composite(
            TAG_FILE,
            &[
                FramedMessage::text(TAG_PATH, "../../etc/passwd"),
                FramedMessage::raw(TAG_DATA, ""),
            ],
        );
        assert!(matches!(
            Record::from_message(&msg),
            Err(ProtocolError::UnsafePath(_))
        ));
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let msg = FramedMessage::composite(
            TAG_FILE,
            &[
                FramedMessage::text(TAG_PATH, "out.log"),
                FramedMessage::raw(TAG_DATA, "***"),
            ],
        );
        assert!(matches!(
            Record::from_message(&msg),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn relative_path_validation() {
        assert!(validate_relative_path("a/b.log").is_ok());
        assert!(validate_relative_path("./a.log").is_ok());
        assert!(validate_relative_path("/abs.log").is_err());
        assert!(validate_relative_path("a/../../b").is_err());
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path(".").is_err());
        assert!(validate_relative_path("c:\\x").is_err());
    }

    #[test]
    fn unknown_record_is_rejected() {
        let msg = FramedMessage::empty("Hello");
        assert!(Record::from_message(&msg).is_err());
    }

    #[test]
    fn simple_records_roundtrip() {
        for record in [
            Record::Free,
            Record::Alive,
            Record::Ack("unit".to_string()),
            Record::End(JobEnd::cancelled()),
        ] {
            let msg = record.to_message();
            assert_eq!(msg.tag, record.tag());
            assert_eq!(Record::from_message(&msg).unwrap(), record);
        }
    }

    #[tokio::test]
    async fn job_query_survives_a_byte_stream() {
        let (client, server) = tokio::io::duplex(7);
        let mut dispatcher = MessageStream::new(client);
        let mut agent = MessageStream::new(server);
        let query = sample_query();

        let sent = query.clone();
        let writer = tokio::spawn(async move {
            dispatcher.send_record(&Record::from(sent)).await.unwrap();
            dispatcher.send_record(&Record::Free).await.unwrap();
        });

        let idle = Duration::from_secs(5);
        let first = agent.recv_record(idle).await.unwrap().unwrap();
        let second = agent.recv_record(idle).await.unwrap().unwrap();
        writer.await.unwrap();

        match first {
            Record::Job(received) => {
                assert_eq!(received.exe, query.exe);
                assert_eq!(received.config, query.config);
                assert_eq!(received.inputs, query.inputs);
                assert_eq!(received.outputs, query.outputs);
            }
            other => panic!("expected job query, got {:?}", other),
        }
        assert_eq!(second, Record::Free);
        assert!(agent.recv_record(idle).await.unwrap().is_none());
    }
}
