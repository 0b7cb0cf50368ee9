//! Wire protocol between dispatcher and agents.
//!
//! - [`framing`]: self-delimited `<Tag>body</Tag>` records over a byte stream
//! - [`messages`]: the job-transfer records built on top of the framing

pub mod framing;
pub mod messages;

pub use framing::{FramedMessage, MessageStream, RecordCodec};
pub use messages::{EndStatus, JobEnd, JobFile, JobQuery, Record};
