pub mod agent;
pub mod batch;
pub mod config;
pub mod dashboard;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod shutdown;

pub use error::{HerdError, Result};
