//! Connector seam: open one connection per host and run single commands on it.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::inventory::Host;
use crate::error::ConnectionError;
use crate::events::OutputSink;

/// Options for one command run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub stdin: Option<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Result of one command as seen by the connector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// The connector killed the command after `RunOptions::timeout`.
    pub timed_out: bool,
    /// Stdout bytes dropped past `RunOptions::output_limit_bytes`.
    pub stdout_truncated: usize,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// The command could not be delivered to the host or its result was lost.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// A live connection owned by exactly one host worker at a time.
#[async_trait]
pub trait Connection: Send {
    async fn run(
        &mut self,
        command: &str,
        opts: &RunOptions,
        sink: &OutputSink,
    ) -> Result<CommandOutput, TransportError>;

    /// Release the connection at run end.
    async fn close(&mut self) {}
}
