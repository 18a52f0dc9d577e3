//! Host-scoped error taxonomy.
//!
//! Every failure the engine observes is attached to one host and one
//! operation; none of these types ever abort the whole run on their own.
//! All errors are `Clone` so the fact store can cache them next to values
//! and the report can keep a copy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::facts::FactKey;
use crate::core::types::Status;

/// A connection to the host could not be established.
///
/// The host is `unreachable` for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot connect to {host}: {reason}")]
pub struct ConnectionError {
    pub host: String,
    pub reason: String,
}

/// A parser rejected the output of a fact command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Why a fact could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatherFailure {
    #[error("command exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("unparsable output: {0}")]
    Parse(#[from] ParseError),
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("output exceeded {limit} bytes ({dropped} bytes dropped)")]
    Truncated { limit: usize, dropped: usize },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("bad fact arguments: {0}")]
    Arguments(String),
}

/// A fact command failed or its output could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fact {fact} failed on {host}: {reason}")]
pub struct FactGatherError {
    pub host: String,
    pub fact: FactKey,
    pub reason: GatherFailure,
}

impl FactGatherError {
    pub fn is_parse(&self) -> bool {
        matches!(self.reason, GatherFailure::Parse(_))
    }
}

/// A command in a batch exited non-zero (or never produced an exit code).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("command `{command}` failed on {host} with status {code:?}: {reason}")]
pub struct CommandExecutionError {
    pub host: String,
    pub command: String,
    pub code: Option<i32>,
    pub reason: String,
}

/// A command ran past its timeout and was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("command `{command}` timed out on {host} after {}s", .timeout.as_secs())]
pub struct TimeoutError {
    pub host: String,
    pub command: String,
    pub timeout: Duration,
}

/// The operation's declaration cannot be turned into commands for a host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("operation read fact {0} it did not declare")]
    UndeclaredFact(String),
    #[error("fact {fact} resolved to an unexpected value: {found}")]
    UnexpectedValue { fact: String, found: String },
    #[error("template error: {0}")]
    Template(String),
    #[error("{0}")]
    Unsatisfiable(String),
}

/// Any failure scoped to one host and one operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    FactGather(#[from] FactGatherError),
    #[error(transparent)]
    CommandExecution(#[from] CommandExecutionError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("planning failed on {host}: {source}")]
    Plan { host: String, source: PlanError },
}

impl HostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::Connection(_) => ErrorKind::Connection,
            HostError::FactGather(_) => ErrorKind::FactGather,
            HostError::CommandExecution(_) => ErrorKind::CommandExecution,
            HostError::Timeout(_) => ErrorKind::Timeout,
            HostError::Plan { .. } => ErrorKind::Plan,
        }
    }

    /// Terminal status a host ends in for the operation that raised this error.
    pub fn status(&self) -> Status {
        match self {
            HostError::Connection(_) => Status::Unreachable,
            HostError::Timeout(_) => Status::Timeout,
            _ => Status::Failed,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Serializable classification of a [`HostError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    FactGather,
    CommandExecution,
    Timeout,
    Plan,
}

/// Error attached to one result in the final report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}
