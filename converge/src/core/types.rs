//! Shared deterministic types for the reconciliation engine.
//!
//! These types define stable contracts between the planner, executor and
//! pipeline. They carry no I/O and serialize into the final report.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::facts::FactKey;
use crate::error::{ErrorReport, HostError};

/// Terminal status of one (host, operation) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// Commands ran and succeeded, but the operation does not track change.
    Success,
    /// Commands were needed to converge and all of them succeeded.
    Changed,
    /// Actual state already satisfied the desired state; nothing ran.
    NoChange,
    Failed,
    Timeout,
    /// The host's connection could not be established.
    Unreachable,
    /// The host was not dispatched for this operation.
    Skipped,
}

impl Status {
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Failed | Status::Timeout | Status::Unreachable)
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Changed => "changed",
            Status::NoChange => "no-change",
            Status::Failed => "failed",
            Status::Timeout => "timeout",
            Status::Unreachable => "unreachable",
            Status::Skipped => "skipped",
        }
    }
}

/// Privilege escalation applied to every command of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Escalation {
    pub enabled: bool,
    pub user: Option<String>,
}

/// One command emitted by the differ, before escalation wrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    pub text: String,
    pub stdin: Option<String>,
}

impl PlannedCommand {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(text: impl Into<String>, stdin: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stdin: Some(stdin.into()),
        }
    }
}

/// Resolved, ordered commands for one (host, operation) pair.
///
/// Consumed exactly once by the executor.
#[derive(Debug, Clone)]
pub struct OpBatch {
    pub host: String,
    pub op_index: usize,
    pub op_name: String,
    pub commands: Vec<PlannedCommand>,
    pub escalation: Escalation,
    pub timeout: Duration,
    /// `false` for operations that cannot tell whether they changed anything.
    pub tracks_changes: bool,
    /// Facts that resolved to a tolerant fallback instead of a parsed value.
    pub degraded: Vec<FactKey>,
}

impl OpBatch {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Which output stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Outcome of one (host, operation) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub host: String,
    pub op_index: usize,
    pub op_name: String,
    pub status: Status,
    /// Commands that were started, in execution order (unwrapped text).
    pub commands: Vec<String>,
    pub exit_codes: Vec<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub duration_ms: u64,
    pub degraded_facts: Vec<String>,
    pub error: Option<ErrorReport>,
}

impl ExecutionResult {
    pub fn new(host: &str, op_index: usize, op_name: &str, status: Status) -> Self {
        Self {
            host: host.to_string(),
            op_index,
            op_name: op_name.to_string(),
            status,
            commands: Vec::new(),
            exit_codes: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            duration_ms: 0,
            degraded_facts: Vec::new(),
            error: None,
        }
    }

    pub fn skipped(host: &str, op_index: usize, op_name: &str) -> Self {
        Self::new(host, op_index, op_name, Status::Skipped)
    }

    pub fn from_error(host: &str, op_index: usize, op_name: &str, err: &HostError) -> Self {
        let mut result = Self::new(host, op_index, op_name, err.status());
        result.error = Some(err.report());
        result
    }
}

/// Aggregate outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub operations: Vec<String>,
    pub hosts: Vec<String>,
    pub results: Vec<ExecutionResult>,
    /// Index of the operation after which the failure threshold tripped.
    pub aborted_at: Option<usize>,
    pub unreachable: Vec<String>,
    pub success: bool,
    pub exit_code: i32,
}

impl RunReport {
    /// Results for one operation, in inventory host order.
    pub fn for_operation(&self, op_index: usize) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(move |r| r.op_index == op_index)
    }

    pub fn result(&self, host: &str, op_index: usize) -> Option<&ExecutionResult> {
        self.results
            .iter()
            .find(|r| r.host == host && r.op_index == op_index)
    }

    pub fn count(&self, op_index: usize, status: Status) -> usize {
        self.for_operation(op_index)
            .filter(|r| r.status == status)
            .count()
    }
}
