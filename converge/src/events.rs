//! Run events streamed to observers while the pipeline runs.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::types::{OutputStream, Status};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    OperationStarted {
        index: usize,
        name: String,
        hosts: usize,
    },
    HostRunning {
        host: String,
        index: usize,
    },
    HostFinished {
        host: String,
        index: usize,
        status: Status,
    },
    Output {
        host: String,
        index: usize,
        stream: OutputStream,
        line: String,
    },
    OperationFinished {
        index: usize,
        active: usize,
        failed: usize,
        ratio: f64,
    },
    Aborted {
        index: usize,
        ratio: f64,
        threshold: f64,
    },
    RunFinished {
        success: bool,
        exit_code: i32,
    },
}

pub type EventSender = broadcast::Sender<RunEvent>;

pub fn channel() -> (EventSender, broadcast::Receiver<RunEvent>) {
    broadcast::channel(CHANNEL_CAPACITY)
}

/// Publish an event; having no subscriber is not an error.
pub fn emit(events: Option<&EventSender>, event: RunEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Forwards captured command output lines for one (host, operation) pair.
#[derive(Debug, Clone)]
pub struct OutputSink {
    events: Option<EventSender>,
    host: String,
    index: usize,
}

impl OutputSink {
    pub fn new(events: Option<EventSender>, host: &str, index: usize) -> Self {
        Self {
            events,
            host: host.to_string(),
            index,
        }
    }

    /// Sink that drops every line, used for fact gathering.
    pub fn detached() -> Self {
        Self::new(None, "", 0)
    }

    pub fn emit(&self, stream: OutputStream, line: &str) {
        emit(
            self.events.as_ref(),
            RunEvent::Output {
                host: self.host.clone(),
                index: self.index,
                stream,
                line: line.to_string(),
            },
        );
    }
}
