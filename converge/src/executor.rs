//! Per-host connection pool and batch execution.
//!
//! Every host owns one connection slot for the whole run. A slot is opened
//! lazily on first lease and stays exclusively held by one worker while it
//! runs commands. A failed connect is remembered so the host is reported
//! unreachable without retrying.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::core::inventory::Host;
use crate::core::shell;
use crate::core::types::{ExecutionResult, OpBatch, Status};
use crate::error::{CommandExecutionError, ConnectionError, HostError, TimeoutError};
use crate::events::{EventSender, OutputSink, RunEvent, emit};
use crate::io::connector::{CommandOutput, Connection, Connector, RunOptions, TransportError};

struct Slot {
    host: Host,
    conn: Option<Box<dyn Connection>>,
    failure: Option<ConnectionError>,
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    slots: HashMap<String, Arc<Mutex<Slot>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, hosts: &[Host]) -> Self {
        let slots = hosts
            .iter()
            .map(|host| {
                let slot = Slot {
                    host: host.clone(),
                    conn: None,
                    failure: None,
                };
                (host.name.clone(), Arc::new(Mutex::new(slot)))
            })
            .collect();
        Self { connector, slots }
    }

    /// Take exclusive use of the host's connection, connecting on first use.
    #[instrument(skip_all, fields(host = host))]
    pub async fn lease(&self, host: &str) -> Result<Lease, ConnectionError> {
        let slot = self.slots.get(host).ok_or_else(|| ConnectionError {
            host: host.to_string(),
            reason: "host is not part of this run".to_string(),
        })?;
        let mut guard = Arc::clone(slot).lock_owned().await;
        if let Some(failure) = &guard.failure {
            return Err(failure.clone());
        }
        if guard.conn.is_none() {
            debug!("opening connection");
            match self.connector.connect(&guard.host).await {
                Ok(conn) => guard.conn = Some(conn),
                Err(err) => {
                    warn!(reason = %err.reason, "host unreachable");
                    guard.failure = Some(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(Lease { guard })
    }

    /// Release every open connection.
    pub async fn close_all(&self) {
        for slot in self.slots.values() {
            let mut guard = slot.lock().await;
            if let Some(mut conn) = guard.conn.take() {
                conn.close().await;
            }
        }
    }
}

/// Exclusive handle to one host's open connection.
pub struct Lease {
    guard: OwnedMutexGuard<Slot>,
}

impl Lease {
    pub async fn run(
        &mut self,
        command: &str,
        opts: &RunOptions,
        sink: &OutputSink,
    ) -> Result<CommandOutput, TransportError> {
        match self.guard.conn.as_mut() {
            Some(conn) => conn.run(command, opts, sink).await,
            None => Err(TransportError("connection is not open".to_string())),
        }
    }
}

pub struct Executor {
    pool: Arc<ConnectionPool>,
    workers: Arc<Semaphore>,
    events: Option<EventSender>,
    output_limit_bytes: usize,
}

impl Executor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        workers: Arc<Semaphore>,
        events: Option<EventSender>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            pool,
            workers,
            events,
            output_limit_bytes,
        }
    }

    /// Run one host's batch strictly in order, stopping at the first failure.
    #[instrument(skip_all, fields(host = %batch.host, op = batch.op_index))]
    pub async fn run_batch(&self, batch: OpBatch) -> ExecutionResult {
        let started = Instant::now();
        emit(
            self.events.as_ref(),
            RunEvent::HostRunning {
                host: batch.host.clone(),
                index: batch.op_index,
            },
        );

        let mut result = ExecutionResult::new(
            &batch.host,
            batch.op_index,
            &batch.op_name,
            Status::NoChange,
        );
        result.degraded_facts = batch.degraded.iter().map(ToString::to_string).collect();

        if !batch.is_empty() {
            match self.execute(&batch, &mut result).await {
                Ok(()) => {
                    result.status = if batch.tracks_changes {
                        Status::Changed
                    } else {
                        Status::Success
                    };
                }
                Err(err) => {
                    result.status = err.status();
                    result.error = Some(err.report());
                }
            }
        }

        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(status = result.status.label(), "batch finished");
        emit(
            self.events.as_ref(),
            RunEvent::HostFinished {
                host: result.host.clone(),
                index: result.op_index,
                status: result.status,
            },
        );
        result
    }

    async fn execute(&self, batch: &OpBatch, result: &mut ExecutionResult) -> Result<(), HostError> {
        let mut lease = self.pool.lease(&batch.host).await?;
        let sink = OutputSink::new(self.events.clone(), &batch.host, batch.op_index);

        for planned in &batch.commands {
            let wrapped = shell::wrap(&planned.text, &batch.escalation);
            let opts = RunOptions {
                stdin: planned.stdin.clone(),
                timeout: batch.timeout,
                output_limit_bytes: self.output_limit_bytes,
            };
            result.commands.push(planned.text.clone());
            debug!(command = %planned.text, "running command");

            let timed_out = || TimeoutError {
                host: batch.host.clone(),
                command: planned.text.clone(),
                timeout: batch.timeout,
            };
            let output = match tokio::time::timeout(batch.timeout, lease.run(&wrapped, &opts, &sink))
                .await
            {
                Err(_) => return Err(timed_out().into()),
                Ok(Err(err)) => {
                    return Err(CommandExecutionError {
                        host: batch.host.clone(),
                        command: planned.text.clone(),
                        code: None,
                        reason: err.to_string(),
                    }
                    .into());
                }
                Ok(Ok(output)) => output,
            };

            result.stdout.extend(output.stdout.iter().cloned());
            result.stderr.extend(output.stderr.iter().cloned());
            if let Some(code) = output.exit_code {
                result.exit_codes.push(code);
            }
            if output.timed_out {
                return Err(timed_out().into());
            }
            if output.exit_code != Some(0) {
                return Err(CommandExecutionError {
                    host: batch.host.clone(),
                    command: planned.text.clone(),
                    code: output.exit_code,
                    reason: output
                        .stderr
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "no output".to_string()),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Run every batch concurrently, at most `parallelism` hosts at once.
    pub async fn run_many(&self, batches: Vec<OpBatch>) -> Vec<ExecutionResult> {
        let tasks = batches.into_iter().map(|batch| async move {
            // The semaphore is never closed.
            let _permit = self.workers.acquire().await.ok();
            self.run_batch(batch).await
        });
        join_all(tasks).await
    }
}
