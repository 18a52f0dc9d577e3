//! Pipeline controller: drives operations across the fleet in declared order.
//!
//! Per operation: warm declared facts, plan every active host, execute the
//! batches concurrently, invalidate mutated facts on hosts that ran
//! commands, then apply the failure threshold. An operation finishes on the
//! whole fleet before the next one starts.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::core::facts::{FactKey, FactValue};
use crate::core::inventory::Host;
use crate::core::operations::Operation;
use crate::core::registry::Registry;
use crate::core::threshold::{FailureTally, unreachable_within};
use crate::core::types::{Escalation, ExecutionResult, RunReport, Status};
use crate::error::HostError;
use crate::events::{EventSender, RunEvent, emit};
use crate::executor::{ConnectionPool, Executor};
use crate::exit_codes;
use crate::fact_store::{FactSettings, FactStore};
use crate::io::config::EngineConfig;
use crate::io::connector::Connector;
use crate::planner::Planner;

pub struct Pipeline {
    config: EngineConfig,
    hosts: Vec<Host>,
    pool: Arc<ConnectionPool>,
    store: FactStore,
    executor: Executor,
    events: Option<EventSender>,
}

impl Pipeline {
    pub fn new(
        config: EngineConfig,
        registry: Arc<Registry>,
        connector: Arc<dyn Connector>,
        hosts: Vec<Host>,
        events: Option<EventSender>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(connector, &hosts));
        let workers = Arc::new(Semaphore::new(config.parallelism));
        let store = FactStore::new(
            registry,
            Arc::clone(&pool),
            Arc::clone(&workers),
            FactSettings {
                escalation: Escalation {
                    enabled: config.escalate_facts,
                    user: None,
                },
                timeout: config.command_timeout(),
                output_limit_bytes: config.output_limit_bytes,
            },
        );
        let executor = Executor::new(
            Arc::clone(&pool),
            workers,
            events.clone(),
            config.output_limit_bytes,
        );
        Self {
            config,
            hosts,
            pool,
            store,
            executor,
            events,
        }
    }

    pub fn store(&self) -> &FactStore {
        &self.store
    }

    /// Apply `operations` in order and release every connection afterwards.
    #[instrument(skip_all, fields(hosts = self.hosts.len(), operations = operations.len()))]
    pub async fn run(&self, operations: &[Operation]) -> RunReport {
        let planner = Planner::new(&self.store, self.config.command_timeout());
        let mut unreachable: BTreeSet<String> = BTreeSet::new();
        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut results = Vec::new();
        let mut aborted_at = None;

        for (index, op) in operations.iter().enumerate() {
            if aborted_at.is_some() {
                results.extend(
                    self.hosts
                        .iter()
                        .map(|h| ExecutionResult::skipped(&h.name, index, &op.name)),
                );
                continue;
            }

            let (active, excluded): (Vec<&Host>, Vec<&Host>) = self
                .hosts
                .iter()
                .partition(|h| !unreachable.contains(&h.name) && !failed.contains(&h.name));
            let active: Vec<Host> = active.into_iter().cloned().collect();
            info!(index, op = %op.name, active = active.len(), "operation started");
            emit(
                self.events.as_ref(),
                RunEvent::OperationStarted {
                    index,
                    name: op.name.clone(),
                    hosts: active.len(),
                },
            );

            let mut op_results: Vec<ExecutionResult> = excluded
                .iter()
                .map(|h| ExecutionResult::skipped(&h.name, index, &op.name))
                .collect();

            // Render errors surface per host when planning.
            let templates = self.store.registry().templates();
            self.store
                .warm(&active, |host| op.reads(host, templates).unwrap_or_default())
                .await;

            let mut batches = Vec::new();
            for (host, planned) in planner.plan(index, op, &active).await {
                match planned {
                    Ok(batch) => batches.push(batch),
                    Err(err) => op_results.push(self.plan_failure(&host, index, op, &err)),
                }
            }

            let touched: Vec<String> = batches
                .iter()
                .filter(|b| !b.is_empty())
                .map(|b| b.host.clone())
                .collect();
            op_results.extend(self.executor.run_many(batches).await);

            let scope = self.store.registry().invalidation_scope(&op.mutates());
            for host in &touched {
                for kind in &scope {
                    self.store.invalidate(host, *kind, None);
                }
            }

            let mut tally = FailureTally::new(active.len());
            for result in &op_results {
                if result.status == Status::Unreachable {
                    unreachable.insert(result.host.clone());
                    tally.record_failure();
                } else if result.status.is_failure() && !op.options.continue_on_error {
                    failed.insert(result.host.clone());
                    tally.record_failure();
                }
            }

            let ratio = tally.ratio();
            emit(
                self.events.as_ref(),
                RunEvent::OperationFinished {
                    index,
                    active: tally.active,
                    failed: tally.failed,
                    ratio,
                },
            );
            if tally.exceeds(self.config.fail_threshold) {
                warn!(
                    index,
                    ratio,
                    threshold = self.config.fail_threshold,
                    "failure threshold exceeded, aborting"
                );
                emit(
                    self.events.as_ref(),
                    RunEvent::Aborted {
                        index,
                        ratio,
                        threshold: self.config.fail_threshold,
                    },
                );
                aborted_at = Some(index);
            }

            op_results.sort_by_key(|r| self.host_position(&r.host));
            results.extend(op_results);
        }

        self.pool.close_all().await;

        let unreachable_ok = unreachable_within(
            unreachable.len(),
            self.hosts.len(),
            self.config.unreachable_tolerance,
        );
        let exit_code = if aborted_at.is_some() {
            exit_codes::THRESHOLD_EXCEEDED
        } else if !unreachable_ok {
            exit_codes::UNREACHABLE
        } else {
            exit_codes::OK
        };
        let success = exit_code == exit_codes::OK;
        emit(
            self.events.as_ref(),
            RunEvent::RunFinished { success, exit_code },
        );

        RunReport {
            operations: operations.iter().map(|op| op.name.clone()).collect(),
            hosts: self.hosts.iter().map(|h| h.name.clone()).collect(),
            results,
            aborted_at,
            unreachable: self
                .hosts
                .iter()
                .filter(|h| unreachable.contains(&h.name))
                .map(|h| h.name.clone())
                .collect(),
            success,
            exit_code,
        }
    }

    /// Gather one fact on every host, in host order.
    pub async fn gather(&self, key: &FactKey) -> Vec<(String, Result<Arc<FactValue>, HostError>)> {
        self.store
            .warm(&self.hosts, |_| vec![key.clone()])
            .await;
        let mut out = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            out.push((host.name.clone(), self.store.get(host, key).await));
        }
        self.pool.close_all().await;
        out
    }

    fn plan_failure(
        &self,
        host: &str,
        index: usize,
        op: &Operation,
        err: &HostError,
    ) -> ExecutionResult {
        warn!(host, op = %op.name, err = %err, "planning failed");
        let result = ExecutionResult::from_error(host, index, &op.name, err);
        emit(
            self.events.as_ref(),
            RunEvent::HostFinished {
                host: host.to_string(),
                index,
                status: result.status,
            },
        );
        result
    }

    fn host_position(&self, host: &str) -> usize {
        self.hosts
            .iter()
            .position(|h| h.name == host)
            .unwrap_or(usize::MAX)
    }
}
