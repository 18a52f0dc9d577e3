//! Read-only planning phase: facts in, one command batch per host out.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::core::differ::diff;
use crate::core::facts::FactView;
use crate::core::inventory::Host;
use crate::core::operations::Operation;
use crate::core::types::OpBatch;
use crate::error::HostError;
use crate::fact_store::FactStore;

pub struct Planner<'a> {
    store: &'a FactStore,
    default_timeout: Duration,
}

impl<'a> Planner<'a> {
    pub fn new(store: &'a FactStore, default_timeout: Duration) -> Self {
        Self {
            store,
            default_timeout,
        }
    }

    /// Plan `op` for every host, in host order.
    pub async fn plan(
        &self,
        op_index: usize,
        op: &Operation,
        hosts: &[Host],
    ) -> Vec<(String, Result<OpBatch, HostError>)> {
        let mut planned = Vec::with_capacity(hosts.len());
        for host in hosts {
            planned.push((host.name.clone(), self.plan_host(op_index, op, host).await));
        }
        planned
    }

    /// Resolve the declared facts, build the desired state and diff it.
    ///
    /// Every value is rendered once for `host`; only the facts the rendered
    /// action reads are visible to the differ.
    #[instrument(skip_all, fields(host = %host.name, op = %op.name))]
    pub async fn plan_host(
        &self,
        op_index: usize,
        op: &Operation,
        host: &Host,
    ) -> Result<OpBatch, HostError> {
        let plan_error = |source| HostError::Plan {
            host: host.name.clone(),
            source,
        };
        let action = op
            .render(host, self.store.registry().templates())
            .map_err(plan_error)?;

        let mut facts = BTreeMap::new();
        for key in action.reads() {
            let resolved = self.store.resolve(host, &key, op.options.tolerant).await?;
            facts.insert(key, resolved);
        }
        let view = FactView::new(facts);

        let commands = diff(&action.into_desired(), &view).map_err(plan_error)?;
        debug!(commands = commands.len(), "planned");

        Ok(OpBatch {
            host: host.name.clone(),
            op_index,
            op_name: op.name.clone(),
            commands,
            escalation: op.escalation(),
            timeout: op.timeout(self.default_timeout),
            tracks_changes: op.tracks_changes(),
            degraded: view.degraded(),
        })
    }
}
