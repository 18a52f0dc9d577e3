//! Per-host fact cache with single-flight fetching and explicit invalidation.
//!
//! Entries are keyed by (host, fact key). The first caller for a key runs
//! the fetch; concurrent callers for the same key await that fetch through
//! the entry's `OnceCell`. The key map lock is only held to look up or
//! insert entries, never across I/O, so unrelated keys never contend.
//! Errors are cached like values until the entry is invalidated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, instrument, warn};

use crate::core::facts::{FactKey, FactKind, FactValue, Resolved};
use crate::core::inventory::Host;
use crate::core::registry::Registry;
use crate::core::shell;
use crate::core::types::Escalation;
use crate::error::{FactGatherError, GatherFailure, HostError};
use crate::events::OutputSink;
use crate::executor::ConnectionPool;
use crate::io::connector::RunOptions;

type FactResult = Result<Arc<FactValue>, HostError>;

struct Entry {
    cell: OnceCell<FactResult>,
}

/// How fact commands are run.
#[derive(Debug, Clone)]
pub struct FactSettings {
    pub escalation: Escalation,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub struct FactStore {
    registry: Arc<Registry>,
    pool: Arc<ConnectionPool>,
    workers: Arc<Semaphore>,
    settings: FactSettings,
    entries: Mutex<HashMap<(String, FactKey), Arc<Entry>>>,
    generation: AtomicU64,
    fetches: AtomicUsize,
}

impl FactStore {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<ConnectionPool>,
        workers: Arc<Semaphore>,
        settings: FactSettings,
    ) -> Self {
        Self {
            registry,
            pool,
            workers,
            settings,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn entry(&self, host: &str, key: &FactKey) -> Arc<Entry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            entries
                .entry((host.to_string(), key.clone()))
                .or_insert_with(|| {
                    Arc::new(Entry {
                        cell: OnceCell::new(),
                    })
                }),
        )
    }

    /// Cached value for `key` on `host`, fetching it at most once per generation.
    pub async fn get(&self, host: &Host, key: &FactKey) -> FactResult {
        let entry = self.entry(&host.name, key);
        entry
            .cell
            .get_or_init(|| self.fetch(host, key))
            .await
            .clone()
    }

    /// Like [`FactStore::get`], but a parse failure yields the registry's
    /// fallback value marked degraded when `tolerant` is set.
    pub async fn resolve(&self, host: &Host, key: &FactKey, tolerant: bool) -> Result<Resolved, HostError> {
        match self.get(host, key).await {
            Ok(value) => Ok(Resolved {
                value,
                degraded: false,
            }),
            Err(HostError::FactGather(err)) if tolerant && err.is_parse() => {
                match self.registry.fallback(key.kind) {
                    Some(fallback) => {
                        warn!(host = %host.name, fact = %key, reason = %err.reason, "using degraded fallback");
                        Ok(Resolved {
                            value: Arc::new(fallback),
                            degraded: true,
                        })
                    }
                    None => Err(HostError::FactGather(err)),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Fetch `keys_for(host)` on every host in parallel, bounded by the
    /// worker limit.
    ///
    /// Results land in the cache; a host that cannot be reached stops after
    /// its first failure.
    #[instrument(skip_all, fields(hosts = hosts.len()))]
    pub async fn warm<F>(&self, hosts: &[Host], keys_for: F)
    where
        F: Fn(&Host) -> Vec<FactKey>,
    {
        let tasks = hosts.iter().map(|host| {
            let keys = keys_for(host);
            async move {
                if keys.is_empty() {
                    return;
                }
                // The semaphore is never closed.
                let _permit = self.workers.acquire().await.ok();
                for key in &keys {
                    if let Err(HostError::Connection(_)) = self.get(host, key).await {
                        break;
                    }
                }
            }
        });
        join_all(tasks).await;
    }

    /// Drop cached entries of `kind` on `host`; `args` narrows to one key.
    pub fn invalidate(&self, host: &str, kind: FactKind, args: Option<&[String]>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(h, key), _| {
            !(h == host && key.kind == kind && args.is_none_or(|a| key.args == a))
        });
        if entries.len() != before {
            self.generation.fetch_add(1, Ordering::SeqCst);
            debug!(host, fact = %kind, removed = before - entries.len(), "invalidated facts");
        }
    }

    /// Bumped every time an invalidation removes entries.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Number of remote fact commands issued so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    #[instrument(skip_all, fields(host = %host.name, fact = %key))]
    async fn fetch(&self, host: &Host, key: &FactKey) -> FactResult {
        let gather_error = |reason: GatherFailure| {
            HostError::from(FactGatherError {
                host: host.name.clone(),
                fact: key.clone(),
                reason,
            })
        };

        let command = self.registry.command_for(key).map_err(gather_error)?;
        let wrapped = shell::wrap(&command, &self.settings.escalation);
        let mut lease = self.pool.lease(&host.name).await?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        debug!(command = %command, "gathering fact");

        let opts = RunOptions {
            stdin: None,
            timeout: self.settings.timeout,
            output_limit_bytes: self.settings.output_limit_bytes,
        };
        let detached = OutputSink::detached();
        let output = match tokio::time::timeout(
            self.settings.timeout,
            lease.run(&wrapped, &opts, &detached),
        )
        .await
        {
            Err(_) => return Err(gather_error(GatherFailure::Timeout(self.settings.timeout))),
            Ok(Err(err)) => return Err(gather_error(GatherFailure::Transport(err.0))),
            Ok(Ok(output)) => output,
        };
        drop(lease);

        if output.timed_out {
            return Err(gather_error(GatherFailure::Timeout(self.settings.timeout)));
        }
        if output.exit_code != Some(0) {
            return Err(gather_error(GatherFailure::NonZeroExit {
                code: output.exit_code,
                stderr: output.stderr.join("\n"),
            }));
        }
        if output.stdout_truncated > 0 {
            return Err(gather_error(GatherFailure::Truncated {
                limit: self.settings.output_limit_bytes,
                dropped: output.stdout_truncated,
            }));
        }
        let value = self
            .registry
            .parse(key, &output.stdout)
            .map_err(gather_error)?;
        Ok(Arc::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Response, ScriptedConnector, hosts};

    fn store(connector: &Arc<ScriptedConnector>, names: &[&str]) -> (FactStore, Vec<Host>) {
        let targets = hosts(names);
        let pool = ConnectionPool::new(connector.clone(), &targets);
        let store = FactStore::new(
            Arc::new(Registry::builtin()),
            Arc::new(pool),
            Arc::new(Semaphore::new(4)),
            FactSettings {
                escalation: Escalation::default(),
                timeout: Duration::from_secs(5),
                output_limit_bytes: 10_000,
            },
        );
        (store, targets)
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_fetch() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.respond(
            "a",
            "hostname",
            Response::ok()
                .stdout("web-a")
                .delay(Duration::from_millis(50)),
        );
        let (store, targets) = store(&connector, &["a"]);
        let key = FactKey::new(FactKind::Hostname);

        let results = join_all((0..8).map(|_| store.get(&targets[0], &key))).await;
        for result in &results {
            assert_eq!(
                result.as_deref(),
                Ok(&FactValue::Text("web-a".to_string()))
            );
        }
        assert_eq!(connector.count("a", "hostname"), 1);
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn invalidation_forces_a_refetch() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.respond("a", "cat '/etc/my app'", Response::file_lines("x=1"));
        let (store, targets) = store(&connector, &["a"]);
        let key = FactKey::path(FactKind::FileLines, "/etc/my app");

        store.get(&targets[0], &key).await.expect("first");
        store.get(&targets[0], &key).await.expect("cached");
        assert_eq!(store.fetch_count(), 1);

        store.invalidate("a", FactKind::Users, None);
        assert_eq!(store.generation(), 0);
        store.invalidate("a", FactKind::FileLines, Some(&["/other".to_string()]));
        assert_eq!(store.generation(), 0);
        store.invalidate("a", FactKind::FileLines, None);
        assert_eq!(store.generation(), 1);

        store.get(&targets[0], &key).await.expect("refetched");
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn errors_are_cached_until_invalidated() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.respond("a", "date", Response::ok().stdout("not a date"));
        let (store, targets) = store(&connector, &["a"]);
        let key = FactKey::new(FactKind::Date);

        let err = store.get(&targets[0], &key).await.unwrap_err();
        assert!(matches!(&err, HostError::FactGather(e) if e.is_parse()));
        assert!(store.get(&targets[0], &key).await.is_err());
        assert_eq!(connector.count("a", "date"), 1);
    }

    #[tokio::test]
    async fn tolerant_resolution_degrades_parse_failures() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.respond("a", "id $i", Response::ok().stdout("uid=1000(x) gid=1000(x) groups=1000(x),oops"));
        let (store, targets) = store(&connector, &["a"]);
        let key = FactKey::new(FactKind::Users);

        assert!(store.resolve(&targets[0], &key, false).await.is_err());
        let resolved = store.resolve(&targets[0], &key, true).await.expect("fallback");
        assert!(resolved.degraded);
        assert_eq!(*resolved.value, FactValue::Users(Default::default()));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_gather_error() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.respond("a", "uname -s", Response::exit(127).stderr("uname: not found"));
        let (store, targets) = store(&connector, &["a"]);

        let err = store
            .get(&targets[0], &FactKey::new(FactKind::Os))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("uname: not found"));
    }

    #[tokio::test]
    async fn transport_and_timeout_failures_name_their_cause() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.respond("a", "uname -s", Response::ok().transport_error());
        connector.respond("b", "uname -s", Response::ok().timed_out());
        let (store, targets) = store(&connector, &["a", "b"]);
        let key = FactKey::new(FactKind::Os);

        let err = store.get(&targets[0], &key).await.unwrap_err();
        assert!(matches!(
            &err,
            HostError::FactGather(e) if matches!(&e.reason, GatherFailure::Transport(m) if m.contains("connection reset"))
        ));
        let err = store.get(&targets[1], &key).await.unwrap_err();
        assert!(matches!(
            &err,
            HostError::FactGather(e) if e.reason == GatherFailure::Timeout(Duration::from_secs(5))
        ));
    }

    #[tokio::test]
    async fn truncated_output_is_never_parsed() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.respond("a", "/etc/big.conf", Response::file_lines("a=1").truncated(50));
        let (store, targets) = store(&connector, &["a"]);

        let err = store
            .get(&targets[0], &FactKey::path(FactKind::FileLines, "/etc/big.conf"))
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            HostError::FactGather(e) if e.reason == GatherFailure::Truncated { limit: 10_000, dropped: 50 }
        ));
        assert!(!matches!(&err, HostError::FactGather(e) if e.is_parse()));
    }

    #[tokio::test]
    async fn warm_fetches_each_key_once_per_host() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.unreachable("c");
        let (store, targets) = store(&connector, &["a", "b", "c"]);
        let keys = vec![FactKey::new(FactKind::Os), FactKey::new(FactKind::Arch)];

        store.warm(&targets, |_| keys.clone()).await;
        store.warm(&targets, |_| keys.clone()).await;

        assert_eq!(connector.count("a", "uname"), 2);
        assert_eq!(connector.count("b", "uname"), 2);
        assert_eq!(connector.connects("c"), 1);
        assert_eq!(store.fetch_count(), 4);
        let err = store.get(&targets[2], &keys[1]).await.unwrap_err();
        assert!(matches!(err, HostError::Connection(_)));
    }
}
