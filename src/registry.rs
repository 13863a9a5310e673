//! The solver registry: one canonical pipeline from player URL to Solvers
//! Pair, with at-most-once concurrent work per fingerprint.
//!
//! Lookup order per fingerprint is strict: disk store (fetch if absent),
//! solver cache, preprocessed cache, worker-pool preprocess, extract. Two
//! concurrent cold calls for the same player collapse onto one builder; the
//! rest wait and re-read the cache. Failures are never cached — the pending
//! entry is removed first, so the next caller rebuilds from scratch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::cache::TieredCache;
use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::metrics::Metrics;
use crate::player::{self, PlayerStore};
use crate::solver::{self, SolverPair};
use crate::worker::WorkerPool;

pub struct SolverRegistry {
    store: Arc<PlayerStore>,
    pool: Arc<WorkerPool>,
    pub preprocessed: Arc<TieredCache<Arc<String>>>,
    pub solvers: Arc<TieredCache<Arc<SolverPair>>>,
    pub sts: Arc<TieredCache<String>>,
    inflight: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl SolverRegistry {
    pub fn new(
        store: Arc<PlayerStore>,
        pool: Arc<WorkerPool>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            pool,
            preprocessed: TieredCache::new(
                "preprocessed",
                config.preprocessed_cache,
                Arc::clone(&metrics),
            ),
            solvers: TieredCache::new("solver", config.solver_cache, Arc::clone(&metrics)),
            sts: TieredCache::new("sts", config.sts_cache, metrics),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn player_store(&self) -> &Arc<PlayerStore> {
        &self.store
    }

    /// Produce the Solvers Pair for an already-canonical player URL.
    ///
    /// Callers validate and normalize first (`player::canonicalize`), so
    /// every spelling of a player lands on one fingerprint here.
    pub async fn solvers_for(&self, canonical_url: &str) -> Result<Arc<SolverPair>> {
        let fp = player::fingerprint(canonical_url);

        loop {
            // Disk first: refreshes last-use on hit, coalesced fetch on miss.
            let path = self.store.path_for(canonical_url).await?;

            if let Some(pair) = self.solvers.get(&fp) {
                return Ok(pair);
            }

            enum Role {
                Leader,
                Waiter(broadcast::Receiver<()>),
            }

            let role = {
                let mut inflight = self.inflight.lock().unwrap();
                match inflight.get(&fp) {
                    Some(tx) => Role::Waiter(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        inflight.insert(fp.clone(), tx);
                        Role::Leader
                    }
                }
            };

            match role {
                Role::Waiter(mut rx) => {
                    // Builder finished or failed; loop and re-read the cache.
                    let _ = rx.recv().await;
                }
                Role::Leader => {
                    let result = self.build(&fp, &path).await;
                    let tx = self.inflight.lock().unwrap().remove(&fp);
                    if let Some(tx) = tx {
                        let _ = tx.send(());
                    }
                    return result;
                }
            }
        }
    }

    /// Steps 3-6 of the pipeline, run by exactly one caller per fingerprint.
    async fn build(&self, fp: &str, path: &Path) -> Result<Arc<SolverPair>> {
        let preprocessed = match self.preprocessed.get(fp) {
            Some(pp) => pp,
            None => {
                let raw = self.store.read_script(path).await?;
                let pp = Arc::new(self.pool.run(raw).await?);
                self.preprocessed.put(fp, Arc::clone(&pp));
                pp
            }
        };

        let pair = solver::extract(&preprocessed).map_err(|e| {
            ServiceError::internal("SOLVER_GENERATION_FAILED", format!("extraction failed: {e}"))
        })?;

        if pair.is_empty() {
            return Err(ServiceError::internal(
                "SOLVER_GENERATION_FAILED",
                "extraction yielded no callables for this player",
            ));
        }

        let pair = Arc::new(pair);
        self.solvers.put(fp, Arc::clone(&pair));
        tracing::info!(
            "[registry] built solvers for {} (sig={}, n={})",
            &fp[..12.min(fp.len())],
            pair.sig.is_some(),
            pair.n.is_some()
        );
        Ok(pair)
    }

    /// Drop the three in-memory tiers (the `clear_cache` fast path).
    pub fn clear_memory_caches(&self) {
        self.preprocessed.clear();
        self.solvers.clear();
        self.sts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const SCRIPT: &str = r#"
var Wk={c9:function(a){a.reverse()},J2:function(a,b){a.splice(0,b)},d0:function(a,b){var c=a[0];a[0]=a[b%a.length];a[b%a.length]=c}};
var dec=function(a){a=a.split("");Wk.J2(a,2);Wk.c9(a,0);return a.join("")};
var nTr=function(a){a=a.split("");a.reverse();return a.join("")};
c.get("n"))&&(e=nTr(f);
padding padding padding padding padding padding padding padding padding
"#;

    fn spawn_stub_server(body: &'static str, hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind localhost");
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                hits.fetch_add(1, Ordering::SeqCst);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/s/player/test/player.js")
    }

    fn registry(dir: &Path, metrics: Arc<Metrics>) -> Arc<SolverRegistry> {
        let store = Arc::new(
            PlayerStore::new(
                dir,
                Duration::from_secs(14 * 24 * 3600),
                reqwest::Client::new(),
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        let pool = WorkerPool::spawn(4, 32, Duration::from_secs(10), 3, Arc::clone(&metrics));
        SolverRegistry::new(store, pool, &Config::default(), metrics)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cold_pipeline_builds_and_caches_the_pair() {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = Metrics::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_stub_server(SCRIPT, Arc::clone(&hits));
        let reg = registry(tmp.path(), Arc::clone(&metrics));

        let pair = reg.solvers_for(&url).await.unwrap();
        let sig = pair.sig.as_ref().expect("sig solver");
        // splice(2) then reverse
        assert_eq!(sig.apply("abcdef").unwrap(), "fedc");
        assert!(pair.n.is_some());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(reg.solvers.len(), 1);
        assert_eq!(reg.preprocessed.len(), 1);

        // Warm call: same Arc identity, no extra fetch, no extra preprocess.
        let again = reg.solvers_for(&url).await.unwrap();
        assert!(Arc::ptr_eq(&pair, &again));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.worker_tasks_total.with(&["success"]).get(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_cold_calls_run_the_pipeline_once() {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = Metrics::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_stub_server(SCRIPT, Arc::clone(&hits));
        let reg = registry(tmp.path(), Arc::clone(&metrics));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let reg = Arc::clone(&reg);
            let url = url.clone();
            handles.push(tokio::spawn(async move { reg.solvers_for(&url).await }));
        }
        let mut pairs = Vec::new();
        for h in handles {
            pairs.push(h.await.unwrap().unwrap());
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1, "one upstream fetch");
        assert_eq!(
            metrics.worker_tasks_total.with(&["success"]).get(),
            1,
            "one preprocess"
        );
        for p in &pairs[1..] {
            assert!(Arc::ptr_eq(&pairs[0], p), "all callers share one pair");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn preprocessed_tier_short_circuits_the_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = Metrics::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_stub_server(SCRIPT, Arc::clone(&hits));
        let reg = registry(tmp.path(), Arc::clone(&metrics));

        reg.solvers_for(&url).await.unwrap();
        // Drop only the solver tier; the preprocessed document survives.
        reg.solvers.clear();
        reg.solvers_for(&url).await.unwrap();

        assert_eq!(metrics.worker_tasks_total.with(&["success"]).get(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clear_then_rebuild_matches_fresh_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = Metrics::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_stub_server(SCRIPT, Arc::clone(&hits));
        let reg = registry(tmp.path(), Arc::clone(&metrics));

        let before = reg.solvers_for(&url).await.unwrap();
        let expected = before.sig.as_ref().unwrap().apply("abcdef").unwrap();

        reg.clear_memory_caches();
        assert_eq!(reg.solvers.len(), 0);
        assert_eq!(reg.preprocessed.len(), 0);

        let after = reg.solvers_for(&url).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after), "rebuilt, not resurrected");
        assert_eq!(after.sig.as_ref().unwrap().apply("abcdef").unwrap(), expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn extraction_failures_are_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = Metrics::new();
        let hits = Arc::new(AtomicUsize::new(0));
        // Valid-looking script with no recognizable transforms.
        let url = spawn_stub_server(
            "function nothing(a){return a+2} var filler = 'padding padding padding padding \
             padding padding padding padding padding padding padding padding padding';",
            Arc::clone(&hits),
        );
        let reg = registry(tmp.path(), Arc::clone(&metrics));

        let err = reg.solvers_for(&url).await.unwrap_err();
        assert_eq!(err.code(), "SOLVER_GENERATION_FAILED");
        assert_eq!(reg.solvers.len(), 0, "failures are never cached");
        assert!(reg.inflight.lock().unwrap().is_empty());

        // A retry runs the extract step again instead of replaying an error.
        let err = reg.solvers_for(&url).await.unwrap_err();
        assert_eq!(err.code(), "SOLVER_GENERATION_FAILED");
    }
}
