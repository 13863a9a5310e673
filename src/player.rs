//! Player-script URLs and the on-disk, content-addressed script store.
//!
//! Scripts are keyed by the SHA-256 of their canonical URL; the store holds
//! one `<fingerprint>.js` file per player version plus nothing else. Fetches
//! of the same fingerprint are coalesced so a cold burst produces exactly
//! one upstream request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::error::{Result, ServiceError};
use crate::metrics::Metrics;

/// Upstream hosts a player URL may point at.
const ALLOWED_HOSTS: [&str; 5] = [
    "www.youtube.com",
    "youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "www.youtube-nocookie.com",
];

const CANONICAL_ORIGIN: &str = "https://www.youtube.com";

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

// ---------------------------------------------------------------------------
// URL normalization & fingerprinting
// ---------------------------------------------------------------------------

/// Validate a player URL and normalize it to its canonical absolute form.
///
/// Relative `/s/player/...` paths are expanded against the canonical origin.
/// Absolute URLs must be https, on an allow-listed host, and contain a
/// `/player/` path segment. Normalization runs before fingerprinting so
/// equivalent spellings share one cache key.
pub fn canonicalize(player_url: &str) -> Result<String> {
    let trimmed = player_url.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::validation(
            "INVALID_PLAYER_URL",
            "player_url must not be empty",
        ));
    }

    if trimmed.starts_with("/s/player/") {
        return Ok(format!("{CANONICAL_ORIGIN}{trimmed}"));
    }

    let parsed = url::Url::parse(trimmed).map_err(|e| {
        ServiceError::validation("INVALID_PLAYER_URL", format!("unparseable player_url: {e}"))
    })?;

    if parsed.scheme() != "https" {
        return Err(ServiceError::validation(
            "INVALID_PLAYER_URL",
            format!("player_url must be https, got {}", parsed.scheme()),
        ));
    }

    let host = parsed.host_str().unwrap_or_default();
    if !ALLOWED_HOSTS.contains(&host) {
        return Err(ServiceError::validation(
            "INVALID_PLAYER_HOST",
            format!("host {host:?} is not an allowed player host"),
        ));
    }

    if !parsed.path().contains("/player/") {
        return Err(ServiceError::validation(
            "INVALID_PLAYER_URL",
            "player_url path must contain /player/",
        ));
    }

    Ok(parsed.to_string())
}

/// Hex SHA-256 of the canonical player URL; the key into every
/// player-scoped cache.
pub fn fingerprint(canonical_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_url.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct PlayerStore {
    dir: PathBuf,
    retention: Duration,
    http: reqwest::Client,
    /// Per-fingerprint fetch coalescing: the first caller installs a sender,
    /// later callers subscribe and re-examine the filesystem once released.
    inflight: Mutex<HashMap<String, broadcast::Sender<()>>>,
    metrics: Arc<Metrics>,
}

impl PlayerStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        retention: Duration,
        http: reqwest::Client,
        metrics: Arc<Metrics>,
    ) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retention,
            http,
            inflight: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn script_path(&self, fp: &str) -> PathBuf {
        self.dir.join(format!("{fp}.js"))
    }

    /// Startup pass: drop every script whose newest timestamp is past the
    /// retention horizon, drop stray `.tmp` leftovers from interrupted
    /// writes, and publish the survivor count.
    pub fn init_cleanup(&self) -> std::io::Result<usize> {
        let now = SystemTime::now();
        let mut survivors = 0usize;
        let mut removed = 0usize;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                let _ = std::fs::remove_file(&path);
                removed += 1;
                continue;
            }

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let newest = [meta.accessed(), meta.modified(), meta.created()]
                .into_iter()
                .flatten()
                .max();
            let stale = newest
                .and_then(|t| now.duration_since(t).ok())
                .map(|age| age > self.retention)
                .unwrap_or(false);

            if stale {
                let _ = std::fs::remove_file(&path);
                removed += 1;
            } else {
                survivors += 1;
            }
        }

        self.metrics.player_store_files.set(survivors as i64);
        tracing::info!(
            "[store] cleanup done: {} scripts kept, {} removed",
            survivors,
            removed
        );
        Ok(survivors)
    }

    /// Resolve a canonical player URL to its on-disk path, fetching the
    /// script if it is not stored yet. Concurrent calls for the same
    /// fingerprint coalesce into one upstream fetch.
    pub async fn path_for(&self, canonical_url: &str) -> Result<PathBuf> {
        let fp = fingerprint(canonical_url);
        let path = self.script_path(&fp);

        loop {
            if path.exists() {
                refresh_mtime(&path);
                return Ok(path);
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
                    // Leader finished (or failed); either way, look again.
                    let _ = rx.recv().await;
                }
                Role::Leader => {
                    let result = self.fetch_and_store(canonical_url, &path).await;
                    let tx = self.inflight.lock().unwrap().remove(&fp);
                    if let Some(tx) = tx {
                        let _ = tx.send(());
                    }
                    result?;
                    return Ok(path);
                }
            }
        }
    }

    async fn fetch_and_store(&self, url: &str, path: &Path) -> Result<()> {
        tracing::info!("[store] fetching {}", url);
        let response = self
            .http
            .get(url)
            .header("User-Agent", BROWSER_UA)
            .send()
            .await
            .map_err(|e| {
                self.metrics.player_fetches_total.with(&["error"]).inc();
                ServiceError::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            self.metrics.player_fetches_total.with(&["error"]).inc();
            return Err(ServiceError::Upstream {
                status: Some(status.as_u16()),
                message: format!("player script fetch returned {status}"),
            });
        }

        let body = response.text().await.map_err(|e| {
            self.metrics.player_fetches_total.with(&["error"]).inc();
            ServiceError::from(e)
        })?;

        // Atomic publish: sibling tmp file, then rename.
        let tmp = path.with_extension("js.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, path).await?;

        self.metrics.player_fetches_total.with(&["success"]).inc();
        self.metrics.player_store_files.add(1);
        tracing::info!("[store] stored {} ({} bytes)", path.display(), body.len());
        Ok(())
    }

    /// Read a stored script back.
    pub async fn read_script(&self, path: &Path) -> Result<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    /// Delete every stored script (the `clear_cache` "player" target).
    pub fn clear(&self) -> std::io::Result<usize> {
        let mut removed = 0usize;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        self.metrics.player_store_files.set(0);
        tracing::info!("[store] cleared {} files", removed);
        Ok(removed)
    }

    pub fn file_count(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|rd| rd.flatten().filter(|e| e.path().is_file()).count())
            .unwrap_or(0)
    }
}

/// Bump the file's mtime so the retention sweep sees recent use. Truncating
/// to the current length counts as a modification without changing content.
fn refresh_mtime(path: &Path) {
    if let Ok(meta) = std::fs::metadata(path) {
        if let Ok(file) = std::fs::OpenOptions::new().write(true).open(path) {
            let _ = file.set_len(meta.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // -----------------------------------------------------------------------
    // URL handling
    // -----------------------------------------------------------------------

    #[test]
    fn canonicalize_accepts_allowed_hosts() {
        for host in ALLOWED_HOSTS {
            let url = format!("https://{host}/s/player/abc123/player_ias.vflset/en_US/base.js");
            assert!(canonicalize(&url).is_ok(), "{host} should be allowed");
        }
    }

    #[test]
    fn canonicalize_expands_relative_paths() {
        let got = canonicalize("/s/player/abc123/player_ias.vflset/en_US/base.js").unwrap();
        assert_eq!(
            got,
            "https://www.youtube.com/s/player/abc123/player_ias.vflset/en_US/base.js"
        );
    }

    #[test]
    fn canonicalize_rejects_bad_input() {
        assert!(canonicalize("").is_err());
        assert!(canonicalize("not a url").is_err());
        assert!(canonicalize("http://www.youtube.com/s/player/x/base.js").is_err());
        assert!(canonicalize("https://evil.example/s/player/x/player.js").is_err());
        assert!(canonicalize("https://www.youtube.com/watch?v=abc").is_err());
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint("https://www.youtube.com/s/player/abc/player.js");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable across calls, different across inputs.
        assert_eq!(fp, fingerprint("https://www.youtube.com/s/player/abc/player.js"));
        assert_ne!(fp, fingerprint("https://www.youtube.com/s/player/def/player.js"));
    }

    // -----------------------------------------------------------------------
    // Store
    // -----------------------------------------------------------------------

    /// Minimal one-response-per-connection HTTP stub that counts requests.
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
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/javascript\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/s/player/stub/player.js")
    }

    fn store(dir: &Path) -> PlayerStore {
        PlayerStore::new(
            dir,
            Duration::from_secs(14 * 24 * 3600),
            reqwest::Client::new(),
            Metrics::new(),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn path_for_fetches_once_then_serves_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_stub_server("var player = 1;", Arc::clone(&hits));
        let store = store(tmp.path());

        let first = store.path_for(&url).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::read_to_string(&first).unwrap(),
            "var player = 1;"
        );

        let second = store.path_for(&url).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "second call must not refetch");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_cold_calls_coalesce_to_one_fetch() {
        let tmp = tempfile::tempdir().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_stub_server("var coalesced = true;", Arc::clone(&hits));
        let store = Arc::new(store(tmp.path()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let url = url.clone();
            handles.push(tokio::spawn(async move { store.path_for(&url).await }));
        }
        for handle in handles {
            let path = handle.await.unwrap().unwrap();
            assert!(path.exists());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1, "all 16 calls share one fetch");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_2xx_fetch_is_an_upstream_error() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Some(Ok(mut stream)) = listener.incoming().next() {
                let mut buf = [0u8; 512];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                );
            }
        });

        let store = store(tmp.path());
        let url = format!("http://{addr}/s/player/gone/player.js");
        let err = store.path_for(&url).await.unwrap_err();
        match err {
            ServiceError::Upstream { status, .. } => assert_eq!(status, Some(404)),
            other => panic!("expected Upstream, got {other:?}"),
        }
        // Failure leaves the flight table clean for a retry.
        assert!(store.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_tmp_strays_and_counts_survivors() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("aaaa.js"), "kept").unwrap();
        std::fs::write(tmp.path().join("bbbb.js.tmp"), "stray").unwrap();

        let store = store(tmp.path());
        let survivors = store.init_cleanup().unwrap();
        assert_eq!(survivors, 1);
        assert!(tmp.path().join("aaaa.js").exists());
        assert!(!tmp.path().join("bbbb.js.tmp").exists());
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("aaaa.js"), "x").unwrap();
        std::fs::write(tmp.path().join("bbbb.js"), "y").unwrap();
        let store = store(tmp.path());
        assert_eq!(store.clear().unwrap(), 2);
        assert_eq!(store.file_count(), 0);
    }
}
