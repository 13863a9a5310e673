//! Service metrics: atomic counters, gauges and fixed-bound latency
//! histograms, rendered in Prometheus text exposition format.
//!
//! Label cardinality is tiny and known ahead of time (paths, cache names,
//! op names), so labeled instruments are a mutex-guarded map of atomic
//! children; the hot path only touches the map to look up an `Arc` once
//! per label combination.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Primitive instruments
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn add(&self, v: i64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Latency buckets in seconds, chosen to cover sub-millisecond cache hits
/// through multi-second cold preprocessing runs.
const LATENCY_BOUNDS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0, 60.0,
];

pub struct Histogram {
    buckets: [AtomicU64; LATENCY_BOUNDS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    pub fn observe(&self, d: Duration) {
        let secs = d.as_secs_f64();
        for (i, bound) in LATENCY_BOUNDS.iter().enumerate() {
            if secs <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Labeled families
// ---------------------------------------------------------------------------

pub struct CounterVec {
    children: Mutex<HashMap<Vec<String>, Arc<Counter>>>,
}

impl CounterVec {
    fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn with(&self, labels: &[&str]) -> Arc<Counter> {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let mut children = self.children.lock().unwrap();
        children.entry(key).or_default().clone()
    }

    fn snapshot(&self) -> Vec<(Vec<String>, u64)> {
        let children = self.children.lock().unwrap();
        children.iter().map(|(k, v)| (k.clone(), v.get())).collect()
    }

    /// Sum across all children (used for aggregate views in `/status`).
    pub fn total(&self) -> u64 {
        self.children
            .lock()
            .unwrap()
            .values()
            .map(|c| c.get())
            .sum()
    }
}

pub struct HistogramVec {
    children: Mutex<HashMap<Vec<String>, Arc<Histogram>>>,
}

impl HistogramVec {
    fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn with(&self, labels: &[&str]) -> Arc<Histogram> {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let mut children = self.children.lock().unwrap();
        children.entry(key).or_default().clone()
    }

    fn snapshot(&self) -> Vec<(Vec<String>, Arc<Histogram>)> {
        let children = self.children.lock().unwrap();
        children.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

pub struct GaugeVec {
    children: Mutex<HashMap<Vec<String>, Arc<Gauge>>>,
}

impl GaugeVec {
    fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn with(&self, labels: &[&str]) -> Arc<Gauge> {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let mut children = self.children.lock().unwrap();
        children.entry(key).or_default().clone()
    }

    fn snapshot(&self) -> Vec<(Vec<String>, i64)> {
        let children = self.children.lock().unwrap();
        children.iter().map(|(k, v)| (k.clone(), v.get())).collect()
    }
}

// ---------------------------------------------------------------------------
// Health window
// ---------------------------------------------------------------------------

/// One-minute request/error buckets. Rates are computed over the trailing
/// window so an error burst ages out instead of poisoning the cumulative
/// ratio for the rest of the process lifetime.
const HEALTH_WINDOW_MINUTES: u64 = 5;

#[derive(Clone, Copy, Default)]
struct MinuteBucket {
    minute: u64,
    requests: u64,
    errors: u64,
}

struct HealthWindow {
    buckets: Mutex<Vec<MinuteBucket>>,
}

impl HealthWindow {
    fn new() -> Self {
        Self {
            buckets: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, minute: u64, is_error: bool) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets.retain(|b| minute - b.minute < HEALTH_WINDOW_MINUTES);
        match buckets.iter_mut().find(|b| b.minute == minute) {
            Some(b) => {
                b.requests += 1;
                if is_error {
                    b.errors += 1;
                }
            }
            None => buckets.push(MinuteBucket {
                minute,
                requests: 1,
                errors: u64::from(is_error),
            }),
        }
    }

    fn error_rate(&self, minute: u64) -> f64 {
        let buckets = self.buckets.lock().unwrap();
        let (mut requests, mut errors) = (0u64, 0u64);
        for b in buckets.iter() {
            if minute - b.minute < HEALTH_WINDOW_MINUTES {
                requests += b.requests;
                errors += b.errors;
            }
        }
        if requests == 0 {
            0.0
        } else {
            errors as f64 / requests as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Metrics {
    started: Instant,

    // HTTP surface
    pub requests_total: CounterVec,       // {path}
    pub responses_total: CounterVec,      // {path, status}
    pub request_duration: HistogramVec,   // {path}
    pub errors_total: CounterVec,         // {kind}
    pub rate_limited_total: Counter,

    // Caches
    pub cache_hits: CounterVec,        // {cache}
    pub cache_misses: CounterVec,      // {cache}
    pub cache_ops: CounterVec,         // {cache, op, outcome}
    pub cache_op_duration: HistogramVec, // {cache, op}
    pub cache_evictions: CounterVec,   // {cache, reason}
    pub cache_size: GaugeVec,          // {cache}

    // Worker pool
    pub worker_tasks_total: CounterVec, // {status}
    pub worker_task_duration: Histogram,
    pub workers_active: Gauge,
    pub workers_idle: Gauge,

    // Player store
    pub player_fetches_total: CounterVec, // {outcome}
    pub player_store_files: Gauge,

    // Process
    pub memory_rss_bytes: Gauge,

    health: HealthWindow,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            requests_total: CounterVec::new(),
            responses_total: CounterVec::new(),
            request_duration: HistogramVec::new(),
            errors_total: CounterVec::new(),
            rate_limited_total: Counter::default(),
            cache_hits: CounterVec::new(),
            cache_misses: CounterVec::new(),
            cache_ops: CounterVec::new(),
            cache_op_duration: HistogramVec::new(),
            cache_evictions: CounterVec::new(),
            cache_size: GaugeVec::new(),
            worker_tasks_total: CounterVec::new(),
            worker_task_duration: Histogram::default(),
            workers_active: Gauge::default(),
            workers_idle: Gauge::default(),
            player_fetches_total: CounterVec::new(),
            player_store_files: Gauge::default(),
            memory_rss_bytes: Gauge::default(),
            health: HealthWindow::new(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn current_minute(&self) -> u64 {
        self.started.elapsed().as_secs() / 60
    }

    /// Record one finished request for health-rate purposes.
    pub fn record_outcome(&self, is_error: bool) {
        self.health.record(self.current_minute(), is_error);
    }

    /// Windowed error rate in `[0, 1]`.
    pub fn error_rate(&self) -> f64 {
        self.health.error_rate(self.current_minute())
    }

    /// Health classification over the trailing window.
    pub fn health_status(&self) -> HealthStatus {
        let rate = self.error_rate();
        if rate > 0.30 {
            HealthStatus::Unhealthy
        } else if rate > 0.10 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Sample the resident set size from /proc (Linux only; other platforms
    /// leave the gauge at its last value).
    pub fn sample_memory(&self) {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if let Some(rest) = line.strip_prefix("VmRSS:") {
                        if let Some(kb) = rest
                            .split_whitespace()
                            .next()
                            .and_then(|v| v.parse::<i64>().ok())
                        {
                            self.memory_rss_bytes.set(kb * 1024);
                        }
                        return;
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    /// Render every instrument in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(8 * 1024);

        render_counter_vec(
            &mut out,
            "ytsig_requests_total",
            "Requests received, by path.",
            &["path"],
            &self.requests_total,
        );
        render_counter_vec(
            &mut out,
            "ytsig_responses_total",
            "Responses sent, by path and status.",
            &["path", "status"],
            &self.responses_total,
        );
        render_histogram_vec(
            &mut out,
            "ytsig_request_duration_seconds",
            "Request handling latency, by path.",
            &["path"],
            &self.request_duration,
        );
        render_counter_vec(
            &mut out,
            "ytsig_errors_total",
            "Errors returned to clients, by kind.",
            &["kind"],
            &self.errors_total,
        );
        render_counter(
            &mut out,
            "ytsig_rate_limited_total",
            "Requests rejected by the rate limiter.",
            self.rate_limited_total.get(),
        );

        render_counter_vec(
            &mut out,
            "ytsig_cache_hits_total",
            "Cache lookups that found a live entry.",
            &["cache"],
            &self.cache_hits,
        );
        render_counter_vec(
            &mut out,
            "ytsig_cache_misses_total",
            "Cache lookups that found nothing (or an expired entry).",
            &["cache"],
            &self.cache_misses,
        );
        render_counter_vec(
            &mut out,
            "ytsig_cache_ops_total",
            "Cache operations, by cache, op and outcome.",
            &["cache", "op", "outcome"],
            &self.cache_ops,
        );
        render_histogram_vec(
            &mut out,
            "ytsig_cache_op_duration_seconds",
            "Cache operation latency, by cache and op.",
            &["cache", "op"],
            &self.cache_op_duration,
        );
        render_counter_vec(
            &mut out,
            "ytsig_cache_evictions_total",
            "Entries evicted, by cache and reason.",
            &["cache", "reason"],
            &self.cache_evictions,
        );
        render_gauge_vec(
            &mut out,
            "ytsig_cache_size",
            "Live entries per cache.",
            &["cache"],
            &self.cache_size,
        );

        render_counter_vec(
            &mut out,
            "ytsig_worker_tasks_total",
            "Preprocessing tasks completed, by status.",
            &["status"],
            &self.worker_tasks_total,
        );
        render_histogram(
            &mut out,
            "ytsig_worker_task_duration_seconds",
            "Preprocessing task wall time.",
            &self.worker_task_duration,
            "",
        );
        render_gauge(
            &mut out,
            "ytsig_workers_active",
            "Workers currently running a task.",
            self.workers_active.get(),
        );
        render_gauge(
            &mut out,
            "ytsig_workers_idle",
            "Workers waiting for a task.",
            self.workers_idle.get(),
        );

        render_counter_vec(
            &mut out,
            "ytsig_player_fetches_total",
            "Upstream player-script fetches, by outcome.",
            &["outcome"],
            &self.player_fetches_total,
        );
        render_gauge(
            &mut out,
            "ytsig_player_store_files",
            "Scripts currently held in the on-disk store.",
            self.player_store_files.get(),
        );

        render_gauge(
            &mut out,
            "ytsig_memory_rss_bytes",
            "Resident set size.",
            self.memory_rss_bytes.get(),
        );
        render_gauge(
            &mut out,
            "ytsig_uptime_seconds",
            "Seconds since process start.",
            self.uptime().as_secs() as i64,
        );

        out
    }
}

// ---------------------------------------------------------------------------
// Text format helpers
// ---------------------------------------------------------------------------

fn label_str(names: &[&str], values: &[String]) -> String {
    if names.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = names
        .iter()
        .zip(values.iter())
        .map(|(n, v)| format!("{n}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: i64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn render_counter_vec(out: &mut String, name: &str, help: &str, labels: &[&str], vec: &CounterVec) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let mut rows = vec.snapshot();
    rows.sort();
    for (values, count) in rows {
        let _ = writeln!(out, "{name}{} {count}", label_str(labels, &values));
    }
}

fn render_gauge_vec(out: &mut String, name: &str, help: &str, labels: &[&str], vec: &GaugeVec) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let mut rows = vec.snapshot();
    rows.sort();
    for (values, v) in rows {
        let _ = writeln!(out, "{name}{} {v}", label_str(labels, &values));
    }
}

fn render_histogram(out: &mut String, name: &str, help: &str, h: &Histogram, labels: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} histogram");
    let mut cumulative = 0u64;
    for (i, bound) in LATENCY_BOUNDS.iter().enumerate() {
        cumulative += h.buckets[i].load(Ordering::Relaxed);
        let le = if labels.is_empty() {
            format!("{{le=\"{bound}\"}}")
        } else {
            format!("{{{labels},le=\"{bound}\"}}")
        };
        let _ = writeln!(out, "{name}_bucket{le} {cumulative}");
    }
    let inf = if labels.is_empty() {
        "{le=\"+Inf\"}".to_string()
    } else {
        format!("{{{labels},le=\"+Inf\"}}")
    };
    let _ = writeln!(out, "{name}_bucket{inf} {}", h.count());
    let brace = if labels.is_empty() {
        String::new()
    } else {
        format!("{{{labels}}}")
    };
    let _ = writeln!(
        out,
        "{name}_sum{brace} {}",
        h.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    );
    let _ = writeln!(out, "{name}_count{brace} {}", h.count());
}

fn render_histogram_vec(
    out: &mut String,
    name: &str,
    help: &str,
    labels: &[&str],
    vec: &HistogramVec,
) {
    let mut rows = vec.snapshot();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    let mut first = true;
    for (values, h) in rows {
        let pairs: Vec<String> = labels
            .iter()
            .zip(values.iter())
            .map(|(n, v)| format!("{n}=\"{v}\""))
            .collect();
        if first {
            render_histogram(out, name, help, &h, &pairs.join(","));
            first = false;
        } else {
            // HELP/TYPE only once per family
            let mut tmp = String::new();
            render_histogram(&mut tmp, name, help, &h, &pairs.join(","));
            for line in tmp.lines().skip(2) {
                let _ = writeln!(out, "{line}");
            }
        }
    }
    if first {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
    }
}
