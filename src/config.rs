use std::path::PathBuf;
use std::time::Duration;

/// Token value that means "auth is not configured". Enforcement only kicks
/// in when `API_TOKEN` is set to something else.
pub const DEFAULT_API_TOKEN: &str = "ytsig-default-token";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Sizing for one in-memory cache tier.
#[derive(Debug, Clone, Copy)]
pub struct CacheTierConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// API token; equal to `DEFAULT_API_TOKEN` means enforcement is off.
    pub api_token: String,

    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: u64,

    pub player_cache_dir: PathBuf,
    pub player_cache_retention: Duration,

    pub preprocessed_cache: CacheTierConfig,
    pub solver_cache: CacheTierConfig,
    pub sts_cache: CacheTierConfig,

    pub worker_concurrency: usize,
    pub worker_queue_capacity: usize,
    pub worker_timeout: Duration,
    pub worker_max_retries: u32,

    pub log_level: String,
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            api_token: DEFAULT_API_TOKEN.into(),
            rate_limit_window: Duration::from_millis(60_000),
            rate_limit_max_requests: 100,
            player_cache_dir: PathBuf::from("player_cache"),
            player_cache_retention: Duration::from_secs(14 * 24 * 3600),
            preprocessed_cache: CacheTierConfig {
                max_entries: 15_000,
                ttl: Duration::from_secs(4 * 3600),
                sweep_interval: Duration::from_secs(600),
            },
            solver_cache: CacheTierConfig {
                max_entries: 5_000,
                ttl: Duration::from_secs(2 * 3600),
                sweep_interval: Duration::from_secs(600),
            },
            sts_cache: CacheTierConfig {
                max_entries: 10_000,
                ttl: Duration::from_secs(3600),
                sweep_interval: Duration::from_secs(300),
            },
            worker_concurrency: 16,
            worker_queue_capacity: 256,
            worker_timeout: Duration::from_secs(60),
            worker_max_retries: 5,
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Config {
    /// Build the configuration from the process environment. Unset or
    /// unparseable variables fall back to defaults.
    pub fn from_env() -> Self {
        let d = Config::default();

        Self {
            host: env_str("HOST", &d.host),
            port: env_parse("PORT", d.port),
            api_token: env_str("API_TOKEN", &d.api_token),
            rate_limit_window: Duration::from_millis(env_parse(
                "RATE_LIMIT_WINDOW_MS",
                d.rate_limit_window.as_millis() as u64,
            )),
            rate_limit_max_requests: env_parse(
                "RATE_LIMIT_MAX_REQUESTS",
                d.rate_limit_max_requests,
            ),
            player_cache_dir: PathBuf::from(env_str(
                "PLAYER_CACHE_DIR",
                &d.player_cache_dir.to_string_lossy(),
            )),
            player_cache_retention: Duration::from_secs(
                env_parse("PLAYER_CACHE_RETENTION_DAYS", 14u64) * 24 * 3600,
            ),
            preprocessed_cache: tier_from_env("PREPROCESSED_CACHE", d.preprocessed_cache),
            solver_cache: tier_from_env("SOLVER_CACHE", d.solver_cache),
            sts_cache: tier_from_env("STS_CACHE", d.sts_cache),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", d.worker_concurrency).max(1),
            worker_queue_capacity: env_parse("WORKER_QUEUE_CAPACITY", d.worker_queue_capacity)
                .max(1),
            worker_timeout: Duration::from_secs(env_parse(
                "WORKER_TIMEOUT_SECS",
                d.worker_timeout.as_secs(),
            )),
            worker_max_retries: env_parse("WORKER_MAX_RETRIES", d.worker_max_retries).max(1),
            log_level: env_str("LOG_LEVEL", &d.log_level),
            log_format: env_str("LOG_FORMAT", &d.log_format),
        }
    }

    /// True when a non-default token is configured and must be enforced.
    pub fn auth_enabled(&self) -> bool {
        !self.api_token.is_empty() && self.api_token != DEFAULT_API_TOKEN
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn tier_from_env(prefix: &str, default: CacheTierConfig) -> CacheTierConfig {
    CacheTierConfig {
        max_entries: env_parse(&format!("{prefix}_MAX"), default.max_entries),
        ttl: Duration::from_secs(env_parse(
            &format!("{prefix}_TTL_SECS"),
            default.ttl.as_secs(),
        )),
        sweep_interval: Duration::from_secs(env_parse(
            &format!("{prefix}_SWEEP_SECS"),
            default.sweep_interval.as_secs(),
        )),
    }
}
