use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default sample-size bucket ladder for fingerprinting (see `fingerprint`).
pub const DEFAULT_BUCKETS: &[u32] = &[10, 25, 50, 100, 250, 500, 1000];

/// Upper bound on worker concurrency to protect provider rate limits.
const MAX_WORKER_CONCURRENCY: usize = 64;

/// Runtime settings, sourced from `RANKLAB_*` environment variables.
///
/// Every field has a working default; unparseable values fall back to the
/// default with a warning rather than aborting startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hard ceiling on a single task's wall-clock duration.
    pub task_max_duration: Duration,
    /// Fingerprint bucketing ladder, ascending.
    pub sample_size_buckets: Vec<u32>,
    /// Cache rows older than this are stale and ignored on lookup.
    pub cache_ttl: Duration,
    /// Plans requesting fewer samples than this bypass the cache entirely.
    pub min_cache_reuse_samples: u32,
    /// Max wait between a cancel request and the worker observing it.
    pub cancel_latency_bound: Duration,
    /// Worker ownership window; an unrenewed lease makes the task reclaimable.
    pub lease_ttl: Duration,
    /// Rate limit on task progress writes.
    pub progress_min_interval: Duration,
    /// Lifetime of an in-memory credential envelope.
    pub credential_envelope_ttl: Duration,
    /// Number of concurrent worker loops.
    pub worker_concurrency: usize,
    /// Requested sample sizes are clamped to this before bucketing.
    pub max_sample_size: u32,
    /// Cache rows stamped with an older evaluator version are stale.
    pub min_evaluator_version: u32,
    /// DuckDB database file path.
    pub db_path: PathBuf,
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_max_duration: Duration::from_secs(900),
            sample_size_buckets: DEFAULT_BUCKETS.to_vec(),
            cache_ttl: Duration::from_secs(7 * 24 * 3600),
            min_cache_reuse_samples: 10,
            cancel_latency_bound: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(30),
            progress_min_interval: Duration::from_millis(500),
            credential_envelope_ttl: Duration::from_secs(3600),
            worker_concurrency: 4,
            max_sample_size: 1000,
            min_evaluator_version: 1,
            db_path: PathBuf::from(".ranklab/ranklab.duckdb"),
            listen_addr: "127.0.0.1:8000".parse().unwrap_or_else(|_| {
                SocketAddr::from(([127, 0, 0, 1], 8000))
            }),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(secs) = parse_env_u64("RANKLAB_TASK_MAX_DURATION_SECS") {
            cfg.task_max_duration = Duration::from_secs(secs.max(1));
        }
        if let Some(buckets) = parse_env_buckets("RANKLAB_SAMPLE_SIZE_BUCKETS") {
            cfg.sample_size_buckets = buckets;
        }
        if let Some(secs) = parse_env_u64("RANKLAB_CACHE_TTL_SECS") {
            cfg.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = parse_env_u64("RANKLAB_MIN_CACHE_REUSE_SAMPLES") {
            cfg.min_cache_reuse_samples = n.min(u64::from(u32::MAX)) as u32;
        }
        if let Some(secs) = parse_env_u64("RANKLAB_CANCEL_LATENCY_BOUND_SECS") {
            cfg.cancel_latency_bound = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_env_u64("RANKLAB_LEASE_TTL_SECS") {
            cfg.lease_ttl = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = parse_env_u64("RANKLAB_PROGRESS_MIN_INTERVAL_MS") {
            cfg.progress_min_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_env_u64("RANKLAB_CREDENTIAL_ENVELOPE_TTL_SECS") {
            cfg.credential_envelope_ttl = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parse_env_u64("RANKLAB_WORKER_CONCURRENCY") {
            cfg.worker_concurrency = (n as usize).clamp(1, MAX_WORKER_CONCURRENCY);
        }
        if let Some(n) = parse_env_u64("RANKLAB_MAX_SAMPLE_SIZE") {
            cfg.max_sample_size = n.clamp(1, u64::from(u32::MAX)) as u32;
        }
        if let Some(n) = parse_env_u64("RANKLAB_MIN_EVALUATOR_VERSION") {
            cfg.min_evaluator_version = n.min(u64::from(u32::MAX)) as u32;
        }
        if let Ok(path) = env::var("RANKLAB_DB_PATH") {
            cfg.db_path = PathBuf::from(path);
        }
        if let Ok(addr) = env::var("RANKLAB_LISTEN_ADDR") {
            match addr.parse() {
                Ok(parsed) => cfg.listen_addr = parsed,
                Err(e) => tracing::warn!("RANKLAB_LISTEN_ADDR unparseable ({e}), using default"),
            }
        }

        cfg
    }
}

fn parse_env_u64(key: &str) -> Option<u64> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("{key}={raw:?} unparseable ({e}), using default");
            None
        }
    }
}

/// Parse a comma-separated bucket ladder. Returns None (keep default) when
/// empty or containing garbage; the result is sorted, deduplicated, nonzero.
fn parse_env_buckets(key: &str) -> Option<Vec<u32>> {
    let raw = env::var(key).ok()?;
    let mut buckets = Vec::new();
    for part in raw.split(',') {
        match part.trim().parse::<u32>() {
            Ok(0) => {
                tracing::warn!("{key} contains 0, using default ladder");
                return None;
            }
            Ok(v) => buckets.push(v),
            Err(e) => {
                tracing::warn!("{key}={raw:?} unparseable ({e}), using default ladder");
                return None;
            }
        }
    }
    if buckets.is_empty() {
        return None;
    }
    buckets.sort_unstable();
    buckets.dedup();
    Some(buckets)
}
