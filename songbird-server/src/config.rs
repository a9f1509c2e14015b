//! Configuration (§6 "Configuration"): a `clap::Parser` struct with `env`
//! fallbacks, loaded once in `main` after `dotenvy::dotenv()` — the same
//! shape as the teacher's CLI-args-plus-env config loading, generalized
//! with defaults for every field spec.md §6 names.

use std::time::Duration;

use clap::Parser;

fn parse_duration_secs(raw: &str) -> Result<Duration, String> {
    raw.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Parser)]
#[command(name = "songbird-server", about = "Coordinator core host: ingests field-device clips, classifies species, and generates art")]
pub struct Settings {
    /// Address to bind the HTTP/WebSocket listener on.
    #[arg(long, env = "SONGBIRD_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Path to the sqlite database file (created on first run).
    #[arg(long, env = "SONGBIRD_DATABASE_PATH", default_value = "songbird.db")]
    pub database_path: String,

    /// Root directory backing the Clip Store and Asset Store.
    #[arg(long, env = "SONGBIRD_BLOB_ROOT", default_value = "./blobs")]
    pub blob_root: String,

    /// Public URL prefix clients use to fetch generated assets.
    #[arg(long, env = "SONGBIRD_ASSET_URL_PREFIX", default_value = "http://localhost:8080/assets")]
    pub asset_url_prefix: String,

    /// Base URL of the classifier collaborator (C4).
    #[arg(long, env = "SONGBIRD_CLASSIFIER_URL", default_value = "http://localhost:9001")]
    pub classifier_url: String,

    /// Classifier call deadline, in seconds (§4.3 default 5s).
    #[arg(long, env = "SONGBIRD_CLASSIFIER_DEADLINE_SECS", default_value = "5", value_parser = parse_duration_secs)]
    pub classifier_deadline: Duration,

    /// Base URL of the art generator collaborator (C4).
    #[arg(long, env = "SONGBIRD_GENERATOR_URL", default_value = "http://localhost:9002")]
    pub generator_url: String,

    /// Generator call deadline, in seconds (§4.3 default 15s).
    #[arg(long, env = "SONGBIRD_GENERATOR_DEADLINE_SECS", default_value = "15", value_parser = parse_duration_secs)]
    pub generator_deadline: Duration,

    /// Dispatcher worker pool size. Default is 2x available parallelism
    /// when unset (§4.5); 0 means "use the default".
    #[arg(long, env = "SONGBIRD_WORKER_POOL_SIZE", default_value = "0")]
    pub worker_pool_size: usize,

    /// Dispatcher queue capacity. 0 means "8x the worker pool size" (§4.5).
    #[arg(long, env = "SONGBIRD_QUEUE_CAPACITY", default_value = "0")]
    pub queue_capacity: usize,

    /// Per-job deadline inside the dispatcher, in seconds (§4.5 default 60s).
    #[arg(long, env = "SONGBIRD_JOB_DEADLINE_SECS", default_value = "60", value_parser = parse_duration_secs)]
    pub job_deadline: Duration,

    /// Reaper sweep interval, in seconds (§5 default 30s).
    #[arg(long, env = "SONGBIRD_REAPER_INTERVAL_SECS", default_value = "30", value_parser = parse_duration_secs)]
    pub reaper_interval: Duration,

    /// Age after which a non-terminal Capture is orphaned, in seconds
    /// (§4.4 default 120s).
    #[arg(long, env = "SONGBIRD_REAPER_STALE_AGE_SECS", default_value = "120", value_parser = parse_duration_secs)]
    pub reaper_stale_age: Duration,

    /// Per-device rate limit: uploads admitted per minute (§4.6 default 30).
    #[arg(long, env = "SONGBIRD_RATE_LIMIT_PER_MINUTE", default_value = "30")]
    pub rate_limit_per_minute: u32,

    /// Per-device rate limit burst size (§4.6 default 10).
    #[arg(long, env = "SONGBIRD_RATE_LIMIT_BURST", default_value = "10")]
    pub rate_limit_burst: u32,

    /// Idle device rate-limit buckets are evicted after this many seconds.
    #[arg(long, env = "SONGBIRD_RATE_LIMIT_IDLE_SECS", default_value = "600", value_parser = parse_duration_secs)]
    pub rate_limit_idle_age: Duration,

    /// Maximum accepted upload size, in bytes (§4.6 default 10 MiB).
    #[arg(long, env = "SONGBIRD_MAX_UPLOAD_BYTES", default_value = "10485760")]
    pub max_upload_bytes: usize,

    /// Interval between WebSocket gateway pings, in seconds (§4.8 default 20s).
    #[arg(long, env = "SONGBIRD_WS_PING_INTERVAL_SECS", default_value = "20", value_parser = parse_duration_secs)]
    pub ws_ping_interval: Duration,

    /// Grace period before a saturated subscriber is disconnected, in
    /// seconds (§4.8 default 5s).
    #[arg(long, env = "SONGBIRD_WS_BACKPRESSURE_GRACE_SECS", default_value = "5", value_parser = parse_duration_secs)]
    pub ws_backpressure_grace: Duration,
}

impl Settings {
    /// Load from CLI args + environment, with `.env` consulted first if
    /// present (mirrors the teacher's config bootstrap).
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Settings::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_bare_binary_name() {
        let settings = Settings::parse_from(["songbird-server"]);
        assert_eq!(settings.bind_addr, "0.0.0.0:8080");
        assert_eq!(settings.classifier_deadline, Duration::from_secs(5));
        assert_eq!(settings.generator_deadline, Duration::from_secs(15));
        assert_eq!(settings.reaper_stale_age, Duration::from_secs(120));
        assert_eq!(settings.rate_limit_per_minute, 30);
        assert_eq!(settings.rate_limit_burst, 10);
        assert_eq!(settings.max_upload_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn overrides_are_honored() {
        let settings = Settings::parse_from([
            "songbird-server",
            "--worker-pool-size",
            "4",
            "--max-upload-bytes",
            "1024",
        ]);
        assert_eq!(settings.worker_pool_size, 4);
        assert_eq!(settings.max_upload_bytes, 1024);
    }
}
