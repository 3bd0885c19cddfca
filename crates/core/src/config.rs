use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period after the last edit before a collection is pushed.
    pub debounce: Duration,
    pub session_check_interval: Duration,
    pub cache_dir: PathBuf,
    /// Backend base URL, without the `/api` suffix.
    pub api_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(800),
            session_check_interval: Duration::from_secs(30),
            cache_dir: PathBuf::from("./data/cache"),
            api_url: "http://localhost:3000".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            debounce: env::var("CANTEIRO_SYNC_DEBOUNCE_MS")
                .ok()
                .and_then(|ms| ms.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.debounce),
            session_check_interval: env::var("CANTEIRO_SESSION_CHECK_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_check_interval),
            cache_dir: env::var("CANTEIRO_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            api_url: env::var("CANTEIRO_API_URL")
                .ok()
                .filter(|url| !url.is_empty())
                .unwrap_or(defaults.api_url),
        }
    }
}
