//! Runtime configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML file
//! (`SENTINEL_CONFIG`, default `config/sentinel`), then `SENTINEL_*` environment variables
//! with `__` as the nesting separator (e.g. `SENTINEL_TRACKER__SOS_INTERVAL_MS=2000`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tracker::TrackerConfig;

const DEFAULT_CONFIG_PATH: &str = "config/sentinel";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Identifies this device in SOS and service reports.
    pub user_id: String,
    pub storage_path: String,
    pub bind_addr: String,
    /// SentinelNet server. Unset means notifications are only logged.
    #[serde(default)]
    pub notification_base_url: Option<String>,
    pub notify_timeout_ms: u64,
    pub escalation_grace_ms: u64,
    pub sos_fix_timeout_ms: u64,
    /// Oldest device-reported fix still served as current.
    pub location_max_age_ms: u64,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            user_id: "demo-user".to_string(),
            storage_path: "./data/sentinel_store".to_string(),
            bind_addr: "127.0.0.1:8787".to_string(),
            notification_base_url: None,
            notify_timeout_ms: 5_000,
            escalation_grace_ms: 2_000,
            sos_fix_timeout_ms: 10_000,
            location_max_age_ms: 30_000,
            tracker: TrackerConfig::default(),
        }
    }
}

impl SentinelConfig {
    /// Load from `SENTINEL_CONFIG` (or `config/sentinel`) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("SENTINEL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// A missing file is not an error; the defaults and environment still apply.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let d = Self::default();
        let built = config::Config::builder()
            .set_default("user_id", d.user_id)?
            .set_default("storage_path", d.storage_path)?
            .set_default("bind_addr", d.bind_addr)?
            .set_default("notify_timeout_ms", d.notify_timeout_ms as i64)?
            .set_default("escalation_grace_ms", d.escalation_grace_ms as i64)?
            .set_default("sos_fix_timeout_ms", d.sos_fix_timeout_ms as i64)?
            .set_default("location_max_age_ms", d.location_max_age_ms as i64)?
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("SENTINEL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        built.try_deserialize()
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn escalation_grace(&self) -> Duration {
        Duration::from_millis(self.escalation_grace_ms)
    }

    pub fn sos_fix_timeout(&self) -> Duration {
        Duration::from_millis(self.sos_fix_timeout_ms)
    }

    pub fn location_max_age(&self) -> Duration {
        Duration::from_millis(self.location_max_age_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The environment is process-wide; tests that load config take turns.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_file_yields_defaults() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let cfg = SentinelConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.escalation_grace(), Duration::from_millis(2000));
        assert_eq!(cfg.tracker, TrackerConfig::default());
        assert!(cfg.notification_base_url.is_none());
    }

    #[test]
    fn file_overrides_defaults() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.toml");
        std::fs::write(
            &path,
            r#"
user_id = "device-42"
notification_base_url = "http://localhost:5000"

[tracker]
sos_interval_ms = 2000
"#,
        )
        .unwrap();
        let cfg = SentinelConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.user_id, "device-42");
        assert_eq!(cfg.notification_base_url.as_deref(), Some("http://localhost:5000"));
        assert_eq!(cfg.tracker.sos_interval_ms, 2000);
        assert_eq!(cfg.tracker.idle_interval_ms, 10_000);
    }

    #[test]
    fn environment_overrides_file_and_defaults() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.toml");
        std::fs::write(&path, "user_id = \"from-file\"\n").unwrap();

        std::env::set_var("SENTINEL_USER_ID", "env-user");
        std::env::set_var("SENTINEL_TRACKER__SOS_INTERVAL_MS", "2000");
        let loaded = SentinelConfig::load_from(path.to_str().unwrap());
        std::env::remove_var("SENTINEL_USER_ID");
        std::env::remove_var("SENTINEL_TRACKER__SOS_INTERVAL_MS");

        let cfg = loaded.unwrap();
        assert_eq!(cfg.user_id, "env-user");
        assert_eq!(cfg.tracker.sos_interval_ms, 2000);
        assert_eq!(cfg.tracker.idle_interval_ms, 10_000);
    }
}
