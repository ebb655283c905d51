use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_INSTANCE_NAME: &str = "CineSocialScheduler";
pub const AUTO_INSTANCE_ID: &str = "AUTO";
pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_CHECKIN_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_MISFIRE_THRESHOLD_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Upper bound for `retry.base_delay_secs` and `retry.max_delay_secs` (30 days).
pub const MAX_RETRY_DELAY_SECS: u64 = 30 * 24 * 60 * 60;

/// Top-level config (cinejobs.toml + CINEJOBS_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CineJobsConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Where triggers, leases and history live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Shared SQLite file; every node pointing at it forms one cluster.
    #[default]
    Persistent,
    /// Private in-memory database. Single node, nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cluster name. Nodes only cooperate with nodes of the same name.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    /// Node identity inside the cluster. `AUTO` generates one per process.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// Max concurrent executions on this node.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_checkin_interval_secs")]
    pub checkin_interval_secs: u64,
    #[serde(default = "default_misfire_threshold_secs")]
    pub misfire_threshold_secs: u64,
    /// Cadence of the due-trigger poll. Misfire recovery runs on the
    /// check-in cadence instead.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub storage: StorageMode,
    /// How long `stop` waits for in-flight executions after cancelling them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            instance_id: default_instance_id(),
            pool_size: DEFAULT_POOL_SIZE,
            checkin_interval_secs: DEFAULT_CHECKIN_INTERVAL_SECS,
            misfire_threshold_secs: DEFAULT_MISFIRE_THRESHOLD_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            storage: StorageMode::default(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

/// Backoff applied between attempts of a failed job.
///
/// Delay for attempt `n` (0-based) is `base_delay_secs * multiplier^n`,
/// capped at `max_delay_secs`. The defaults give 1 min, 5 min, 25 min.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry budget of the built-in job types.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_secs: default_base_delay_secs(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SmtpTls {
    None,
    #[default]
    Starttls,
    Tls,
}

/// Outgoing mail settings. Without a `host` the worker logs mails instead
/// of sending them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Falls back to `username` when unset.
    pub from_email: Option<String>,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default)]
    pub tls: SmtpTls,
    #[serde(default = "default_smtp_timeout_secs")]
    pub timeout_secs: u64,
    /// Page the verification link points at; `?token=` is appended.
    #[serde(default = "default_verification_url")]
    pub verification_url: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_smtp_port(),
            username: None,
            password: None,
            from_email: None,
            from_name: default_from_name(),
            tls: SmtpTls::default(),
            timeout_secs: default_smtp_timeout_secs(),
            verification_url: default_verification_url(),
        }
    }
}

impl SmtpConfig {
    pub fn sender_address(&self) -> Option<&str> {
        self.from_email.as_deref().or(self.username.as_deref())
    }
}

fn default_instance_name() -> String {
    DEFAULT_INSTANCE_NAME.to_string()
}
fn default_instance_id() -> String {
    AUTO_INSTANCE_ID.to_string()
}
fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_checkin_interval_secs() -> u64 {
    DEFAULT_CHECKIN_INTERVAL_SECS
}
fn default_misfire_threshold_secs() -> u64 {
    DEFAULT_MISFIRE_THRESHOLD_SECS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay_secs() -> u64 {
    60
}
fn default_multiplier() -> u32 {
    5
}
fn default_max_delay_secs() -> u64 {
    3_600
}
fn default_smtp_port() -> u16 {
    587
}
fn default_from_name() -> String {
    "CineSocial".to_string()
}
fn default_smtp_timeout_secs() -> u64 {
    30
}
fn default_verification_url() -> String {
    "http://localhost:5500/verify.html".to_string()
}
fn default_db_path() -> String {
    format!("{}/cinejobs.db", home_dir())
}

fn home_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cinejobs", home)
}

impl CineJobsConfig {
    /// Load config from a TOML file with CINEJOBS_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CINEJOBS_SCHEDULER__POOL_SIZE=4`. A missing file is not an error;
    /// every key has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CineJobsConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CINEJOBS_").split("__"))
            .extract()
            .map_err(|e| crate::error::CineJobsError::Config(e.to_string()))?;

        config.validate()?;
        tracing::debug!(path = %path, storage = ?config.scheduler.storage, "config loaded");
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        use crate::error::CineJobsError::Config;

        if self.scheduler.instance_name.trim().is_empty() {
            return Err(Config("scheduler.instance_name must not be empty".into()));
        }
        if self.scheduler.pool_size == 0 {
            return Err(Config("scheduler.pool_size must be at least 1".into()));
        }
        if self.scheduler.checkin_interval_secs == 0 {
            return Err(Config(
                "scheduler.checkin_interval_secs must be at least 1".into(),
            ));
        }
        if self.scheduler.misfire_threshold_secs == 0 {
            return Err(Config(
                "scheduler.misfire_threshold_secs must be at least 1".into(),
            ));
        }
        if self.retry.multiplier == 0 {
            return Err(Config("retry.multiplier must be at least 1".into()));
        }
        if self.retry.base_delay_secs == 0 {
            return Err(Config("retry.base_delay_secs must be at least 1".into()));
        }
        for (name, secs) in [
            ("retry.base_delay_secs", self.retry.base_delay_secs),
            ("retry.max_delay_secs", self.retry.max_delay_secs),
        ] {
            if secs > MAX_RETRY_DELAY_SECS {
                return Err(Config(format!(
                    "{name} must be at most {MAX_RETRY_DELAY_SECS} (30 days)"
                )));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    format!("{}/cinejobs.toml", home_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn empty_config_uses_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("cinejobs.toml", "")?;
            let config = CineJobsConfig::load(Some("cinejobs.toml")).map_err(|e| e.to_string())?;

            assert_eq!(config.scheduler.instance_name, DEFAULT_INSTANCE_NAME);
            assert_eq!(config.scheduler.instance_id, AUTO_INSTANCE_ID);
            assert_eq!(config.scheduler.pool_size, 10);
            assert_eq!(config.scheduler.checkin_interval_secs, 10);
            assert_eq!(config.scheduler.misfire_threshold_secs, 60);
            assert_eq!(config.scheduler.storage, StorageMode::Persistent);
            assert_eq!(config.retry.max_retries, 3);
            assert!(config.smtp.host.is_none());
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cinejobs.toml",
                r#"
                [scheduler]
                instance_name = "from-file"
                pool_size = 2
                storage = "memory"
                "#,
            )?;
            jail.set_env("CINEJOBS_SCHEDULER__POOL_SIZE", "4");
            jail.set_env("CINEJOBS_SMTP__HOST", "smtp.example.com");

            let config = CineJobsConfig::load(Some("cinejobs.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.scheduler.instance_name, "from-file");
            assert_eq!(config.scheduler.pool_size, 4);
            assert_eq!(config.scheduler.storage, StorageMode::Memory);
            assert_eq!(config.smtp.host.as_deref(), Some("smtp.example.com"));
            Ok(())
        });
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("cinejobs.toml", "[scheduler]\npool_size = 0\n")?;
            let err = CineJobsConfig::load(Some("cinejobs.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }

    #[test]
    fn zero_misfire_threshold_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("CINEJOBS_SCHEDULER__MISFIRE_THRESHOLD_SECS", "0");
            let err = CineJobsConfig::load(Some("missing.toml")).unwrap_err();
            assert!(err.to_string().contains("misfire_threshold_secs"));
            Ok(())
        });
    }

    #[test]
    fn oversized_retry_delays_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cinejobs.toml",
                "[retry]\nmax_delay_secs = 10000000000000000\n",
            )?;
            let err = CineJobsConfig::load(Some("cinejobs.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            assert!(err.to_string().contains("retry.max_delay_secs"));

            jail.create_file("cinejobs.toml", "[retry]\nbase_delay_secs = 2592001\n")?;
            let err = CineJobsConfig::load(Some("cinejobs.toml")).unwrap_err();
            assert!(err.to_string().contains("retry.base_delay_secs"));

            jail.create_file("cinejobs.toml", "[retry]\nmax_delay_secs = 2592000\n")?;
            assert!(CineJobsConfig::load(Some("cinejobs.toml")).is_ok());
            Ok(())
        });
    }

    #[test]
    fn sender_address_falls_back_to_username() {
        let smtp = SmtpConfig {
            username: Some("mailer@example.com".into()),
            ..SmtpConfig::default()
        };
        assert_eq!(smtp.sender_address(), Some("mailer@example.com"));
    }
}
