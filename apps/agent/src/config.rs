use std::path::{Path, PathBuf};
use std::time::Duration;

use mxagent_crypto::group::RotationPolicy;
use mxagent_crypto::trust::TrustPolicy;
use mxagent_shared::error::MxError;
use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Agent configuration loaded from config.toml with env var overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Homeserver base URL, e.g. "https://matrix.example.org".
    #[serde(default)]
    pub homeserver: String,
    /// Full Matrix user id, e.g. "@bot:example.org".
    #[serde(default)]
    pub user_id: String,
    /// Token used when no credentials file exists yet.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Default: $XDG_DATA_HOME/mxagent/store
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    /// Tracing log level. Default: "warn"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Display name given to the device created by `setup`.
    #[serde(default)]
    pub device_display_name: Option<String>,
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_verification_timeout_secs")]
    pub verification_timeout_secs: u64,
    #[serde(default = "default_key_request_window_secs")]
    pub key_request_window_secs: u64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default)]
    pub rotation: RotationConfig,
    /// "tofu" or "explicit". Default: "tofu"
    #[serde(default = "default_trust_policy")]
    pub trust_policy: String,
    #[serde(default)]
    pub retry: RetryConfig,
    /// "auto", "keychain", "file" or "passphrase". Default: "auto"
    #[serde(default = "default_db_key_source")]
    pub db_key_source: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: u64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_log_level() -> String {
    "warn".to_string()
}
fn default_sync_timeout_secs() -> u64 {
    30
}
fn default_operation_timeout_secs() -> u64 {
    120
}
fn default_verification_timeout_secs() -> u64 {
    300
}
fn default_key_request_window_secs() -> u64 {
    60
}
fn default_lock_timeout_secs() -> u64 {
    30
}
fn default_trust_policy() -> String {
    "tofu".to_string()
}
fn default_db_key_source() -> String {
    "auto".to_string()
}
fn default_max_messages() -> u64 {
    100
}
fn default_max_age_secs() -> u64 {
    7 * 24 * 3600
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            homeserver: String::new(),
            user_id: String::new(),
            access_token: None,
            store_dir: None,
            log_level: default_log_level(),
            device_display_name: None,
            sync_timeout_secs: default_sync_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            verification_timeout_secs: default_verification_timeout_secs(),
            key_request_window_secs: default_key_request_window_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            rotation: RotationConfig::default(),
            trust_policy: default_trust_policy(),
            retry: RetryConfig::default(),
            db_key_source: default_db_key_source(),
        }
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn home_dir() -> Option<PathBuf> {
    env_path("HOME")
}

fn parse_env<T: std::str::FromStr>(var: &str, val: &str) -> Result<T, MxError> {
    val.parse()
        .map_err(|_| MxError::Config(format!("invalid {var} value: {val}")))
}

impl AgentConfig {
    /// Load configuration from `path`, `$MXAGENT_CONFIG`, or
    /// `$XDG_CONFIG_HOME/mxagent/config.toml`, then apply env var overrides.
    ///
    /// A missing default config file is not an error: the agent can be
    /// configured entirely from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, MxError> {
        let explicit = path.map(Path::to_path_buf).or_else(|| env_path("MXAGENT_CONFIG"));
        let path = match explicit {
            Some(p) => Some(p),
            None => Self::default_config_path().filter(|p| p.exists()),
        };

        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(&path).map_err(|e| {
                    MxError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&contents)
            }
            None => {
                let mut config = Self::default();
                config.apply_env_overrides()?;
                Ok(config)
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        env_path("XDG_CONFIG_HOME")
            .or_else(|| home_dir().map(|h| h.join(".config")))
            .map(|base| base.join("mxagent").join("config.toml"))
    }

    /// Load configuration from a TOML string, then apply env var overrides.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, MxError> {
        let mut config: AgentConfig =
            toml::from_str(toml_str).map_err(|e| MxError::Config(e.to_string()))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the config.
    ///
    /// Returns an error if an env var is set but has an invalid format
    /// (e.g., MXAGENT_SYNC_TIMEOUT=abc).
    pub fn apply_env_overrides(&mut self) -> Result<(), MxError> {
        if let Ok(val) = std::env::var("MATRIX_HOMESERVER") {
            self.homeserver = val;
        }
        if let Ok(val) = std::env::var("MATRIX_USER_ID") {
            self.user_id = val;
        }
        if let Ok(val) = std::env::var("MATRIX_ACCESS_TOKEN") {
            self.access_token = Some(val);
        }
        if let Some(val) = env_path("MXAGENT_STORE_DIR") {
            self.store_dir = Some(val);
        }
        if let Ok(val) = std::env::var("MXAGENT_LOG_LEVEL") {
            self.log_level = val;
        }
        if let Ok(val) = std::env::var("MXAGENT_DEVICE_NAME") {
            self.device_display_name = Some(val);
        }
        if let Ok(val) = std::env::var("MXAGENT_SYNC_TIMEOUT") {
            self.sync_timeout_secs = parse_env("MXAGENT_SYNC_TIMEOUT", &val)?;
        }
        if let Ok(val) = std::env::var("MXAGENT_OPERATION_TIMEOUT") {
            self.operation_timeout_secs = parse_env("MXAGENT_OPERATION_TIMEOUT", &val)?;
        }
        if let Ok(val) = std::env::var("MXAGENT_VERIFICATION_TIMEOUT") {
            self.verification_timeout_secs = parse_env("MXAGENT_VERIFICATION_TIMEOUT", &val)?;
        }
        if let Ok(val) = std::env::var("MXAGENT_TRUST_POLICY") {
            self.trust_policy = val;
        }
        if let Ok(val) = std::env::var("MXAGENT_DB_KEY_SOURCE") {
            self.db_key_source = val;
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), MxError> {
        if TrustPolicy::parse(&self.trust_policy).is_none() {
            return Err(MxError::Config(format!(
                "trust_policy must be \"tofu\" or \"explicit\", got {:?}",
                self.trust_policy
            )));
        }
        if !matches!(self.db_key_source.as_str(), "auto" | "keychain" | "file" | "passphrase") {
            return Err(MxError::Config(format!(
                "unknown db_key_source {:?}",
                self.db_key_source
            )));
        }
        if self.rotation.max_messages == 0 {
            return Err(MxError::Config("rotation.max_messages must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(MxError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Directory holding credentials, the crypto database and the lock file.
    pub fn store_path(&self) -> Result<PathBuf, MxError> {
        if let Some(dir) = &self.store_dir {
            return Ok(dir.clone());
        }
        env_path("XDG_DATA_HOME")
            .or_else(|| home_dir().map(|h| h.join(".local").join("share")))
            .map(|base| base.join("mxagent").join("store"))
            .ok_or_else(|| MxError::Config("cannot locate a data directory; set MXAGENT_STORE_DIR".into()))
    }

    pub fn trust_policy(&self) -> TrustPolicy {
        TrustPolicy::parse(&self.trust_policy).unwrap_or_default()
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            max_messages: self.rotation.max_messages,
            max_age: Duration::from_secs(self.rotation.max_age_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    pub fn key_request_window(&self) -> Duration {
        Duration::from_secs(self.key_request_window_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Display name for a new device: configured, or "mxagent E2EE @ <host>".
    pub fn device_name(&self) -> String {
        self.device_display_name.clone().unwrap_or_else(|| {
            format!(
                "{} @ {}",
                mxagent_shared::constants::DEFAULT_DEVICE_NAME_PREFIX,
                gethostname::gethostname().to_string_lossy()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_loads_from_valid_toml_string() {
        let toml = r#"
            homeserver = "https://hs.example"
            user_id = "@bot:hs.example"
            log_level = "debug"
            sync_timeout_secs = 10
            trust_policy = "explicit"

            [rotation]
            max_messages = 50

            [retry]
            max_attempts = 2
        "#;
        let config = AgentConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.homeserver, "https://hs.example");
        assert_eq!(config.user_id, "@bot:hs.example");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.sync_timeout(), Duration::from_secs(10));
        assert_eq!(config.trust_policy(), TrustPolicy::ExplicitOnly);
        assert_eq!(config.rotation_policy().max_messages, 50);
        assert_eq!(config.rotation.max_age_secs, 604_800);
        assert_eq!(config.retry_policy().max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 500);
    }

    #[test]
    #[serial]
    fn test_config_applies_env_var_overrides() {
        std::env::set_var("MATRIX_HOMESERVER", "https://override.example");
        std::env::set_var("MXAGENT_SYNC_TIMEOUT", "5");
        let config = AgentConfig::from_toml_str(r#"homeserver = "https://original.example""#).unwrap();
        assert_eq!(config.homeserver, "https://override.example");
        assert_eq!(config.sync_timeout_secs, 5);
        std::env::remove_var("MATRIX_HOMESERVER");
        std::env::remove_var("MXAGENT_SYNC_TIMEOUT");
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_rejected() {
        std::env::set_var("MXAGENT_OPERATION_TIMEOUT", "soon");
        let result = AgentConfig::from_toml_str("");
        std::env::remove_var("MXAGENT_OPERATION_TIMEOUT");
        assert!(matches!(result, Err(MxError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_config_has_correct_defaults_for_omitted_fields() {
        let config = AgentConfig::from_toml_str("").unwrap();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.operation_timeout(), Duration::from_secs(120));
        assert_eq!(config.verification_timeout(), Duration::from_secs(300));
        assert_eq!(config.key_request_window(), Duration::from_secs(60));
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.trust_policy(), TrustPolicy::TrustOnFirstUse);
        assert_eq!(config.db_key_source, "auto");
    }

    #[test]
    #[serial]
    fn test_unknown_trust_policy_is_rejected() {
        assert!(AgentConfig::from_toml_str(r#"trust_policy = "everyone""#).is_err());
        assert!(AgentConfig::from_toml_str("[rotation]\nmax_messages = 0").is_err());
    }

    #[test]
    #[serial]
    fn test_config_fails_on_malformed_toml() {
        let result = AgentConfig::from_toml_str("this is not valid = [[[toml");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_store_path_follows_xdg_data_home() {
        std::env::set_var("XDG_DATA_HOME", "/tmp/xdg-data");
        let config = AgentConfig::default();
        assert_eq!(
            config.store_path().unwrap(),
            PathBuf::from("/tmp/xdg-data/mxagent/store")
        );
        std::env::remove_var("XDG_DATA_HOME");

        let pinned = AgentConfig {
            store_dir: Some(PathBuf::from("/srv/agent")),
            ..AgentConfig::default()
        };
        assert_eq!(pinned.store_path().unwrap(), PathBuf::from("/srv/agent"));
    }

    #[test]
    #[serial]
    fn test_load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "user_id = \"@file:hs\"\n").unwrap();
        let config = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(config.user_id, "@file:hs");

        let missing = dir.path().join("missing.toml");
        assert!(matches!(AgentConfig::load(Some(&missing)), Err(MxError::Config(_))));
    }
}
