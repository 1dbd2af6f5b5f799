//! User settings stored in `<root>/config.toml`

use crate::error::{Error, Result};
use crate::sync::SyncMode;
use crate::transport::{ChunkLimits, Credentials, TokenRouting, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.toml";

/// All settings; every field has a default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub transport: TransportSettings,

    /// URL rewrite used with token credentials
    #[serde(default)]
    pub token_routing: TokenRouting,

    #[serde(default)]
    pub instances: InstanceSettings,
}

/// Where the server lives and how to authenticate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServerSettings {
    /// Base URL, e.g. `https://sync.example.org`
    #[serde(default)]
    pub url: String,

    pub username: Option<String>,

    pub password: Option<String>,

    pub token: Option<String>,

    /// Authenticate with `token` instead of username and password
    #[serde(default)]
    pub use_token: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub mode: SyncMode,

    /// Seconds between automatic sync cycles
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// A submission request may not grow past this by adding an attachment
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: u64,

    #[serde(default = "default_max_files_per_request")]
    pub max_files_per_request: usize,

    /// Per request, body included
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    pub user_agent: Option<String>,
}

/// App-wide defaults that a form may override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InstanceSettings {
    /// Delete instances once the server accepts them
    #[serde(default)]
    pub auto_delete: bool,

    /// Submit instances as soon as they are finalized
    #[serde(default)]
    pub auto_send: bool,
}

fn default_interval_secs() -> u64 {
    15 * 60
}

fn default_max_request_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_files_per_request() -> usize {
    100
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            interval_secs: default_interval_secs(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_request_bytes: default_max_request_bytes(),
            max_files_per_request: default_max_files_per_request(),
            timeout_secs: default_timeout_secs(),
            user_agent: None,
        }
    }
}

impl ServerSettings {
    /// Credentials to send, if any are configured
    pub fn credentials(&self) -> Option<Credentials> {
        if self.use_token {
            return self.token.as_deref().map(Credentials::token);
        }
        self.username
            .as_deref()
            .map(|user| Credentials::basic(user, self.password.as_deref().unwrap_or_default()))
    }

    pub fn form_list_url(&self) -> Result<String> {
        Ok(format!("{}/formList", self.base_url()?))
    }

    /// Fallback endpoint for forms without their own submission URI
    pub fn submission_url(&self) -> Result<String> {
        Ok(format!("{}/submission", self.base_url()?))
    }

    fn base_url(&self) -> Result<&str> {
        let url = self.url.trim().trim_end_matches('/');
        if url.is_empty() {
            return Err(Error::Config("server.url is not set".to_string()));
        }
        Ok(url)
    }
}

impl TransportSettings {
    pub fn limits(&self) -> ChunkLimits {
        ChunkLimits {
            max_request_bytes: self.max_request_bytes,
            max_files_per_request: self.max_files_per_request,
        }
    }
}

impl Settings {
    pub fn path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }

    /// Load settings from the storage root or return defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = Self::path(root);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        let settings: Settings = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse {}: {}", config_path.display(), e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to the storage root
    pub fn save(&self, root: &Path) -> Result<()> {
        std::fs::create_dir_all(root)?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize settings: {}", e)))?;
        std::fs::write(Self::path(root), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.interval_secs == 0 {
            return Err(Error::Config("sync.interval_secs must be positive".into()));
        }
        if self.transport.max_files_per_request == 0 {
            return Err(Error::Config(
                "transport.max_files_per_request must be positive".into(),
            ));
        }
        if self.transport.timeout_secs == 0 {
            return Err(Error::Config("transport.timeout_secs must be positive".into()));
        }
        if self.server.use_token && self.server.token.is_none() {
            return Err(Error::Config(
                "server.use_token is set but server.token is missing".into(),
            ));
        }
        Ok(())
    }

    /// HTTP transport configuration derived from these settings
    pub fn transport_config(&self) -> TransportConfig {
        let defaults = TransportConfig::default();
        TransportConfig {
            timeout: Duration::from_secs(self.transport.timeout_secs),
            user_agent: self
                .transport
                .user_agent
                .clone()
                .unwrap_or(defaults.user_agent),
            limits: self.transport.limits(),
            token_routing: self.token_routing.clone(),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::load_or_default(tmp.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.sync.mode, SyncMode::Manual);
        assert_eq!(settings.transport.max_request_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.token_routing.prefix, "/token");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
            [server]
            url = "https://sync.example.org/"
            username = "enumerator"
            password = "pw"

            [sync]
            mode = "match_exactly"
            "#,
        )
        .unwrap();

        let settings = Settings::load_or_default(tmp.path()).unwrap();
        assert_eq!(settings.sync.mode, SyncMode::MatchExactly);
        assert_eq!(settings.sync.interval_secs, 900);
        assert_eq!(
            settings.server.form_list_url().unwrap(),
            "https://sync.example.org/formList"
        );
        assert_eq!(
            settings.server.credentials(),
            Some(Credentials::basic("enumerator", "pw"))
        );
    }

    #[test]
    fn test_save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.server.url = "https://sync.example.org".into();
        settings.server.use_token = true;
        settings.server.token = Some("tok".into());
        settings.instances.auto_delete = true;
        settings.save(tmp.path()).unwrap();

        let loaded = Settings::load_or_default(tmp.path()).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.server.credentials(), Some(Credentials::token("tok")));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "[sync]\ninterval_secs = 0\n").unwrap();
        assert!(matches!(
            Settings::load_or_default(tmp.path()),
            Err(Error::Config(_))
        ));

        std::fs::write(tmp.path().join(CONFIG_FILE), "not = [valid").unwrap();
        assert!(matches!(
            Settings::load_or_default(tmp.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_server_url_required_for_endpoints() {
        let settings = Settings::default();
        assert!(matches!(
            settings.server.submission_url(),
            Err(Error::Config(_))
        ));
        assert!(settings.server.credentials().is_none());
    }
}
