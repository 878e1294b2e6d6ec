use crate::error::Error;
use crate::event::ReplaceableMode;
use crate::keys::RelayKeys;
use config::{Config as ConfigTree, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

const ENVIRONMENT_PREFIX: &str = "AGORA";
const CONFIG_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySettings {
    pub relay_secret_key: String,
    pub local_addr: String,
    /// Canonical URL clients must put in their NIP-42 `relay` tag.
    pub relay_url: String,
    pub db_path: String,
    #[serde(default)]
    pub info: RelayInfoSettings,
    #[serde(default)]
    pub policies: PolicySettings,
    #[serde(default)]
    pub websocket: WebSocketSettings,
    #[serde(default)]
    pub rate_limiting: RateLimitSettings,
    #[serde(default)]
    pub replaceable_mode: ReplaceableMode,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
}

impl RelaySettings {
    pub fn relay_keys(&self) -> Result<RelayKeys, Error> {
        RelayKeys::from_hex(&self.relay_secret_key)
    }
}

/// The NIP-11 document, minus the pubkey which is derived from the relay
/// keys at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayInfoSettings {
    pub name: String,
    pub description: String,
    pub contact: Option<String>,
    pub supported_nips: Vec<u32>,
}

impl Default for RelayInfoSettings {
    fn default() -> Self {
        Self {
            name: "agora".to_string(),
            description: "Nostr relay with relay-moderated groups".to_string(),
            contact: None,
            supported_nips: vec![1, 11, 29, 42, 45],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequiredTagRule {
    pub kind: u32,
    pub tags: Vec<String>,
}

/// Declarative toggles for the built-in rejection policies.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub forbidden_kinds: Vec<u32>,
    pub max_tags: Option<usize>,
    pub max_content_bytes: Option<usize>,
    /// Seconds of clock skew tolerated into the future.
    pub created_at_future_secs: u64,
    /// When set, events older than this many seconds are rejected.
    pub created_at_past_secs: Option<u64>,
    pub blocked_pubkeys: Vec<String>,
    pub allowed_pubkeys: Option<Vec<String>>,
    pub auth_required_kinds: Vec<u32>,
    pub required_tags: Vec<RequiredTagRule>,
    pub non_empty_content_kinds: Vec<u32>,
    pub blocked_tag_values: HashMap<String, Vec<String>>,
    pub check_sig_length: bool,
    pub validate_kind0_metadata: bool,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            forbidden_kinds: Vec::new(),
            max_tags: Some(2000),
            max_content_bytes: Some(256 * 1024),
            created_at_future_secs: 900,
            created_at_past_secs: None,
            blocked_pubkeys: Vec::new(),
            allowed_pubkeys: None,
            auth_required_kinds: Vec::new(),
            required_tags: Vec::new(),
            non_empty_content_kinds: Vec::new(),
            blocked_tag_values: HashMap::new(),
            check_sig_length: true,
            validate_kind0_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    #[serde(with = "humantime_serde")]
    pub max_connection_duration: Option<Duration>,
    pub max_connections: Option<usize>,
    pub channel_size: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            max_connection_duration: Some(Duration::from_secs(10 * 60)),
            max_connections: Some(1000),
            channel_size: 1000,
        }
    }
}

/// Rate limiting is a hook: this section only carries the knobs a
/// deployment-provided limiter reads.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_events_per_minute: Option<u32>,
}

fn default_max_limit() -> usize {
    500
}

fn default_max_subscriptions() -> usize {
    50
}

#[derive(Debug, Clone)]
pub struct Config {
    config: ConfigTree,
}

impl Config {
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let environment =
            std::env::var(format!("{ENVIRONMENT_PREFIX}{CONFIG_SEPARATOR}ENVIRONMENT"))
                .unwrap_or_else(|_| "development".into());

        let config_dir = config_dir.as_ref();
        let default_config = config_dir.join("settings.yml");
        let env_config = config_dir.join(format!("settings.{environment}.yml"));
        let local_config = config_dir.join("settings.local.yml");

        let config = ConfigTree::builder()
            .add_source(File::from(default_config))
            .add_source(File::from(env_config).required(false))
            .add_source(File::from(local_config).required(false))
            .add_source(
                Environment::with_prefix(ENVIRONMENT_PREFIX)
                    .separator(CONFIG_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        Ok(Config { config })
    }

    pub fn get_settings(&self) -> Result<RelaySettings, ConfigError> {
        let settings: RelaySettings = self.config.get("relay")?;
        info!(
            "relay settings: addr={}, db={}, max_limit={}, max_subscriptions={}",
            settings.local_addr, settings.db_path, settings.max_limit, settings.max_subscriptions
        );
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let policies = PolicySettings::default();
        assert!(policies.check_sig_length);
        assert!(policies.validate_kind0_metadata);
        assert_eq!(policies.created_at_future_secs, 900);

        let ws = WebSocketSettings::default();
        assert_eq!(ws.channel_size, 1000);
        assert_eq!(ws.max_connections, Some(1000));
    }

    #[test]
    fn loads_yaml_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.yml"),
            r#"
relay:
  relay_secret_key: "0101010101010101010101010101010101010101010101010101010101010101"
  local_addr: "127.0.0.1:8080"
  relay_url: "wss://relay.example.com"
  db_path: "relay.db"
  replaceable_mode: legacy
  policies:
    forbidden_kinds: [4]
    max_tags: 100
  ignored_key: true
"#,
        )
        .unwrap();

        let settings = Config::new(dir.path()).unwrap().get_settings().unwrap();
        assert_eq!(settings.local_addr, "127.0.0.1:8080");
        assert_eq!(settings.replaceable_mode, ReplaceableMode::Legacy);
        assert_eq!(settings.policies.forbidden_kinds, vec![4]);
        assert_eq!(settings.policies.max_tags, Some(100));
        assert_eq!(settings.max_limit, 500);
        assert!(settings.relay_keys().is_ok());
    }
}
