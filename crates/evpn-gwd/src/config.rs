//! Daemon configuration file.
//!
//! Loaded from TOML; every section and field is optional. Default location:
//! /etc/evpn-gw/evpn-gwd.toml

use evpn_common::{Backoff, DeliveryPolicy, KvBackend, SubscriberConfig};
use evpn_infradb::ResourceKind;
use evpn_netlink::{NetlinkConfig, PhyPort};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/evpn-gw/evpn-gwd.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Persistence backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: KvBackend,

    #[serde(default = "default_address")]
    pub address: String,
}

/// A backend subscribing to desired-state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberEntry {
    pub name: String,

    /// Lower values are notified, and listed in resource status, first.
    #[serde(default)]
    pub priority: i32,

    pub events: Vec<ResourceKind>,

    #[serde(default)]
    pub policy: DeliveryPolicy,
}

impl SubscriberEntry {
    pub fn subscriber_config(&self, queue_depth: usize) -> SubscriberConfig {
        SubscriberConfig::new(self.name.clone())
            .with_priority(self.priority)
            .with_events(self.events.iter().map(|k| k.as_str()))
            .with_queue_depth(queue_depth)
            .with_policy(self.policy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskManagerConfig {
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetlinkSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_grd_table")]
    pub grd_table: u32,

    #[serde(default = "default_br_tenant")]
    pub br_tenant: String,

    #[serde(default = "default_true")]
    pub enable_ecmp: bool,

    #[serde(default = "default_max_resolve_depth")]
    pub max_resolve_depth: usize,

    #[serde(default)]
    pub phy_ports: Vec<PhyPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub subscribers: Vec<SubscriberEntry>,

    #[serde(default)]
    pub task_manager: TaskManagerConfig,

    #[serde(default)]
    pub netlink: NetlinkSection,
}

fn default_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_retry_base_delay() -> u64 {
    2_000
}

fn default_retry_max_delay() -> u64 {
    300_000
}

fn default_event_queue_depth() -> usize {
    evpn_common::event_bus::DEFAULT_QUEUE_DEPTH
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_grd_table() -> u32 {
    evpn_netlink::config::DEFAULT_GRD_TABLE
}

fn default_br_tenant() -> String {
    "br-tenant".to_string()
}

fn default_max_resolve_depth() -> usize {
    evpn_netlink::config::DEFAULT_MAX_RESOLVE_DEPTH
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: KvBackend::default(),
            address: default_address(),
        }
    }
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            event_queue_depth: default_event_queue_depth(),
        }
    }
}

impl Default for NetlinkSection {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_poll_interval(),
            grd_table: default_grd_table(),
            br_tenant: default_br_tenant(),
            enable_ecmp: true,
            max_resolve_depth: default_max_resolve_depth(),
            phy_ports: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Loads the configuration, falling back to defaults if the file does
    /// not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.backend == KvBackend::Redis && self.database.address.trim().is_empty() {
            return Err(ConfigError::Invalid("database address must be set".to_string()));
        }

        let mut names = HashSet::new();
        for sub in &self.subscribers {
            if sub.name.is_empty() {
                return Err(ConfigError::Invalid("subscriber name must not be empty".to_string()));
            }
            if !names.insert(sub.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate subscriber {}", sub.name)));
            }
            if sub.events.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "subscriber {} has no events",
                    sub.name
                )));
            }
        }

        let tm = &self.task_manager;
        if tm.retry_base_delay_ms == 0 {
            return Err(ConfigError::Invalid("retry_base_delay_ms must be > 0".to_string()));
        }
        if tm.retry_max_delay_ms < tm.retry_base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry_max_delay_ms must be >= retry_base_delay_ms".to_string(),
            ));
        }
        if tm.event_queue_depth == 0 {
            return Err(ConfigError::Invalid("event_queue_depth must be > 0".to_string()));
        }

        let nl = &self.netlink;
        if nl.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be > 0".to_string()));
        }
        if nl.br_tenant.is_empty() {
            return Err(ConfigError::Invalid("br_tenant must not be empty".to_string()));
        }

        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.task_manager.retry_base_delay_ms),
            Duration::from_millis(self.task_manager.retry_max_delay_ms),
        )
    }

    pub fn netlink_config(&self) -> NetlinkConfig {
        let nl = &self.netlink;
        NetlinkConfig {
            poll_interval: Duration::from_millis(nl.poll_interval_ms),
            grd_table: nl.grd_table,
            br_tenant: nl.br_tenant.clone(),
            phy_ports: nl.phy_ports.clone(),
            enable_ecmp: nl.enable_ecmp,
            max_resolve_depth: nl.max_resolve_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.database.backend, KvBackend::Redis);
        assert_eq!(config.database.address, "127.0.0.1:6379");
        assert!(config.subscribers.is_empty());
        assert_eq!(config.backoff(), Backoff::default());
        assert_eq!(config.netlink_config(), NetlinkConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_file() {
        let toml_str = r#"
[database]
backend = "memory"

[[subscribers]]
name = "lgm"
priority = 1
events = ["vrf", "svi", "logical-bridge"]

[[subscribers]]
name = "frr"
priority = 2
events = ["vrf"]
policy = "drop_newest"

[task_manager]
retry_base_delay_ms = 500

[netlink]
poll_interval_ms = 250
enable_ecmp = false

[[netlink.phy_ports]]
name = "eth0"
vsi = 3
"#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.backend, KvBackend::Memory);
        assert_eq!(config.subscribers.len(), 2);
        assert_eq!(
            config.subscribers[0].events,
            vec![ResourceKind::Vrf, ResourceKind::Svi, ResourceKind::LogicalBridge]
        );
        assert_eq!(config.subscribers[1].policy, DeliveryPolicy::DropNewest);
        // Unspecified values keep their defaults.
        assert_eq!(config.task_manager.retry_max_delay_ms, 300_000);

        let nl = config.netlink_config();
        assert_eq!(nl.poll_interval, Duration::from_millis(250));
        assert!(!nl.enable_ecmp);
        assert_eq!(nl.phy_port("eth0").map(|p| p.vsi), Some(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let toml_str = r#"
[[subscribers]]
name = "lgm"
events = ["router"]
"#;
        assert!(toml::from_str::<GatewayConfig>(toml_str).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        let sub = SubscriberEntry {
            name: "lgm".into(),
            priority: 1,
            events: vec![ResourceKind::Vrf],
            policy: DeliveryPolicy::default(),
        };
        config.subscribers = vec![sub.clone(), sub];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = GatewayConfig::default();
        config.task_manager.retry_max_delay_ms = 1;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.netlink.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_subscriber_config() {
        let sub = SubscriberEntry {
            name: "frr".into(),
            priority: 2,
            events: vec![ResourceKind::Vrf, ResourceKind::Svi],
            policy: DeliveryPolicy::Backpressure,
        };
        let config = sub.subscriber_config(16);
        assert_eq!(config.name, "frr");
        assert_eq!(config.priority, 2);
        assert_eq!(config.events, vec!["vrf".to_string(), "svi".to_string()]);
        assert_eq!(config.queue_depth, 16);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database]\naddress = \"10.0.0.5:6380\"").unwrap();
        let config = GatewayConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.database.address, "10.0.0.5:6380");

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        writeln!(broken, "[database\n").unwrap();
        assert!(matches!(
            GatewayConfig::load_or_default(broken.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = GatewayConfig::load_or_default("/nonexistent/evpn-gwd.toml").unwrap();
        assert_eq!(config, GatewayConfig::default());
    }
}
