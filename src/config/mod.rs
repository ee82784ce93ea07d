//! # Configuration Management Module
//!
//! TOML configuration for a qmesh node: identity and routing cadence, the
//! link sections (modem port, TCP server, outbound TCP peers), optional
//! payload encryption, storage, chat identity/peers, and the sync policy
//! table. Every section has serde defaults so a minimal config stays
//! minimal, and [`Config::validate`] catches the mistakes that would
//! otherwise surface as confusing runtime behavior.
//!
//! ```toml
//! [node]
//! callsign = "N0CALL"
//!
//! [modem]
//! host = "127.0.0.1"
//! port = 8515
//! ```

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::link::modem::ModemConfig;
use crate::link::tcp::{TcpClientConfig, TcpServerConfig};
use crate::mesh::crypto::{PayloadCipher, KEY_LEN};
use crate::mesh::RoutingConfig;
use crate::sync::{ChannelPolicy, GapConfig, PlannerConfig, RetryConfig, SyncPolicy};

/// Node identity and routing cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub callsign: String,
    #[serde(default = "default_ogm_interval")]
    pub ogm_interval_secs: f64,
    #[serde(default = "default_ogm_ttl")]
    pub ogm_ttl: u8,
    #[serde(default = "default_route_expiry")]
    pub route_expiry_secs: f64,
    #[serde(default = "default_neighbor_expiry")]
    pub neighbor_expiry_secs: f64,
    #[serde(default = "default_dedup_expiry")]
    pub dedup_expiry_secs: f64,
}

fn default_ogm_interval() -> f64 {
    600.0
}
fn default_ogm_ttl() -> u8 {
    5
}
fn default_route_expiry() -> f64 {
    120.0
}
fn default_neighbor_expiry() -> f64 {
    60.0
}
fn default_dedup_expiry() -> f64 {
    30.0
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            callsign: "N0CALL".to_string(),
            ogm_interval_secs: default_ogm_interval(),
            ogm_ttl: default_ogm_ttl(),
            route_expiry_secs: default_route_expiry(),
            neighbor_expiry_secs: default_neighbor_expiry(),
            dedup_expiry_secs: default_dedup_expiry(),
        }
    }
}

/// Radio modem TCP data port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_modem_host")]
    pub host: String,
    #[serde(default = "default_modem_port")]
    pub port: u16,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_secs: f64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: f64,
    #[serde(default = "default_tx_queue")]
    pub tx_queue_size: usize,
}

fn default_true() -> bool {
    true
}
fn default_modem_host() -> String {
    "127.0.0.1".to_string()
}
fn default_modem_port() -> u16 {
    8515
}
fn default_reconnect_base() -> f64 {
    5.0
}
fn default_reconnect_max() -> f64 {
    60.0
}
fn default_tx_queue() -> usize {
    1000
}

impl Default for ModemSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_modem_host(),
            port: default_modem_port(),
            reconnect_base_secs: default_reconnect_base(),
            reconnect_max_secs: default_reconnect_max(),
            tx_queue_size: default_tx_queue(),
        }
    }
}

/// Inbound TCP mesh server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpServerSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
}

fn default_tcp_port() -> u16 {
    9000
}

/// One outbound TCP mesh peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpLinkSection {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_secs: f64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: f64,
    #[serde(default = "default_tx_queue")]
    pub tx_queue_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpSection {
    #[serde(default)]
    pub server: TcpServerSection,
    #[serde(default)]
    pub links: Vec<TcpLinkSection>,
}

/// Optional payload encryption.
///
/// Note: content encryption is typically prohibited on amateur radio
/// allocations; leave this off there.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySection {
    #[serde(default)]
    pub enable_encryption: bool,
    #[serde(default)]
    pub key_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Keep only the newest N messages per channel at startup (0 = never
    /// prune).
    #[serde(default)]
    pub keep_last_n: usize,
}

fn default_db_path() -> String {
    "qmesh-db".to_string()
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            keep_last_n: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatSection {
    /// Display nick; defaults to the callsign when empty.
    #[serde(default)]
    pub nick: String,
    /// Peer nickname -> callsign.
    #[serde(default)]
    pub peers: HashMap<String, String>,
}

/// Per-channel sync gates (overrides the `[sync.default_channel]` values).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPolicySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Require link RX activity within this many seconds before sending a
    /// sync request (0 disables the gate).
    #[serde(default)]
    pub require_rx_within_secs: f64,
    #[serde(default = "default_peer_fresh_window")]
    pub peer_fresh_window_secs: f64,
}

fn default_peer_fresh_window() -> f64 {
    1800.0
}

impl Default for ChannelPolicySection {
    fn default() -> Self {
        Self {
            enabled: true,
            require_rx_within_secs: 0.0,
            peer_fresh_window_secs: default_peer_fresh_window(),
        }
    }
}

impl ChannelPolicySection {
    fn to_policy(&self) -> ChannelPolicy {
        ChannelPolicy {
            enabled: self.enabled,
            require_rx_within: if self.require_rx_within_secs > 0.0 {
                Some(Duration::from_secs_f64(self.require_rx_within_secs))
            } else {
                None
            },
            peer_fresh_window: Duration::from_secs_f64(
                self.peer_fresh_window_secs.max(1.0),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_confirm_delay")]
    pub confirm_delay_secs: f64,
    #[serde(default = "default_min_report_interval")]
    pub min_report_interval_secs: f64,
    #[serde(default = "default_coalesce_distance")]
    pub coalesce_distance: u32,
    #[serde(default = "default_max_range_len")]
    pub max_range_len: u32,
    #[serde(default = "default_max_requests")]
    pub max_requests_per_trigger: usize,
    #[serde(default = "default_origin_cooldown")]
    pub origin_cooldown_secs: f64,
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: f64,
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: f64,
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_inventory_last_n")]
    pub inventory_last_n: u32,
    #[serde(default)]
    pub default_channel: ChannelPolicySection,
    #[serde(default)]
    pub channels: HashMap<String, ChannelPolicySection>,
}

fn default_confirm_delay() -> f64 {
    90.0
}
fn default_min_report_interval() -> f64 {
    30.0
}
fn default_coalesce_distance() -> u32 {
    8
}
fn default_max_range_len() -> u32 {
    50
}
fn default_max_requests() -> usize {
    3
}
fn default_origin_cooldown() -> f64 {
    120.0
}
fn default_retry_base() -> f64 {
    5.0
}
fn default_retry_max() -> f64 {
    120.0
}
fn default_retry_attempts() -> u32 {
    6
}
fn default_inventory_last_n() -> u32 {
    50
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            confirm_delay_secs: default_confirm_delay(),
            min_report_interval_secs: default_min_report_interval(),
            coalesce_distance: default_coalesce_distance(),
            max_range_len: default_max_range_len(),
            max_requests_per_trigger: default_max_requests(),
            origin_cooldown_secs: default_origin_cooldown(),
            retry_base_secs: default_retry_base(),
            retry_max_secs: default_retry_max(),
            retry_max_attempts: default_retry_attempts(),
            inventory_last_n: default_inventory_last_n(),
            default_channel: ChannelPolicySection::default(),
            channels: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub modem: ModemSection,
    #[serde(default)]
    pub tcp: TcpSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub chat: ChatSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Config {
    /// Load and validate a configuration file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("failed to parse {}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Write a commented starter config. Refuses to overwrite.
    pub async fn create_default(path: &str) -> Result<()> {
        if fs::metadata(path).await.is_ok() {
            return Err(anyhow!("{} already exists, refusing to overwrite", path));
        }
        fs::write(path, DEFAULT_CONFIG_TEMPLATE)
            .await
            .with_context(|| format!("failed to write {}", path))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let callsign = self.node.callsign.trim();
        if callsign.is_empty() {
            return Err(anyhow!("node.callsign must not be empty"));
        }
        if callsign.len() > 8 {
            return Err(anyhow!(
                "node.callsign must be at most 8 characters, got {}",
                callsign.len()
            ));
        }
        if !callsign.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(anyhow!("node.callsign must be printable ASCII"));
        }
        if self.node.ogm_ttl == 0 {
            return Err(anyhow!("node.ogm_ttl must be at least 1"));
        }
        if self.node.ogm_interval_secs < 1.0 {
            return Err(anyhow!("node.ogm_interval_secs must be at least 1"));
        }

        let any_link = self.modem.enabled
            || self.tcp.server.enabled
            || self.tcp.links.iter().any(|l| l.enabled);
        if !any_link {
            return Err(anyhow!(
                "no link enabled: enable [modem], [tcp.server], or a [[tcp.links]] entry"
            ));
        }
        for link in &self.tcp.links {
            if link.enabled && link.name.trim().is_empty() {
                return Err(anyhow!("every [[tcp.links]] entry needs a name"));
            }
        }

        if self.security.enable_encryption {
            let key = decode_hex(&self.security.key_hex)
                .ok_or_else(|| anyhow!("security.key_hex must be valid hex"))?;
            if key.len() != KEY_LEN {
                return Err(anyhow!(
                    "security.key_hex must encode {} bytes, got {}",
                    KEY_LEN,
                    key.len()
                ));
            }
        }

        if self.sync.retry_max_attempts == 0 {
            return Err(anyhow!("sync.retry_max_attempts must be at least 1"));
        }
        if self.sync.max_range_len == 0 {
            return Err(anyhow!("sync.max_range_len must be at least 1"));
        }
        if self.sync.max_requests_per_trigger == 0 {
            return Err(anyhow!("sync.max_requests_per_trigger must be at least 1"));
        }
        if self.storage.db_path.trim().is_empty() {
            return Err(anyhow!("storage.db_path must not be empty"));
        }
        Ok(())
    }

    /// Effective chat nick: configured nick, or the callsign.
    pub fn nick(&self) -> String {
        let nick = self.chat.nick.trim();
        if nick.is_empty() {
            self.node.callsign.trim().to_string()
        } else {
            nick.to_string()
        }
    }

    pub fn routing_config(&self) -> RoutingConfig {
        RoutingConfig {
            ogm_interval: Duration::from_secs_f64(self.node.ogm_interval_secs),
            ogm_ttl: self.node.ogm_ttl,
            route_expiry: Duration::from_secs_f64(self.node.route_expiry_secs),
            neighbor_expiry: Duration::from_secs_f64(self.node.neighbor_expiry_secs),
            dedup_expiry: Duration::from_secs_f64(self.node.dedup_expiry_secs),
        }
    }

    pub fn payload_cipher(&self) -> Result<PayloadCipher> {
        if !self.security.enable_encryption {
            return Ok(PayloadCipher::disabled());
        }
        let key = decode_hex(&self.security.key_hex)
            .ok_or_else(|| anyhow!("security.key_hex must be valid hex"))?;
        PayloadCipher::new(&key).map_err(|e| anyhow!(e))
    }

    pub fn modem_config(&self) -> ModemConfig {
        ModemConfig {
            host: self.modem.host.clone(),
            port: self.modem.port,
            reconnect_base: Duration::from_secs_f64(self.modem.reconnect_base_secs.max(0.2)),
            reconnect_max: Duration::from_secs_f64(self.modem.reconnect_max_secs.max(1.0)),
            tx_queue_size: self.modem.tx_queue_size,
        }
    }

    pub fn tcp_server_config(&self) -> TcpServerConfig {
        TcpServerConfig {
            port: self.tcp.server.port,
            password: self.tcp.server.password.clone(),
            tx_queue_size: default_tx_queue(),
        }
    }

    pub fn tcp_client_configs(&self) -> Vec<(String, TcpClientConfig)> {
        self.tcp
            .links
            .iter()
            .filter(|l| l.enabled)
            .map(|l| {
                (
                    l.name.clone(),
                    TcpClientConfig {
                        host: l.host.clone(),
                        port: l.port,
                        password: l.password.clone(),
                        reconnect_base: Duration::from_secs_f64(l.reconnect_base_secs.max(0.2)),
                        reconnect_max: Duration::from_secs_f64(l.reconnect_max_secs.max(1.0)),
                        tx_queue_size: l.tx_queue_size,
                    },
                )
            })
            .collect()
    }

    pub fn gap_config(&self) -> GapConfig {
        GapConfig {
            confirm_delay: Duration::from_secs_f64(self.sync.confirm_delay_secs.max(1.0)),
            min_report_interval: Duration::from_secs_f64(
                self.sync.min_report_interval_secs.max(1.0),
            ),
        }
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            coalesce_distance: self.sync.coalesce_distance,
            max_range_len: self.sync.max_range_len,
            max_requests_per_trigger: self.sync.max_requests_per_trigger,
            origin_cooldown: Duration::from_secs_f64(self.sync.origin_cooldown_secs.max(1.0)),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            tick: Duration::from_millis(500),
            base_delay: Duration::from_secs_f64(self.sync.retry_base_secs.max(0.5)),
            max_delay: Duration::from_secs_f64(self.sync.retry_max_secs.max(1.0)),
            max_attempts: self.sync.retry_max_attempts,
        }
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            default_channel: self.sync.default_channel.to_policy(),
            channels: self
                .sync
                .channels
                .iter()
                .map(|(name, section)| (name.clone(), section.to_policy()))
                .collect(),
        }
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

const DEFAULT_CONFIG_TEMPLATE: &str = r##"# qmesh node configuration

[node]
callsign = "N0CALL"          # 1-8 ASCII characters, your mesh identity
# ogm_interval_secs = 600    # route advertisement cadence
# ogm_ttl = 5                # hop budget for OGMs and data
# route_expiry_secs = 120
# neighbor_expiry_secs = 60
# dedup_expiry_secs = 30

[modem]
enabled = true
host = "127.0.0.1"
port = 8515
# reconnect_base_secs = 5.0
# reconnect_max_secs = 60.0
# tx_queue_size = 1000

[tcp.server]
enabled = false
port = 9000
password = ""

# [[tcp.links]]
# name = "relay-1"
# host = "relay.example.net"
# port = 9000
# password = "shared-secret"

[security]
enable_encryption = false
key_hex = ""                 # 64 hex chars (32 bytes) when enabled

[storage]
db_path = "qmesh-db"
keep_last_n = 0              # prune channels to N messages at startup; 0 = off

[chat]
nick = ""                    # defaults to callsign
[chat.peers]
# alice = "K1ABC"

[sync]
# confirm_delay_secs = 90
# min_report_interval_secs = 30
# coalesce_distance = 8
# max_range_len = 50
# max_requests_per_trigger = 3
# origin_cooldown_secs = 120
# retry_base_secs = 5
# retry_max_secs = 120
# retry_max_attempts = 6
# inventory_last_n = 50
[sync.default_channel]
enabled = true
require_rx_within_secs = 0
peer_fresh_window_secs = 1800

# [sync.channels."#example"]
# enabled = false

[logging]
level = "info"
"##;
