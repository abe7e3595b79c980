//! # Configuration Management Module
//!
//! Node identity, radio parameters, protocol timings and transport tuning for a
//! loramesh node, stored as TOML.
//!
//! ## Configuration Structure
//!
//! - [`NodeConfig`] - node id (1 is the master) and display name
//! - [`RadioConfig`] - LoRa physical-layer parameters handed to the radio driver
//! - [`NetworkConfig`] - beacon/ping cadence, route timeout, hop limit
//! - [`MeshConfig`] - self-healing, maintenance cadence, table capacities
//! - [`TransportConfig`] - transmit queue sizing and timeouts
//! - [`EncryptionConfig`] - AES-128-CBC key, IV and IV mode
//! - [`UdpConfig`] - host-side UDP radio adapter
//! - [`LoggingConfig`] - log level and optional file sink
//!
//! ## Usage
//!
//! ```rust,no_run
//! use loramesh::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("Node {} ({})", config.node.id, config.node.name);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [node]
//! id = 1
//! name = "LoRa-Master"
//!
//! [radio]
//! frequency = 868000000
//! spreading_factor = 7
//! bandwidth = 125000
//! coding_rate = 5
//! tx_power = 17
//! sync_word = 18
//!
//! [network]
//! ping_interval = 30
//! beacon_interval = 60
//! route_timeout = 300
//! max_hops = 5
//!
//! [encryption]
//! enabled = true
//! key = "000102030405060708090a0b0c0d0e0f"
//! iv = "0f0e0d0c0b0a09080706050403020100"
//! ```
//!
//! Sections other than `[node]`, `[radio]`, `[network]`, `[encryption]` and
//! `[logging]` may be omitted and fall back to their defaults.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::error::{MeshError, MeshResult};

/// The master node sends pings and never treats itself as isolated.
pub const MASTER_NODE_ID: u8 = 1;

/// LoRa bandwidths (Hz) the radio accepts.
pub const VALID_BANDWIDTHS: [u32; 9] = [
    7800, 10400, 15600, 20800, 31250, 41700, 62500, 125000, 250000,
];

pub const MAX_NODE_NAME_LEN: usize = 31;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub radio: RadioConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub udp: UdpConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 1..=254. 0 is reserved and 255 is the broadcast address.
    pub id: u8,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Carrier frequency in Hz (e.g. 868000000).
    pub frequency: u32,
    /// 7..=12
    pub spreading_factor: u8,
    /// Hz, one of [`VALID_BANDWIDTHS`].
    pub bandwidth: u32,
    /// Denominator of the 4/x coding rate, 5..=8.
    pub coding_rate: u8,
    /// dBm, 2..=20
    pub tx_power: i8,
    /// 0x12 private, 0x34 public.
    pub sync_word: u8,
    #[serde(default = "default_preamble_length")]
    pub preamble_length: u16,
    #[serde(default = "default_symbol_timeout")]
    pub symbol_timeout: u16,
    #[serde(default = "default_true")]
    pub enable_crc: bool,
    #[serde(default = "default_true")]
    pub enable_ldro: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Seconds between pings (master only).
    pub ping_interval: u16,
    /// Seconds between beacons.
    pub beacon_interval: u16,
    /// Seconds without a sighting before a node goes offline / a route goes inactive.
    pub route_timeout: u16,
    /// 1..=10
    pub max_hops: u8,
    /// Upper bound of the random delay before answering a ping.
    #[serde(default = "default_ping_jitter_max_ms")]
    pub ping_jitter_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub enable_self_healing: bool,
    /// Seconds between self-healing passes.
    pub healing_timeout: u16,
    /// Seconds between expiry passes.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval: u16,
    #[serde(default = "default_table_capacity")]
    pub node_capacity: usize,
    #[serde(default = "default_table_capacity")]
    pub route_capacity: usize,
    /// Seconds a (origin, sequence) route request is remembered; 0 disables
    /// duplicate suppression.
    #[serde(default)]
    pub rreq_dedup_window: u16,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enable_self_healing: true,
            healing_timeout: 30,
            maintenance_interval: default_maintenance_interval(),
            node_capacity: default_table_capacity(),
            route_capacity: default_table_capacity(),
            rreq_dedup_window: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    /// Receive timeout per radio poll.
    pub rx_poll_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            enqueue_timeout_ms: 100,
            rx_poll_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IvMode {
    /// One configured IV for every frame (compatible with existing nodes).
    #[default]
    Static,
    /// A fresh random IV is prepended to every ciphertext.
    PerPacket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// 16-byte AES key as 32 hex characters.
    pub key: String,
    /// 16-byte IV as 32 hex characters.
    pub iv: String,
    #[serde(default)]
    pub iv_mode: IvMode,
}

impl EncryptionConfig {
    /// Fresh random key and IV, as written by `loramesh init`.
    pub fn generate() -> Self {
        let key: [u8; 16] = rand::random();
        let iv: [u8; 16] = rand::random();
        Self {
            enabled: true,
            key: hex::encode(key),
            iv: hex::encode(iv),
            iv_mode: IvMode::Static,
        }
    }

    pub fn key_bytes(&self) -> MeshResult<[u8; 16]> {
        parse_block("encryption.key", &self.key)
    }

    pub fn iv_bytes(&self) -> MeshResult<[u8; 16]> {
        parse_block("encryption.iv", &self.iv)
    }
}

fn parse_block(field: &str, value: &str) -> MeshResult<[u8; 16]> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| MeshError::Config(format!("{field}: not valid hex ({e})")))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| MeshError::Config(format!("{field}: expected 16 bytes, got {}", v.len())))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    pub bind: String,
    #[serde(default)]
    pub peers: Vec<String>,
    /// RSSI reported for every datagram (there is no real signal to measure).
    #[serde(default = "default_udp_rssi")]
    pub rssi: i16,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:47000".to_string(),
            peers: Vec::new(),
            rssi: default_udp_rssi(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_preamble_length() -> u16 {
    8
}
fn default_symbol_timeout() -> u16 {
    5
}
fn default_ping_jitter_max_ms() -> u64 {
    1000
}
fn default_maintenance_interval() -> u16 {
    10
}
fn default_table_capacity() -> usize {
    20
}
fn default_udp_rssi() -> i16 {
    -60
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Write this configuration to a file, replacing any existing one
    pub async fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;
        Ok(())
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        Config::default().save(path).await
    }

    /// Reject out-of-range parameters. A node must not start with a config
    /// that fails here.
    pub fn validate(&self) -> MeshResult<()> {
        let bad = |msg: String| Err(MeshError::Config(msg));

        if self.node.id == 0 || self.node.id == 0xFF {
            return bad(format!("node.id {} is reserved", self.node.id));
        }
        if self.node.name.len() > MAX_NODE_NAME_LEN {
            return bad(format!(
                "node.name is {} bytes (max {})",
                self.node.name.len(),
                MAX_NODE_NAME_LEN
            ));
        }

        let r = &self.radio;
        if !(7..=12).contains(&r.spreading_factor) {
            return bad(format!("radio.spreading_factor {} (7-12)", r.spreading_factor));
        }
        if !(2..=20).contains(&r.tx_power) {
            return bad(format!("radio.tx_power {} dBm (2-20)", r.tx_power));
        }
        if !(5..=8).contains(&r.coding_rate) {
            return bad(format!("radio.coding_rate {} (5-8)", r.coding_rate));
        }
        if !VALID_BANDWIDTHS.contains(&r.bandwidth) {
            return bad(format!("radio.bandwidth {} Hz is not supported", r.bandwidth));
        }
        if r.frequency == 0 {
            return bad("radio.frequency must be set".to_string());
        }

        let n = &self.network;
        if !(1..=10).contains(&n.max_hops) {
            return bad(format!("network.max_hops {} (1-10)", n.max_hops));
        }
        if n.ping_interval == 0 || n.beacon_interval == 0 || n.route_timeout == 0 {
            return bad("network intervals must be non-zero".to_string());
        }

        let m = &self.mesh;
        if m.healing_timeout == 0 || m.maintenance_interval == 0 {
            return bad("mesh intervals must be non-zero".to_string());
        }
        if m.node_capacity == 0 || m.route_capacity == 0 {
            return bad("mesh table capacities must be at least 1".to_string());
        }

        if self.transport.queue_capacity == 0 {
            return bad("transport.queue_capacity must be at least 1".to_string());
        }

        if self.encryption.enabled {
            self.encryption.key_bytes()?;
            self.encryption.iv_bytes()?;
        }
        Ok(())
    }

    pub fn is_master(&self) -> bool {
        self.node.id == MASTER_NODE_ID
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.network.beacon_interval as u64)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.network.ping_interval as u64)
    }

    pub fn route_timeout(&self) -> Duration {
        Duration::from_secs(self.network.route_timeout as u64)
    }

    pub fn healing_interval(&self) -> Duration {
        Duration::from_secs(self.mesh.healing_timeout as u64)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.mesh.maintenance_interval as u64)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.enqueue_timeout_ms)
    }

    /// Human-readable summary, one setting per line.
    pub fn summary_lines(&self) -> Vec<String> {
        let onoff = |b: bool| if b { "Enabled" } else { "Disabled" };
        vec![
            format!(
                "Node ID: {} ({}), Name: {}",
                self.node.id,
                if self.is_master() { "MASTER" } else { "SLAVE" },
                self.node.name
            ),
            format!("Frequency: {:.1} MHz", self.radio.frequency as f64 / 1_000_000.0),
            format!(
                "SF: {}, BW: {} Hz, CR: 4/{}",
                self.radio.spreading_factor, self.radio.bandwidth, self.radio.coding_rate
            ),
            format!("TX Power: {} dBm", self.radio.tx_power),
            format!("Ping Interval: {} s", self.network.ping_interval),
            format!("Beacon Interval: {} s", self.network.beacon_interval),
            format!("Route Timeout: {} s", self.network.route_timeout),
            format!("Max Hops: {}", self.network.max_hops),
            format!(
                "Self-Healing: {} (every {} s)",
                onoff(self.mesh.enable_self_healing),
                self.mesh.healing_timeout
            ),
            format!(
                "Encryption: {} (IV mode {:?})",
                onoff(self.encryption.enabled),
                self.encryption.iv_mode
            ),
            format!(
                "CRC: {}, LDRO: {}",
                onoff(self.radio.enable_crc),
                onoff(self.radio.enable_ldro)
            ),
        ]
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node: NodeConfig {
                id: MASTER_NODE_ID,
                name: "LoRa-Master".to_string(),
            },
            radio: RadioConfig {
                frequency: 868_000_000,
                spreading_factor: 7,
                bandwidth: 125_000,
                coding_rate: 5,
                tx_power: 17,
                sync_word: 0x12,
                preamble_length: default_preamble_length(),
                symbol_timeout: default_symbol_timeout(),
                enable_crc: true,
                enable_ldro: true,
            },
            network: NetworkConfig {
                ping_interval: 30,
                beacon_interval: 60,
                route_timeout: 300,
                max_hops: 5,
                ping_jitter_max_ms: default_ping_jitter_max_ms(),
            },
            mesh: MeshConfig::default(),
            transport: TransportConfig::default(),
            encryption: EncryptionConfig::generate(),
            udp: UdpConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
            },
        }
    }
}

/// Persistence collaborator: where the node's configuration lives between runs.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_config(&self) -> Result<Config>;
    async fn save_config(&self, config: &Config) -> Result<()>;
}

/// TOML file on local disk.
#[derive(Debug, Clone)]
pub struct TomlConfigStore {
    path: PathBuf,
}

impl TomlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn path_str(&self) -> Result<&str> {
        self.path
            .to_str()
            .ok_or_else(|| anyhow!("config path {:?} is not valid UTF-8", self.path))
    }
}

#[async_trait]
impl ConfigStore for TomlConfigStore {
    async fn load_config(&self) -> Result<Config> {
        Config::load(self.path_str()?).await
    }

    async fn save_config(&self, config: &Config) -> Result<()> {
        config.save(self.path_str()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.is_master());
        assert_eq!(config.mesh.node_capacity, 20);
        assert_eq!(config.transport.queue_capacity, 10);
    }

    #[test]
    fn rejects_out_of_range_radio_parameters() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("sf low", Box::new(|c: &mut Config| c.radio.spreading_factor = 6)),
            ("sf high", Box::new(|c: &mut Config| c.radio.spreading_factor = 13)),
            ("power", Box::new(|c: &mut Config| c.radio.tx_power = 21)),
            ("cr", Box::new(|c: &mut Config| c.radio.coding_rate = 4)),
            ("bw", Box::new(|c: &mut Config| c.radio.bandwidth = 100_000)),
            ("hops", Box::new(|c: &mut Config| c.network.max_hops = 0)),
            ("id zero", Box::new(|c: &mut Config| c.node.id = 0)),
            ("id broadcast", Box::new(|c: &mut Config| c.node.id = 0xFF)),
        ];
        for (label, mutate) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(MeshError::Config(_))),
                "{} should be rejected",
                label
            );
        }
    }

    #[test]
    fn rejects_bad_key_only_when_encryption_enabled() {
        let mut config = Config::default();
        config.encryption.key = "abcd".to_string();
        assert!(config.validate().is_err());
        config.encryption.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn key_and_iv_decode_from_hex() {
        let enc = EncryptionConfig {
            enabled: true,
            key: "000102030405060708090a0b0c0d0e0f".into(),
            iv: "ffffffffffffffffffffffffffffffff".into(),
            iv_mode: IvMode::Static,
        };
        assert_eq!(enc.key_bytes().unwrap()[15], 0x0f);
        assert_eq!(enc.iv_bytes().unwrap(), [0xff; 16]);
    }

    #[test]
    fn optional_sections_fall_back_to_defaults() {
        let toml_src = r#"
            [node]
            id = 3
            name = "relay-3"

            [radio]
            frequency = 868000000
            spreading_factor = 9
            bandwidth = 125000
            coding_rate = 5
            tx_power = 14
            sync_word = 18

            [network]
            ping_interval = 30
            beacon_interval = 60
            route_timeout = 300
            max_hops = 5

            [encryption]
            enabled = false
            key = ""
            iv = ""

            [logging]
            level = "debug"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert!(!config.is_master());
        assert_eq!(config.mesh.maintenance_interval, 10);
        assert_eq!(config.transport.enqueue_timeout_ms, 100);
        assert_eq!(config.network.ping_jitter_max_ms, 1000);
        assert!(config.radio.enable_crc);
        assert_eq!(config.encryption.iv_mode, IvMode::Static);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn summary_mentions_role_and_band() {
        let lines = Config::default().summary_lines();
        assert!(lines[0].contains("MASTER"));
        assert!(lines.iter().any(|l| l.contains("868.0 MHz")));
    }
}
