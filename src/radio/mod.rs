//! Physical-layer collaborator.
//!
//! The mesh core never touches radio registers. It configures a [`Radio`]
//! once at startup, hands it encoded frames, and polls it for received ones.
//! Two adapters ship with the crate:
//!
//! - [`loopback`] - an in-process shared medium with explicit links, used by
//!   tests and the `simulate` command
//! - [`udp`] - frames carried in UDP datagrams so a node can run on a host

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::config::RadioConfig;
use crate::error::MeshResult;

pub mod loopback;
pub mod udp;

/// LoRa modem settings applied at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RadioParams {
    pub frequency: u32,
    pub spreading_factor: u8,
    pub bandwidth: u32,
    pub coding_rate: u8,
    pub tx_power: i8,
    pub sync_word: u8,
    pub preamble_length: u16,
    pub crc_enabled: bool,
    pub ldro_enabled: bool,
}

impl From<&RadioConfig> for RadioParams {
    fn from(r: &RadioConfig) -> Self {
        Self {
            frequency: r.frequency,
            spreading_factor: r.spreading_factor,
            bandwidth: r.bandwidth,
            coding_rate: r.coding_rate,
            tx_power: r.tx_power,
            sync_word: r.sync_word,
            preamble_length: r.preamble_length,
            crc_enabled: r.enable_crc,
            ldro_enabled: r.enable_ldro,
        }
    }
}

impl std::fmt::Display for RadioParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1}MHz SF{} BW:{} CR:4/{} {}dBm",
            self.frequency as f64 / 1_000_000.0,
            self.spreading_factor,
            self.bandwidth,
            self.coding_rate,
            self.tx_power
        )
    }
}

/// A frame as it came off the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    pub bytes: Vec<u8>,
    pub rssi: i16,
    pub snr: i8,
}

#[async_trait]
pub trait Radio: Send + Sync {
    /// Bring the modem up. An error here is fatal for the node.
    async fn configure(&self, params: &RadioParams) -> MeshResult<()>;

    /// Transmit one frame. Not retried on failure.
    async fn send(&self, frame: &[u8]) -> MeshResult<()>;

    /// Wait up to `timeout` for a frame; `Ok(None)` when nothing arrived.
    async fn receive(&self, timeout: Duration) -> MeshResult<Option<RxFrame>>;
}
