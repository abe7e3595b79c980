//! Packet transport: frame codec plus the bounded transmit queue.
//!
//! Protocol code talks to the [`Transport`] trait. [`PacketTransport`] encodes
//! (and optionally encrypts) each frame and hands it to a bounded tokio mpsc
//! queue; the radio I/O loop is the queue's single consumer and transmits
//! each frame once.

use async_trait::async_trait;
use log::{debug, trace, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::config::Config;
use crate::error::{MeshError, MeshResult};
use crate::logutil::hex_dump;
use crate::mesh::crypto::FrameCipher;
use crate::mesh::packet::{MessageType, Packet, BROADCAST, MAX_FRAME_LEN};
use crate::metrics;

/// What the dispatcher needs from the layer below it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a frame for `dest` (a neighbour id or [`BROADCAST`]).
    async fn send(&self, dest: u8, msg_type: MessageType, payload: Vec<u8>) -> MeshResult<()>;

    async fn broadcast(&self, msg_type: MessageType, payload: Vec<u8>) -> MeshResult<()> {
        self.send(BROADCAST, msg_type, payload).await
    }
}

/// A frame ready for the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub dest: u8,
    pub msg_type: MessageType,
    pub bytes: Vec<u8>,
}

/// Consumer half of the transmit queue.
#[derive(Debug)]
pub struct TxQueue {
    rx: mpsc::Receiver<OutboundFrame>,
}

impl TxQueue {
    /// Next frame to transmit; `None` once every producer is gone.
    pub async fn next(&mut self) -> Option<OutboundFrame> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<OutboundFrame> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
pub struct PacketTransport {
    local_id: u8,
    cipher: Option<FrameCipher>,
    tx: mpsc::Sender<OutboundFrame>,
    enqueue_timeout: Duration,
}

impl PacketTransport {
    pub fn new(
        local_id: u8,
        cipher: Option<FrameCipher>,
        capacity: usize,
        enqueue_timeout: Duration,
    ) -> (Self, TxQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                local_id,
                cipher,
                tx,
                enqueue_timeout,
            },
            TxQueue { rx },
        )
    }

    pub fn from_config(config: &Config) -> MeshResult<(Self, TxQueue)> {
        let cipher = FrameCipher::from_config(&config.encryption)?;
        Ok(Self::new(
            config.node.id,
            cipher,
            config.transport.queue_capacity,
            config.enqueue_timeout(),
        ))
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Header + payload, sealed when encryption is on.
    pub fn encode(&self, packet: &Packet) -> MeshResult<Vec<u8>> {
        let frame = packet.to_bytes()?;
        let bytes = match &self.cipher {
            Some(cipher) => cipher.seal(&frame)?,
            None => frame,
        };
        if bytes.len() > MAX_FRAME_LEN {
            return Err(MeshError::FrameTooLarge {
                len: bytes.len(),
                max: MAX_FRAME_LEN,
            });
        }
        Ok(bytes)
    }

    /// Turn received bytes into a packet. Failures are counted; the caller
    /// just drops the frame.
    pub fn decode_inbound(&self, bytes: &[u8], rssi: i16, snr: i8) -> MeshResult<Packet> {
        let plain = match &self.cipher {
            Some(cipher) => cipher.open(bytes).map_err(|e| {
                metrics::inc_crypto_failures();
                e
            })?,
            None => bytes.to_vec(),
        };
        let packet = Packet::from_bytes(&plain).map_err(|e| {
            metrics::inc_malformed_frames();
            e
        })?;
        trace!(
            "RX {} bytes from {}: type={} payload=[{}]",
            bytes.len(),
            packet.src,
            packet.msg_type,
            hex_dump(&packet.payload, 16)
        );
        Ok(packet.with_signal(rssi, snr))
    }

    /// Block up to the configured timeout for queue space. On timeout the
    /// frame is dropped.
    pub async fn enqueue(&self, packet: Packet) -> MeshResult<()> {
        let bytes = self.encode(&packet)?;
        let frame = OutboundFrame {
            dest: packet.dest,
            msg_type: packet.msg_type,
            bytes,
        };
        match self.tx.send_timeout(frame, self.enqueue_timeout).await {
            Ok(()) => {
                debug!("Queued {} for {}", packet.msg_type, packet.dest);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                metrics::inc_tx_queue_drops();
                warn!(
                    "TX queue full, dropped {} for {}",
                    packet.msg_type, packet.dest
                );
                Err(MeshError::TransportTimeout {
                    timeout_ms: self.enqueue_timeout.as_millis() as u64,
                })
            }
            Err(SendTimeoutError::Closed(_)) => Err(MeshError::QueueClosed),
        }
    }
}

#[async_trait]
impl Transport for PacketTransport {
    async fn send(&self, dest: u8, msg_type: MessageType, payload: Vec<u8>) -> MeshResult<()> {
        self.enqueue(Packet::new(self.local_id, dest, msg_type, payload))
            .await
    }
}
