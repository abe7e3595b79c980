//! UDP datagram radio.
//!
//! Each frame is one datagram sent to every configured peer. There is no
//! signal to measure, so every received frame reports the configured RSSI.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

use super::{Radio, RadioParams, RxFrame};
use crate::config::UdpConfig;
use crate::error::{MeshError, MeshResult};
use crate::mesh::packet::MAX_FRAME_LEN;

#[derive(Debug)]
pub struct UdpRadio {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    rssi: i16,
}

impl UdpRadio {
    /// Bind the local socket and resolve every peer. Failure here means the
    /// node has no radio, so it is reported as [`MeshError::RadioInit`].
    pub async fn bind(cfg: &UdpConfig) -> MeshResult<Self> {
        let socket = UdpSocket::bind(cfg.bind.as_str())
            .await
            .map_err(|e| MeshError::RadioInit(format!("bind {}: {}", cfg.bind, e)))?;
        let mut peers = Vec::with_capacity(cfg.peers.len());
        for peer in &cfg.peers {
            let mut addrs = tokio::net::lookup_host(peer.as_str())
                .await
                .map_err(|e| MeshError::RadioInit(format!("peer {}: {}", peer, e)))?;
            match addrs.next() {
                Some(addr) => peers.push(addr),
                None => {
                    return Err(MeshError::RadioInit(format!(
                        "peer {} did not resolve",
                        peer
                    )))
                }
            }
        }
        Ok(Self {
            socket,
            peers,
            rssi: cfg.rssi,
        })
    }

    pub fn local_addr(&self) -> MeshResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Radio for UdpRadio {
    async fn configure(&self, params: &RadioParams) -> MeshResult<()> {
        info!(
            "UDP radio on {} ({} peer(s)), emulating {}",
            self.socket.local_addr()?,
            self.peers.len(),
            params
        );
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> MeshResult<()> {
        let mut failures = 0;
        for peer in &self.peers {
            if let Err(e) = self.socket.send_to(frame, peer).await {
                warn!("UDP send to {} failed: {}", peer, e);
                failures += 1;
            }
        }
        if failures > 0 && failures == self.peers.len() {
            return Err(MeshError::Radio(format!(
                "send failed for all {} peer(s)",
                failures
            )));
        }
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> MeshResult<Option<RxFrame>> {
        let mut buf = [0u8; MAX_FRAME_LEN + 1];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(MeshError::Radio(format!("recv: {}", e))),
            Ok(Ok((len, from))) => {
                if len > MAX_FRAME_LEN {
                    debug!("Oversized datagram from {} dropped", from);
                    return Ok(None);
                }
                Ok(Some(RxFrame {
                    bytes: buf[..len].to_vec(),
                    rssi: self.rssi,
                    snr: 0,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(bind: &str, peers: Vec<String>) -> UdpConfig {
        UdpConfig {
            bind: bind.to_string(),
            peers,
            rssi: -42,
        }
    }

    #[tokio::test]
    async fn datagrams_reach_peers_with_configured_rssi() {
        let b = UdpRadio::bind(&local("127.0.0.1:0", vec![])).await.unwrap();
        let b_addr = b.local_addr().unwrap();
        let a = UdpRadio::bind(&local("127.0.0.1:0", vec![b_addr.to_string()]))
            .await
            .unwrap();
        a.send(&[2, 0xFF, 4, 0]).await.unwrap();
        let frame = b.receive(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(frame.bytes, vec![2, 0xFF, 4, 0]);
        assert_eq!(frame.rssi, -42);
        assert!(b.receive(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unresolvable_peer_is_a_radio_init_failure() {
        let err = UdpRadio::bind(&local("127.0.0.1:0", vec!["not an address".into()]))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
