//! Protocol dispatcher.
//!
//! Interprets received packets by message type and originates beacons, pings
//! and route requests. There is no per-conversation state here: everything
//! that persists between packets lives in the [`Registry`]. The only local
//! state is the sequence counter and the optional route-request seen-cache.

use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{MeshError, MeshResult};
use crate::logutil::{escape_log, hex_dump};
use crate::mesh::clock::Clock;
use crate::mesh::packet::{
    Beacon, DataEnvelope, MessageType, Packet, Ping, Pong, RouteReply, RouteRequest,
    WirePayload, BROADCAST,
};
use crate::mesh::registry::Registry;
use crate::mesh::transport::Transport;
use crate::metrics;

/// Application payloads buffered for the consumer before new ones are dropped.
pub const APP_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub local_id: u8,
    pub local_name: String,
    pub max_hops: u8,
    pub ping_jitter_max_ms: u64,
    /// Zero disables duplicate route-request suppression.
    pub rreq_dedup_window: Duration,
}

impl From<&Config> for DispatcherSettings {
    fn from(config: &Config) -> Self {
        Self {
            local_id: config.node.id,
            local_name: config.node.name.clone(),
            max_hops: config.network.max_hops,
            ping_jitter_max_ms: config.network.ping_jitter_max_ms,
            rreq_dedup_window: Duration::from_secs(config.mesh.rreq_dedup_window as u64),
        }
    }
}

/// Application data addressed to this node (or broadcast).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    pub origin: u8,
    pub broadcast: bool,
    pub body: Vec<u8>,
    pub rssi: i16,
}

/// What handling a single packet did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Echo of our own traffic, overheard unicast, or a type with no handler.
    Ignored,
    /// State updated; the packet stopped here (hop limit reached).
    Absorbed,
    /// Re-sent: beacon/RREQ rebroadcast, or RREP/DATA forwarded.
    Relayed { to: u8 },
    /// A RREP was sent or a PONG was scheduled.
    Replied { to: u8 },
    Delivered { origin: u8 },
    RouteEstablished { dest: u8, via: u8 },
    Rtt { from: u8, rtt_ms: u32 },
    Dropped(&'static str),
}

pub struct Dispatcher {
    settings: DispatcherSettings,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    sequence: AtomicU16,
    seen_rreqs: Mutex<HashMap<(u8, u16), u64>>,
    app_tx: mpsc::Sender<AppMessage>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        settings: DispatcherSettings,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::Receiver<AppMessage>) {
        let (app_tx, app_rx) = mpsc::channel(APP_QUEUE_CAPACITY);
        let seed: u16 = rand::random();
        info!(
            "Mesh protocol initialized, node ID: {}",
            settings.local_id
        );
        (
            Self {
                settings,
                registry,
                transport,
                clock,
                sequence: AtomicU16::new(seed),
                seen_rreqs: Mutex::new(HashMap::new()),
                app_tx,
            },
            app_rx,
        )
    }

    pub fn local_id(&self) -> u8 {
        self.settings.local_id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Increment and return the sequence counter (wraps at u16::MAX).
    pub fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn current_sequence(&self) -> u16 {
        self.sequence.load(Ordering::Relaxed)
    }

    fn now_ms32(&self) -> u32 {
        self.clock.now_ms() as u32
    }

    /// Forwarding is allowed while the received hop count is below
    /// `max_hops - 1`.
    fn may_relay(&self, hop_count: u8) -> bool {
        hop_count < self.settings.max_hops.saturating_sub(1)
    }

    async fn emit(&self, dest: u8, msg_type: MessageType, payload: Vec<u8>) -> bool {
        match self.transport.send(dest, msg_type, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to queue {} for {}: {}", msg_type, dest, e);
                false
            }
        }
    }

    fn malformed(&self, packet: &Packet, e: MeshError) -> Outcome {
        metrics::inc_malformed_frames();
        warn!("Dropping {} from {}: {}", packet.msg_type, packet.src, e);
        Outcome::Dropped("malformed payload")
    }

    // -------------------------------------------------------------- inbound

    pub async fn handle_packet(&self, packet: Packet) -> Outcome {
        let local = self.settings.local_id;
        if packet.src == local {
            return Outcome::Ignored;
        }
        metrics::inc_packets_received();

        if let Err(e) = self.registry.touch_node(packet.src, packet.rssi) {
            warn!("Could not record sender {}: {}", packet.src, e);
        }

        if packet.dest != local && packet.dest != BROADCAST {
            debug!(
                "Overheard {} from {} for {}",
                packet.msg_type, packet.src, packet.dest
            );
            return Outcome::Ignored;
        }

        debug!(
            "RX from {}: type={} RSSI={} SNR={}",
            packet.src, packet.msg_type, packet.rssi, packet.snr
        );

        match packet.msg_type {
            MessageType::Beacon => self.handle_beacon(&packet).await,
            MessageType::Ping => self.handle_ping(&packet),
            MessageType::Pong => self.handle_pong(&packet),
            MessageType::Data => self.handle_data(&packet).await,
            MessageType::RouteRequest => self.handle_route_request(&packet).await,
            MessageType::RouteReply => self.handle_route_reply(&packet).await,
            MessageType::ConfigSync => {
                debug!("Config sync packet from {} ignored", packet.src);
                Outcome::Ignored
            }
            MessageType::Unknown(code) => {
                warn!(
                    "Unknown packet type 0x{:02X} from {} (len={}): {}",
                    code,
                    packet.src,
                    packet.payload.len(),
                    hex_dump(&packet.payload, 64)
                );
                Outcome::Ignored
            }
        }
    }

    async fn handle_beacon(&self, packet: &Packet) -> Outcome {
        let beacon = match Beacon::decode(&packet.payload) {
            Ok(b) => b,
            Err(e) => return self.malformed(packet, e),
        };
        if beacon.node_id == self.settings.local_id || beacon.node_id == 0 {
            return Outcome::Ignored;
        }
        let hops = beacon.hop_count.saturating_add(1);
        debug!(
            "Beacon from {} ({}) via {}: hops={}",
            beacon.node_id,
            escape_log(&beacon.name),
            packet.src,
            hops
        );

        let path_taken = match self
            .registry
            .upsert_route(beacon.node_id, packet.src, hops, packet.rssi)
        {
            Ok(taken) => taken,
            Err(e) => {
                warn!("Route to {} not recorded: {}", beacon.node_id, e);
                true
            }
        };

        // Hop count and RSSI follow the route actually in use; an echo over a
        // longer path only refreshes the name and liveness.
        let (rssi, hop_count) = match self.registry.find_node(beacon.node_id) {
            Some(known) if !path_taken => (known.rssi, known.hop_count),
            _ => (packet.rssi, hops),
        };
        if let Err(e) =
            self.registry
                .upsert_node(beacon.node_id, Some(&beacon.name), rssi, hop_count)
        {
            warn!("Beacon from {} not recorded: {}", beacon.node_id, e);
        }

        if !self.may_relay(beacon.hop_count) {
            return Outcome::Absorbed;
        }
        let relayed = Beacon {
            hop_count: hops,
            ..beacon
        };
        if self
            .emit(BROADCAST, MessageType::Beacon, relayed.encode())
            .await
        {
            metrics::inc_packets_forwarded();
            Outcome::Relayed { to: BROADCAST }
        } else {
            Outcome::Dropped("transmit queue full")
        }
    }

    fn handle_ping(&self, packet: &Packet) -> Outcome {
        let ping = match Ping::decode(&packet.payload) {
            Ok(p) => p,
            Err(e) => return self.malformed(packet, e),
        };
        if ping.node_id == self.settings.local_id {
            return Outcome::Ignored;
        }
        let pong = Pong {
            node_id: self.settings.local_id,
            ping_sequence: ping.sequence,
            timestamp_ms: ping.timestamp_ms,
            rtt_ms: 0,
        };
        let max = self.settings.ping_jitter_max_ms;
        let delay_ms = if max == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..max)
        };
        debug!(
            "Ping {} from {}, answering in {}ms",
            ping.sequence, ping.node_id, delay_ms
        );

        // Answer from a timer so the receive path keeps draining the radio.
        let transport = Arc::clone(&self.transport);
        let to = ping.node_id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Err(e) = transport.send(to, MessageType::Pong, pong.encode()).await {
                warn!("Pong to {} dropped: {}", to, e);
            }
        });
        Outcome::Replied { to }
    }

    fn handle_pong(&self, packet: &Packet) -> Outcome {
        let pong = match Pong::decode(&packet.payload) {
            Ok(p) => p,
            Err(e) => return self.malformed(packet, e),
        };
        let rtt_ms = rtt_since(pong.timestamp_ms, self.now_ms32());
        metrics::observe_rtt(rtt_ms);
        info!(
            "Pong from {}: RTT={}ms (Seq={})",
            pong.node_id, rtt_ms, pong.ping_sequence
        );
        Outcome::Rtt {
            from: pong.node_id,
            rtt_ms,
        }
    }

    async fn handle_data(&self, packet: &Packet) -> Outcome {
        let env = match DataEnvelope::decode(&packet.payload) {
            Ok(e) => e,
            Err(e) => return self.malformed(packet, e),
        };
        let local = self.settings.local_id;

        if env.final_dest == local || env.final_dest == BROADCAST {
            info!(
                "Data packet from {} via {}: {} bytes",
                env.origin,
                packet.src,
                env.body.len()
            );
            let msg = AppMessage {
                origin: env.origin,
                broadcast: env.final_dest == BROADCAST,
                body: env.body,
                rssi: packet.rssi,
            };
            if self.app_tx.try_send(msg).is_err() {
                warn!("Application queue full, data from {} dropped", env.origin);
                return Outcome::Dropped("application queue full");
            }
            return Outcome::Delivered { origin: env.origin };
        }

        if packet.is_broadcast() {
            debug!(
                "Broadcast data from {} for {} not forwarded",
                env.origin, env.final_dest
            );
            return Outcome::Dropped("broadcast data is not forwarded");
        }

        match self.registry.next_hop(env.final_dest) {
            Some(next_hop) => {
                if !self
                    .emit(next_hop, MessageType::Data, packet.payload.clone())
                    .await
                {
                    return Outcome::Dropped("transmit queue full");
                }
                metrics::inc_packets_forwarded();
                info!(
                    "Forwarding packet from {} to {} via {}",
                    env.origin, env.final_dest, next_hop
                );
                Outcome::Relayed { to: next_hop }
            }
            None => {
                metrics::inc_no_route_drops();
                warn!(
                    "No route to {} for packet from {}",
                    env.final_dest, env.origin
                );
                Outcome::Dropped("no route")
            }
        }
    }

    /// True when `(origin, sequence)` was already seen inside the window.
    fn seen_recently(&self, origin: u8, sequence: u16) -> bool {
        let window = self.settings.rreq_dedup_window;
        if window.is_zero() {
            return false;
        }
        let now = self.clock.now_ms();
        let window_ms = window.as_millis() as u64;
        let mut seen = self
            .seen_rreqs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        seen.retain(|_, at| now.saturating_sub(*at) <= window_ms);
        if seen.contains_key(&(origin, sequence)) {
            return true;
        }
        seen.insert((origin, sequence), now);
        false
    }

    /// Forget route requests older than the dedup window.
    pub fn prune_seen_requests(&self) -> usize {
        let now = self.clock.now_ms();
        let window_ms = self.settings.rreq_dedup_window.as_millis() as u64;
        let mut seen = self
            .seen_rreqs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = seen.len();
        seen.retain(|_, at| now.saturating_sub(*at) <= window_ms);
        before - seen.len()
    }

    async fn handle_route_request(&self, packet: &Packet) -> Outcome {
        let rreq = match RouteRequest::decode(&packet.payload) {
            Ok(r) => r,
            Err(e) => return self.malformed(packet, e),
        };
        let local = self.settings.local_id;
        if rreq.origin == local {
            return Outcome::Ignored;
        }
        info!(
            "RREQ: Origin={} Target={} Seq={} Hops={} (via {})",
            rreq.origin, rreq.target, rreq.sequence, rreq.hop_count, packet.src
        );

        // Reverse route to the originator through whoever handed it to us.
        if let Err(e) = self.registry.upsert_route(
            rreq.origin,
            packet.src,
            rreq.hop_count.saturating_add(1),
            packet.rssi,
        ) {
            warn!("Reverse route to {} not recorded: {}", rreq.origin, e);
        }

        if self.seen_recently(rreq.origin, rreq.sequence) {
            metrics::inc_duplicate_rreqs();
            debug!(
                "Duplicate RREQ {}/{} suppressed",
                rreq.origin, rreq.sequence
            );
            return Outcome::Absorbed;
        }

        if rreq.target == local {
            info!("RREQ reached target, sending RREP to {}", packet.src);
            let rrep = RouteReply {
                target: local,
                origin: rreq.origin,
                sequence: rreq.sequence,
                hop_count: 0,
            };
            return if self
                .emit(packet.src, MessageType::RouteReply, rrep.encode())
                .await
            {
                Outcome::Replied { to: packet.src }
            } else {
                Outcome::Dropped("transmit queue full")
            };
        }

        if !self.may_relay(rreq.hop_count) {
            return Outcome::Absorbed;
        }
        let relayed = RouteRequest {
            hop_count: rreq.hop_count + 1,
            ..rreq
        };
        if self
            .emit(BROADCAST, MessageType::RouteRequest, relayed.encode())
            .await
        {
            metrics::inc_packets_forwarded();
            Outcome::Relayed { to: BROADCAST }
        } else {
            Outcome::Dropped("transmit queue full")
        }
    }

    async fn handle_route_reply(&self, packet: &Packet) -> Outcome {
        let rrep = match RouteReply::decode(&packet.payload) {
            Ok(r) => r,
            Err(e) => return self.malformed(packet, e),
        };
        let local = self.settings.local_id;
        info!(
            "RREP: Target={} Origin={} Hops={} (via {})",
            rrep.target, rrep.origin, rrep.hop_count, packet.src
        );

        if let Err(e) = self.registry.upsert_route(
            rrep.target,
            packet.src,
            rrep.hop_count.saturating_add(1),
            packet.rssi,
        ) {
            warn!("Forward route to {} not recorded: {}", rrep.target, e);
        }

        if rrep.origin == local {
            metrics::inc_discoveries_completed();
            info!(
                "Route discovery complete! Route to {} established via {}",
                rrep.target, packet.src
            );
            return Outcome::RouteEstablished {
                dest: rrep.target,
                via: packet.src,
            };
        }

        if !self.may_relay(rrep.hop_count) {
            return Outcome::Absorbed;
        }
        let Some(next_hop) = self.registry.next_hop(rrep.origin) else {
            metrics::inc_no_route_drops();
            warn!(
                "RREP forward failed: no route to originator {}",
                rrep.origin
            );
            return Outcome::Dropped("no route");
        };
        let relayed = RouteReply {
            hop_count: rrep.hop_count + 1,
            ..rrep
        };
        if self
            .emit(next_hop, MessageType::RouteReply, relayed.encode())
            .await
        {
            metrics::inc_packets_forwarded();
            Outcome::Relayed { to: next_hop }
        } else {
            Outcome::Dropped("transmit queue full")
        }
    }

    // ------------------------------------------------------------- outbound

    pub async fn send_beacon(&self) -> MeshResult<()> {
        let beacon = Beacon {
            node_id: self.settings.local_id,
            name: self.settings.local_name.clone(),
            sequence: self.current_sequence(),
            rssi: 0,
            hop_count: 0,
        };
        debug!("Sending beacon");
        self.transport
            .broadcast(MessageType::Beacon, beacon.encode())
            .await
    }

    /// Broadcast a ping; returns its sequence number.
    pub async fn send_ping(&self) -> MeshResult<u16> {
        let ping = Ping {
            node_id: self.settings.local_id,
            sequence: self.next_sequence(),
            timestamp_ms: self.now_ms32(),
        };
        debug!("Sending ping {}", ping.sequence);
        self.transport
            .broadcast(MessageType::Ping, ping.encode())
            .await?;
        Ok(ping.sequence)
    }

    /// Flood a route request for `dest`; returns its sequence number.
    pub async fn initiate_route_discovery(&self, dest: u8) -> MeshResult<u16> {
        if dest == self.settings.local_id || dest == BROADCAST || dest == 0 {
            return Err(MeshError::NoRoute(dest));
        }
        let rreq = RouteRequest {
            origin: self.settings.local_id,
            target: dest,
            sequence: self.next_sequence(),
            hop_count: 0,
        };
        self.transport
            .broadcast(MessageType::RouteRequest, rreq.encode())
            .await?;
        metrics::inc_discoveries_started();
        info!("Initiating route discovery to node {}", dest);
        Ok(rreq.sequence)
    }

    /// Send application bytes to `dest` (or [`BROADCAST`]). Without an active
    /// route the data is refused with [`MeshError::NoRoute`] and a discovery
    /// is started so a retry can succeed.
    pub async fn send_application_data(&self, dest: u8, body: &[u8]) -> MeshResult<()> {
        if body.len() > DataEnvelope::MAX_BODY_LEN {
            return Err(MeshError::FrameTooLarge {
                len: body.len(),
                max: DataEnvelope::MAX_BODY_LEN,
            });
        }
        if dest == self.settings.local_id || dest == 0 {
            return Err(MeshError::NoRoute(dest));
        }
        let env = DataEnvelope {
            origin: self.settings.local_id,
            final_dest: dest,
            body: body.to_vec(),
        };
        if dest == BROADCAST {
            return self
                .transport
                .broadcast(MessageType::Data, env.encode())
                .await;
        }
        match self.registry.next_hop(dest) {
            Some(next_hop) => {
                self.transport
                    .send(next_hop, MessageType::Data, env.encode())
                    .await
            }
            None => {
                metrics::inc_no_route_drops();
                warn!("No route to {}, starting discovery", dest);
                if let Err(e) = self.initiate_route_discovery(dest).await {
                    warn!("Route discovery to {} not sent: {}", dest, e);
                }
                Err(MeshError::NoRoute(dest))
            }
        }
    }
}

/// Round-trip time from an echoed 32-bit millisecond timestamp. Wrapping
/// arithmetic keeps the result correct across the u32 rollover.
pub fn rtt_since(echoed_ms: u32, now_ms: u32) -> u32 {
    now_ms.wrapping_sub(echoed_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::clock::ManualClock;
    use async_trait::async_trait;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    /// Records every frame the dispatcher asks to send.
    struct Recorder {
        tx: UnboundedSender<(u8, MessageType, Vec<u8>)>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, dest: u8, msg_type: MessageType, payload: Vec<u8>) -> MeshResult<()> {
            if self.fail {
                return Err(MeshError::TransportTimeout { timeout_ms: 100 });
            }
            let _ = self.tx.send((dest, msg_type, payload));
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        registry: Arc<Registry>,
        clock: Arc<ManualClock>,
        sent: UnboundedReceiver<(u8, MessageType, Vec<u8>)>,
        app: mpsc::Receiver<AppMessage>,
    }

    fn harness_with(local_id: u8, dedup: Duration, fail: bool) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = Arc::new(Registry::new(local_id, "local", 20, 20, clock.clone()));
        let (tx, sent) = unbounded_channel();
        let transport = Arc::new(Recorder {
            tx,
            fail,
        });
        let settings = DispatcherSettings {
            local_id,
            local_name: "local".into(),
            max_hops: 5,
            ping_jitter_max_ms: 0,
            rreq_dedup_window: dedup,
        };
        let (dispatcher, app) =
            Dispatcher::new(settings, registry.clone(), transport, clock.clone());
        Harness {
            dispatcher,
            registry,
            clock,
            sent,
            app,
        }
    }

    fn harness(local_id: u8) -> Harness {
        harness_with(local_id, Duration::ZERO, false)
    }

    fn rx(src: u8, dest: u8, ty: MessageType, payload: Vec<u8>, rssi: i16) -> Packet {
        Packet::new(src, dest, ty, payload).with_signal(rssi, 5)
    }

    fn beacon_from(id: u8, hops: u8) -> Vec<u8> {
        Beacon {
            node_id: id,
            name: format!("node-{id}"),
            sequence: 1,
            rssi: 0,
            hop_count: hops,
        }
        .encode()
    }

    #[tokio::test]
    async fn beacon_from_neighbour_creates_node_and_route() {
        let mut h = harness(1);
        let out = h
            .dispatcher
            .handle_packet(rx(5, BROADCAST, MessageType::Beacon, beacon_from(5, 0), -60))
            .await;
        assert_eq!(out, Outcome::Relayed { to: BROADCAST });

        let node = h.registry.find_node(5).unwrap();
        assert_eq!((node.hop_count, node.rssi), (1, -60));
        assert_eq!(node.name, "node-5");
        let route = h.registry.find_route(5).unwrap();
        assert_eq!((route.next_hop, route.hop_count), (5, 1));

        let (dest, ty, payload) = h.sent.recv().await.unwrap();
        assert_eq!((dest, ty), (BROADCAST, MessageType::Beacon));
        assert_eq!(Beacon::decode(&payload).unwrap().hop_count, 1);
    }

    #[tokio::test]
    async fn relayed_beacon_routes_through_the_relay() {
        let mut h = harness(1);
        h.dispatcher
            .handle_packet(rx(3, BROADCAST, MessageType::Beacon, beacon_from(8, 2), -70))
            .await;
        let route = h.registry.find_route(8).unwrap();
        assert_eq!((route.next_hop, route.hop_count), (3, 3));
        assert_eq!(h.registry.find_node(8).unwrap().hop_count, 3);
        // relay itself is a direct neighbour
        assert_eq!(h.registry.find_node(3).unwrap().hop_count, 1);
        assert!(h.sent.try_recv().is_ok());
    }

    #[tokio::test]
    async fn echoed_beacon_leaves_neighbour_at_one_hop() {
        let h = harness(2);
        h.dispatcher
            .handle_packet(rx(1, BROADCAST, MessageType::Beacon, beacon_from(1, 0), -50))
            .await;
        // node 1's beacon comes back around through node 3
        let out = h
            .dispatcher
            .handle_packet(rx(3, BROADCAST, MessageType::Beacon, beacon_from(1, 4), -90))
            .await;
        assert_eq!(out, Outcome::Absorbed);

        let node = h.registry.find_node(1).unwrap();
        assert_eq!((node.hop_count, node.rssi), (1, -50));
        let route = h.registry.find_route(1).unwrap();
        assert_eq!((route.next_hop, route.hop_count), (1, 1));
    }

    #[tokio::test]
    async fn echo_through_same_relay_keeps_short_route() {
        let h = harness(1);
        h.dispatcher
            .handle_packet(rx(2, BROADCAST, MessageType::Beacon, beacon_from(3, 1), -71))
            .await;
        h.dispatcher
            .handle_packet(rx(2, BROADCAST, MessageType::Beacon, beacon_from(3, 3), -71))
            .await;
        let route = h.registry.find_route(3).unwrap();
        assert_eq!((route.next_hop, route.hop_count), (2, 2));
        assert_eq!(h.registry.find_node(3).unwrap().hop_count, 2);
    }

    #[tokio::test]
    async fn beacon_at_hop_limit_is_not_rebroadcast() {
        let mut h = harness(1);
        let out = h
            .dispatcher
            .handle_packet(rx(3, BROADCAST, MessageType::Beacon, beacon_from(8, 4), -70))
            .await;
        assert_eq!(out, Outcome::Absorbed);
        assert!(h.sent.try_recv().is_err());
        assert!(h.registry.find_route(8).is_some());
    }

    #[tokio::test]
    async fn own_echoes_and_own_beacons_are_ignored() {
        let mut h = harness(1);
        let echo = rx(1, BROADCAST, MessageType::Beacon, beacon_from(1, 0), -40);
        assert_eq!(h.dispatcher.handle_packet(echo).await, Outcome::Ignored);
        let relayed_own = rx(4, BROADCAST, MessageType::Beacon, beacon_from(1, 1), -40);
        assert_eq!(h.dispatcher.handle_packet(relayed_own).await, Outcome::Ignored);
        assert!(h.sent.try_recv().is_err());
        assert!(h.registry.find_route(1).is_none());
    }

    #[tokio::test]
    async fn any_packet_refreshes_sender() {
        let h = harness(1);
        h.dispatcher
            .handle_packet(rx(6, 9, MessageType::Data, vec![6, 9], -88))
            .await;
        let n = h.registry.find_node(6).unwrap();
        assert_eq!((n.rssi, n.last_seen_ms), (-88, 1_000_000));
    }

    #[tokio::test]
    async fn ping_is_answered_with_echoed_timestamp() {
        let mut h = harness(4);
        let ping = Ping {
            node_id: 1,
            sequence: 77,
            timestamp_ms: 123_456,
        };
        let out = h
            .dispatcher
            .handle_packet(rx(1, BROADCAST, MessageType::Ping, ping.encode(), -50))
            .await;
        assert_eq!(out, Outcome::Replied { to: 1 });
        let (dest, ty, payload) = tokio::time::timeout(Duration::from_secs(1), h.sent.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((dest, ty), (1, MessageType::Pong));
        let pong = Pong::decode(&payload).unwrap();
        assert_eq!(pong.node_id, 4);
        assert_eq!(pong.ping_sequence, 77);
        assert_eq!(pong.timestamp_ms, 123_456);
    }

    #[tokio::test]
    async fn pong_yields_rtt_from_echoed_timestamp() {
        let h = harness(1);
        let t0 = h.clock.now_ms() as u32;
        h.clock.advance(420);
        let pong = Pong {
            node_id: 4,
            ping_sequence: 3,
            timestamp_ms: t0,
            rtt_ms: 0,
        };
        let out = h
            .dispatcher
            .handle_packet(rx(4, 1, MessageType::Pong, pong.encode(), -50))
            .await;
        assert_eq!(out, Outcome::Rtt { from: 4, rtt_ms: 420 });
        assert_eq!(rtt_since(u32::MAX - 9, 10), 20);
    }

    #[tokio::test]
    async fn rreq_from_far_originator_sets_reverse_route_and_rebroadcasts() {
        let mut h = harness(1);
        let rreq = RouteRequest {
            origin: 2,
            target: 9,
            sequence: 500,
            hop_count: 0,
        };
        let out = h
            .dispatcher
            .handle_packet(rx(3, BROADCAST, MessageType::RouteRequest, rreq.encode(), -65))
            .await;
        assert_eq!(out, Outcome::Relayed { to: BROADCAST });
        let back = h.registry.find_route(2).unwrap();
        assert_eq!((back.next_hop, back.hop_count), (3, 1));

        let (dest, ty, payload) = h.sent.recv().await.unwrap();
        assert_eq!((dest, ty), (BROADCAST, MessageType::RouteRequest));
        let relayed = RouteRequest::decode(&payload).unwrap();
        assert_eq!(relayed.hop_count, 1);
        assert_eq!((relayed.origin, relayed.target, relayed.sequence), (2, 9, 500));
    }

    #[tokio::test]
    async fn rreq_for_us_is_answered_toward_sender() {
        let mut h = harness(9);
        let rreq = RouteRequest {
            origin: 2,
            target: 9,
            sequence: 11,
            hop_count: 2,
        };
        let out = h
            .dispatcher
            .handle_packet(rx(7, BROADCAST, MessageType::RouteRequest, rreq.encode(), -65))
            .await;
        assert_eq!(out, Outcome::Replied { to: 7 });
        let (dest, ty, payload) = h.sent.recv().await.unwrap();
        assert_eq!((dest, ty), (7, MessageType::RouteReply));
        let rrep = RouteReply::decode(&payload).unwrap();
        assert_eq!((rrep.target, rrep.origin, rrep.sequence, rrep.hop_count), (9, 2, 11, 0));
        assert_eq!(h.registry.next_hop(2), Some(7));
    }

    #[tokio::test]
    async fn rreq_past_hop_limit_is_not_rebroadcast() {
        let mut h = harness(1);
        let rreq = RouteRequest {
            origin: 2,
            target: 9,
            sequence: 1,
            hop_count: 4,
        };
        let out = h
            .dispatcher
            .handle_packet(rx(3, BROADCAST, MessageType::RouteRequest, rreq.encode(), -65))
            .await;
        assert_eq!(out, Outcome::Absorbed);
        assert!(h.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_rreqs_rebroadcast_without_cache_and_suppressed_with_it() {
        let rreq = RouteRequest {
            origin: 2,
            target: 9,
            sequence: 42,
            hop_count: 0,
        };
        let mut open = harness(1);
        for src in [3, 4] {
            open.dispatcher
                .handle_packet(rx(src, BROADCAST, MessageType::RouteRequest, rreq.encode(), -65))
                .await;
        }
        assert!(open.sent.try_recv().is_ok());
        assert!(open.sent.try_recv().is_ok());

        let mut dedup = harness_with(1, Duration::from_secs(30), false);
        let first = dedup
            .dispatcher
            .handle_packet(rx(3, BROADCAST, MessageType::RouteRequest, rreq.encode(), -65))
            .await;
        let second = dedup
            .dispatcher
            .handle_packet(rx(4, BROADCAST, MessageType::RouteRequest, rreq.encode(), -65))
            .await;
        assert_eq!(first, Outcome::Relayed { to: BROADCAST });
        assert_eq!(second, Outcome::Absorbed);
        assert!(dedup.sent.try_recv().is_ok());
        assert!(dedup.sent.try_recv().is_err());

        dedup.clock.advance(31_000);
        assert_eq!(dedup.dispatcher.prune_seen_requests(), 1);
        let third = dedup
            .dispatcher
            .handle_packet(rx(4, BROADCAST, MessageType::RouteRequest, rreq.encode(), -65))
            .await;
        assert_eq!(third, Outcome::Relayed { to: BROADCAST });
    }

    #[tokio::test]
    async fn rrep_for_us_completes_discovery() {
        let h = harness(2);
        let rrep = RouteReply {
            target: 9,
            origin: 2,
            sequence: 11,
            hop_count: 1,
        };
        let out = h
            .dispatcher
            .handle_packet(rx(3, 2, MessageType::RouteReply, rrep.encode(), -61))
            .await;
        assert_eq!(out, Outcome::RouteEstablished { dest: 9, via: 3 });
        let route = h.registry.find_route(9).unwrap();
        assert_eq!((route.next_hop, route.hop_count), (3, 2));
    }

    #[tokio::test]
    async fn rrep_is_forwarded_along_reverse_route_or_dropped() {
        let mut h = harness(3);
        let rrep = RouteReply {
            target: 9,
            origin: 2,
            sequence: 11,
            hop_count: 0,
        };
        let out = h
            .dispatcher
            .handle_packet(rx(9, 3, MessageType::RouteReply, rrep.encode(), -61))
            .await;
        assert_eq!(out, Outcome::Dropped("no route"));
        assert!(h.sent.try_recv().is_err());

        h.registry.upsert_route(2, 2, 1, -50).unwrap();
        let out = h
            .dispatcher
            .handle_packet(rx(9, 3, MessageType::RouteReply, rrep.encode(), -61))
            .await;
        assert_eq!(out, Outcome::Relayed { to: 2 });
        let (dest, ty, payload) = h.sent.recv().await.unwrap();
        assert_eq!((dest, ty), (2, MessageType::RouteReply));
        assert_eq!(RouteReply::decode(&payload).unwrap().hop_count, 1);
    }

    #[tokio::test]
    async fn data_for_us_is_delivered() {
        let mut h = harness(9);
        let env = DataEnvelope {
            origin: 2,
            final_dest: 9,
            body: b"hello".to_vec(),
        };
        let out = h
            .dispatcher
            .handle_packet(rx(3, 9, MessageType::Data, env.encode(), -70))
            .await;
        assert_eq!(out, Outcome::Delivered { origin: 2 });
        let msg = h.app.recv().await.unwrap();
        assert_eq!((msg.origin, msg.broadcast), (2, false));
        assert_eq!(msg.body, b"hello");
    }

    #[tokio::test]
    async fn broadcast_data_is_delivered_but_not_forwarded() {
        let mut h = harness(9);
        let env = DataEnvelope {
            origin: 2,
            final_dest: BROADCAST,
            body: b"all".to_vec(),
        };
        h.dispatcher
            .handle_packet(rx(2, BROADCAST, MessageType::Data, env.encode(), -70))
            .await;
        assert!(h.app.recv().await.unwrap().broadcast);
        assert!(h.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_frame_for_another_node_is_not_forwarded() {
        let mut h = harness(3);
        h.registry.upsert_route(9, 8, 2, -70).unwrap();
        let env = DataEnvelope {
            origin: 2,
            final_dest: 9,
            body: b"not mine".to_vec(),
        };
        let out = h
            .dispatcher
            .handle_packet(rx(2, BROADCAST, MessageType::Data, env.encode(), -70))
            .await;
        assert_eq!(out, Outcome::Dropped("broadcast data is not forwarded"));
        assert!(h.sent.try_recv().is_err());
        assert!(h.app.try_recv().is_err());
    }

    #[tokio::test]
    async fn data_is_forwarded_unchanged_or_dropped_without_route() {
        let mut h = harness(3);
        let env = DataEnvelope {
            origin: 2,
            final_dest: 9,
            body: b"relay me".to_vec(),
        };
        let out = h
            .dispatcher
            .handle_packet(rx(2, 3, MessageType::Data, env.encode(), -70))
            .await;
        assert_eq!(out, Outcome::Dropped("no route"));

        h.registry.upsert_route(9, 8, 2, -70).unwrap();
        let out = h
            .dispatcher
            .handle_packet(rx(2, 3, MessageType::Data, env.encode(), -70))
            .await;
        assert_eq!(out, Outcome::Relayed { to: 8 });
        let (dest, ty, payload) = h.sent.recv().await.unwrap();
        assert_eq!((dest, ty), (8, MessageType::Data));
        assert_eq!(payload, env.encode());
    }

    #[tokio::test]
    async fn overheard_unicast_only_refreshes_sender() {
        let mut h = harness(1);
        let rreq = RouteRequest {
            origin: 2,
            target: 9,
            sequence: 1,
            hop_count: 0,
        };
        let out = h
            .dispatcher
            .handle_packet(rx(3, 7, MessageType::RouteRequest, rreq.encode(), -65))
            .await;
        assert_eq!(out, Outcome::Ignored);
        assert!(h.registry.find_route(2).is_none());
        assert!(h.registry.find_node(3).is_some());
        assert!(h.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_config_sync_and_truncated_packets_change_nothing() {
        let mut h = harness(1);
        for packet in [
            rx(3, 1, MessageType::Unknown(0x42), vec![1, 2, 3], -60),
            rx(3, 1, MessageType::ConfigSync, vec![0; 8], -60),
        ] {
            assert_eq!(h.dispatcher.handle_packet(packet).await, Outcome::Ignored);
        }
        let out = h
            .dispatcher
            .handle_packet(rx(3, BROADCAST, MessageType::Beacon, vec![5, 0, 0], -60))
            .await;
        assert_eq!(out, Outcome::Dropped("malformed payload"));
        assert_eq!(h.registry.route_count(), 0);
        assert!(h.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn sequence_numbers_increment_per_ping_and_discovery() {
        let mut h = harness(1);
        let a = h.dispatcher.send_ping().await.unwrap();
        let b = h.dispatcher.initiate_route_discovery(9).await.unwrap();
        assert_eq!(b, a.wrapping_add(1));
        let (_, ty, payload) = h.sent.recv().await.unwrap();
        assert_eq!(ty, MessageType::Ping);
        assert_eq!(Ping::decode(&payload).unwrap().sequence, a);
        let (_, ty, payload) = h.sent.recv().await.unwrap();
        assert_eq!(ty, MessageType::RouteRequest);
        let rreq = RouteRequest::decode(&payload).unwrap();
        assert_eq!((rreq.origin, rreq.target, rreq.hop_count), (1, 9, 0));
    }

    #[tokio::test]
    async fn application_send_uses_route_or_starts_discovery() {
        let mut h = harness(2);
        let err = h
            .dispatcher
            .send_application_data(9, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NoRoute(9)));
        let (_, ty, _) = h.sent.recv().await.unwrap();
        assert_eq!(ty, MessageType::RouteRequest);

        h.registry.upsert_route(9, 3, 2, -60).unwrap();
        h.dispatcher.send_application_data(9, b"x").await.unwrap();
        let (dest, ty, payload) = h.sent.recv().await.unwrap();
        assert_eq!((dest, ty), (3, MessageType::Data));
        let env = DataEnvelope::decode(&payload).unwrap();
        assert_eq!((env.origin, env.final_dest), (2, 9));

        let too_big = vec![0u8; DataEnvelope::MAX_BODY_LEN + 1];
        assert!(matches!(
            h.dispatcher.send_application_data(9, &too_big).await,
            Err(MeshError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn queue_failures_are_recovered_locally() {
        let h = harness_with(1, Duration::ZERO, true);
        let out = h
            .dispatcher
            .handle_packet(rx(5, BROADCAST, MessageType::Beacon, beacon_from(5, 0), -60))
            .await;
        assert_eq!(out, Outcome::Dropped("transmit queue full"));
        // registry was still updated
        assert!(h.registry.find_route(5).is_some());
        assert!(h.dispatcher.send_beacon().await.is_err());
    }
}
