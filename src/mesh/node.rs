//! Mesh node: wires the registry, transport, dispatcher and scheduler to a
//! [`Radio`] and runs them.
//!
//! Three tasks run per node:
//!
//! - receive loop: blocking receive with timeout, decode, dispatch
//! - transmit loop: sole consumer of the transmit queue, one send per frame
//! - maintenance scheduler
//!
//! All three stop when [`MeshNode::shutdown`] is called or the node is
//! dropped.

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{MeshError, MeshResult};
use crate::mesh::clock::{Clock, MonotonicClock};
use crate::mesh::dispatcher::{AppMessage, Dispatcher, DispatcherSettings};
use crate::mesh::registry::{Node, Registry, Route, Statistics};
use crate::mesh::scheduler::{Scheduler, SchedulerSettings};
use crate::mesh::transport::{OutboundFrame, PacketTransport, TxQueue};
use crate::metrics;
use crate::radio::{Radio, RadioParams};

/// Point-in-time view of a node, as served to status consumers.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: u8,
    pub name: String,
    pub master: bool,
    pub statistics: Statistics,
    pub nodes: Vec<Node>,
    pub routes: Vec<Route>,
}

pub struct MeshNode {
    config: Config,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    app_rx: Option<mpsc::Receiver<AppMessage>>,
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("id", &self.config.node.id)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl MeshNode {
    pub async fn start(config: Config, radio: Arc<dyn Radio>) -> MeshResult<Self> {
        Self::start_with_clock(config, radio, Arc::new(MonotonicClock::new())).await
    }

    /// Validate the configuration, bring the radio up and spawn the node's
    /// tasks. A radio that fails to configure is fatal: nothing is spawned.
    pub async fn start_with_clock(
        config: Config,
        radio: Arc<dyn Radio>,
        clock: Arc<dyn Clock>,
    ) -> MeshResult<Self> {
        config.validate()?;

        let params = RadioParams::from(&config.radio);
        radio.configure(&params).await.map_err(|e| match e {
            MeshError::RadioInit(_) => e,
            other => MeshError::RadioInit(other.to_string()),
        })?;
        info!("LoRa initialized: {}", params);

        let registry = Arc::new(Registry::new(
            config.node.id,
            &config.node.name,
            config.mesh.node_capacity,
            config.mesh.route_capacity,
            clock.clone(),
        ));
        let (transport, tx_queue) = PacketTransport::from_config(&config)?;
        let transport = Arc::new(transport);
        if !transport.is_encrypted() {
            warn!("Encryption disabled, frames are sent in clear");
        }
        let (dispatcher, app_rx) = Dispatcher::new(
            DispatcherSettings::from(&config),
            registry.clone(),
            transport.clone(),
            clock.clone(),
        );
        let dispatcher = Arc::new(dispatcher);
        let scheduler = Scheduler::new(
            SchedulerSettings::from(&config),
            registry.clone(),
            dispatcher.clone(),
            clock,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll = Duration::from_millis(config.transport.rx_poll_ms.max(1));
        let tasks = vec![
            tokio::spawn(transmit_loop(
                radio.clone(),
                tx_queue,
                shutdown_rx.clone(),
            )),
            tokio::spawn(receive_loop(
                radio,
                transport,
                dispatcher.clone(),
                poll,
                shutdown_rx.clone(),
            )),
            tokio::spawn(scheduler.run(shutdown_rx)),
        ];

        info!(
            "Mesh node {} ({}) started as {}",
            config.node.id,
            config.node.name,
            if config.is_master() { "master" } else { "slave" }
        );

        Ok(Self {
            config,
            registry,
            dispatcher,
            shutdown_tx,
            tasks,
            app_rx: Some(app_rx),
        })
    }

    pub fn id(&self) -> u8 {
        self.config.node.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn list_nodes(&self) -> Vec<Node> {
        self.registry.nodes()
    }

    pub fn list_routes(&self) -> Vec<Route> {
        self.registry.routes()
    }

    pub fn get_statistics(&self) -> Statistics {
        self.registry.statistics()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.config.node.id,
            name: self.config.node.name.clone(),
            master: self.config.is_master(),
            statistics: self.get_statistics(),
            nodes: self.list_nodes(),
            routes: self.list_routes(),
        }
    }

    pub async fn send_application_data(&self, dest: u8, body: &[u8]) -> MeshResult<()> {
        self.dispatcher.send_application_data(dest, body).await
    }

    /// Start a route discovery toward `dest`; returns the request sequence.
    pub async fn trigger_discovery(&self, dest: u8) -> MeshResult<u16> {
        self.dispatcher.initiate_route_discovery(dest).await
    }

    /// Application data received by this node. Can be taken once.
    pub fn take_app_receiver(&mut self) -> Option<mpsc::Receiver<AppMessage>> {
        self.app_rx.take()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Mesh task ended abnormally: {}", e);
            }
        }
        info!("Mesh node {} stopped", self.config.node.id);
    }
}

fn stop_requested(changed: Result<(), watch::error::RecvError>, rx: &watch::Receiver<bool>) -> bool {
    changed.is_err() || *rx.borrow()
}

async fn transmit_loop(
    radio: Arc<dyn Radio>,
    mut queue: TxQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    break;
                }
            }
            frame = queue.next() => {
                match frame {
                    Some(frame) => transmit(radio.as_ref(), frame).await,
                    None => break,
                }
            }
        }
    }
    debug!("Transmit loop stopped");
}

/// One attempt, no retry.
async fn transmit(radio: &dyn Radio, frame: OutboundFrame) {
    match radio.send(&frame.bytes).await {
        Ok(()) => {
            metrics::inc_packets_transmitted();
            debug!(
                "TX to {}: type={} len={}",
                frame.dest,
                frame.msg_type,
                frame.bytes.len()
            );
        }
        Err(e) => {
            metrics::inc_tx_send_failures();
            warn!(
                "TX of {} to {} failed, dropped: {}",
                frame.msg_type, frame.dest, e
            );
        }
    }
}

async fn receive_loop(
    radio: Arc<dyn Radio>,
    transport: Arc<PacketTransport>,
    dispatcher: Arc<Dispatcher>,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    break;
                }
            }
            received = radio.receive(poll) => {
                match received {
                    Ok(Some(frame)) => {
                        match transport.decode_inbound(&frame.bytes, frame.rssi, frame.snr) {
                            Ok(packet) => {
                                let outcome = dispatcher.handle_packet(packet).await;
                                debug!("Handled frame: {:?}", outcome);
                            }
                            Err(e) => warn!(
                                "Dropped undecodable frame ({} bytes, RSSI {}): {}",
                                frame.bytes.len(),
                                frame.rssi,
                                e
                            ),
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Radio receive failed: {}", e);
                        tokio::time::sleep(poll).await;
                    }
                }
            }
        }
    }
    debug!("Receive loop stopped");
}
