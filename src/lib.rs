//! # Loramesh - self-healing multi-hop mesh over LoRa
//!
//! Loramesh is the routing engine of a battery-class LoRa node. Nodes find
//! each other through flooded beacons, discover multi-hop paths on demand with
//! AODV-style route requests and replies, track link quality, and repair
//! routes when a next hop goes silent.
//!
//! ## Features
//!
//! - **Node & Route Registry**: bounded tables (20 entries each by default) with TTL liveness and a 3:1 smoothed link quality.
//! - **Route Discovery**: RREQ flooding bounded by `max_hops`, unicast RREP back along the reverse path.
//! - **Liveness**: periodic beacons from every node, ping/pong RTT probing from the master.
//! - **Self-Healing**: routes through offline neighbours are deactivated and rediscovered; isolated nodes re-beacon.
//! - **Encryption**: optional AES-128-CBC with validated PKCS#7 padding, static or per-packet IV.
//! - **Bounded Transport**: a fixed-size transmit queue with enqueue timeout and at-most-once sends.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use loramesh::config::Config;
//! use loramesh::mesh::MeshNode;
//! use loramesh::radio::udp::UdpRadio;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let radio = UdpRadio::bind(&config.udp).await?;
//!     let node = MeshNode::start(config, Arc::new(radio)).await?;
//!     tokio::signal::ctrl_c().await?;
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - configuration loading, defaults and validation
//! - [`mesh`] - registry, codec, transport, dispatcher, scheduler and node
//! - [`radio`] - physical-layer trait plus loopback and UDP adapters
//! - [`error`] - error taxonomy
//! - [`metrics`] - drop and traffic counters
//! - [`logutil`] - log formatting helpers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Scheduler     │ ──→ │   Dispatcher    │ ← protocol state machine
//! └─────────────────┘     └─────────────────┘
//!          │                  │         │
//!          ▼                  ▼         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Registry      │     │   Transport     │ ← codec + bounded TX queue
//! └─────────────────┘     └─────────────────┘
//!                                  │
//!                         ┌─────────────────┐
//!                         │     Radio       │ ← loopback / UDP / hardware
//!                         └─────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod logutil;
pub mod mesh;
pub mod metrics;
pub mod radio;
