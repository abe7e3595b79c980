//! Mesh routing engine.
//!
//! Leaf-first:
//!
//! - [`clock`] - millisecond time source
//! - [`registry`] - bounded node and route tables with TTL liveness
//! - [`packet`] - wire header and per-type payload codecs
//! - [`crypto`] - AES-128-CBC frame encryption with PKCS#7 padding
//! - [`transport`] - frame codec plus bounded transmit queue
//! - [`dispatcher`] - per-message protocol handling (beacons, ping/pong, RREQ/RREP, data)
//! - [`scheduler`] - expiry, self-healing and outbound cadences
//! - [`node`] - composition root and radio I/O loops

pub mod clock;
pub mod crypto;
pub mod dispatcher;
pub mod node;
pub mod packet;
pub mod registry;
pub mod scheduler;
pub mod transport;

pub use dispatcher::{AppMessage, Dispatcher, Outcome};
pub use node::{MeshNode, NodeStatus};
pub use packet::{MessageType, Packet, BROADCAST};
pub use registry::{Node, Registry, Route, Statistics};
