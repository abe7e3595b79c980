//! Test utilities & fixtures.
//! Builds small in-process meshes on a shared loopback medium.

use std::sync::Arc;
use std::time::Duration;

use loramesh::config::Config;
use loramesh::mesh::MeshNode;
use loramesh::radio::loopback::LoopbackMedium;

/// Config shared by every node of a test mesh. All nodes clone it so they
/// share one encryption key.
pub fn fast_config() -> Config {
    let mut cfg = Config::default();
    cfg.network.beacon_interval = 1;
    cfg.network.ping_interval = 1;
    cfg.network.ping_jitter_max_ms = 50;
    cfg.mesh.maintenance_interval = 1;
    cfg.mesh.healing_timeout = 1;
    cfg
}

/// Start one node per id on `medium`. Every radio is attached before any node
/// starts so startup beacons are heard by all.
#[allow(dead_code)]
pub async fn start_mesh(medium: &Arc<LoopbackMedium>, base: &Config, ids: &[u8]) -> Vec<MeshNode> {
    let radios: Vec<_> = ids.iter().map(|id| medium.attach(*id)).collect();
    let mut nodes = Vec::with_capacity(ids.len());
    for (id, radio) in ids.iter().zip(radios) {
        let mut cfg = base.clone();
        cfg.node.id = *id;
        cfg.node.name = format!("node-{}", id);
        nodes.push(
            MeshNode::start(cfg, Arc::new(radio))
                .await
                .expect("node start"),
        );
    }
    nodes
}

/// Poll `cond` every 20ms until it holds; panic with `what` after `secs`.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(secs: u64, what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[allow(dead_code)]
pub async fn shutdown_all(nodes: Vec<MeshNode>) {
    for node in nodes {
        node.shutdown().await;
    }
}
