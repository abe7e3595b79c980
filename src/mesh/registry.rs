//! Node & route registry.
//!
//! Two bounded tables, each behind its own mutex so the radio loop and the
//! maintenance loop can touch them independently. Critical sections are a
//! linear scan plus a field update; no lock is ever held across an `.await`
//! and the two locks are never held at the same time.
//!
//! Tables keep insertion order and never evict: once a table is full, new
//! entries are rejected with [`MeshError::RegistryFull`] and counted in
//! [`crate::metrics`].

use log::{debug, info, trace, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::MAX_NODE_NAME_LEN;
use crate::error::{MeshError, MeshResult};
use crate::logutil::escape_log;
use crate::mesh::clock::Clock;
use crate::metrics;

/// Reported by [`Registry::link_quality`] when there is no active route.
pub const NO_LINK_QUALITY: i16 = -127;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: u8,
    pub name: String,
    pub rssi: i16,
    pub hop_count: u8,
    pub last_seen_ms: u64,
    pub uptime_ms: u64,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub destination: u8,
    pub next_hop: u8,
    pub hop_count: u8,
    /// Smoothed RSSI of the path's first hop.
    pub link_quality: i16,
    pub last_update_ms: u64,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Statistics {
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub total_routes: usize,
    pub active_routes: usize,
}

/// 3:1 old:new weighted average, truncating toward zero like the radio firmware.
pub fn ewma_link_quality(old: i16, sample: i16) -> i16 {
    ((3 * old as i32 + sample as i32) / 4) as i16
}

fn clamp_name(name: &str) -> String {
    if name.len() <= MAX_NODE_NAME_LEN {
        return name.to_string();
    }
    let mut cut = MAX_NODE_NAME_LEN;
    while cut > 0 && !name.is_char_boundary(cut) {
        cut -= 1;
    }
    name[..cut].to_string()
}

// A panic while holding a table lock leaves plain data behind (no invariants
// spanning multiple fields), so a poisoned lock is still safe to reuse.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Registry {
    local_id: u8,
    node_capacity: usize,
    route_capacity: usize,
    clock: Arc<dyn Clock>,
    nodes: Mutex<Vec<Node>>,
    routes: Mutex<Vec<Route>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("local_id", &self.local_id)
            .field("statistics", &self.statistics())
            .finish()
    }
}

impl Registry {
    /// Create the tables with the local node already present at hop 0.
    pub fn new(
        local_id: u8,
        local_name: &str,
        node_capacity: usize,
        route_capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_ms();
        let local = Node {
            id: local_id,
            name: clamp_name(local_name),
            rssi: 0,
            hop_count: 0,
            last_seen_ms: now,
            uptime_ms: now,
            online: true,
        };
        Self {
            local_id,
            node_capacity: node_capacity.max(1),
            route_capacity,
            clock,
            nodes: Mutex::new(vec![local]),
            routes: Mutex::new(Vec::new()),
        }
    }

    pub fn local_id(&self) -> u8 {
        self.local_id
    }

    pub fn node_capacity(&self) -> usize {
        self.node_capacity
    }

    pub fn route_capacity(&self) -> usize {
        self.route_capacity
    }

    // ---------------------------------------------------------------- nodes

    /// Insert or refresh a node. `name` is only applied when non-empty; new
    /// nodes without a name are called `Node-<id>`.
    pub fn upsert_node(
        &self,
        id: u8,
        name: Option<&str>,
        rssi: i16,
        hop_count: u8,
    ) -> MeshResult<()> {
        if id == 0 {
            return Err(MeshError::Malformed("node id 0 is reserved".into()));
        }
        let now = self.clock.now_ms();
        let name = name.filter(|n| !n.is_empty()).map(clamp_name);
        let hop_count = if id == self.local_id { 0 } else { hop_count };
        let mut nodes = lock(&self.nodes);

        if let Some(node) = nodes.iter_mut().find(|n| n.id == id) {
            if let Some(name) = name {
                node.name = name;
            }
            node.rssi = rssi;
            node.hop_count = hop_count;
            node.last_seen_ms = now;
            node.online = true;
            debug!("Updated node {}: RSSI={}, Hops={}", id, rssi, hop_count);
            return Ok(());
        }

        if nodes.len() >= self.node_capacity {
            drop(nodes);
            metrics::inc_node_table_full();
            warn!("Node list full, cannot add node {}", id);
            return Err(MeshError::RegistryFull {
                table: "node",
                capacity: self.node_capacity,
                id,
            });
        }

        let name = name.unwrap_or_else(|| format!("Node-{}", id));
        info!(
            "Added new node {} ({}): RSSI={}, Hops={}",
            id,
            escape_log(&name),
            rssi,
            hop_count
        );
        nodes.push(Node {
            id,
            name,
            rssi,
            hop_count,
            last_seen_ms: now,
            uptime_ms: 0,
            online: true,
        });
        Ok(())
    }

    /// Record that a frame was just heard from `id`. Known nodes keep their
    /// hop count; unknown ones are added as direct neighbours.
    pub fn touch_node(&self, id: u8, rssi: i16) -> MeshResult<()> {
        if id == self.local_id {
            return Ok(());
        }
        {
            let now = self.clock.now_ms();
            let mut nodes = lock(&self.nodes);
            if let Some(node) = nodes.iter_mut().find(|n| n.id == id) {
                node.rssi = rssi;
                node.last_seen_ms = now;
                node.online = true;
                return Ok(());
            }
        }
        self.upsert_node(id, None, rssi, 1)
    }

    pub fn find_node(&self, id: u8) -> Option<Node> {
        lock(&self.nodes).iter().find(|n| n.id == id).cloned()
    }

    /// Remove a node and every route through it. The local node cannot be
    /// removed.
    pub fn remove_node(&self, id: u8) -> bool {
        if id == self.local_id {
            return false;
        }
        let removed = {
            let mut nodes = lock(&self.nodes);
            let before = nodes.len();
            nodes.retain(|n| n.id != id);
            nodes.len() != before
        };
        if removed {
            info!("Removed node {}", id);
            self.remove_routes_via(id);
        }
        removed
    }

    /// Mark nodes not heard from for longer than `ttl` as offline. The local
    /// node is never marked. Returns how many nodes went offline.
    pub fn mark_offline_if_stale(&self, ttl: Duration) -> usize {
        let now = self.clock.now_ms();
        let ttl_ms = ttl.as_millis() as u64;
        let mut changed = 0;
        for node in lock(&self.nodes).iter_mut() {
            if node.id == self.local_id || !node.online {
                continue;
            }
            let age = now.saturating_sub(node.last_seen_ms);
            if age > ttl_ms {
                warn!(
                    "Node {} marked offline (last seen {}s ago)",
                    node.id,
                    age / 1000
                );
                node.online = false;
                changed += 1;
            }
        }
        changed
    }

    pub fn online_count(&self) -> usize {
        lock(&self.nodes).iter().filter(|n| n.online).count()
    }

    pub fn node_count(&self) -> usize {
        lock(&self.nodes).len()
    }

    pub fn nodes(&self) -> Vec<Node> {
        lock(&self.nodes).clone()
    }

    /// Refresh the local node's uptime and liveness.
    pub fn refresh_local(&self) -> u64 {
        let now = self.clock.now_ms();
        if let Some(local) = lock(&self.nodes)
            .iter_mut()
            .find(|n| n.id == self.local_id)
        {
            local.uptime_ms = now;
            local.last_seen_ms = now;
            local.online = true;
        }
        now
    }

    // --------------------------------------------------------------- routes

    /// Insert or refresh the route to `dest`.
    ///
    /// An existing entry is replaced when it is inactive or when the new path
    /// is no longer in hops. Through an unchanged next hop the quality is
    /// smoothed; a longer hop count via that same neighbour only refreshes the
    /// entry. Returns `Ok(true)` when the offered path was taken, `Ok(false)`
    /// when the existing shorter active path was kept.
    pub fn upsert_route(
        &self,
        dest: u8,
        next_hop: u8,
        hop_count: u8,
        link_quality: i16,
    ) -> MeshResult<bool> {
        if dest == self.local_id || dest == 0 {
            return Ok(false);
        }
        let now = self.clock.now_ms();
        let mut routes = lock(&self.routes);

        if let Some(route) = routes.iter_mut().find(|r| r.destination == dest) {
            let same_hop = route.next_hop == next_hop;
            if route.active && !same_hop && hop_count > route.hop_count {
                debug!(
                    "Kept route to {} via {} ({} hops) over {} hops via {}",
                    dest, route.next_hop, route.hop_count, hop_count, next_hop
                );
                return Ok(false);
            }
            if route.active && same_hop && hop_count > route.hop_count {
                // Flood echo through the same neighbour: refresh, keep the hop count.
                route.link_quality = ewma_link_quality(route.link_quality, link_quality);
                route.last_update_ms = now;
                trace!(
                    "Refreshed route to {} via {} ({} hops), ignored {} hop echo",
                    dest, next_hop, route.hop_count, hop_count
                );
                return Ok(false);
            }
            route.link_quality = if same_hop && route.active {
                ewma_link_quality(route.link_quality, link_quality)
            } else {
                link_quality
            };
            route.next_hop = next_hop;
            route.hop_count = hop_count;
            route.last_update_ms = now;
            route.active = true;
            debug!(
                "Updated route to {} via {} (hops={}, quality={})",
                dest, next_hop, hop_count, route.link_quality
            );
            return Ok(true);
        }

        if routes.len() >= self.route_capacity {
            drop(routes);
            metrics::inc_route_table_full();
            warn!("Route list full, cannot add route to {}", dest);
            return Err(MeshError::RegistryFull {
                table: "route",
                capacity: self.route_capacity,
                id: dest,
            });
        }

        info!(
            "Added route to {} via {} (hops={}, quality={})",
            dest, next_hop, hop_count, link_quality
        );
        routes.push(Route {
            destination: dest,
            next_hop,
            hop_count,
            link_quality,
            last_update_ms: now,
            active: true,
        });
        Ok(true)
    }

    pub fn find_route(&self, dest: u8) -> Option<Route> {
        lock(&self.routes)
            .iter()
            .find(|r| r.destination == dest)
            .cloned()
    }

    /// Next hop toward `dest`, only if the route is active.
    pub fn next_hop(&self, dest: u8) -> Option<u8> {
        lock(&self.routes)
            .iter()
            .find(|r| r.destination == dest && r.active)
            .map(|r| r.next_hop)
    }

    pub fn is_reachable(&self, dest: u8) -> bool {
        self.next_hop(dest).is_some()
    }

    pub fn link_quality(&self, dest: u8) -> i16 {
        lock(&self.routes)
            .iter()
            .find(|r| r.destination == dest && r.active)
            .map(|r| r.link_quality)
            .unwrap_or(NO_LINK_QUALITY)
    }

    /// Fold a new RSSI sample into the route's link quality. Returns the new
    /// value, or `None` when there is no route to `dest`.
    pub fn update_link_quality(&self, dest: u8, sample: i16) -> Option<i16> {
        let now = self.clock.now_ms();
        let mut routes = lock(&self.routes);
        let route = routes.iter_mut().find(|r| r.destination == dest)?;
        route.link_quality = ewma_link_quality(route.link_quality, sample);
        route.last_update_ms = now;
        Some(route.link_quality)
    }

    pub fn remove_route(&self, dest: u8) -> bool {
        let mut routes = lock(&self.routes);
        let before = routes.len();
        routes.retain(|r| r.destination != dest);
        let removed = routes.len() != before;
        if removed {
            info!("Removed route to {}", dest);
        }
        removed
    }

    /// Drop every route whose next hop is `node`.
    pub fn remove_routes_via(&self, node: u8) -> usize {
        let mut routes = lock(&self.routes);
        let before = routes.len();
        routes.retain(|r| {
            if r.next_hop == node {
                warn!("Removing route to {} via removed node {}", r.destination, node);
                false
            } else {
                true
            }
        });
        before - routes.len()
    }

    /// Deactivate routes not refreshed for longer than `ttl`. Returns how many
    /// routes went inactive.
    pub fn mark_expired_if_stale(&self, ttl: Duration) -> usize {
        let now = self.clock.now_ms();
        let ttl_ms = ttl.as_millis() as u64;
        let mut changed = 0;
        for route in lock(&self.routes).iter_mut() {
            if !route.active {
                continue;
            }
            let age = now.saturating_sub(route.last_update_ms);
            if age > ttl_ms {
                warn!(
                    "Route to {} expired (last update {}s ago)",
                    route.destination,
                    age / 1000
                );
                route.active = false;
                changed += 1;
            }
        }
        changed
    }

    /// Deactivate every active route whose next hop is not an online node and
    /// return the routes that were broken.
    pub fn deactivate_broken_routes(&self) -> Vec<Route> {
        let online: HashSet<u8> = lock(&self.nodes)
            .iter()
            .filter(|n| n.online)
            .map(|n| n.id)
            .collect();
        let mut broken = Vec::new();
        for route in lock(&self.routes).iter_mut() {
            if route.active && !online.contains(&route.next_hop) {
                route.active = false;
                broken.push(route.clone());
            }
        }
        broken
    }

    pub fn active_count(&self) -> usize {
        lock(&self.routes).iter().filter(|r| r.active).count()
    }

    pub fn route_count(&self) -> usize {
        lock(&self.routes).len()
    }

    pub fn routes(&self) -> Vec<Route> {
        lock(&self.routes).clone()
    }

    pub fn statistics(&self) -> Statistics {
        let (total_nodes, online_nodes) = {
            let nodes = lock(&self.nodes);
            (nodes.len(), nodes.iter().filter(|n| n.online).count())
        };
        let (total_routes, active_routes) = {
            let routes = lock(&self.routes);
            (routes.len(), routes.iter().filter(|r| r.active).count())
        };
        Statistics {
            total_nodes,
            online_nodes,
            total_routes,
            active_routes,
        }
    }
}
