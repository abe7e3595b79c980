//! Maintenance scheduler.
//!
//! One loop, several cadences: expiry and uptime refresh, self-healing,
//! beacons, and (on the master only) pings. Each [`Scheduler::tick`] runs
//! whatever is due at the clock's current time, which keeps the cadences
//! testable with a [`ManualClock`](crate::mesh::clock::ManualClock). Nothing
//! here is fatal: failed broadcasts are logged and the next cycle proceeds.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::Config;
use crate::mesh::clock::Clock;
use crate::mesh::dispatcher::Dispatcher;
use crate::mesh::registry::Registry;

/// How often the run loop wakes up to check cadences.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub maintenance_interval: Duration,
    pub healing_interval: Duration,
    pub beacon_interval: Duration,
    pub ping_interval: Duration,
    /// TTL for both node liveness and route activity.
    pub route_timeout: Duration,
    pub self_healing: bool,
    pub is_master: bool,
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            maintenance_interval: config.maintenance_interval(),
            healing_interval: config.healing_interval(),
            beacon_interval: config.beacon_interval(),
            ping_interval: config.ping_interval(),
            route_timeout: config.route_timeout(),
            self_healing: config.mesh.enable_self_healing,
            is_master: config.is_master(),
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub maintenance: bool,
    pub nodes_offline: usize,
    pub routes_expired: usize,
    pub healing: bool,
    /// Destinations whose routes were found broken and rediscovered.
    pub repaired: Vec<u8>,
    pub isolated: bool,
    pub beacon_sent: bool,
    pub ping_sent: bool,
}

/// Last-run bookkeeping for one cadence.
#[derive(Debug, Default)]
struct Cadence {
    last_ms: Option<u64>,
}

impl Cadence {
    /// True (and rearmed) when never run or `interval` has passed.
    fn due(&mut self, now: u64, interval: Duration) -> bool {
        let ready = match self.last_ms {
            None => true,
            Some(last) => now.saturating_sub(last) >= interval.as_millis() as u64,
        };
        if ready {
            self.last_ms = Some(now);
        }
        ready
    }
}

pub struct Scheduler {
    settings: SchedulerSettings,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    maintenance: Cadence,
    healing: Cadence,
    beacon: Cadence,
    ping: Cadence,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        registry: Arc<Registry>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            registry,
            dispatcher,
            clock,
            maintenance: Cadence::default(),
            healing: Cadence::default(),
            beacon: Cadence::default(),
            ping: Cadence::default(),
        }
    }

    /// Run every cadence that is due now.
    pub async fn tick(&mut self) -> TickReport {
        let now = self.clock.now_ms();
        let mut report = TickReport::default();

        if self.maintenance.due(now, self.settings.maintenance_interval) {
            report.maintenance = true;
            self.perform_maintenance(&mut report);
        }

        if self.settings.self_healing && self.healing.due(now, self.settings.healing_interval) {
            report.healing = true;
            self.self_healing_check(&mut report).await;
        }

        if self.beacon.due(now, self.settings.beacon_interval) {
            match self.dispatcher.send_beacon().await {
                Ok(()) => report.beacon_sent = true,
                Err(e) => warn!("Beacon not sent: {}", e),
            }
        }

        if self.settings.is_master && self.ping.due(now, self.settings.ping_interval) {
            match self.dispatcher.send_ping().await {
                Ok(_) => report.ping_sent = true,
                Err(e) => warn!("Ping not sent: {}", e),
            }
        }

        report
    }

    fn perform_maintenance(&self, report: &mut TickReport) {
        let ttl = self.settings.route_timeout;
        report.nodes_offline = self.registry.mark_offline_if_stale(ttl);
        report.routes_expired = self.registry.mark_expired_if_stale(ttl);
        self.registry.refresh_local();
        let pruned = self.dispatcher.prune_seen_requests();
        debug!(
            "Maintenance: {} node(s) offline, {} route(s) expired, {} RREQ(s) forgotten",
            report.nodes_offline, report.routes_expired, pruned
        );
    }

    async fn self_healing_check(&self, report: &mut TickReport) {
        debug!("Running self-healing check");
        for route in self.registry.deactivate_broken_routes() {
            warn!(
                "Route to {} via {} is broken, initiating repair",
                route.destination, route.next_hop
            );
            if let Err(e) = self
                .dispatcher
                .initiate_route_discovery(route.destination)
                .await
            {
                warn!("Repair discovery to {} not sent: {}", route.destination, e);
            }
            report.repaired.push(route.destination);
        }

        if self.registry.online_count() <= 1 && !self.settings.is_master {
            report.isolated = true;
            warn!("Node isolated from mesh, attempting to reconnect");
            if let Err(e) = self.dispatcher.send_beacon().await {
                warn!("Reconnect beacon not sent: {}", e);
            }
        }
    }

    /// Tick every [`TICK_INTERVAL`] until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Maintenance scheduler started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Maintenance scheduler stopped");
    }
}
