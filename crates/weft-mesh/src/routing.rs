//! Routing table — destination to next-hop entries learned from link
//! installs and relayed traffic, aged out when nothing refreshes them.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// One learned route. Distance is a hop-count estimate, not a metric the
/// wire carries; it only orders competing candidates for the same
/// destination.
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub destination: String,
    pub next_hop: String,
    pub distance: u32,
    pub refreshed_at: Instant,
}

pub struct RoutingTable {
    routes: DashMap<String, RoutingEntry>,
    route_ttl: Duration,
}

impl RoutingTable {
    pub fn new(route_ttl: Duration) -> Self {
        Self {
            routes: DashMap::new(),
            route_ttl,
        }
    }

    /// Record a route. An existing entry is replaced only by a strictly
    /// smaller distance; an equal-distance candidate refreshes the current
    /// entry instead of flapping between next hops.
    pub fn learn_route(&self, destination: &str, next_hop: &str, distance: u32) {
        let mut entry = self
            .routes
            .entry(destination.to_string())
            .or_insert_with(|| {
                tracing::debug!(
                    destination,
                    next_hop,
                    distance,
                    "learned route"
                );
                RoutingEntry {
                    destination: destination.to_string(),
                    next_hop: next_hop.to_string(),
                    distance,
                    refreshed_at: Instant::now(),
                }
            });

        if distance < entry.distance {
            tracing::debug!(
                destination,
                next_hop,
                distance,
                previous = entry.distance,
                "route improved"
            );
            entry.next_hop = next_hop.to_string();
            entry.distance = distance;
            entry.refreshed_at = Instant::now();
        } else if distance == entry.distance && next_hop == entry.next_hop {
            entry.refreshed_at = Instant::now();
        }
    }

    /// Next hop for a destination, if a live route exists.
    pub fn route_for(&self, destination: &str) -> Option<RoutingEntry> {
        self.routes.get(destination).map(|e| e.clone())
    }

    /// Touch a route so traffic keeps it alive.
    pub fn refresh(&self, destination: &str) {
        if let Some(mut e) = self.routes.get_mut(destination) {
            e.refreshed_at = Instant::now();
        }
    }

    /// Drop a specific destination (direct link replaced, peer departed).
    pub fn remove(&self, destination: &str) -> Option<RoutingEntry> {
        self.routes.remove(destination).map(|(_, e)| e)
    }

    /// Drop every route relayed through a dead neighbor.
    pub fn purge_via(&self, next_hop: &str) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, e| e.next_hop != next_hop);
        before - self.routes.len()
    }

    /// Remove and return routes idle past the table's TTL.
    pub fn expire_stale(&self) -> Vec<RoutingEntry> {
        let ttl = self.route_ttl;
        let stale: Vec<String> = self
            .routes
            .iter()
            .filter(|e| e.refreshed_at.elapsed() > ttl)
            .map(|e| e.destination.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|d| self.routes.remove(&d).map(|(_, e)| e))
            .collect()
    }

    pub fn entries(&self) -> Vec<RoutingEntry> {
        self.routes.iter().map(|e| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
