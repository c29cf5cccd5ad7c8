use std::cmp::min;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::topology::node::Node;
use crate::topology::route::{Route, RouteMode};

/// Picks the destination for a message on a route.
///
/// Load balancing keeps one cursor per route name, shared by all senders using the route. The
///  cursor is an atomic counter, so concurrent callers see a strict round-robin sequence without
///  any lock held across the increment.
#[derive(Default)]
pub struct RouteResolver {
    cursors: RwLock<FxHashMap<String, Arc<AtomicUsize>>>,
}

impl RouteResolver {
    pub fn new() -> RouteResolver {
        Default::default()
    }

    pub fn next<'a>(&self, route: &'a Route, attempt_index: usize) -> &'a Node {
        &route.destinations()[self.next_index(route, attempt_index)]
    }

    /// Failover routes ignore the cursor and clamp `attempt_index` to the last destination. Load
    ///  balancing routes ignore `attempt_index`.
    pub fn next_index(&self, route: &Route, attempt_index: usize) -> usize {
        let num_destinations = route.destinations().len();
        match route.mode() {
            RouteMode::Failover => min(attempt_index, num_destinations - 1),
            RouteMode::LoadBalance => {
                let ticket = self.cursor(route.name())
                    .fetch_add(1, Ordering::AcqRel);
                let index = (route.start_index() + ticket % num_destinations) % num_destinations;
                trace!(route = route.name(), ticket, index, "load balancing");
                index
            }
        }
    }

    fn cursor(&self, route_name: &str) -> Arc<AtomicUsize> {
        {
            // trying with a read lock first is an optimization for the common case
            if let Some(cursor) = self.cursors.read().unwrap_or_else(PoisonError::into_inner)
                .get(route_name)
            {
                return cursor.clone();
            }
        }

        // entry() re-checks under the exclusive lock to avoid racy initialization
        self.cursors.write().unwrap_or_else(PoisonError::into_inner)
            .entry(route_name.to_string())
            .or_default()
            .clone()
    }

    /// discards cursors of routes that are no longer configured
    pub fn retain_routes<'a>(&self, route_names: impl IntoIterator<Item = &'a str>) {
        let route_names = route_names.into_iter().collect::<Vec<_>>();
        self.cursors.write().unwrap_or_else(PoisonError::into_inner)
            .retain(|name, _| route_names.contains(&name.as_str()));
    }
}
