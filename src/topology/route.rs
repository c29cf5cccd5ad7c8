use std::collections::BTreeSet;
use std::time::Duration;
use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::topology::node::Node;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum RouteMode {
    /// Destinations are tried in their configured order: a message goes to the first destination,
    ///  and to the next one only if the previous one did not acknowledge it.
    Failover = 1,
    /// Consecutive messages are spread over the destinations round-robin.
    LoadBalance = 2,
}

/// A named reachability policy from a set of permitted source nodes to an ordered list of
///  destination nodes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Route {
    name: String,
    mode: RouteMode,
    sources: BTreeSet<String>,
    destinations: Vec<Node>,
    /// delays between successive transmissions to the same destination
    retransmit_pattern: Vec<Duration>,
    default_queue: Option<String>,
    /// first destination index for load balancing
    start_index: usize,
}

impl Route {
    pub fn new(
        name: impl Into<String>,
        mode: RouteMode,
        sources: impl IntoIterator<Item = impl Into<String>>,
        destinations: Vec<Node>,
        retransmit_pattern: Vec<Duration>,
    ) -> anyhow::Result<Route> {
        let name = name.into();
        if destinations.is_empty() {
            bail!("route {} has no destinations", name);
        }
        if retransmit_pattern.is_empty() {
            bail!("route {} has an empty retransmit pattern", name);
        }

        Ok(Route {
            name,
            mode,
            sources: sources.into_iter().map(Into::into).collect(),
            destinations,
            retransmit_pattern,
            default_queue: None,
            start_index: 0,
        })
    }

    /// convenience for the common case of a retransmit pattern configured in milliseconds
    pub fn with_pattern_millis(
        name: impl Into<String>,
        mode: RouteMode,
        sources: impl IntoIterator<Item = impl Into<String>>,
        destinations: Vec<Node>,
        retransmit_pattern_millis: &[u64],
    ) -> anyhow::Result<Route> {
        let pattern = retransmit_pattern_millis.iter()
            .map(|&millis| Duration::from_millis(millis))
            .collect();
        Route::new(name, mode, sources, destinations, pattern)
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Route {
        self.default_queue = Some(queue.into());
        self
    }

    pub fn with_start_index(mut self, start_index: usize) -> anyhow::Result<Route> {
        if start_index >= self.destinations.len() {
            bail!("start index {} is out of bounds for route {} with {} destinations", start_index, self.name, self.destinations.len());
        }
        self.start_index = start_index;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> RouteMode {
        self.mode
    }

    pub fn sources(&self) -> &BTreeSet<String> {
        &self.sources
    }

    pub fn is_permitted_source(&self, node_name: &str) -> bool {
        self.sources.contains(node_name)
    }

    pub fn destinations(&self) -> &[Node] {
        &self.destinations
    }

    pub fn destination_by_name(&self, node_name: &str) -> Option<&Node> {
        self.destinations.iter()
            .find(|n| n.name() == node_name)
    }

    pub fn retransmit_pattern(&self) -> &[Duration] {
        &self.retransmit_pattern
    }

    pub fn default_queue(&self) -> Option<&str> {
        self.default_queue.as_deref()
    }

    pub fn start_index(&self) -> usize {
        self.start_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: u16) -> Vec<Node> {
        (1..=n)
            .map(|i| Node::new(format!("R{}", i), "127.0.0.1", 9000 + i))
            .collect()
    }

    #[test]
    fn test_no_destinations() {
        assert!(Route::with_pattern_millis("r", RouteMode::Failover, ["A"], vec![], &[100]).is_err());
    }

    #[test]
    fn test_empty_pattern() {
        assert!(Route::with_pattern_millis("r", RouteMode::Failover, ["A"], nodes(1), &[]).is_err());
    }

    #[test]
    fn test_start_index_bounds() {
        let route = Route::with_pattern_millis("r", RouteMode::LoadBalance, ["A"], nodes(2), &[100]).unwrap();
        assert!(route.clone().with_start_index(2).is_err());
        assert_eq!(route.with_start_index(1).unwrap().start_index(), 1);
    }

    #[test]
    fn test_accessors() {
        let route = Route::with_pattern_millis("r", RouteMode::Failover, ["A", "B"], nodes(2), &[200, 600])
            .unwrap()
            .with_default_queue("q");

        assert!(route.is_permitted_source("A"));
        assert!(!route.is_permitted_source("R1"));
        assert_eq!(route.retransmit_pattern(), &[Duration::from_millis(200), Duration::from_millis(600)]);
        assert_eq!(route.default_queue(), Some("q"));
        assert_eq!(route.destination_by_name("R2"), Some(&nodes(2)[1]));
        assert_eq!(route.destination_by_name("R3"), None);
    }
}
