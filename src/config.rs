use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashMap;
use crate::incoming::accept_mode::AcceptMode;
use crate::topology::node::Node;
use crate::topology::route::Route;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PoolConfig {
    pub num_workers: usize,
}
impl PoolConfig {
    pub const fn new(num_workers: usize) -> PoolConfig {
        PoolConfig { num_workers }
    }
}

#[derive(Debug, Clone)]
pub struct LwCommConfig {
    /// name of the node this process runs as - it must be one of [LwCommConfig::nodes]
    pub local_node: String,

    pub nodes: BTreeMap<String, Node>,
    pub routes: BTreeMap<String, Arc<Route>>,

    pub heartbeat_interval: Duration,
    /// a peer is considered unreachable if no heartbeat arrived from it for this long. This must
    ///  be longer than the heartbeat interval.
    pub heartbeat_timeout: Duration,

    /// decoding of received payloads
    pub receive_transport_pool: PoolConfig,
    /// execution of the receiver callback
    pub receive_worker_pool: PoolConfig,
    /// outbound transport writes
    pub send_pool: PoolConfig,

    pub default_accept_mode: AcceptMode,
    pub tag_accept_modes: FxHashMap<String, AcceptMode>,

    /// how long ids of accepted messages are remembered for duplicate detection. This should
    ///  comfortably exceed the total duration of the longest retransmit pattern times the number
    ///  of destinations.
    pub dedup_window: Duration,
    pub housekeeping_interval: Duration,
}

impl LwCommConfig {
    pub fn new(local_node: impl Into<String>) -> LwCommConfig {
        LwCommConfig {
            local_node: local_node.into(),
            nodes: Default::default(),
            routes: Default::default(),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
            receive_transport_pool: PoolConfig::new(2),
            receive_worker_pool: PoolConfig::new(8),
            send_pool: PoolConfig::new(2),
            default_accept_mode: AcceptMode::Accept,
            tag_accept_modes: Default::default(),
            dedup_window: Duration::from_secs(60),
            housekeeping_interval: Duration::from_secs(1),
        }
    }

    /// A configuration for running several nodes inside a single process, e.g. for tests: short
    ///  heartbeat cadence and small pools
    pub fn local_test(local_node: impl Into<String>, nodes: impl IntoIterator<Item = Node>) -> anyhow::Result<LwCommConfig> {
        let mut config = LwCommConfig::new(local_node);
        config.heartbeat_interval = Duration::from_millis(100);
        config.heartbeat_timeout = Duration::from_millis(500);
        config.receive_transport_pool = PoolConfig::new(1);
        config.receive_worker_pool = PoolConfig::new(4);
        config.send_pool = PoolConfig::new(1);
        config.dedup_window = Duration::from_secs(30);
        config.housekeeping_interval = Duration::from_millis(500);

        for node in nodes {
            config.add_node(node)?;
        }
        Ok(config)
    }

    pub fn add_node(&mut self, node: Node) -> anyhow::Result<()> {
        if self.nodes.contains_key(node.name()) {
            bail!("duplicate node name {}", node.name());
        }
        self.nodes.insert(node.name().to_string(), node);
        Ok(())
    }

    pub fn add_route(&mut self, route: Route) -> anyhow::Result<()> {
        if self.routes.contains_key(route.name()) {
            bail!("duplicate route name {}", route.name());
        }
        self.routes.insert(route.name().to_string(), Arc::new(route));
        Ok(())
    }

    pub fn local_node(&self) -> Option<&Node> {
        self.nodes.get(&self.local_node)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn route(&self, name: &str) -> Option<&Arc<Route>> {
        self.routes.get(name)
    }

    /// all configured nodes except the local node
    pub fn peers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
            .filter(|n| n.name() != self.local_node)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.local_node().is_none() {
            bail!("local node {} is not among the configured nodes", self.local_node);
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            bail!("heartbeat timeout {:?} must exceed heartbeat interval {:?}", self.heartbeat_timeout, self.heartbeat_interval);
        }
        for (name, pool) in [
            ("receive transport", self.receive_transport_pool),
            ("receive worker", self.receive_worker_pool),
            ("send", self.send_pool),
        ] {
            if pool.num_workers == 0 {
                bail!("{} pool must have at least one worker", name);
            }
        }
        if self.housekeeping_interval.is_zero() {
            bail!("housekeeping interval must be positive");
        }

        for route in self.routes.values() {
            self.validate_route(route)?;
        }
        Ok(())
    }

    fn validate_route(&self, route: &Route) -> anyhow::Result<()> {
        if route.destinations().is_empty() || route.retransmit_pattern().is_empty() {
            bail!("route {} must have destinations and a retransmit pattern", route.name());
        }
        for source in route.sources() {
            if !self.nodes.contains_key(source) {
                bail!("route {} has unknown source node {}", route.name(), source);
            }
        }
        for destination in route.destinations() {
            match self.nodes.get(destination.name()) {
                None => bail!("route {} has unknown destination node {}", route.name(), destination.name()),
                Some(configured) if configured != destination => bail!("route {} has destination {:?} which differs from the configured node {:?}", route.name(), destination, configured),
                Some(_) => {}
            }
        }
        Ok(())
    }
}
