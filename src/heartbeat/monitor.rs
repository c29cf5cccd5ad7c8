use std::cmp::min;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use arc_swap::ArcSwap;
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};
use crate::config::LwCommConfig;
use crate::heartbeat::liveness::FixedTimeoutDecider;
use crate::messaging::frame::Frame;
use crate::messaging::frame_sender::FrameSender;
use crate::stats::Statistics;
use crate::topology::node::Node;

/// upper bound for the delay between detecting a missing heartbeat and reporting it
pub const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LivenessEvent {
    pub node: Node,
    pub is_live: bool,
}

struct PeerLiveness {
    decider: FixedTimeoutDecider,
    /// the most recently reported state
    is_live: bool,
}

/// Announces the local node's liveness to all peers, and tracks peers' liveness based on the
///  heartbeats they send.
///
/// Peers start out live. Transitions are published as [LivenessEvent]s.
pub struct HeartbeatMonitor {
    local_node_name: String,
    config: Arc<ArcSwap<LwCommConfig>>,
    frame_sender: Arc<FrameSender>,
    statistics: Arc<Statistics>,
    counter: AtomicU64,
    peers: Mutex<BTreeMap<String, PeerLiveness>>,
    events: broadcast::Sender<LivenessEvent>,
}

impl HeartbeatMonitor {
    pub fn new(config: Arc<ArcSwap<LwCommConfig>>, frame_sender: Arc<FrameSender>, statistics: Arc<Statistics>) -> HeartbeatMonitor {
        let (events, _) = broadcast::channel(128);
        let local_node_name = config.load().local_node.clone();

        let monitor = HeartbeatMonitor {
            local_node_name,
            config,
            frame_sender,
            statistics,
            counter: AtomicU64::new(0),
            peers: Default::default(),
            events,
        };
        monitor.sync_peers();
        monitor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.events.subscribe()
    }

    /// Sends heartbeats and checks peers' liveness until `shut_down` is signalled. The interval is
    ///  re-read from the configuration for every heartbeat.
    pub async fn run(self: Arc<Self>, mut shut_down: watch::Receiver<bool>) {
        if *shut_down.borrow_and_update() {
            return;
        }
        info!("starting heartbeat on {}", self.local_node_name);

        let mut next_heartbeat = Instant::now();
        loop {
            let now = Instant::now();
            if now >= next_heartbeat {
                self.send_heartbeats();
                next_heartbeat = now + self.config.load().heartbeat_interval;
            }
            self.check_liveness();

            select! {
                _ = sleep_until(min(next_heartbeat, now + LIVENESS_CHECK_INTERVAL)) => {}
                _ = shut_down.changed() => break,
            }
        }
        info!("heartbeat loop shut down");
    }

    pub fn send_heartbeats(&self) {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Frame::Heartbeat {
            source: self.local_node_name.clone(),
            counter,
        }.to_bytes();

        let config = self.config.load();
        for peer in config.peers() {
            trace!(?peer, counter, "sending heartbeat");
            self.frame_sender.send(peer.clone(), frame.clone());
            self.statistics.heartbeats_sent.increment();
        }
    }

    pub fn on_heartbeat(&self, source: &str, counter: u64) {
        self.statistics.heartbeats_received.increment();

        let became_live = {
            let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(peer) = peers.get_mut(source) else {
                debug!(source, "heartbeat from a node that is not a configured peer - ignoring");
                return;
            };
            trace!(source, counter, "received heartbeat");
            peer.decider.on_heartbeat();

            let became_live = !peer.is_live;
            peer.is_live = true;
            became_live
        };

        if became_live {
            info!(source, "node is reachable again");
            self.publish(source, true);
        }
    }

    /// reports peers whose most recent heartbeat is older than the heartbeat timeout
    pub fn check_liveness(&self) {
        self.sync_peers();

        let became_unreachable = {
            let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
            peers.iter_mut()
                .filter(|(_, peer)| peer.is_live && !peer.decider.is_reachable())
                .map(|(name, peer)| {
                    peer.is_live = false;
                    name.clone()
                })
                .collect::<Vec<_>>()
        };

        for name in became_unreachable {
            warn!(node = name, "no heartbeat within timeout - node is unreachable");
            self.statistics.nodes_became_unreachable.increment();
            self.publish(&name, false);
        }
    }

    /// adjusts tracked peers to the current configuration, e.g. after a reload
    fn sync_peers(&self) {
        let config = self.config.load();
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);

        peers.retain(|name, _| config.node(name).is_some() && *name != config.local_node);
        for peer in config.peers() {
            match peers.get_mut(peer.name()) {
                Some(tracked) => tracked.decider.set_threshold(config.heartbeat_timeout),
                None => {
                    debug!(?peer, "tracking liveness");
                    peers.insert(peer.name().to_string(), PeerLiveness {
                        decider: FixedTimeoutDecider::new_for_threshold(config.heartbeat_timeout),
                        is_live: true,
                    });
                }
            }
        }
    }

    fn publish(&self, node_name: &str, is_live: bool) {
        let Some(node) = self.config.load().node(node_name).cloned() else {
            return;
        };
        // no subscribers is fine
        let _ = self.events.send(LivenessEvent { node, is_live });
    }

    pub fn is_live(&self, node_name: &str) -> bool {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
            .get(node_name)
            .map(|p| p.is_live)
            .unwrap_or(false)
    }

    /// peers that are currently considered live
    pub fn live_nodes(&self) -> Vec<Node> {
        let config = self.config.load();
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, p)| p.is_live)
            .filter_map(|(name, _)| config.node(name).cloned())
            .collect()
    }
}
