use std::sync::{Arc, Mutex, PoisonError};
use anyhow::{anyhow, bail};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};
use crate::config::LwCommConfig;
use crate::heartbeat::monitor::{HeartbeatMonitor, LivenessEvent};
use crate::incoming::accept_mode::AcceptMode;
use crate::incoming::dispatcher::GroupDispatcher;
use crate::incoming::{IncomingMessages, MessageReceiver};
use crate::messaging::arrival_sequencer::ArrivalSequencer;
use crate::messaging::frame::Frame;
use crate::messaging::frame_sender::FrameSender;
use crate::messaging::message::{MessageIdGenerator, TextMessage};
use crate::messaging::transport::udp::UdpTransport;
use crate::messaging::transport::{BytesHandler, Transport};
use crate::outgoing::send_future::SendFuture;
use crate::outgoing::OutgoingMessages;
use crate::stats::Statistics;
use crate::topology::node::Node;
use crate::topology::resolver::RouteResolver;
use crate::util::worker_pool::WorkerPool;

/// Decodes received payloads on the receive transport pool and passes them on by frame kind.
///
/// Decoding runs concurrently, but frames are passed on in the order their payloads arrived so
///  that messages of a group reach the dispatcher in arrival order.
struct FrameRouter {
    pool: WorkerPool,
    handler: Arc<FrameHandler>,
}

struct FrameHandler {
    outgoing: Arc<OutgoingMessages>,
    incoming: Arc<IncomingMessages>,
    heartbeat: Arc<HeartbeatMonitor>,
    statistics: Arc<Statistics>,
    sequencer: ArrivalSequencer<Option<Frame>>,
}

#[async_trait]
impl BytesHandler for FrameRouter {
    async fn bytes_arrived(&self, payload: Bytes) {
        let ticket = self.handler.sequencer.next_ticket();
        let handler = self.handler.clone();
        if !self.pool.submit(async move { handler.on_payload(ticket, payload) }) {
            debug!("receive transport pool is shut down - discarding payload");
            self.handler.release_in_order(ticket, None);
        }
    }
}

impl FrameHandler {
    fn on_payload(&self, ticket: u64, payload: Bytes) {
        let frame = match Frame::deser(&payload) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!(len = payload.len(), "received an invalid frame - discarding: {}", e);
                self.statistics.incoming_invalid.increment();
                None
            }
        };

        self.release_in_order(ticket, frame);
    }

    /// frames that arrived earlier may still be decoding - this frame waits for them
    fn release_in_order(&self, ticket: u64, frame: Option<Frame>) {
        self.sequencer.complete(ticket, frame, |frame| {
            if let Some(frame) = frame {
                self.on_frame(frame);
            }
        });
    }

    fn on_frame(&self, frame: Frame) {
        match frame {
            Frame::Message { source, message_id, message } => self.incoming.on_message(&source, message_id, message),
            Frame::Ack { source, message_id } => self.outgoing.on_ack(&source, message_id),
            Frame::Nack { source, message_id } => self.outgoing.on_nack(&source, message_id),
            Frame::Heartbeat { source, counter } => self.heartbeat.on_heartbeat(&source, counter),
        }
    }
}

/// The LwComm service for one node: reliable messaging to other nodes along configured routes,
///  and delivery of messages from other nodes to a [MessageReceiver].
///
/// There is no global instance: [LwCommService::init] creates a service and starts its
///  background tasks, [LwCommService::shutdown] stops them.
pub struct LwCommService {
    config: Arc<ArcSwap<LwCommConfig>>,
    transport: Arc<dyn Transport>,
    statistics: Arc<Statistics>,
    resolver: Arc<RouteResolver>,
    frame_sender: Arc<FrameSender>,
    frame_router: Arc<FrameRouter>,
    outgoing: Arc<OutgoingMessages>,
    incoming: Arc<IncomingMessages>,
    heartbeat: Arc<HeartbeatMonitor>,
    shut_down: watch::Sender<bool>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LwCommService {
    /// Validates the configuration and starts the service on the current tokio runtime.
    pub fn init(config: LwCommConfig, transport: Arc<dyn Transport>, receiver: Arc<dyn MessageReceiver>) -> anyhow::Result<Arc<LwCommService>> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| anyhow!("LwComm must be initialized from inside a tokio runtime: {}", e))?;

        let statistics = Arc::new(Statistics::new());
        let resolver = Arc::new(RouteResolver::new());

        let receive_transport_pool = WorkerPool::new("receive-transport", config.receive_transport_pool.num_workers, &runtime);
        let receive_worker_pool = WorkerPool::new("receive-worker", config.receive_worker_pool.num_workers, &runtime);
        let send_pool = WorkerPool::new("send", config.send_pool.num_workers, &runtime);

        let local_node_name = config.local_node.clone();
        let config = Arc::new(ArcSwap::from_pointee(config));

        let frame_sender = Arc::new(FrameSender::new(transport.clone(), send_pool, statistics.clone()));
        let outgoing = Arc::new(OutgoingMessages::new(
            local_node_name.clone(),
            runtime.clone(),
            resolver.clone(),
            frame_sender.clone(),
            statistics.clone(),
            MessageIdGenerator::new(),
        ));
        let dispatcher = Arc::new(GroupDispatcher::new(receive_worker_pool, receiver, statistics.clone()));
        let incoming = Arc::new(IncomingMessages::new(config.clone(), dispatcher, frame_sender.clone(), statistics.clone()));
        let heartbeat = Arc::new(HeartbeatMonitor::new(config.clone(), frame_sender.clone(), statistics.clone()));

        let frame_router = Arc::new(FrameRouter {
            pool: receive_transport_pool,
            handler: Arc::new(FrameHandler {
                outgoing: outgoing.clone(),
                incoming: incoming.clone(),
                heartbeat: heartbeat.clone(),
                statistics: statistics.clone(),
                sequencer: ArrivalSequencer::new(),
            }),
        });

        let (shut_down, _) = watch::channel(false);

        let mut background_tasks = Vec::new();
        {
            let transport = transport.clone();
            let frame_router = frame_router.clone();
            background_tasks.push(runtime.spawn(async move {
                if let Err(e) = transport.recv_loop(frame_router).await {
                    error!("receive loop terminated with error: {}", e);
                }
            }));
        }
        background_tasks.push(runtime.spawn(heartbeat.clone().run(shut_down.subscribe())));
        background_tasks.push(runtime.spawn(Self::run_housekeeping(config.clone(), incoming.clone(), shut_down.subscribe())));

        info!("LwComm service started on {}", local_node_name);

        Ok(Arc::new(LwCommService {
            config,
            transport,
            statistics,
            resolver,
            frame_sender,
            frame_router,
            outgoing,
            incoming,
            heartbeat,
            shut_down,
            background_tasks: Mutex::new(background_tasks),
        }))
    }

    /// Convenience for starting a service with a [UdpTransport] bound to the local node's address
    pub async fn init_udp(config: LwCommConfig, receiver: Arc<dyn MessageReceiver>) -> anyhow::Result<Arc<LwCommService>> {
        config.validate()?;
        let local_node = config.local_node()
            .ok_or_else(|| anyhow!("local node {} is not configured", config.local_node))?;
        let transport = Arc::new(UdpTransport::bind(local_node).await?);
        Self::init(config, transport, receiver)
    }

    async fn run_housekeeping(config: Arc<ArcSwap<LwCommConfig>>, incoming: Arc<IncomingMessages>, mut shut_down: watch::Receiver<bool>) {
        loop {
            let (interval, dedup_window) = {
                let config = config.load();
                (config.housekeeping_interval, config.dedup_window)
            };

            select! {
                _ = sleep(interval) => incoming.evict_expired(dedup_window),
                _ = shut_down.changed() => break,
            }
        }
        debug!("housekeeping loop shut down");
    }

    /// Sends a message along a route. The returned handle resolves once the message is
    ///  acknowledged, no destination acknowledged it, or it was cancelled.
    ///
    /// Fails without any network activity if the route does not exist, the local node is not a
    ///  permitted source of the route, or the service is shut down.
    pub fn send(&self, route_name: &str, message: TextMessage) -> anyhow::Result<SendFuture> {
        if *self.shut_down.borrow() {
            bail!("LwComm service is shut down");
        }

        let config = self.config.load();
        let Some(route) = config.route(route_name) else {
            bail!("unknown route {}", route_name);
        };
        if !route.is_permitted_source(&config.local_node) {
            bail!("local node {} is not a permitted source of route {}", config.local_node, route_name);
        }

        Ok(self.outgoing.start(route.clone(), message))
    }

    /// Sets the accept mode for messages with the given tags, or the default accept mode if no
    ///  tags are given.
    pub fn set_accept_mode(&self, mode: AcceptMode, tags: &[&str]) {
        self.incoming.accept_policy().set_accept_mode(mode, tags);
    }

    pub fn get_configuration(&self) -> Arc<LwCommConfig> {
        self.config.load_full()
    }

    /// Replaces nodes, routes and tunables. Messages in flight keep the route they were sent
    ///  with, and load balancing continues where it was for routes that keep their name.
    ///
    /// Pool sizes and accept modes are not affected by a reload.
    pub fn reload_configuration(&self, new_config: LwCommConfig) -> anyhow::Result<()> {
        new_config.validate()?;

        let current = self.config.load();
        if new_config.local_node != current.local_node {
            bail!("reloaded configuration is for node {}, but this service runs as {}", new_config.local_node, current.local_node);
        }

        self.resolver.retain_routes(new_config.routes.keys().map(|name| name.as_str()));
        self.config.store(Arc::new(new_config));
        info!("configuration reloaded");
        Ok(())
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.statistics
    }

    pub fn subscribe_liveness(&self) -> broadcast::Receiver<LivenessEvent> {
        self.heartbeat.subscribe()
    }

    pub fn live_nodes(&self) -> Vec<Node> {
        self.heartbeat.live_nodes()
    }

    pub fn num_in_flight(&self) -> usize {
        self.outgoing.num_in_flight()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shut_down.borrow()
    }

    /// Stops receiving, cancels all messages in flight and waits for background work to finish.
    ///  Calling it more than once has no additional effect.
    pub async fn shutdown(&self) {
        if self.shut_down.send_replace(true) {
            return;
        }
        info!("shutting down LwComm service");

        self.transport.shut_down_recv_loop();
        self.outgoing.cancel_all();

        let background_tasks = std::mem::take(&mut *self.background_tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in background_tasks {
            if let Err(e) = task.await {
                error!("background task terminated abnormally: {}", e);
            }
        }

        self.frame_router.pool.shutdown();
        self.frame_router.pool.join().await;
        self.incoming.shutdown();
        self.incoming.join().await;
        self.frame_sender.shutdown();
        self.frame_sender.join().await;

        info!("LwComm service shut down");
    }
}
