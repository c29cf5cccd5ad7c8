use std::sync::{Arc, Mutex, PoisonError};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;
use crate::messaging::frame::{Frame, FrameKind};
use crate::messaging::transport::{BytesHandler, Transport};
use crate::topology::node::Node;

/// A frame that went through an [InMemoryNetwork], recorded for assertions
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub from: String,
    pub to: String,
    pub at: Instant,
    /// `false` if the frame was lost because the sender or the recipient was silenced
    pub delivered: bool,
    pub frame: Frame,
}

#[derive(Default)]
struct NetworkState {
    handlers: FxHashMap<String, Arc<dyn BytesHandler>>,
    /// payloads for nodes whose receive loop is not running yet
    pending: FxHashMap<String, Vec<Bytes>>,
    silenced: FxHashSet<String>,
    sent: Vec<SentFrame>,
}

/// Connects several nodes inside a single process. Delivery is immediate and reliable, except
///  that silenced nodes neither send nor receive anything.
#[derive(Default)]
pub struct InMemoryNetwork {
    state: Mutex<NetworkState>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<InMemoryNetwork> {
        Default::default()
    }

    pub fn transport(self: &Arc<Self>, node_name: &str) -> Arc<InMemoryTransport> {
        let (shut_down, _) = watch::channel(false);
        Arc::new(InMemoryTransport {
            network: self.clone(),
            node_name: node_name.to_string(),
            shut_down,
        })
    }

    pub fn silence(&self, node_name: &str) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
            .silenced.insert(node_name.to_string());
    }

    pub fn unsilence(&self, node_name: &str) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
            .silenced.remove(node_name);
    }

    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
            .sent.clone()
    }

    /// all sent MESSAGE frames, including retransmissions
    pub fn sent_messages(&self) -> Vec<SentFrame> {
        self.sent_frames().into_iter()
            .filter(|f| f.frame.kind() == FrameKind::Message)
            .collect()
    }

    pub fn clear_sent_frames(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
            .sent.clear();
    }

    /// passes a raw payload to a node's receive loop, bypassing recording and silencing
    pub async fn inject(&self, to: &str, payload: Bytes) {
        let handler = self.state.lock().unwrap_or_else(PoisonError::into_inner)
            .handlers.get(to)
            .cloned();
        if let Some(handler) = handler {
            handler.bytes_arrived(payload).await;
        }
    }

    async fn transmit(&self, from: &str, to: &str, payload: Bytes) {
        let handler = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let delivered = !state.silenced.contains(from) && !state.silenced.contains(to);

            if let Ok(frame) = Frame::deser(&payload) {
                state.sent.push(SentFrame {
                    from: from.to_string(),
                    to: to.to_string(),
                    at: Instant::now(),
                    delivered,
                    frame,
                });
            }

            if !delivered {
                trace!(from, to, "silenced - discarding payload");
                return;
            }

            match state.handlers.get(to).cloned() {
                Some(handler) => handler,
                None => {
                    state.pending.entry(to.to_string())
                        .or_default()
                        .push(payload);
                    return;
                }
            }
        };

        handler.bytes_arrived(payload).await;
    }

    fn register(&self, node_name: &str, handler: Arc<dyn BytesHandler>) -> Vec<Bytes> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.handlers.insert(node_name.to_string(), handler);
        state.pending.remove(node_name).unwrap_or_default()
    }

    fn unregister(&self, node_name: &str) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
            .handlers.remove(node_name);
    }
}

pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
    node_name: String,
    shut_down: watch::Sender<bool>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send_bytes(&self, to: &Node, payload: Bytes) -> anyhow::Result<()> {
        self.network.transmit(&self.node_name, to.name(), payload).await;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn BytesHandler>) -> anyhow::Result<()> {
        let mut shut_down = self.shut_down.subscribe();
        if *shut_down.borrow_and_update() {
            return Ok(());
        }

        for payload in self.network.register(&self.node_name, handler.clone()) {
            handler.bytes_arrived(payload).await;
        }

        let _ = shut_down.changed().await;
        self.network.unregister(&self.node_name);
        Ok(())
    }

    fn shut_down_recv_loop(&self) {
        self.shut_down.send_replace(true);
    }
}
