//! The receiving side: deduplication, admission control by accept mode, acknowledgement, and
//!  dispatch to the application's [MessageReceiver].

pub mod accept_mode;
pub mod dispatcher;
pub mod store;

use std::sync::Arc;
use std::time::Duration;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::LwCommConfig;
use crate::incoming::accept_mode::{AcceptMode, AcceptPolicy};
use crate::incoming::dispatcher::GroupDispatcher;
use crate::incoming::store::RecentMessages;
use crate::messaging::frame::Frame;
use crate::messaging::frame_sender::FrameSender;
use crate::messaging::message::{IncomingTextMessage, MessageId, TextMessage};
use crate::stats::Statistics;
use crate::topology::node::Node;

/// The application's callback for received messages.
///
/// Messages are acknowledged before they are passed to the receiver, i.e. delivery is
///  at-least-once and the receiver should be idempotent.
#[async_trait]
pub trait MessageReceiver: Sync + Send + 'static {
    async fn on_message(&self, message: IncomingTextMessage);
}

pub struct IncomingMessages {
    local_node_name: String,
    config: Arc<ArcSwap<LwCommConfig>>,
    accept_policy: AcceptPolicy,
    recent: RecentMessages,
    dispatcher: Arc<GroupDispatcher>,
    frame_sender: Arc<FrameSender>,
    statistics: Arc<Statistics>,
}

impl IncomingMessages {
    pub fn new(
        config: Arc<ArcSwap<LwCommConfig>>,
        dispatcher: Arc<GroupDispatcher>,
        frame_sender: Arc<FrameSender>,
        statistics: Arc<Statistics>,
    ) -> IncomingMessages {
        let (local_node_name, accept_policy) = {
            let config = config.load();
            (
                config.local_node.clone(),
                AcceptPolicy::new(config.default_accept_mode, config.tag_accept_modes.clone()),
            )
        };

        IncomingMessages {
            local_node_name,
            config,
            accept_policy,
            recent: RecentMessages::new(),
            dispatcher,
            frame_sender,
            statistics,
        }
    }

    pub fn accept_policy(&self) -> &AcceptPolicy {
        &self.accept_policy
    }

    pub fn on_message(&self, source: &str, message_id: MessageId, message: TextMessage) {
        let Some(source_node) = self.config.load().node(source).cloned() else {
            warn!(source, ?message_id, "message from unknown node - discarding");
            self.statistics.incoming_invalid.increment();
            return;
        };

        match self.accept_policy.accept_mode_for(message.tag.as_deref()) {
            AcceptMode::Accept => {
                if self.recent.insert_if_absent(source, message_id, Instant::now()) {
                    // acknowledge first, so a slow receiver does not cause retransmits
                    self.send_ack(&source_node, message_id);
                    self.dispatcher.dispatch(IncomingTextMessage {
                        source: source_node,
                        message_id,
                        message,
                    });
                }
                else {
                    debug!(source, ?message_id, "duplicate message - acknowledging again");
                    self.statistics.out_of_order_messages.increment();
                    self.send_ack(&source_node, message_id);
                }
            }
            AcceptMode::Drop => {
                trace!(source, ?message_id, tag = ?message.tag, "dropping message");
                if !self.recent.contains(source, message_id) {
                    self.statistics.incoming_dropped.increment();
                }
            }
            AcceptMode::Reject => {
                trace!(source, ?message_id, tag = ?message.tag, "rejecting message");
                if !self.recent.contains(source, message_id) {
                    self.statistics.incoming_rejected.increment();
                }
                self.send_nack(&source_node, message_id);
            }
        }
    }

    fn send_ack(&self, to: &Node, message_id: MessageId) {
        let frame = Frame::Ack {
            source: self.local_node_name.clone(),
            message_id,
        };
        self.frame_sender.send(to.clone(), frame.to_bytes());
        self.statistics.acks_sent.increment();
    }

    fn send_nack(&self, to: &Node, message_id: MessageId) {
        let frame = Frame::Nack {
            source: self.local_node_name.clone(),
            message_id,
        };
        self.frame_sender.send(to.clone(), frame.to_bytes());
        self.statistics.nacks_sent.increment();
    }

    /// forgets ids of messages accepted longer than `dedup_window` ago
    pub fn evict_expired(&self, dedup_window: Duration) {
        let Some(cutoff) = Instant::now().checked_sub(dedup_window) else {
            return;
        };
        let num_evicted = self.recent.evict_older_than(cutoff);
        if num_evicted > 0 {
            trace!(num_evicted, "evicted message ids from the deduplication store");
        }
    }

    pub fn num_remembered(&self) -> usize {
        self.recent.len()
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    pub async fn join(&self) {
        self.dispatcher.join().await;
    }
}
