//! The sending side: every message gets an [tracker::OutgoingMessage] that drives
//!  retransmission and failover until the message is acknowledged, times out or is cancelled.

pub mod send_future;
pub mod tracker;

use std::sync::{Arc, Mutex, PoisonError};
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tracing::{debug, trace};
use crate::messaging::frame::Frame;
use crate::messaging::frame_sender::FrameSender;
use crate::messaging::message::{MessageId, MessageIdGenerator, TextMessage};
use crate::outgoing::send_future::SendFuture;
use crate::outgoing::tracker::OutgoingMessage;
use crate::stats::Statistics;
use crate::topology::resolver::RouteResolver;
use crate::topology::route::Route;

/// Registry of in-flight messages, keyed by message id for ACK / NACK lookup
pub struct OutgoingMessages {
    local_node_name: String,
    runtime: Handle,
    resolver: Arc<RouteResolver>,
    frame_sender: Arc<FrameSender>,
    statistics: Arc<Statistics>,
    id_generator: MessageIdGenerator,
    in_flight: Mutex<FxHashMap<MessageId, Arc<OutgoingMessage>>>,
}

impl OutgoingMessages {
    pub fn new(
        local_node_name: impl Into<String>,
        runtime: Handle,
        resolver: Arc<RouteResolver>,
        frame_sender: Arc<FrameSender>,
        statistics: Arc<Statistics>,
        id_generator: MessageIdGenerator,
    ) -> OutgoingMessages {
        OutgoingMessages {
            local_node_name: local_node_name.into(),
            runtime,
            resolver,
            frame_sender,
            statistics,
            id_generator,
            in_flight: Default::default(),
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn resolver(&self) -> &RouteResolver {
        &self.resolver
    }

    pub(crate) fn frame_sender(&self) -> &FrameSender {
        &self.frame_sender
    }

    pub(crate) fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Assigns a message id and sends the message to its first destination. A message without a
    ///  queue is sent with the route's default queue.
    pub fn start(self: &Arc<Self>, route: Arc<Route>, mut message: TextMessage) -> SendFuture {
        let message_id = self.id_generator.next_id();
        if message.queue.is_none() {
            message.queue = route.default_queue().map(|q| q.to_string());
        }

        let frame = Frame::Message {
            source: self.local_node_name.clone(),
            message_id,
            message,
        }.to_bytes();

        let first_destination_index = self.resolver.next_index(&route, 0);
        let tracker = Arc::new(OutgoingMessage::new(message_id, route, frame, first_destination_index, Arc::downgrade(self)));

        // register before sending so that even an immediate ACK finds the tracker
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
            .insert(message_id, tracker.clone());
        tracker.start(self);

        SendFuture::new(tracker)
    }

    fn get(&self, message_id: MessageId) -> Option<Arc<OutgoingMessage>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
            .get(&message_id)
            .cloned()
    }

    pub(crate) fn remove(&self, message_id: MessageId) {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
            .remove(&message_id);
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn on_ack(&self, from: &str, message_id: MessageId) {
        self.statistics.acks_processed.increment();

        let processed = match self.get(message_id) {
            Some(tracker) => tracker.on_ack(self, from),
            None => false,
        };
        if !processed {
            trace!(?message_id, from, "ACK for a message that is not in flight");
            self.statistics.out_of_order_acks.increment();
        }
    }

    pub fn on_nack(&self, from: &str, message_id: MessageId) {
        self.statistics.nacks_processed.increment();

        let processed = match self.get(message_id) {
            Some(tracker) => tracker.on_nack(self, from),
            None => false,
        };
        if !processed {
            trace!(?message_id, from, "NACK for a message that is not in flight");
            self.statistics.out_of_order_acks.increment();
        }
    }

    /// Cancels all messages that are currently in flight
    pub fn cancel_all(&self) {
        let trackers = std::mem::take(&mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner));
        if !trackers.is_empty() {
            debug!("cancelling {} in-flight messages", trackers.len());
        }
        for tracker in trackers.into_values() {
            tracker.cancel();
        }
    }
}
