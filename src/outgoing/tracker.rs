use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::messaging::message::{MessageId, SendResult};
use crate::outgoing::OutgoingMessages;
use crate::outgoing::send_future::ResultSlot;
use crate::topology::node::Node;
use crate::topology::route::{Route, RouteMode};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TrackerPhase {
    Created,
    /// sent or retransmitted to the current destination, waiting for an ACK
    WaitingForAck,
    Acked,
    TimedOut,
    Cancelled,
}
impl TrackerPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrackerPhase::Acked | TrackerPhase::TimedOut | TrackerPhase::Cancelled)
    }
}

struct TrackerState {
    phase: TrackerPhase,
    destination_index: usize,
    /// number of distinct destinations this message was sent to so far
    destinations_tried: usize,
    /// index into the retransmit pattern for the current destination
    pattern_index: usize,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    last_sent: Instant,
}

impl TrackerState {
    fn cancel_timer(&mut self) {
        self.timer_generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// The retransmission and failover state machine for a single in-flight message.
///
/// The tracker works on the route snapshot it was created with, so a configuration reload does
///  not affect messages that are already in flight.
pub struct OutgoingMessage {
    message_id: MessageId,
    route: Arc<Route>,
    /// the serialized MESSAGE frame, sent unchanged on every (re)transmission
    frame: Bytes,
    slot: ResultSlot,
    state: Mutex<TrackerState>,
    owner: Weak<OutgoingMessages>,
}

impl OutgoingMessage {
    pub(crate) fn new(message_id: MessageId, route: Arc<Route>, frame: Bytes, first_destination_index: usize, owner: Weak<OutgoingMessages>) -> OutgoingMessage {
        OutgoingMessage {
            message_id,
            route,
            frame,
            slot: Default::default(),
            state: Mutex::new(TrackerState {
                phase: TrackerPhase::Created,
                destination_index: first_destination_index,
                destinations_tried: 0,
                pattern_index: 0,
                timer: None,
                timer_generation: 0,
                last_sent: Instant::now(),
            }),
            owner,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn route(&self) -> &Arc<Route> {
        &self.route
    }

    pub fn phase(&self) -> TrackerPhase {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
            .phase
    }

    pub fn current_destination(&self) -> &Node {
        let index = self.state.lock().unwrap_or_else(PoisonError::into_inner)
            .destination_index;
        &self.route.destinations()[index]
    }

    pub(crate) fn result_slot(&self) -> &ResultSlot {
        &self.slot
    }

    /// sends to the first destination and arms the first retransmit timer
    pub(crate) fn start(self: &Arc<Self>, owner: &OutgoingMessages) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.phase != TrackerPhase::Created {
            return;
        }

        state.phase = TrackerPhase::WaitingForAck;
        state.destinations_tried = 1;
        owner.statistics().messages_first_sent.increment();
        trace!(message_id = ?self.message_id, route = self.route.name(), destination = ?self.route.destinations()[state.destination_index], "sending message");

        self.transmit(owner, &mut state);
        self.arm_timer(owner, &mut state);
    }

    fn transmit(&self, owner: &OutgoingMessages, state: &mut TrackerState) {
        let destination = self.route.destinations()[state.destination_index].clone();
        state.last_sent = Instant::now();
        owner.frame_sender().send(destination, self.frame.clone());
    }

    fn arm_timer(self: &Arc<Self>, owner: &OutgoingMessages, state: &mut TrackerState) {
        state.cancel_timer();
        let generation = state.timer_generation;

        let delay = self.route.retransmit_pattern()
            .get(state.pattern_index)
            .copied()
            .unwrap_or(Duration::ZERO);

        let tracker = Arc::downgrade(self);
        state.timer = Some(owner.runtime().spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.on_timer(generation);
            }
        }));
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };

        let outcome = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.phase.is_terminal() || state.timer_generation != generation {
                // the timer lost a race against an ACK, a NACK or cancellation
                return;
            }
            // this is the currently running timer task, so it must not be aborted
            state.timer = None;

            state.pattern_index += 1;
            if state.pattern_index < self.route.retransmit_pattern().len() {
                owner.statistics().messages_retransmitted.increment();
                debug!(message_id = ?self.message_id, destination = ?self.route.destinations()[state.destination_index], attempt = state.pattern_index, "no ACK - retransmitting");
                self.transmit(&owner, &mut state);
                self.arm_timer(&owner, &mut state);
                None
            }
            else {
                self.fail_over_locked(&owner, &mut state)
            }
        };

        if let Some(result) = outcome {
            self.complete(&owner, result);
        }
    }

    fn next_destination_index(&self, owner: &OutgoingMessages, state: &TrackerState) -> usize {
        match self.route.mode() {
            RouteMode::Failover => owner.resolver().next_index(&self.route, state.destinations_tried),
            // walk the list from where the load balancer put this message, leaving the shared
            //  cursor alone
            RouteMode::LoadBalance => (state.destination_index + 1) % self.route.destinations().len(),
        }
    }

    /// Moves on to the next destination, restarting the retransmit pattern. Returns the
    ///  outcome if there is no destination left.
    fn fail_over_locked(self: &Arc<Self>, owner: &OutgoingMessages, state: &mut TrackerState) -> Option<SendResult> {
        if state.destinations_tried >= self.route.destinations().len() {
            debug!(message_id = ?self.message_id, route = self.route.name(), "no destination acknowledged the message - giving up");
            state.phase = TrackerPhase::TimedOut;
            state.cancel_timer();
            owner.statistics().messages_timed_out.increment();
            return Some(SendResult::Failure);
        }

        let previous = state.destination_index;
        state.destination_index = self.next_destination_index(owner, state);
        state.destinations_tried += 1;
        state.pattern_index = 0;
        state.phase = TrackerPhase::WaitingForAck;
        owner.statistics().messages_failed_over.increment();
        debug!(message_id = ?self.message_id, from = ?self.route.destinations()[previous], to = ?self.route.destinations()[state.destination_index], "failing over");

        self.transmit(owner, state);
        self.arm_timer(owner, state);
        None
    }

    /// Returns `false` if the ACK was not expected, i.e. the message is complete already or the
    ///  acknowledging node is not a destination of the route
    pub(crate) fn on_ack(&self, owner: &OutgoingMessages, from: &str) -> bool {
        let Some(node) = self.route.destination_by_name(from) else {
            debug!(message_id = ?self.message_id, from, "ACK from a node that is not a destination of route {}", self.route.name());
            return false;
        };

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.phase.is_terminal() {
                return false;
            }
            state.phase = TrackerPhase::Acked;
            state.cancel_timer();
            owner.statistics().ack_turnaround_time.record(state.last_sent.elapsed());
        }

        trace!(message_id = ?self.message_id, ?node, "message was acknowledged");
        owner.statistics().messages_succeeded.increment();
        self.complete(owner, SendResult::Success(node.clone()));
        true
    }

    /// Only a NACK from the current destination triggers a failover; NACKs from earlier
    ///  destinations are stale. Returns `false` if the NACK was not acted upon.
    pub(crate) fn on_nack(self: &Arc<Self>, owner: &OutgoingMessages, from: &str) -> bool {
        let outcome = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.phase.is_terminal() {
                return false;
            }
            if self.route.destinations()[state.destination_index].name() != from {
                debug!(message_id = ?self.message_id, from, "NACK from a node other than the current destination - ignoring");
                return false;
            }

            debug!(message_id = ?self.message_id, from, "message was rejected");
            self.fail_over_locked(owner, &mut state)
        };

        if let Some(result) = outcome {
            self.complete(owner, result);
        }
        true
    }

    /// Returns `true` if this call cancelled the message, `false` if it was complete already
    pub(crate) fn cancel(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.phase.is_terminal() {
                return false;
            }
            state.phase = TrackerPhase::Cancelled;
            state.cancel_timer();
        }

        debug!(message_id = ?self.message_id, "message was cancelled");
        match self.owner.upgrade() {
            Some(owner) => {
                owner.statistics().messages_cancelled.increment();
                self.complete(&owner, SendResult::Cancelled);
            }
            None => {
                self.slot.try_complete(SendResult::Cancelled);
            }
        }
        true
    }

    fn complete(&self, owner: &OutgoingMessages, result: SendResult) {
        owner.remove(self.message_id);
        self.slot.try_complete(result);
    }
}
