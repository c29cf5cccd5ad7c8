//! Counters and rolling timing samples for the messaging layer. Components update them as a side
//!  effect of their regular work; application code reads them through [Statistics::snapshot] and
//!  can zero them with [Statistics::reset].

pub mod rolling_data;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use crate::stats::rolling_data::RollingData;

/// number of samples in the rolling windows of timing values
pub const TIMING_WINDOW_SIZE: usize = 256;

#[derive(Default)]
pub struct Counter(AtomicU64);
impl Counter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct TimingSample {
    window: Mutex<RollingData<TIMING_WINDOW_SIZE>>,
}
impl TimingSample {
    pub(crate) fn record(&self, duration: Duration) {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
            .add_value(duration.as_secs_f64() * 1000.0);
    }

    pub fn average_millis(&self) -> f64 {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
            .mean()
    }

    pub fn max_millis(&self) -> f64 {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
            .max()
    }

    fn reset(&self) {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
            .reset();
    }

    fn summary(&self) -> TimingSummary {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        TimingSummary {
            average_millis: window.mean(),
            max_millis: window.max(),
        }
    }
}

#[derive(Default)]
pub struct Statistics {
    /// messages sent to their first destination
    pub messages_first_sent: Counter,
    /// re-sends to the same destination after a retransmit delay expired
    pub messages_retransmitted: Counter,
    /// switches to another destination, either after the retransmit pattern was exhausted or
    ///  after a NACK
    pub messages_failed_over: Counter,
    /// messages resolved as failure because no destination acknowledged them
    pub messages_timed_out: Counter,
    pub messages_cancelled: Counter,
    pub messages_succeeded: Counter,

    pub incoming_processed: Counter,
    pub incoming_rejected: Counter,
    pub incoming_dropped: Counter,
    /// received payloads that could not be decoded or came from an unknown node
    pub incoming_invalid: Counter,

    pub acks_sent: Counter,
    pub acks_processed: Counter,
    pub nacks_sent: Counter,
    pub nacks_processed: Counter,

    pub heartbeats_sent: Counter,
    pub heartbeats_received: Counter,
    pub nodes_became_unreachable: Counter,

    /// messages that arrived again after they were already accepted
    pub out_of_order_messages: Counter,
    /// ACKs and NACKs for messages that are no longer in flight
    pub out_of_order_acks: Counter,

    /// time spent in the receiver callback
    pub handler_time: TimingSample,
    /// time between the most recent transmission of a message and its ACK
    pub ack_turnaround_time: TimingSample,
    /// time an outgoing frame waits for a send worker
    pub send_channel_wait_time: TimingSample,
    /// time an accepted incoming message waits for a receive worker
    pub worker_wait_time: TimingSample,
}

impl Statistics {
    pub fn new() -> Statistics {
        Default::default()
    }

    fn counters(&self) -> [&Counter; 19] {
        [
            &self.messages_first_sent,
            &self.messages_retransmitted,
            &self.messages_failed_over,
            &self.messages_timed_out,
            &self.messages_cancelled,
            &self.messages_succeeded,
            &self.incoming_processed,
            &self.incoming_rejected,
            &self.incoming_dropped,
            &self.incoming_invalid,
            &self.acks_sent,
            &self.acks_processed,
            &self.nacks_sent,
            &self.nacks_processed,
            &self.heartbeats_sent,
            &self.heartbeats_received,
            &self.nodes_became_unreachable,
            &self.out_of_order_messages,
            &self.out_of_order_acks,
        ]
    }

    /// zeroes all counters and restarts the rolling timing windows
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.reset();
        }
        self.handler_time.reset();
        self.ack_turnaround_time.reset();
        self.send_channel_wait_time.reset();
        self.worker_wait_time.reset();
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            messages_first_sent: self.messages_first_sent.get(),
            messages_retransmitted: self.messages_retransmitted.get(),
            messages_failed_over: self.messages_failed_over.get(),
            messages_timed_out: self.messages_timed_out.get(),
            messages_cancelled: self.messages_cancelled.get(),
            messages_succeeded: self.messages_succeeded.get(),
            incoming_processed: self.incoming_processed.get(),
            incoming_rejected: self.incoming_rejected.get(),
            incoming_dropped: self.incoming_dropped.get(),
            incoming_invalid: self.incoming_invalid.get(),
            acks_sent: self.acks_sent.get(),
            acks_processed: self.acks_processed.get(),
            nacks_sent: self.nacks_sent.get(),
            nacks_processed: self.nacks_processed.get(),
            heartbeats_sent: self.heartbeats_sent.get(),
            heartbeats_received: self.heartbeats_received.get(),
            nodes_became_unreachable: self.nodes_became_unreachable.get(),
            out_of_order_messages: self.out_of_order_messages.get(),
            out_of_order_acks: self.out_of_order_acks.get(),
            handler_time: self.handler_time.summary(),
            ack_turnaround_time: self.ack_turnaround_time.summary(),
            send_channel_wait_time: self.send_channel_wait_time.summary(),
            worker_wait_time: self.worker_wait_time.summary(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimingSummary {
    pub average_millis: f64,
    pub max_millis: f64,
}

/// A point-in-time copy of [Statistics]. Counters are read individually, so a snapshot taken
///  under load is not guaranteed to be consistent across counters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatisticsSnapshot {
    pub messages_first_sent: u64,
    pub messages_retransmitted: u64,
    pub messages_failed_over: u64,
    pub messages_timed_out: u64,
    pub messages_cancelled: u64,
    pub messages_succeeded: u64,
    pub incoming_processed: u64,
    pub incoming_rejected: u64,
    pub incoming_dropped: u64,
    pub incoming_invalid: u64,
    pub acks_sent: u64,
    pub acks_processed: u64,
    pub nacks_sent: u64,
    pub nacks_processed: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub nodes_became_unreachable: u64,
    pub out_of_order_messages: u64,
    pub out_of_order_acks: u64,
    pub handler_time: TimingSummary,
    pub ack_turnaround_time: TimingSummary,
    pub send_channel_wait_time: TimingSummary,
    pub worker_wait_time: TimingSummary,
}
