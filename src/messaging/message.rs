use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use rand::Rng;
use crate::topology::node::Node;

/// An application message. The payload is opaque to the messaging layer; the optional fields
///  control how it is delivered:
/// * `group_id`: messages with the same group id are passed to the receiver one at a time and in
///    the order they arrived
/// * `queue`: overrides the route's default queue
/// * `tag`: selects the receiver's accept mode
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct TextMessage {
    pub payload: String,
    pub group_id: Option<String>,
    pub queue: Option<String>,
    pub tag: Option<String>,
}

impl TextMessage {
    pub fn new(payload: impl Into<String>) -> TextMessage {
        TextMessage {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> TextMessage {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> TextMessage {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> TextMessage {
        self.tag = Some(tag.into());
        self
    }
}

/// A received message as it is passed to the receiver. `message.queue` is the effective queue,
///  i.e. the sender's override or the route's default queue.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct IncomingTextMessage {
    pub source: Node,
    pub message_id: MessageId,
    pub message: TextMessage,
}

/// Assigned by the sender; unique per sending node within the receivers' deduplication window.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub u64);

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:016x}", self.0)
    }
}

/// Message ids start at a value derived from the process start time, so that a restarted node
///  does not reuse ids that receivers may still remember.
pub struct MessageIdGenerator {
    next: AtomicU64,
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdGenerator {
    pub fn new() -> MessageIdGenerator {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        // 2^20 ids per millisecond of uptime difference, plus some jitter for nodes restarted
        //  within the same millisecond
        let initial = (millis << 20) | rand::thread_rng().gen_range(0..1u64 << 16);
        Self::starting_at(initial)
    }

    pub fn starting_at(initial: u64) -> MessageIdGenerator {
        MessageIdGenerator {
            next: AtomicU64::new(initial),
        }
    }

    pub fn next_id(&self) -> MessageId {
        MessageId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// The terminal outcome of sending a message
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum SendResult {
    /// the message was acknowledged by the given node
    Success(Node),
    /// the sender gave up waiting; the message may still have been delivered
    Cancelled,
    /// no destination acknowledged the message
    Failure,
}
