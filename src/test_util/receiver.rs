use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Notify;
use crate::incoming::MessageReceiver;
use crate::messaging::message::IncomingTextMessage;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReceiverEvent {
    Start(String),
    End(String),
}

type DelayFn = Box<dyn Fn(&IncomingTextMessage) -> Duration + Send + Sync>;

/// A [MessageReceiver] that records the messages it gets, optionally taking some time to
///  process each of them. Events are identified by payload.
#[derive(Default)]
pub struct RecordingReceiver {
    delay: Option<DelayFn>,
    panic_on_payload: Option<String>,
    messages: Mutex<Vec<IncomingTextMessage>>,
    events: Mutex<Vec<ReceiverEvent>>,
    completed: Notify,
}

impl RecordingReceiver {
    pub fn new() -> RecordingReceiver {
        Default::default()
    }

    pub fn with_delay(delay: impl Fn(&IncomingTextMessage) -> Duration + Send + Sync + 'static) -> RecordingReceiver {
        RecordingReceiver {
            delay: Some(Box::new(delay)),
            ..Default::default()
        }
    }

    /// panics when processing a message with the given payload
    pub fn panicking_on(payload: &str) -> RecordingReceiver {
        RecordingReceiver {
            panic_on_payload: Some(payload.to_string()),
            ..Default::default()
        }
    }

    /// received messages in the order their processing started
    pub fn messages(&self) -> Vec<IncomingTextMessage> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.messages().into_iter()
            .map(|m| m.message.payload)
            .collect()
    }

    pub fn events(&self) -> Vec<ReceiverEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn num_completed(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| matches!(e, ReceiverEvent::End(_)))
            .count()
    }

    /// waits until at least `n` messages were processed completely
    pub async fn wait_for_completed(&self, n: usize) {
        loop {
            let notified = self.completed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.num_completed() >= n {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, event: ReceiverEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[async_trait]
impl MessageReceiver for RecordingReceiver {
    async fn on_message(&self, message: IncomingTextMessage) {
        let payload = message.message.payload.clone();
        let delay = self.delay.as_ref()
            .map(|d| d(&message));

        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
            .push(message);
        self.record(ReceiverEvent::Start(payload.clone()));

        if self.panic_on_payload.as_ref() == Some(&payload) {
            panic!("receiver failure for {}", payload);
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.record(ReceiverEvent::End(payload));
        self.completed.notify_waiters();
    }
}
