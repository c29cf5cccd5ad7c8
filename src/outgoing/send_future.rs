use std::fmt::{Debug, Formatter};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::trace;
use crate::messaging::message::{MessageId, SendResult};
use crate::outgoing::tracker::OutgoingMessage;

/// Callback for the outcome of a send. Closures `Fn(&SendResult)` implement this trait.
pub trait SendResultListener: Send + Sync + 'static {
    fn on_result(&self, result: &SendResult);
}

impl<F> SendResultListener for F
where F: Fn(&SendResult) + Send + Sync + 'static
{
    fn on_result(&self, result: &SendResult) {
        self(result)
    }
}

struct RegisteredListener {
    listener: Arc<dyn SendResultListener>,
    executor: Option<Handle>,
}
impl RegisteredListener {
    fn is_same(&self, listener: &Arc<dyn SendResultListener>) -> bool {
        // compare data pointers only: vtable pointers of the same type may differ between
        //  codegen units
        Arc::as_ptr(&self.listener) as *const () == Arc::as_ptr(listener) as *const ()
    }
}

#[derive(Default)]
struct SlotState {
    result: Option<SendResult>,
    listeners: Vec<RegisteredListener>,
}

/// Write-once holder for a [SendResult]: the first writer wins, and later attempts to complete
///  the slot are ignored.
#[derive(Default)]
pub(crate) struct ResultSlot {
    state: Mutex<SlotState>,
    condvar: Condvar,
    notify: Notify,
}

impl ResultSlot {
    /// Returns `true` if this call stored the result, `false` if the slot was already complete.
    ///
    /// Listeners are called on their executor if they have one. Others are spawned on the current
    ///  tokio runtime if there is one, so that timer and network code paths never run application
    ///  callbacks, and called inline otherwise.
    pub fn try_complete(&self, result: SendResult) -> bool {
        let to_notify = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result.clone());
            state.listeners.iter()
                .map(|l| (l.listener.clone(), l.executor.clone()))
                .collect::<Vec<_>>()
        };

        self.condvar.notify_all();
        self.notify.notify_waiters();

        let fallback = Handle::try_current().ok();
        for (listener, executor) in to_notify {
            match executor.or_else(|| fallback.clone()) {
                Some(executor) => Self::call_on(&executor, listener, result.clone()),
                None => listener.on_result(&result),
            }
        }
        true
    }

    fn call_on(executor: &Handle, listener: Arc<dyn SendResultListener>, result: SendResult) {
        executor.spawn(async move {
            listener.on_result(&result);
        });
    }

    pub fn try_result(&self) -> Option<SendResult> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
            .result.clone()
    }

    pub async fn get(&self) -> SendResult {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register for notification before checking, so a completion in between is not lost
            notified.as_mut().enable();

            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }

    pub fn blocking_get(&self) -> SendResult {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            state = self.condvar.wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn blocking_get_timeout(&self, timeout: Duration) -> Option<SendResult> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self.condvar.wait_timeout_while(state, timeout, |s| s.result.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.result.clone()
    }

    /// Registering the same listener (i.e. the same `Arc`) a second time only replaces its
    ///  executor. A new listener on a complete slot is called right away: on the executor if there
    ///  is one, inline otherwise.
    pub fn add_listener(&self, listener: Arc<dyn SendResultListener>, executor: Option<Handle>) {
        let result = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(registered) = state.listeners.iter_mut().find(|l| l.is_same(&listener)) {
                trace!("listener is already registered - updating its executor");
                registered.executor = executor;
                return;
            }

            state.listeners.push(RegisteredListener {
                listener: listener.clone(),
                executor: executor.clone(),
            });
            state.result.clone()
        };

        if let Some(result) = result {
            match executor {
                Some(executor) => Self::call_on(&executor, listener, result),
                None => listener.on_result(&result),
            }
        }
    }
}

/// Handle for the eventual outcome of a sent message. It resolves exactly once, to
///  [SendResult::Success], [SendResult::Cancelled] or [SendResult::Failure].
///
/// The outcome can be awaited (the handle implements [IntoFuture]), waited for blocking, polled
///  or delivered to listeners.
#[derive(Clone)]
pub struct SendFuture {
    message: Arc<OutgoingMessage>,
}

impl Debug for SendFuture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SendFuture{{{:?}: {:?}}}", self.message.message_id(), self.try_result())
    }
}

impl SendFuture {
    pub(crate) fn new(message: Arc<OutgoingMessage>) -> SendFuture {
        SendFuture { message }
    }

    pub fn message_id(&self) -> MessageId {
        self.message.message_id()
    }

    pub async fn get(&self) -> SendResult {
        self.message.result_slot().get().await
    }

    /// Blocks the calling thread until the outcome is known. This must not be called from
    ///  inside the async runtime's worker threads.
    pub fn blocking_get(&self) -> SendResult {
        self.message.result_slot().blocking_get()
    }

    /// Returns `None` if the outcome is still unknown after `timeout`
    pub fn blocking_get_timeout(&self, timeout: Duration) -> Option<SendResult> {
        self.message.result_slot().blocking_get_timeout(timeout)
    }

    pub fn try_result(&self) -> Option<SendResult> {
        self.message.result_slot().try_result()
    }

    pub fn is_done(&self) -> bool {
        self.try_result().is_some()
    }

    pub fn add_listener(&self, listener: Arc<dyn SendResultListener>, executor: Option<Handle>) {
        self.message.result_slot().add_listener(listener, executor);
    }

    /// Stops retransmissions and resolves the handle as [SendResult::Cancelled], unless the
    ///  outcome is known already. Frames that were sent before may still be delivered.
    ///
    /// Returns `true` if this call cancelled the message.
    pub fn cancel(&self) -> bool {
        self.message.cancel()
    }
}

impl IntoFuture for SendFuture {
    type Output = SendResult;
    type IntoFuture = Pin<Box<dyn Future<Output = SendResult> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.get().await })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use crate::topology::node::Node;
    use super::*;

    fn counting_listener() -> (Arc<dyn SendResultListener>, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let listener: Arc<dyn SendResultListener> = Arc::new(move |_: &SendResult| {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        (listener, counter)
    }

    #[test]
    fn test_first_writer_wins() {
        let slot = ResultSlot::default();
        assert_eq!(slot.try_result(), None);

        assert!(slot.try_complete(SendResult::Success(Node::new("R1", "localhost", 1))));
        assert!(!slot.try_complete(SendResult::Cancelled));
        assert!(!slot.try_complete(SendResult::Failure));

        assert_eq!(slot.try_result(), Some(SendResult::Success(Node::new("R1", "localhost", 1))));
        assert_eq!(slot.blocking_get(), SendResult::Success(Node::new("R1", "localhost", 1)));
    }

    #[test]
    fn test_listeners_on_completed_slot_run_inline() {
        let slot = ResultSlot::default();
        slot.try_complete(SendResult::Failure);

        let (listener1, counter1) = counting_listener();
        let (listener2, counter2) = counting_listener();
        slot.add_listener(listener1, None);
        slot.add_listener(listener2, None);

        assert_eq!(counter1.load(Ordering::SeqCst), 1);
        assert_eq!(counter2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_without_runtime_runs_inline_on_completion() {
        let slot = ResultSlot::default();
        let (listener, counter) = counting_listener();
        slot.add_listener(listener, None);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        slot.try_complete(SendResult::Cancelled);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        slot.try_complete(SendResult::Failure);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_registration() {
        let slot = ResultSlot::default();
        let (listener, counter) = counting_listener();
        slot.add_listener(listener.clone(), None);
        slot.add_listener(listener.clone(), None);

        slot.try_complete(SendResult::Failure);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // registering again after completion does not call it again
        slot.add_listener(listener, None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_registration_updates_executor() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();

        let slot = ResultSlot::default();
        let (send, recv) = mpsc::channel();
        let listener: Arc<dyn SendResultListener> = Arc::new(move |_: &SendResult| {
            send.send(std::thread::current().id()).unwrap();
        });

        slot.add_listener(listener.clone(), None);
        slot.add_listener(listener, Some(runtime.handle().clone()));
        slot.try_complete(SendResult::Failure);

        let thread_id = recv.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(thread_id, std::thread::current().id());
        assert!(recv.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[tokio::test]
    async fn test_listener_is_spawned_inside_runtime() {
        let slot = ResultSlot::default();
        let (send, mut recv) = tokio::sync::mpsc::unbounded_channel();
        slot.add_listener(Arc::new(move |r: &SendResult| {
            send.send(r.clone()).unwrap();
        }), None);

        slot.try_complete(SendResult::Cancelled);
        assert_eq!(recv.recv().await, Some(SendResult::Cancelled));
    }

    #[tokio::test]
    async fn test_async_get() {
        let slot = Arc::new(ResultSlot::default());

        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.get().await })
        };
        tokio::task::yield_now().await;

        slot.try_complete(SendResult::Failure);
        assert_eq!(waiter.await.unwrap(), SendResult::Failure);
        assert_eq!(slot.get().await, SendResult::Failure);
    }

    #[test]
    fn test_blocking_get_from_other_thread() {
        let slot = Arc::new(ResultSlot::default());

        let waiter = {
            let slot = slot.clone();
            std::thread::spawn(move || slot.blocking_get())
        };
        std::thread::sleep(Duration::from_millis(10));
        slot.try_complete(SendResult::Cancelled);

        assert_eq!(waiter.join().unwrap(), SendResult::Cancelled);
    }

    #[test]
    fn test_blocking_get_timeout() {
        let slot = ResultSlot::default();
        assert_eq!(slot.blocking_get_timeout(Duration::from_millis(10)), None);

        slot.try_complete(SendResult::Failure);
        assert_eq!(slot.blocking_get_timeout(Duration::from_millis(10)), Some(SendResult::Failure));
    }
}
