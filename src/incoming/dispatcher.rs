use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, trace};
use crate::incoming::MessageReceiver;
use crate::messaging::message::IncomingTextMessage;
use crate::stats::Statistics;
use crate::util::worker_pool::WorkerPool;

struct Queued {
    message: IncomingTextMessage,
    enqueued_at: Instant,
}

/// Runs the receiver callback for accepted messages on the receive worker pool.
///
/// Messages with a group id are passed to the receiver strictly one at a time and in dispatch
///  order: a group has at most one job in the pool, and when that job finishes it submits the
///  group's next message. Messages without a group id run concurrently, bounded by the pool size.
pub struct GroupDispatcher {
    pool: WorkerPool,
    receiver: Arc<dyn MessageReceiver>,
    statistics: Arc<Statistics>,
    /// messages waiting for their group's in-flight message to complete. A group has an entry
    ///  exactly while one of its messages is in the pool.
    pending_by_group: Mutex<FxHashMap<String, VecDeque<Queued>>>,
}

impl GroupDispatcher {
    pub fn new(pool: WorkerPool, receiver: Arc<dyn MessageReceiver>, statistics: Arc<Statistics>) -> GroupDispatcher {
        GroupDispatcher {
            pool,
            receiver,
            statistics,
            pending_by_group: Default::default(),
        }
    }

    pub fn dispatch(self: &Arc<Self>, message: IncomingTextMessage) {
        let queued = Queued {
            message,
            enqueued_at: Instant::now(),
        };

        let Some(group_id) = queued.message.message.group_id.clone() else {
            self.submit(queued, None);
            return;
        };

        {
            let mut pending = self.pending_by_group.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(queue) = pending.get_mut(&group_id) {
                trace!(group_id, message_id = ?queued.message.message_id, "group is busy - queueing message");
                queue.push_back(queued);
                return;
            }
            pending.insert(group_id.clone(), VecDeque::new());
        }
        self.submit(queued, Some(group_id));
    }

    fn submit(self: &Arc<Self>, queued: Queued, group_id: Option<String>) {
        let dispatcher = self.clone();
        let job_group_id = group_id.clone();
        let submitted = self.pool.submit(async move {
            dispatcher.handle(queued).await;
            if let Some(group_id) = job_group_id {
                dispatcher.on_group_message_done(group_id);
            }
        });

        if !submitted {
            // nothing would ever release the group's queued messages
            let num_queued = group_id
                .and_then(|g| self.pending_by_group.lock().unwrap_or_else(PoisonError::into_inner).remove(&g))
                .map(|queue| queue.len())
                .unwrap_or(0);
            debug!(num_queued, "receive worker pool is shut down - discarding message");
        }
    }

    fn on_group_message_done(self: &Arc<Self>, group_id: String) {
        let next = {
            let mut pending = self.pending_by_group.lock().unwrap_or_else(PoisonError::into_inner);
            let next = pending.get_mut(&group_id)
                .and_then(|queue| queue.pop_front());
            if next.is_none() {
                pending.remove(&group_id);
            }
            next
        };

        if let Some(next) = next {
            self.submit(next, Some(group_id));
        }
    }

    async fn handle(&self, queued: Queued) {
        self.statistics.worker_wait_time.record(queued.enqueued_at.elapsed());

        let message_id = queued.message.message_id;
        let receiver = self.receiver.clone();
        let started_at = Instant::now();

        // a separate task contains a panicking receiver, so that its group is not stalled
        let result = tokio::spawn(async move {
            receiver.on_message(queued.message).await
        }).await;

        self.statistics.handler_time.record(started_at.elapsed());
        match result {
            Ok(()) => self.statistics.incoming_processed.increment(),
            Err(e) => error!(?message_id, "receiver terminated abnormally: {}", e),
        }
    }

    /// number of groups with a message in progress
    pub fn num_busy_groups(&self) -> usize {
        self.pending_by_group.lock().unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    pub async fn join(&self) {
        self.pool.join().await;
    }
}
