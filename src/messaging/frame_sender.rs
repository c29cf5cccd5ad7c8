use std::sync::Arc;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{trace, warn};
use crate::messaging::transport::Transport;
use crate::stats::Statistics;
use crate::topology::node::Node;
use crate::util::worker_pool::WorkerPool;

/// Hands outgoing frames to the send pool, decoupling callers (trackers, timers, the receive
///  path) from the latency of actual transport writes.
pub struct FrameSender {
    transport: Arc<dyn Transport>,
    pool: WorkerPool,
    statistics: Arc<Statistics>,
}

impl FrameSender {
    pub fn new(transport: Arc<dyn Transport>, pool: WorkerPool, statistics: Arc<Statistics>) -> FrameSender {
        FrameSender {
            transport,
            pool,
            statistics,
        }
    }

    /// Does not report send errors: the retransmission logic of the frame's originator takes care
    ///  of frames that never reach their destination.
    pub fn send(&self, to: Node, frame: Bytes) {
        let transport = self.transport.clone();
        let statistics = self.statistics.clone();
        let enqueued_at = Instant::now();

        let submitted = self.pool.submit(async move {
            statistics.send_channel_wait_time.record(enqueued_at.elapsed());
            trace!(?to, len = frame.len(), "sending frame");
            if let Err(e) = transport.send_bytes(&to, frame).await {
                warn!(?to, "error sending frame: {}", e);
            }
        });
        if !submitted {
            trace!("send pool is shut down - discarding frame");
        }
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    pub async fn join(&self) {
        self.pool.join().await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::runtime::Handle;
    use crate::messaging::transport::MockTransport;
    use super::*;

    #[tokio::test]
    async fn test_send() {
        let mut transport = MockTransport::new();
        transport.expect_send_bytes()
            .withf(|to, payload| to.name() == "R1" && payload.as_ref() == b"abc")
            .times(1)
            .returning(|_, _| Ok(()));
        transport.expect_send_bytes()
            .withf(|to, _| to.name() == "R2")
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("network unreachable")));

        let statistics = Arc::new(Statistics::new());
        let sender = FrameSender::new(Arc::new(transport), WorkerPool::new("send", 1, &Handle::current()), statistics.clone());

        sender.send(Node::new("R1", "127.0.0.1", 1), Bytes::from_static(b"abc"));
        sender.send(Node::new("R2", "127.0.0.1", 2), Bytes::from_static(b"def"));

        sender.shutdown();
        sender.join().await;

        // the mock verifies the expected calls when it is dropped
        assert!(statistics.snapshot().send_channel_wait_time.max_millis >= 0.0);
    }

    #[tokio::test]
    async fn test_send_after_shutdown() {
        let mut transport = MockTransport::new();
        transport.expect_send_bytes().never();

        let sender = FrameSender::new(Arc::new(transport), WorkerPool::new("send", 1, &Handle::current()), Arc::new(Statistics::new()));
        sender.shutdown();
        sender.send(Node::new("R1", "127.0.0.1", 1), Bytes::from_static(b"abc"));
        sender.join().await;
    }
}
