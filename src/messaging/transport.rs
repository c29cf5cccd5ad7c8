pub mod udp;

use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::topology::node::Node;

/// The byte transport between nodes, e.g. UDP datagrams or a message queue. The messaging layer
///  makes no assumptions beyond "opaque payload in, opaque payload out": delivery may be lost,
///  duplicated or reordered.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Sync + Send + 'static {
    async fn send_bytes(&self, to: &Node, payload: Bytes) -> anyhow::Result<()>;

    /// Receives payloads and passes them to the handler until [Transport::shut_down_recv_loop]
    ///  is called
    async fn recv_loop(&self, handler: Arc<dyn BytesHandler>) -> anyhow::Result<()>;

    fn shut_down_recv_loop(&self);
}

/// This trait decouples the transport from the handling of a payload once it is received.
///
/// It is passed around as an `Arc<dyn ...>` to minimize dependencies of [Transport] implementations.
#[async_trait]
pub trait BytesHandler: Sync + Send {
    async fn bytes_arrived(&self, payload: Bytes);
}
