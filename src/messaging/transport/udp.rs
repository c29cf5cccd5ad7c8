use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, trace, warn};
use crate::messaging::transport::{BytesHandler, Transport};
use crate::topology::node::Node;

/// datagrams of this size are assumed to be truncated and are discarded
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Sends each payload as a single UDP datagram to the target node's host and port.
pub struct UdpTransport {
    socket: UdpSocket,
    resolved_addrs: RwLock<FxHashMap<String, SocketAddr>>,
    shut_down: watch::Sender<bool>,
}
impl Debug for UdpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpTransport{{{:?}}}", self.socket.local_addr())
    }
}

impl UdpTransport {
    /// binds to the host and port of the local node
    pub async fn bind(local_node: &Node) -> anyhow::Result<UdpTransport> {
        let addr = Self::resolve(local_node).await?;
        Self::bind_addr(addr).await
    }

    pub async fn bind_addr(addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        info!("UDP transport listening on {:?}", socket.local_addr()?);

        let (shut_down, _) = watch::channel(false);
        Ok(UdpTransport {
            socket,
            resolved_addrs: Default::default(),
            shut_down,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn resolve(node: &Node) -> anyhow::Result<SocketAddr> {
        lookup_host((node.host(), node.port())).await?
            .next()
            .ok_or_else(|| anyhow!("no address for node {:?}", node))
    }

    async fn socket_addr(&self, node: &Node) -> anyhow::Result<SocketAddr> {
        {
            if let Some(addr) = self.resolved_addrs.read().await.get(node.name()) {
                return Ok(*addr);
            }
        }

        let addr = Self::resolve(node).await?;
        debug!("resolved {:?} to {:?}", node, addr);
        self.resolved_addrs.write().await
            .insert(node.name().to_string(), addr);
        Ok(addr)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_bytes(&self, to: &Node, payload: Bytes) -> anyhow::Result<()> {
        let addr = self.socket_addr(to).await?;
        trace!(?to, len = payload.len(), "sending datagram");
        self.socket.send_to(&payload, addr).await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn BytesHandler>) -> anyhow::Result<()> {
        let mut shut_down = self.shut_down.subscribe();
        if *shut_down.borrow_and_update() {
            return Ok(());
        }
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

        loop {
            tokio::select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            if len > MAX_DATAGRAM_SIZE {
                                warn!("received a datagram exceeding max size of {} bytes from {:?} - skipping", MAX_DATAGRAM_SIZE, from);
                                continue;
                            }
                            trace!(?from, len, "received datagram");
                            handler.bytes_arrived(BytesMut::from(&buf[..len]).freeze()).await;
                        }
                        Err(e) => {
                            // e.g. ICMP 'port unreachable' surfacing on some platforms - not fatal
                            error!(error = ?e, "error receiving from datagram socket");
                        }
                    }
                }
                _ = shut_down.changed() => break,
            }
        }

        info!("UDP receive loop shut down");
        Ok(())
    }

    fn shut_down_recv_loop(&self) {
        if !self.shut_down.send_replace(true) {
            info!("shutting down UDP receive loop");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::sync::mpsc;
    use super::*;

    struct ChannelHandler(mpsc::UnboundedSender<Bytes>);

    #[async_trait]
    impl BytesHandler for ChannelHandler {
        async fn bytes_arrived(&self, payload: Bytes) {
            self.0.send(payload).unwrap();
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let receiver = Arc::new(UdpTransport::bind_addr("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let sender = UdpTransport::bind_addr("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let receiver_addr = receiver.local_addr().unwrap();
        let receiver_node = Node::new("R", receiver_addr.ip().to_string(), receiver_addr.port());

        let (send, mut recv) = mpsc::unbounded_channel();
        let recv_loop = {
            let receiver = receiver.clone();
            tokio::spawn(async move {
                receiver.recv_loop(Arc::new(ChannelHandler(send))).await
            })
        };

        // datagrams may get lost even on loopback
        let received = loop {
            sender.send_bytes(&receiver_node, Bytes::from_static(b"abc")).await.unwrap();
            if let Ok(Some(received)) = tokio::time::timeout(Duration::from_millis(50), recv.recv()).await {
                break received;
            }
        };
        assert_eq!(received.as_ref(), b"abc");

        receiver.shut_down_recv_loop();
        recv_loop.await.unwrap().unwrap();
    }
}
