use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::router::Router;
use crate::core::{Error, Result};

/// Largest datagram the receive loop accepts
const RECV_BUFFER_SIZE: usize = 65536;

/// Owns the UDP socket and pumps datagrams between it and a [`Router`]
pub struct UdpTransport {
    router: Arc<Router>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Binds a broadcast-capable socket and starts the I/O task
    ///
    /// `initial_source` seeds the router's source counter; `None` picks a random start.
    pub async fn bind(bind_addr: SocketAddr, initial_source: Option<u32>) -> Result<Self> {
        let socket = Arc::new(bind_socket(bind_addr)?);
        let local_addr = socket.local_addr()?;
        info!("UDP transport bound to {}", local_addr);

        let (tx, rx) = mpsc::unbounded_channel::<(Bytes, SocketAddr)>();
        let sender = move |bytes: Bytes, destination: SocketAddr| {
            tx.send((bytes, destination))
                .map_err(|_| Error::network("transport is shut down"))
        };
        let router = Arc::new(match initial_source {
            Some(start) => Router::with_initial_source(start, sender),
            None => Router::new(sender),
        });

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(socket, router.clone(), rx, shutdown.clone()));

        Ok(UdpTransport {
            router,
            local_addr,
            shutdown,
            task: Some(task),
        })
    }

    /// The router fed by this transport
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Returns the local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the I/O task and waits for it to finish
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::network(format!("transport task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn bind_socket(bind_addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&bind_addr.into())
        .map_err(|e| Error::network(format!("Failed to bind {}: {}", bind_addr, e)))?;
    Ok(UdpSocket::from_std(socket.into())?)
}

async fn run(
    socket: Arc<UdpSocket>,
    router: Arc<Router>,
    mut outbound: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("UDP transport shutting down");
                break;
            }

            Some((bytes, destination)) = outbound.recv() => {
                if let Err(e) = socket.send_to(&bytes, destination).await {
                    warn!("Failed to send {} bytes to {}: {}", bytes.len(), destination, e);
                }
            }

            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, peer)) => {
                        router.receive_from(&buf[..len], peer);
                    }
                    Err(e) => warn!("UDP receive failed: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Target;
    use crate::protocol::{encode, Header, Reply};
    use crate::network::ReplyHandler;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Forward(mpsc::UnboundedSender<Reply>);

    impl ReplyHandler for Forward {
        fn handle(&self, reply: &Reply) {
            let _ = self.0.send(reply.clone());
        }
    }

    #[tokio::test]
    async fn test_outbound_and_inbound_datagrams() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), Some(500))
            .await
            .unwrap();
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let router = transport.router();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = router.next_source();
        assert_eq!(source, 500);
        router.register(source, Arc::new(Forward(tx)));

        let request = encode(&Header::new(source, Target([2; 6]), 23), &[]).unwrap();
        router.send(request.clone(), peer.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 128];
        let (len, from) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &request[..]);
        assert_eq!(from.port(), transport.local_addr().port());

        let reply = encode(&Header::new(source, Target([2; 6]), 25), &[0u8; 32]).unwrap();
        peer.send_to(&reply, from).await.unwrap();

        let reply = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(reply.message_type(), 25);
        assert_eq!(reply.peer, Some(peer.local_addr().unwrap()));

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let router = transport.router();
        transport.shutdown().await.unwrap();

        let bytes = encode(&Header::new(1, Target::BROADCAST, 2), &[]).unwrap();
        let result = router.send(bytes, "127.0.0.1:56700".parse().unwrap());
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
