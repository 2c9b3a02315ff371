pub mod lossy;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};


/// The raw datagram transport. Implementations give no delivery guarantees: datagrams may be
///  dropped, duplicated or reordered (but not corrupted), and all reliability is layered on top.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    /// fire and forget - an `Ok` result says nothing about delivery
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    /// Receives datagrams, passing them to the handler one at a time, until the loop is cancelled
    ///  by [Transport::close].
    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()>;

    /// terminates the receive loop and releases the underlying socket
    fn close(&self);
}


/// This trait decouples the mechanics of receiving datagrams from the protocol logic that
///  handles them. It is passed around as an `Arc<dyn ...>` to minimize dependencies of
///  [Transport] implementations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn handle_datagram(&self, buf: &[u8], from: SocketAddr);
}


/// pause after a transient receive error, so that a persistent error condition does not turn
///  the receive loop into a busy loop
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Errors that some platforms report on a UDP socket for ICMP responses to earlier sends. They
///  say nothing about the socket itself, so receiving can continue.
fn is_transient_recv_error(e: &io::Error) -> bool {
    matches!(e.kind(),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
    )
}


/// A [Transport] based on a single UDP socket that is used both for sending and receiving, so
///  that peers can reply to a datagram's source address.
pub struct UdpTransport {
    self_addr: SocketAddr,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    cancel_sender: broadcast::Sender<()>,
    max_datagram_size: usize,
}

impl UdpTransport {
    pub async fn bind(addr: impl ToSocketAddrs, max_datagram_size: usize) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        let self_addr = socket.local_addr()?;
        info!("bound UDP socket to {:?}", self_addr);

        let (cancel_sender, _) = broadcast::channel(1);

        Ok(UdpTransport {
            self_addr,
            socket: RwLock::new(Some(Arc::new(socket))),
            cancel_sender,
            max_datagram_size,
        })
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        match self.socket.read() {
            Ok(socket) => socket.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.self_addr
    }

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        let socket = self.socket()
            .ok_or_else(|| anyhow!("sending on a closed transport"))?;

        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
        // NB: subscribe before checking for the socket so that a concurrent close() is not missed
        let mut cancel_receiver = self.cancel_sender.subscribe();

        let socket = match self.socket() {
            Some(socket) => socket,
            None => {
                debug!("receive loop started on a closed transport");
                return Ok(());
            }
        };

        // one byte more than the maximum so that oversized datagrams can be detected
        let mut buf = vec![0u8; self.max_datagram_size + 1];

        info!("starting UDP receive loop on {:?}", self.self_addr);
        loop {
            tokio::select! {
                r = socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            if len > self.max_datagram_size {
                                warn!("received a datagram from {:?} exceeding max datagram size of {} bytes - skipping", from, self.max_datagram_size);
                                continue;
                            }
                            handler.handle_datagram(&buf[..len], from).await;
                        }
                        Err(e) if is_transient_recv_error(&e) => {
                            warn!(error = ?e, "transient error receiving from datagram socket - backing off");
                            tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket - terminating receive loop");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        info!("shutting down UDP receive loop on {:?}", self.self_addr);
        Ok(())
    }

    fn close(&self) {
        let prev = match self.socket.write() {
            Ok(mut socket) => socket.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if prev.is_some() {
            debug!("closing UDP transport on {:?}", self.self_addr);
        }

        if self.cancel_sender.send(()).is_err() {
            debug!("closing transport while no receive loop is running");
        }
    }
}
