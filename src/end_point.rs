use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::select;
use tracing::{debug, info, span, trace, warn, Instrument, Level};

use crate::ack::responder::{AckResponder, MessageReceiver};
use crate::ack::tracker::{AckTracker, SendOutcome};
use crate::config::AckConfig;
use crate::peer_modes::PeerModes;
use crate::protocol::envelope::{Envelope, Message};
use crate::transport::{DatagramHandler, Transport, UdpTransport};


/// EndPoint is where the parts of the protocol come together: It owns a transport, dispatching
///  incoming acknowledgements to its [AckTracker] and all other messages to its [AckResponder],
///  and it has an API for application code to send messages.
///
/// The protocol is symmetric, so the same end point type serves as 'client' and 'server'. Tracker
///  and responder share a single table of peer acknowledgement modes, so a connection is in the
///  same mode for both directions, whichever side switched it.
pub struct EndPoint {
    config: Arc<AckConfig>,
    transport: Arc<dyn Transport>,
    tracker: Arc<AckTracker>,
    responder: Arc<AckResponder>,
    cancel_sender: broadcast::Sender<()>,
    housekeeping_handle: Option<JoinHandle<()>>,
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        if let Some(handle) = self.housekeeping_handle.take() {
            handle.abort();
        }
    }
}

impl EndPoint {
    /// binds a UDP socket to the configured address
    pub async fn new(config: AckConfig, receiver: Arc<dyn MessageReceiver>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let transport = UdpTransport::bind(config.self_addr, config.max_datagram_size).await?;
        Ok(Self::with_transport(Arc::new(config), Arc::new(transport), receiver))
    }

    pub fn with_transport(config: Arc<AckConfig>, transport: Arc<dyn Transport>, receiver: Arc<dyn MessageReceiver>) -> EndPoint {
        let peer_modes = Arc::new(Mutex::new(PeerModes::default()));

        let mut tracker = AckTracker::with_peer_modes(config.clone(), transport.clone(), peer_modes.clone());
        tracker.spawn_retry_loop();
        let tracker = Arc::new(tracker);

        let responder = Arc::new(AckResponder::with_peer_modes(transport.clone(), receiver, peer_modes));

        let (cancel_sender, _) = broadcast::channel(1);

        let housekeeping_handle = config.peer_idle_timeout.map(|_| {
            tokio::spawn(Self::housekeeping_loop(config.clone(), tracker.clone(), cancel_sender.subscribe()))
        });

        EndPoint {
            config,
            transport,
            tracker,
            responder,
            cancel_sender,
            housekeeping_handle,
        }
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &AckConfig {
        &self.config
    }

    /// see [AckTracker::send]
    pub async fn send_acknowledged(&self, message: Message, to: SocketAddr, blocking: bool) -> anyhow::Result<SendOutcome> {
        self.tracker.send(message, to, blocking).await
    }

    pub async fn send_unacknowledged(&self, message: Message, to: SocketAddr) -> anyhow::Result<()> {
        self.tracker.send_unacknowledged(message, to).await
    }

    pub fn pending_count(&self) -> usize {
        self.tracker.pending_count()
    }

    pub fn dropped_count(&self) -> u64 {
        self.tracker.dropped_count()
    }

    pub async fn wait_until_drained(&self) {
        self.tracker.wait_until_drained().await
    }

    /// forgets the peer's acknowledgement mode, both for sending and for receiving
    pub async fn forget_peer(&self, peer: SocketAddr) {
        self.tracker.forget_peer(peer).await;
    }

    /// Receives datagrams until [EndPoint::shutdown] is called. This is typically spawned as a
    ///  separate task.
    pub async fn recv_loop(&self) -> anyhow::Result<()> {
        info!("starting receive loop on {:?}", self.self_addr());
        self.transport.recv_loop(self.datagram_handler()).await
    }

    /// Stops the retry loop and the receive loop, and releases the socket. Messages that are still
    ///  pending acknowledgement are discarded.
    pub async fn shutdown(&self) {
        info!("shutting down end point on {:?}", self.self_addr());
        let _ = self.cancel_sender.send(());
        self.tracker.shutdown().await;
        self.transport.close();
    }

    fn datagram_handler(&self) -> Arc<dyn DatagramHandler> {
        Arc::new(EndPointDatagramHandler {
            tracker: self.tracker.clone(),
            responder: self.responder.clone(),
        })
    }

    async fn housekeeping_loop(config: Arc<AckConfig>, tracker: Arc<AckTracker>, mut cancel_receiver: broadcast::Receiver<()>) {
        let max_idle = match config.peer_idle_timeout {
            Some(max_idle) => max_idle,
            None => return,
        };

        let mut ticks = interval((max_idle / 2).max(Duration::from_millis(1)));
        loop {
            select! {
                _ = ticks.tick() => {
                    let num_evicted = tracker.evict_idle_peers(max_idle).await;
                    if num_evicted > 0 {
                        debug!("evicted {} idle peers", num_evicted);
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }
    }
}


struct EndPointDatagramHandler {
    tracker: Arc<AckTracker>,
    responder: Arc<AckResponder>,
}

#[async_trait]
impl DatagramHandler for EndPointDatagramHandler {
    async fn handle_datagram(&self, buf: &[u8], from: SocketAddr) {
        let span = span!(Level::TRACE, "datagram_received", ?from);

        async {
            trace!("received datagram: {:?}", buf);

            let envelope = match Envelope::try_deser(buf) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("received an undecodable datagram from {:?} - dropping: {}", from, e);
                    return;
                }
            };

            if envelope.message_type().is_ack() {
                self.tracker.on_ack(envelope.identity(), from).await;
            }
            else {
                self.responder.on_envelope(envelope, from).await;
            }
        }.instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use crate::protocol::message_type::MessageType::*;
    use crate::test_util::{test_addr, CollectingReceiver, RecordingTransport};
    use super::*;

    fn end_point(peer_idle_timeout: Option<Duration>) -> (EndPoint, Arc<RecordingTransport>, Arc<CollectingReceiver>) {
        end_point_at(1, peer_idle_timeout)
    }

    fn end_point_at(n: u16, peer_idle_timeout: Option<Duration>) -> (EndPoint, Arc<RecordingTransport>, Arc<CollectingReceiver>) {
        let config = Arc::new(AckConfig {
            peer_idle_timeout,
            ..AckConfig::new(test_addr(n))
        });
        let transport = Arc::new(RecordingTransport::new(test_addr(n)));
        let receiver = Arc::new(CollectingReceiver::default());
        (EndPoint::with_transport(config, transport.clone(), receiver.clone()), transport, receiver)
    }

    #[tokio::test]
    async fn test_ack_dispatched_to_tracker() {
        let (end_point, transport, receiver) = end_point(None);
        let handler = end_point.datagram_handler();

        end_point.send_acknowledged(Message::new(Register, "x"), test_addr(2), false).await.unwrap();
        assert_eq!(end_point.pending_count(), 1);

        let (_, sent) = transport.sent_envelopes()[0].clone();
        handler.handle_datagram(&Envelope::ack(sent.identity()).to_bytes(), test_addr(2)).await;

        assert_eq!(end_point.pending_count(), 0);
        assert!(receiver.received().is_empty());
    }

    #[tokio::test]
    async fn test_message_dispatched_to_responder() {
        let (end_point, transport, receiver) = end_point(None);
        let handler = end_point.datagram_handler();

        let envelope = Envelope::new(Message::new(Register, "hello"), 1);
        handler.handle_datagram(&envelope.to_bytes(), test_addr(3)).await;

        assert_eq!(transport.sent_envelopes(), vec![(test_addr(3), Envelope::ack(envelope.identity()))]);
        assert_eq!(receiver.received(), vec![(Message::new(Register, "hello"), test_addr(3))]);
    }

    #[tokio::test]
    async fn test_malformed_datagram() {
        let (end_point, transport, receiver) = end_point(None);
        end_point.datagram_handler().handle_datagram(b"\x01\x01garbage", test_addr(3)).await;

        assert!(transport.sent().is_empty());
        assert!(receiver.received().is_empty());
    }

    #[tokio::test]
    async fn test_send_unacknowledged() {
        let (end_point, transport, _) = end_point(None);
        end_point.send_unacknowledged(Message::new(Register, "x"), test_addr(2)).await.unwrap();

        assert_eq!(transport.sent().len(), 1);
        assert_eq!(end_point.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_peers_are_evicted() {
        let (end_point, transport, _) = end_point(Some(Duration::from_secs(10)));
        let handler = end_point.datagram_handler();

        end_point.send_acknowledged(Message::new(RegisterWithAcknowledges, "x"), test_addr(2), false).await.unwrap();
        handler.handle_datagram(&Envelope::new(Message::new(RegisterWithAcknowledges, "y"), 1).to_bytes(), test_addr(3)).await;

        time::sleep(Duration::from_secs(30)).await;

        // both directions fell back to auto mode
        assert_eq!(end_point.send_acknowledged(Message::new(Command, "x"), test_addr(2), false).await.unwrap(), SendOutcome::NotTracked);

        let num_sent = transport.sent().len();
        handler.handle_datagram(&Envelope::new(Message::new(Command, "z"), 2).to_bytes(), test_addr(3)).await;
        assert_eq!(transport.sent().len(), num_sent);
    }

    #[tokio::test]
    async fn test_forget_peer() {
        let (end_point, _, _) = end_point(None);
        end_point.send_acknowledged(Message::new(RegisterWithAcknowledges, "x"), test_addr(2), false).await.unwrap();
        end_point.forget_peer(test_addr(2)).await;

        assert_eq!(end_point.send_acknowledged(Message::new(StateId, "x"), test_addr(2), false).await.unwrap(), SendOutcome::NotTracked);
    }

    /// passes everything that was sent through `transport` so far to `handler`
    async fn deliver_all(transport: &RecordingTransport, handler: &Arc<dyn DatagramHandler>) {
        for (_, buf) in transport.sent() {
            handler.handle_datagram(&buf, transport.local_addr()).await;
        }
    }

    #[tokio::test]
    async fn test_mode_is_shared_between_directions() {
        let (end_point, transport, _) = end_point(None);
        let handler = end_point.datagram_handler();

        handler.handle_datagram(&Envelope::new(Message::new(RegisterWithAcknowledges, "x"), 1).to_bytes(), test_addr(2)).await;
        assert!(matches!(end_point.send_acknowledged(Message::new(Command, "y"), test_addr(2), false).await.unwrap(), SendOutcome::Pending(_)));

        end_point.send_acknowledged(Message::new(RegisterWithAcknowledges, "x"), test_addr(3), false).await.unwrap();
        let num_sent = transport.sent().len();
        handler.handle_datagram(&Envelope::new(Message::new(StateId, "z"), 1).to_bytes(), test_addr(3)).await;
        assert_eq!(transport.sent().len(), num_sent + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_agrees_after_lost_message() {
        let (a, a_transport, _) = end_point_at(1, Some(Duration::from_secs(10)));
        let (b, b_transport, _) = end_point_at(2, Some(Duration::from_secs(10)));
        let a_handler = a.datagram_handler();
        let b_handler = b.datagram_handler();

        a.send_acknowledged(Message::new(RegisterWithAcknowledges, "hi"), b.self_addr(), false).await.unwrap();
        deliver_all(&a_transport, &b_handler).await;
        deliver_all(&b_transport, &a_handler).await;
        assert_eq!(a.pending_count(), 0);

        time::sleep(Duration::from_secs(6)).await;
        // never delivered to b
        a.send_acknowledged(Message::new(StateId, "lost"), b.self_addr(), false).await.unwrap();

        time::sleep(Duration::from_secs(10)).await;

        // both sides are back in auto mode
        assert_eq!(a.send_acknowledged(Message::new(Command, "x"), b.self_addr(), false).await.unwrap(), SendOutcome::NotTracked);
        let num_sent = b_transport.sent().len();
        b_handler.handle_datagram(&Envelope::new(Message::new(Command, "y"), 100).to_bytes(), a.self_addr()).await;
        assert_eq!(b_transport.sent().len(), num_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_after_shutdown() {
        let (end_point, transport, _) = end_point(None);
        end_point.shutdown().await;

        let outcome = time::timeout(Duration::from_secs(600), end_point.send_acknowledged(Message::new(Register, "x"), test_addr(2), true)).await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SendOutcome::Discarded);
        assert_eq!(end_point.pending_count(), 0);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (end_point, _, _) = end_point(None);
        end_point.send_acknowledged(Message::new(Register, "x"), test_addr(2), false).await.unwrap();

        end_point.shutdown().await;
        assert_eq!(end_point.pending_count(), 0);
        end_point.recv_loop().await.unwrap();
    }
}
