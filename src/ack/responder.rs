use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::peer_modes::PeerModes;
use crate::protocol::envelope::{Envelope, Message};
use crate::transport::Transport;


/// The application callback for received messages
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageReceiver: Send + Sync + 'static {
    /// Called once per received datagram, including duplicates: there is no deduplication at
    ///  this layer.
    ///
    /// This is a blocking call, holding up the receive loop. Non-trivial work should be
    ///  offloaded, but it is up to the implementation to decide and do this.
    async fn on_message(&self, message: Message, from: SocketAddr);
}


/// The receiver side of the protocol: it acknowledges incoming messages as the message type
///  policy requires, mirroring the sender's per-peer acknowledgement mode, and forwards all
///  messages to the application.
pub struct AckResponder {
    transport: Arc<dyn Transport>,
    receiver: Arc<dyn MessageReceiver>,
    peer_modes: Arc<Mutex<PeerModes>>,
}

impl AckResponder {
    pub fn new(transport: Arc<dyn Transport>, receiver: Arc<dyn MessageReceiver>) -> AckResponder {
        Self::with_peer_modes(transport, receiver, Default::default())
    }

    /// see [crate::ack::tracker::AckTracker::with_peer_modes]
    pub fn with_peer_modes(transport: Arc<dyn Transport>, receiver: Arc<dyn MessageReceiver>, peer_modes: Arc<Mutex<PeerModes>>) -> AckResponder {
        AckResponder {
            transport,
            receiver,
            peer_modes,
        }
    }

    pub async fn on_datagram_received(&self, buf: &[u8], from: SocketAddr) {
        match Envelope::try_deser(buf) {
            Ok(envelope) => self.on_envelope(envelope, from).await,
            Err(e) => warn!("received an undecodable datagram from {:?} - dropping: {}", from, e),
        }
    }

    pub async fn on_envelope(&self, envelope: Envelope, from: SocketAddr) {
        if envelope.message_type().is_ack() {
            debug!(?from, identity = ?envelope.identity(), "received an acknowledgement without a tracker - ignoring");
            return;
        }

        let decision = self.peer_modes.lock().await
            .apply_received(from, envelope.message_type());

        trace!(?from, identity = ?envelope.identity(), message_type = ?envelope.message_type(), requires_ack = decision.requires_ack, "received message");

        if decision.requires_ack {
            let ack = Envelope::ack(envelope.identity());
            if let Err(e) = self.transport.send(from, &ack.to_bytes()).await {
                // the sender will retransmit, giving us another chance to acknowledge
                warn!("error sending acknowledgement for {:?} to {:?}: {}", envelope.identity(), from, e);
            }
        }

        self.receiver.on_message(envelope.to_message(), from).await;
    }

    pub async fn forget_peer(&self, peer: SocketAddr) {
        self.peer_modes.lock().await
            .forget_peer(peer);
    }
}
