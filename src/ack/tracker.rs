use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::AckConfig;
use crate::peer_modes::PeerModes;
use crate::protocol::envelope::{Envelope, Message};
use crate::protocol::message_id::MessageId;
use crate::transport::Transport;


/// The result of sending a message through an [AckTracker]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    /// the message type policy does not require an acknowledgement, so the message was sent
    ///  without tracking
    NotTracked,
    /// non-blocking send of a message that requires acknowledgement: it is tracked in the
    ///  background
    Pending(MessageId),
    Acknowledged,
    /// the retry budget was exhausted without an acknowledgement
    Dropped,
    /// the tracker was shut down, either while waiting for an acknowledgement or before the
    ///  message was sent
    Discarded,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Resolution {
    Acknowledged,
    Dropped,
}

struct PendingAck {
    envelope: Envelope,
    datagram: Bytes,
    first_sent_at: Instant,
    retry_count: u32,
    next_retry_at: Instant,
    /// present for blocking sends
    waiter: Option<oneshot::Sender<Resolution>>,
}
impl PendingAck {
    fn resolve(&mut self, resolution: Resolution) {
        if let Some(waiter) = self.waiter.take() {
            // the receiver is gone if the sending task was cancelled, which is fine
            let _ = waiter.send(resolution);
        }
    }
}

#[derive(Default)]
struct TrackerState {
    next_sequence: u64,
    pending: FxHashMap<(SocketAddr, MessageId), PendingAck>,
}

impl TrackerState {
    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }
}

/// State shared between the API and the retry loop
struct TrackerShared {
    config: Arc<AckConfig>,
    transport: Arc<dyn Transport>,
    state: Mutex<TrackerState>,
    /// locked after `state` where both are needed
    peer_modes: Arc<Mutex<PeerModes>>,
    num_dropped: AtomicU64,
    is_shut_down: AtomicBool,
    pending_count: watch::Sender<usize>,
}

impl TrackerShared {
    fn update_pending_count(&self, state: &TrackerState) {
        self.pending_count.send_replace(state.pending.len());
    }
}


/// The sender side of the protocol: it sends messages, keeps those that require acknowledgement
///  until the acknowledgement arrives, retransmits them periodically, and eventually gives up
///  on them, counting them as dropped.
///
/// Pending messages are keyed by destination and [MessageId] rather than by send order, so
///  acknowledgements can arrive in any order. Both the receive path ([AckTracker::on_ack]) and
///  the retry loop may try to remove the same entry; whoever comes second finds nothing to do.
pub struct AckTracker {
    shared: Arc<TrackerShared>,
    cancel_sender: broadcast::Sender<()>,
    retry_handle: Option<JoinHandle<()>>,
}

impl Drop for AckTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.retry_handle.take() {
            handle.abort();
        }
    }
}

impl AckTracker {
    pub fn new(config: Arc<AckConfig>, transport: Arc<dyn Transport>) -> AckTracker {
        Self::with_peer_modes(config, transport, Default::default())
    }

    /// Creates a tracker that shares its peers' acknowledgement modes with others, typically with
    ///  the [crate::ack::responder::AckResponder] of the same end point. Then a mode switch
    ///  applies to both directions of a connection, no matter which side initiated it.
    pub fn with_peer_modes(config: Arc<AckConfig>, transport: Arc<dyn Transport>, peer_modes: Arc<Mutex<PeerModes>>) -> AckTracker {
        let (cancel_sender, _) = broadcast::channel(1);
        let (pending_count, _) = watch::channel(0);

        AckTracker {
            shared: Arc::new(TrackerShared {
                config,
                transport,
                state: Default::default(),
                peer_modes,
                num_dropped: AtomicU64::new(0),
                is_shut_down: AtomicBool::new(false),
                pending_count,
            }),
            cancel_sender,
            retry_handle: None,
        }
    }

    pub fn spawn_retry_loop(&mut self) {
        if self.retry_handle.is_some() {
            warn!("retry loop already spawned");
            return;
        }
        let cancel_receiver = self.cancel_sender.subscribe();
        self.retry_handle = Some(tokio::spawn(Self::retry_loop(self.shared.clone(), cancel_receiver)));
    }

    /// Sends a message, tracking it for acknowledgement if the message type policy requires it.
    ///
    /// A `blocking` send waits until the message is either acknowledged or dropped. Dropping is
    ///  reported through the returned [SendOutcome] and [AckTracker::dropped_count], not as an
    ///  error: errors are reserved for messages that can not be sent at all.
    ///
    /// After [AckTracker::shutdown], nothing is sent or tracked any more, and all sends return
    ///  [SendOutcome::Discarded].
    ///
    /// NB: A transport error on the first transmission of a tracked message is treated like a
    ///      lost datagram, leaving recovery to the retry loop
    pub async fn send(&self, message: Message, to: SocketAddr, blocking: bool) -> anyhow::Result<SendOutcome> {
        let (envelope, datagram, waiter) = {
            let mut state = self.shared.state.lock().await;
            // NB: checked under the lock, so there is no race with shutdown() clearing pending entries
            if self.shared.is_shut_down.load(Ordering::Acquire) {
                debug!(?to, message_type = ?message.message_type, "tracker is shut down - discarding message");
                return Ok(SendOutcome::Discarded);
            }

            let envelope = Envelope::new(message, state.next_sequence());
            let datagram = self.checked_datagram(&envelope)?;

            let decision = self.shared.peer_modes.lock().await
                .apply_sent(to, envelope.message_type());
            if decision.requires_ack {
                let (waiter, receiver) = if blocking {
                    let (sender, receiver) = oneshot::channel();
                    (Some(sender), Some(receiver))
                }
                else {
                    (None, None)
                };

                // NB: registering before sending so that even an immediate ACK finds the entry
                let now = Instant::now();
                state.pending.insert((to, envelope.identity()), PendingAck {
                    envelope: envelope.clone(),
                    datagram: datagram.clone(),
                    first_sent_at: now,
                    retry_count: 0,
                    next_retry_at: now + self.shared.config.ack_timeout,
                    waiter,
                });
                self.shared.update_pending_count(&state);
                (envelope, datagram, Some(receiver))
            }
            else {
                (envelope, datagram, None)
            }
        };

        debug!(?to, identity = ?envelope.identity(), message_type = ?envelope.message_type(), "sending message");

        let receiver = match waiter {
            None => {
                self.shared.transport.send(to, &datagram).await?;
                return Ok(SendOutcome::NotTracked);
            }
            Some(receiver) => receiver,
        };

        if let Err(e) = self.shared.transport.send(to, &datagram).await {
            warn!("error sending message {:?} to {:?}, leaving it to be retried: {}", envelope.identity(), to, e);
        }

        match receiver {
            None => Ok(SendOutcome::Pending(envelope.identity())),
            Some(receiver) => match receiver.await {
                Ok(Resolution::Acknowledged) => Ok(SendOutcome::Acknowledged),
                Ok(Resolution::Dropped) => Ok(SendOutcome::Dropped),
                Err(_) => Ok(SendOutcome::Discarded),
            }
        }
    }

    /// Sends a message without ever tracking it, regardless of the message type policy. This
    ///  does not affect the peer's acknowledgement mode either.
    pub async fn send_unacknowledged(&self, message: Message, to: SocketAddr) -> anyhow::Result<()> {
        let (envelope, datagram) = {
            let mut state = self.shared.state.lock().await;
            let envelope = Envelope::new(message, state.next_sequence());
            let datagram = self.checked_datagram(&envelope)?;
            (envelope, datagram)
        };

        debug!(?to, identity = ?envelope.identity(), message_type = ?envelope.message_type(), "sending unacknowledged message");
        self.shared.transport.send(to, &datagram).await
    }

    fn checked_datagram(&self, envelope: &Envelope) -> anyhow::Result<Bytes> {
        let datagram = envelope.to_bytes();
        if datagram.len() > self.shared.config.max_datagram_size {
            bail!("message of type {:?} is {} bytes when encoded, exceeding the maximum datagram size of {} bytes",
                envelope.message_type(), datagram.len(), self.shared.config.max_datagram_size);
        }
        Ok(datagram)
    }

    /// handles a raw datagram on the sender side: only acknowledgements are of interest here
    pub async fn on_datagram_received(&self, buf: &[u8], from: SocketAddr) {
        match Envelope::try_deser(buf) {
            Ok(envelope) if envelope.message_type().is_ack() => self.on_ack(envelope.identity(), from).await,
            Ok(envelope) => debug!("ignoring {:?} message from {:?} - not an acknowledgement", envelope.message_type(), from),
            Err(e) => warn!("received an undecodable datagram from {:?} - dropping: {}", from, e),
        }
    }

    /// Removes the pending entry matching an acknowledgement. Duplicate or late acknowledgements
    ///  find no entry and are ignored.
    pub async fn on_ack(&self, identity: MessageId, from: SocketAddr) {
        let mut state = self.shared.state.lock().await;
        match state.pending.remove(&(from, identity)) {
            Some(mut entry) => {
                trace!(?from, ?identity, retry_count = entry.retry_count, rtt = ?entry.first_sent_at.elapsed(), "message acknowledged");
                entry.resolve(Resolution::Acknowledged);
                self.shared.update_pending_count(&state);
                self.shared.peer_modes.lock().await
                    .touch(from);
            }
            None => {
                debug!(?from, ?identity, "received acknowledgement for a message that is not pending - ignoring");
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        *self.shared.pending_count.borrow()
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.num_dropped.load(Ordering::Acquire)
    }

    /// returns once no message is waiting for acknowledgement
    pub async fn wait_until_drained(&self) {
        let mut receiver = self.shared.pending_count.subscribe();
        // NB: the sender lives as long as self, so this can not fail
        let _ = receiver.wait_for(|&n| n == 0).await;
    }

    pub async fn forget_peer(&self, peer: SocketAddr) {
        self.shared.peer_modes.lock().await
            .forget_peer(peer);
    }

    pub async fn evict_idle_peers(&self, max_idle: Duration) -> usize {
        self.shared.peer_modes.lock().await
            .evict_idle(max_idle)
    }

    /// Stops the retry loop and discards all pending messages. Blocked senders return
    ///  [SendOutcome::Discarded].
    pub async fn shutdown(&self) {
        if self.cancel_sender.send(()).is_err() {
            debug!("shutting down tracker without a running retry loop");
        }

        let mut state = self.shared.state.lock().await;
        self.shared.is_shut_down.store(true, Ordering::Release);
        if !state.pending.is_empty() {
            info!("discarding {} messages pending acknowledgement", state.pending.len());
        }
        state.pending.clear();
        self.shared.update_pending_count(&state);
    }

    async fn retry_loop(shared: Arc<TrackerShared>, mut cancel_receiver: broadcast::Receiver<()>) {
        let mut retry_ticks = retry_ticks(shared.config.retry_interval);

        loop {
            select! {
                _ = retry_ticks.tick() => {
                    Self::do_retry(shared.as_ref()).await
                }
                _ = cancel_receiver.recv() => {
                    debug!("shutting down retry loop");
                    break;
                }
            }
        }
    }

    async fn do_retry(shared: &TrackerShared) {
        let now = Instant::now();
        let mut retransmissions = Vec::new();
        let mut num_dropped = 0u64;

        {
            let mut state = shared.state.lock().await;
            let max_retries = shared.config.max_retries;
            let ack_timeout = shared.config.ack_timeout;

            state.pending.retain(|(to, identity), entry| {
                if entry.next_retry_at > now {
                    return true;
                }

                if entry.retry_count >= max_retries {
                    warn!(?to, ?identity, "no acknowledgement for {:?} message after {} retries - dropping it", entry.envelope.message_type(), entry.retry_count);
                    shared.num_dropped.fetch_add(1, Ordering::AcqRel);
                    num_dropped += 1;
                    entry.resolve(Resolution::Dropped);
                    return false;
                }

                entry.retry_count += 1;
                entry.next_retry_at = now + ack_timeout;
                debug!(?to, ?identity, retry_count = entry.retry_count, "no acknowledgement (yet) - retransmitting");
                retransmissions.push((*to, entry.datagram.clone()));
                true
            });

            if num_dropped > 0 {
                shared.update_pending_count(&state);
            }
        }

        for (to, datagram) in retransmissions {
            if let Err(e) = shared.transport.send(to, &datagram).await {
                warn!("error retransmitting to {:?}: {}", to, e);
            }
        }
    }
}

/// After a stall, e.g. waiting for the lock, the next scan is a full interval later rather than
///  a burst of catch-up scans.
fn retry_ticks(retry_interval: Duration) -> Interval {
    let mut ticks = interval(retry_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks
}
