use std::net::SocketAddr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::message_type::MessageType;
use crate::protocol::policy::{ack_decision, AckDecision, AckMode};

struct PeerModeEntry {
    mode: AckMode,
    last_seen: Instant,
}

/// Acknowledgement mode per peer address.
///
/// Only peers in a non-default mode have an entry, so peers that never switch to explicit
///  acknowledgement cost nothing. Entries are removed when a peer unregisters, explicitly via
///  [PeerModes::forget_peer], or when they were idle for too long.
#[derive(Default)]
pub struct PeerModes {
    modes: FxHashMap<SocketAddr, PeerModeEntry>,
}

impl PeerModes {
    pub fn mode(&self, peer: SocketAddr) -> AckMode {
        self.modes.get(&peer)
            .map(|e| e.mode)
            .unwrap_or_default()
    }

    /// Applies the message type policy for a message sent to a peer, updating the peer's mode
    ///  as a side effect. Sending does not count as activity: a sent message may be lost, and
    ///  refreshing the peer here would let the two sides' idle eviction drift apart.
    pub fn apply_sent(&mut self, peer: SocketAddr, message_type: MessageType) -> AckDecision {
        self.apply(peer, message_type, false)
    }

    /// Applies the message type policy for a message received from a peer, updating the peer's
    ///  mode and marking it as active.
    pub fn apply_received(&mut self, peer: SocketAddr, message_type: MessageType) -> AckDecision {
        self.apply(peer, message_type, true)
    }

    /// marks a peer as active, e.g. when an acknowledgement arrives from it
    pub fn touch(&mut self, peer: SocketAddr) {
        if let Some(entry) = self.modes.get_mut(&peer) {
            entry.last_seen = Instant::now();
        }
    }

    fn apply(&mut self, peer: SocketAddr, message_type: MessageType, is_activity: bool) -> AckDecision {
        let current = self.mode(peer);
        let decision = ack_decision(message_type, current);
        let next = decision.next_mode(current);

        if next != current {
            debug!(?peer, ?current, ?next, "switching acknowledgement mode");
        }

        if next == AckMode::Auto {
            self.modes.remove(&peer);
        }
        else if let Some(entry) = self.modes.get_mut(&peer) {
            entry.mode = next;
            if is_activity {
                entry.last_seen = Instant::now();
            }
        }
        else {
            self.modes.insert(peer, PeerModeEntry { mode: next, last_seen: Instant::now() });
        }
        decision
    }

    pub fn forget_peer(&mut self, peer: SocketAddr) {
        if self.modes.remove(&peer).is_some() {
            debug!(?peer, "forgetting acknowledgement mode");
        }
    }

    /// removes all peers that were not seen for at least `max_idle`, returning the number of
    ///  evicted peers
    pub fn evict_idle(&mut self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.modes.len();
        self.modes.retain(|peer, e| {
            let keep = now.duration_since(e.last_seen) < max_idle;
            if !keep {
                debug!(?peer, "evicting idle peer's acknowledgement mode");
            }
            keep
        });
        before - self.modes.len()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}
