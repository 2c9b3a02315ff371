//! An acknowledgement layer on top of UDP: it adds per-message delivery confirmation, retries
//!  and drop accounting to an unreliable datagram transport.
//!
//! ## Design goals
//!
//! * Confidence per message, not ordering: each message that requires acknowledgement is
//!    confirmed individually, and acknowledgements may arrive in any order
//!   * there are no ordering guarantees across messages, and no deduplication on the receiving
//!      side - a retransmitted message may be delivered more than once
//! * Senders decide *per message type* whether a message needs confirmation:
//!   * REGISTER messages are always acknowledged
//!   * REGISTER_WITH_ACKNOWLEDGES switches the connection into 'explicit' mode where all
//!      subsequent messages are acknowledged
//!   * UNREGISTER switches back to the default mode
//!   * both sides track the mode per peer based on the messages they see, so there is no
//!      separate handshake
//! * Bounded retries: a message is retransmitted until it is acknowledged or the retry budget
//!    is exhausted. Exhausted messages are *dropped*, which is counted rather than raised as an
//!    error, so the layer degrades by accumulating drops instead of failing
//! * Peer-to-peer: every end point can send and receive, 'client' and 'server' are roles of the
//!    application
//!
//! ## Wire format
//!
//! Each UDP datagram contains exactly one envelope - all numbers in network byte order (BE):
//! ```ascii
//! 0:  protocol version (u8), 1 for this version
//! 1:  message type (u8)
//!     * 1 REGISTER
//!     * 2 REGISTER_WITH_ACKNOWLEDGES
//!     * 3 STATE_ID
//!     * 4 COMMAND
//!     * 5 ACK
//!     * 6 UNREGISTER
//!     * 7 HEARTBEAT
//! 2:  CRC-32 checksum (u32) of the rest of the datagram, starting after the checksum
//! 6:  message identity: sequence number (varint u64) - the sender's send counter
//! *:  message identity: digest (u32) - CRC-32 of message type and content
//! *:  content: the rest of the datagram, opaque to the protocol. Empty for ACK.
//! ```
//!
//! An ACK echoes the identity of the message it confirms. Datagrams that can not be decoded are
//!  dropped without acknowledgement.

pub mod ack;
pub mod config;
pub mod end_point;
pub mod peer_modes;
pub mod protocol;
pub mod test_util;
pub mod transport;
