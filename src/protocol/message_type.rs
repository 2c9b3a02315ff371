use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The kind of a message, sent as a single byte on the wire. The set is closed: a datagram with
///  an unknown discriminator is treated as malformed.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum MessageType {
    /// A peer announces itself. Register messages are acknowledged regardless of the peer's
    ///  acknowledgement mode.
    Register = 1,
    /// Like [MessageType::Register], and additionally switches the connection into explicit
    ///  acknowledgement mode: all subsequent messages to / from this peer are acknowledged.
    RegisterWithAcknowledges = 2,
    StateId = 3,
    Command = 4,
    /// Confirms receipt of the message identified by the envelope's identity. Carries no payload.
    Ack = 5,
    /// A peer tears down its connection, resetting the acknowledgement mode to its default
    Unregister = 6,
    /// liveness probe, never acknowledged
    Heartbeat = 7,
}

impl MessageType {
    pub fn is_ack(&self) -> bool {
        *self == MessageType::Ack
    }
}
