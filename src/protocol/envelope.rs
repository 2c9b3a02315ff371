use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;

use crate::protocol::message_id::MessageId;
use crate::protocol::message_type::MessageType;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// A message as the application sees it: type and opaque payload, no identity yet. The identity
///  is assigned when the message is sent, turning it into an [Envelope].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub content: Bytes,
}

impl Message {
    pub fn new(message_type: MessageType, content: impl Into<Bytes>) -> Message {
        Message {
            message_type,
            content: content.into(),
        }
    }
}


/// One datagram's worth of protocol data. Envelopes are immutable once created, so the identity
///  is fixed at the point where the sender creates the envelope.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Envelope {
    message_type: MessageType,
    identity: MessageId,
    content: Bytes,
}

impl Envelope {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    const CHECKSUM_OFFSET: usize = 2;
    const CHECKSUM_END: usize = Self::CHECKSUM_OFFSET + size_of::<u32>();

    pub fn new(message: Message, sequence: u64) -> Envelope {
        let identity = MessageId::new(sequence, message.message_type, &message.content);
        Envelope {
            message_type: message.message_type,
            identity,
            content: message.content,
        }
    }

    /// creates the acknowledgement for an envelope with the given identity
    pub fn ack(identity: MessageId) -> Envelope {
        Envelope {
            message_type: MessageType::Ack,
            identity,
            content: Bytes::new(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn identity(&self) -> MessageId {
        self.identity
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn to_message(&self) -> Message {
        Message {
            message_type: self.message_type,
            content: self.content.clone(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        // 10 bytes is the maximum length of a varint encoded u64
        Self::CHECKSUM_END + 10 + size_of::<u32>() + self.content.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u8(self.message_type.into());
        buf.put_u32(0); // placeholder, patched below
        self.identity.ser(buf);
        buf.put_slice(&self.content);

        let checksum = CHECKSUM.checksum(&buf[start + Self::CHECKSUM_END..]);
        buf[start + Self::CHECKSUM_OFFSET..start + Self::CHECKSUM_END].copy_from_slice(&checksum.to_be_bytes());
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(datagram: &[u8]) -> anyhow::Result<Envelope> {
        if datagram.len() < Self::CHECKSUM_END {
            bail!("datagram is shorter than the envelope header: {} bytes", datagram.len());
        }

        let mut buf = datagram;
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }

        let raw_type = buf.try_get_u8()?;
        let message_type = MessageType::try_from(raw_type)
            .map_err(|_| anyhow!("invalid message type discriminator {}", raw_type))?;

        let checksum = buf.try_get_u32()?;
        let actual_checksum = CHECKSUM.checksum(buf);
        if checksum != actual_checksum {
            bail!("checksum mismatch: expected {:08x}, was {:08x}", checksum, actual_checksum);
        }

        let identity = MessageId::try_deser(&mut buf)?;

        if message_type.is_ack() && !buf.is_empty() {
            bail!("ACK for {:?} carries {} bytes of unexpected content", identity, buf.len());
        }

        Ok(Envelope {
            message_type,
            identity,
            content: Bytes::copy_from_slice(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn register_envelope() -> Envelope {
        Envelope::new(Message::new(MessageType::Register, "registering_with_acks"), 1)
    }

    #[test]
    fn test_identity_assigned_from_sequence_and_content() {
        let envelope = Envelope::new(Message::new(MessageType::StateId, "This is a state_id"), 17);
        assert_eq!(envelope.identity(), MessageId::new(17, MessageType::StateId, b"This is a state_id"));
        assert_eq!(envelope.to_message(), Message::new(MessageType::StateId, "This is a state_id"));
    }

    #[test]
    fn test_ser_layout() {
        let envelope = Envelope::ack(MessageId { sequence: 3, digest: 0x0a0b0c0d });

        let buf = envelope.to_bytes();
        assert_eq!(buf[0], Envelope::PROTOCOL_VERSION_1);
        assert_eq!(buf[1], 5);
        assert_eq!(&buf[6..], &[3, 0x0a,0x0b,0x0c,0x0d]);
        assert_eq!(&buf[2..6], &CHECKSUM.checksum(&buf[6..]).to_be_bytes());
        assert!(buf.len() <= envelope.serialized_len());
    }

    #[test]
    fn test_ser_appends_to_buffer() {
        let envelope = register_envelope();

        let mut buf = BytesMut::new();
        buf.put_slice(b"xyz");
        envelope.ser(&mut buf);

        assert_eq!(&buf[..3], b"xyz");
        assert_eq!(Envelope::try_deser(&buf[3..]).unwrap(), envelope);
    }

    #[rstest]
    #[case::register(register_envelope())]
    #[case::empty_content(Envelope::new(Message::new(MessageType::Heartbeat, ""), 99))]
    #[case::ack(Envelope::ack(MessageId::new(u64::MAX, MessageType::Command, b"final")))]
    fn test_deser(#[case] envelope: Envelope) {
        let buf = envelope.to_bytes();
        assert_eq!(Envelope::try_deser(&buf).unwrap(), envelope);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short_header(vec![1, 1, 0, 0])]
    #[case::wrong_version(vec![2, 1, 0, 0, 0, 0, 1, 0, 0, 0, 0])]
    #[case::unknown_type(vec![1, 42, 0, 0, 0, 0, 1, 0, 0, 0, 0])]
    #[case::checksum_mismatch(vec![1, 1, 0, 0, 0, 0, 1, 0, 0, 0, 0])]
    fn test_deser_malformed(#[case] buf: Vec<u8>) {
        assert!(Envelope::try_deser(&buf).is_err());
    }

    #[test]
    fn test_deser_corrupted_content() {
        let mut buf = register_envelope().to_bytes().to_vec();
        let last = buf.len() - 1;
        buf[last] ^= 0x20;
        assert!(Envelope::try_deser(&buf).is_err());
    }

    #[test]
    fn test_deser_ack_with_content() {
        let mut buf = BytesMut::new();
        Envelope {
            message_type: MessageType::Ack,
            identity: MessageId { sequence: 1, digest: 2 },
            content: Bytes::from_static(b"unexpected"),
        }.ser(&mut buf);

        assert!(Envelope::try_deser(&buf).is_err());
    }
}
