use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::Crc;

use crate::protocol::message_type::MessageType;

const DIGEST: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Correlates an acknowledgement with the message it confirms.
///
/// The `sequence` part is the sender's send counter at the time the message was sent, which makes
///  ids unique among a sender's pending messages. The `digest` is derived from the message's type
///  and content so that an ACK for a different message that happens to reuse a sequence number
///  (e.g. after a sender restart) does not match.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId {
    pub sequence: u64,
    pub digest: u32,
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:08x}", self.sequence, self.digest)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl MessageId {
    pub fn new(sequence: u64, message_type: MessageType, content: &[u8]) -> MessageId {
        let discriminator: u8 = message_type.into();

        let mut digest = DIGEST.digest();
        digest.update(&[discriminator]);
        digest.update(content);

        MessageId {
            sequence,
            digest: digest.finalize(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_varint(self.sequence);
        buf.put_u32(self.digest);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageId> {
        let sequence = buf.try_get_u64_varint()?;
        let digest = buf.try_get_u32()?;
        Ok(MessageId { sequence, digest })
    }
}
