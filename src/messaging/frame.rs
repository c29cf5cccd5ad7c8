//! Wire format of the frames exchanged between nodes. All numbers are in network byte order.
//!
//! ```ascii
//! 0: CRC-64 checksum of everything after the checksum (u64)
//! 8: frame kind (u8): 1 MESSAGE, 2 ACK, 3 NACK, 4 HEARTBEAT
//! 9: source node name (varint length + UTF-8)
//! *: message id (u64) - the heartbeat counter for HEARTBEAT frames
//! ```
//!
//! MESSAGE frames continue with the payload (string), and the optional group id, queue and tag
//!  (each a presence byte followed by a string if present). The other frames have no body.

use std::fmt::{Debug, Formatter};
use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::messaging::message::{MessageId, TextMessage};
use crate::util::buf::{get_u64_checked, get_u8_checked, put_opt_string, put_string, try_get_opt_string, try_get_string};

const CHECKSUM_LEN: usize = std::mem::size_of::<u64>();

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn new(buf: &[u8]) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        Checksum(hasher.checksum(buf))
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum FrameKind {
    Message = 1,
    Ack = 2,
    Nack = 3,
    Heartbeat = 4,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Message {
        source: String,
        message_id: MessageId,
        message: TextMessage,
    },
    Ack {
        source: String,
        message_id: MessageId,
    },
    Nack {
        source: String,
        message_id: MessageId,
    },
    Heartbeat {
        source: String,
        counter: u64,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Message { .. } => FrameKind::Message,
            Frame::Ack { .. } => FrameKind::Ack,
            Frame::Nack { .. } => FrameKind::Nack,
            Frame::Heartbeat { .. } => FrameKind::Heartbeat,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Frame::Message { source, .. } => source,
            Frame::Ack { source, .. } => source,
            Frame::Nack { source, .. } => source,
            Frame::Heartbeat { source, .. } => source,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let checksum_offset = buf.len();
        buf.put_u64(0); // placeholder, patched below

        buf.put_u8(self.kind().into());
        put_string(buf, self.source());

        match self {
            Frame::Message { message_id, message, .. } => {
                buf.put_u64(message_id.0);
                put_string(buf, &message.payload);
                put_opt_string(buf, message.group_id.as_deref());
                put_opt_string(buf, message.queue.as_deref());
                put_opt_string(buf, message.tag.as_deref());
            }
            Frame::Ack { message_id, .. } | Frame::Nack { message_id, .. } => {
                buf.put_u64(message_id.0);
            }
            Frame::Heartbeat { counter, .. } => {
                buf.put_u64(*counter);
            }
        }

        let checksum = Checksum::new(&buf[checksum_offset + CHECKSUM_LEN..]);
        buf[checksum_offset..checksum_offset + CHECKSUM_LEN].copy_from_slice(&checksum.0.to_be_bytes());
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<Frame> {
        let mut buf = buf;
        let checksum = Checksum(get_u64_checked(&mut buf)?);
        let actual_checksum = Checksum::new(buf);
        if checksum != actual_checksum {
            bail!("checksum error: expected {:?}, was {:?}", checksum, actual_checksum);
        }

        let kind = FrameKind::try_from(get_u8_checked(&mut buf)?)
            .map_err(|e| anyhow!("invalid frame kind: {}", e.number))?;
        let source = try_get_string(&mut buf)?;
        let id = get_u64_checked(&mut buf)?;

        let frame = match kind {
            FrameKind::Message => {
                let payload = try_get_string(&mut buf)?;
                let group_id = try_get_opt_string(&mut buf)?;
                let queue = try_get_opt_string(&mut buf)?;
                let tag = try_get_opt_string(&mut buf)?;
                Frame::Message {
                    source,
                    message_id: MessageId(id),
                    message: TextMessage {
                        payload,
                        group_id,
                        queue,
                        tag,
                    },
                }
            }
            FrameKind::Ack => Frame::Ack { source, message_id: MessageId(id) },
            FrameKind::Nack => Frame::Nack { source, message_id: MessageId(id) },
            FrameKind::Heartbeat => Frame::Heartbeat { source, counter: id },
        };

        if !buf.is_empty() {
            bail!("{} trailing bytes after {:?} frame", buf.len(), kind);
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn message_frame() -> Frame {
        Frame::Message {
            source: "A".to_string(),
            message_id: MessageId(0x0102),
            message: TextMessage::new("hello")
                .with_group_id("call-17")
                .with_tag("X"),
        }
    }

    #[rstest]
    #[case::message(message_frame(), FrameKind::Message)]
    #[case::untagged_message(Frame::Message { source: "A".to_string(), message_id: MessageId(7), message: TextMessage::new("") }, FrameKind::Message)]
    #[case::ack(Frame::Ack { source: "R1".to_string(), message_id: MessageId(3) }, FrameKind::Ack)]
    #[case::nack(Frame::Nack { source: "R2".to_string(), message_id: MessageId(4) }, FrameKind::Nack)]
    #[case::heartbeat(Frame::Heartbeat { source: "A".to_string(), counter: 99 }, FrameKind::Heartbeat)]
    fn test_ser_deser(#[case] frame: Frame, #[case] kind: FrameKind) {
        assert_eq!(frame.kind(), kind);

        let buf = frame.to_bytes();
        assert_eq!(buf[CHECKSUM_LEN], u8::from(kind));
        assert_eq!(Frame::deser(&buf).unwrap(), frame);
    }

    #[test]
    fn test_ack_layout() {
        let buf = Frame::Ack { source: "R1".to_string(), message_id: MessageId(0x0a0b) }.to_bytes();
        assert_eq!(&buf[CHECKSUM_LEN..], b"\x02\x02R1\0\0\0\0\0\0\x0a\x0b");
        assert_eq!(Checksum::new(&buf[CHECKSUM_LEN..]).0.to_be_bytes(), buf[..CHECKSUM_LEN]);
    }

    #[test]
    fn test_corrupted_checksum() {
        let mut buf = BytesMut::from(message_frame().to_bytes().as_ref());
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(Frame::deser(&buf).is_err());
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::too_short(b"\0\0\0\0")]
    #[case::garbage(b"this is not a frame at all")]
    fn test_garbage(#[case] buf: &[u8]) {
        assert!(Frame::deser(buf).is_err());
    }

    #[test]
    fn test_invalid_kind() {
        let mut body = BytesMut::new();
        body.put_u8(17);
        put_string(&mut body, "A");
        body.put_u64(1);

        let mut buf = BytesMut::new();
        buf.put_u64(Checksum::new(&body).0);
        buf.extend_from_slice(&body);
        assert!(Frame::deser(&buf).is_err());
    }

    #[test]
    fn test_trailing_bytes() {
        let mut body = BytesMut::new();
        body.put_u8(FrameKind::Ack.into());
        put_string(&mut body, "A");
        body.put_u64(1);
        body.put_u8(0);

        let mut buf = BytesMut::new();
        buf.put_u64(Checksum::new(&body).0);
        buf.extend_from_slice(&body);
        assert!(Frame::deser(&buf).is_err());
    }
}
