//! Wire messages produced and consumed by the replication stream.
//!
//! Binary layout mirrors the rest of the protocol family this crate grew out
//! of: a one-byte opcode tag followed by big-endian fixed fields, with
//! variable-length key/value payloads length-prefixed.
//!
//! ```text
//! +--------+-----------------------------+
//! | opcode |   ... fields per type ...   |
//! | (1B)   |                             |
//! +--------+-----------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, StreamError};

/// Message opcode identifiers carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    SnapshotMarker = 0x01,
    Mutation = 0x02,
    Deletion = 0x03,
    Expiration = 0x04,
    SetVBucketState = 0x05,
    StreamEnd = 0x06,
    BufferAck = 0x07,
}

impl TryFrom<u8> for MessageType {
    type Error = StreamError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MessageType::SnapshotMarker),
            0x02 => Ok(MessageType::Mutation),
            0x03 => Ok(MessageType::Deletion),
            0x04 => Ok(MessageType::Expiration),
            0x05 => Ok(MessageType::SetVBucketState),
            0x06 => Ok(MessageType::StreamEnd),
            0x07 => Ok(MessageType::BufferAck),
            other => Err(StreamError::UnknownMessageType(other)),
        }
    }
}

/// Flags carried in a `SnapshotMarker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotFlags(pub u8);

impl SnapshotFlags {
    pub const DISK: Self = Self(0x01);
    pub const MEMORY: Self = Self(0x02);
    /// Peer should acknowledge once this snapshot is fully consumed.
    pub const ACK: Self = Self(0x04);

    pub fn contains(self, flag: SnapshotFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    pub fn is_disk(self) -> bool {
        self.contains(Self::DISK)
    }

    pub fn is_memory(self) -> bool {
        self.contains(Self::MEMORY)
    }
}

/// Whether a snapshot originated from the disk backfill source or the live
/// in-memory checkpoint cursor. `None` (no current snapshot) is represented
/// by `Option<SnapshotType>` at call sites rather than as a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotType {
    Disk,
    Memory,
}

impl From<SnapshotType> for SnapshotFlags {
    fn from(t: SnapshotType) -> Self {
        match t {
            SnapshotType::Disk => SnapshotFlags::DISK,
            SnapshotType::Memory => SnapshotFlags::MEMORY,
        }
    }
}

/// The vbucket state carried by `SetVBucketState`, and reported by the
/// `VBucket` collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VBucketState {
    Active = 0x01,
    Replica = 0x02,
    Pending = 0x03,
    Dead = 0x04,
}

impl TryFrom<u8> for VBucketState {
    type Error = StreamError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(VBucketState::Active),
            0x02 => Ok(VBucketState::Replica),
            0x03 => Ok(VBucketState::Pending),
            0x04 => Ok(VBucketState::Dead),
            other => Err(StreamError::Internal(format!(
                "unknown vbucket state byte 0x{other:02x}"
            ))),
        }
    }
}

/// The reason a stream ended, echoed to the peer in `StreamEnd` and used
/// internally to decide how `set_dead` handles the ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    Ok = 0x00,
    Closed = 0x01,
    StateChanged = 0x02,
    Disconnected = 0x03,
    Slow = 0x04,
}

impl TryFrom<u8> for CloseReason {
    type Error = StreamError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(CloseReason::Ok),
            0x01 => Ok(CloseReason::Closed),
            0x02 => Ok(CloseReason::StateChanged),
            0x03 => Ok(CloseReason::Disconnected),
            0x04 => Ok(CloseReason::Slow),
            other => Err(StreamError::InvalidCloseReason(other)),
        }
    }
}

/// A replication protocol message, produced by `ActiveStream`/`NotifierStream`
/// and consumed by `PassiveStream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// vbucket(2) + opaque(4) + start_seqno(8) + end_seqno(8) + flags(1)
    SnapshotMarker {
        vbucket: u16,
        opaque: u32,
        start_seqno: u64,
        end_seqno: u64,
        flags: SnapshotFlags,
    },
    /// vbucket(2) + opaque(4) + seqno(8) + key_len(2) + key + value_len(4) + value
    Mutation {
        vbucket: u16,
        opaque: u32,
        seqno: u64,
        key: Bytes,
        value: Bytes,
    },
    /// vbucket(2) + opaque(4) + seqno(8) + key_len(2) + key
    Deletion {
        vbucket: u16,
        opaque: u32,
        seqno: u64,
        key: Bytes,
    },
    /// vbucket(2) + opaque(4) + seqno(8) + key_len(2) + key
    Expiration {
        vbucket: u16,
        opaque: u32,
        seqno: u64,
        key: Bytes,
    },
    /// vbucket(2) + opaque(4) + state(1)
    SetVBucketState {
        vbucket: u16,
        opaque: u32,
        state: VBucketState,
    },
    /// vbucket(2) + opaque(4) + reason(1)
    StreamEnd {
        vbucket: u16,
        opaque: u32,
        reason: CloseReason,
    },
    /// vbucket(2) + opaque(4) + bytes_acked(4)
    BufferAck {
        vbucket: u16,
        opaque: u32,
        bytes_acked: u32,
    },
}

const MAX_PAYLOAD: usize = 20 * 1024 * 1024;

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::SnapshotMarker { .. } => MessageType::SnapshotMarker,
            Message::Mutation { .. } => MessageType::Mutation,
            Message::Deletion { .. } => MessageType::Deletion,
            Message::Expiration { .. } => MessageType::Expiration,
            Message::SetVBucketState { .. } => MessageType::SetVBucketState,
            Message::StreamEnd { .. } => MessageType::StreamEnd,
            Message::BufferAck { .. } => MessageType::BufferAck,
        }
    }

    pub fn vbucket(&self) -> u16 {
        match self {
            Message::SnapshotMarker { vbucket, .. }
            | Message::Mutation { vbucket, .. }
            | Message::Deletion { vbucket, .. }
            | Message::Expiration { vbucket, .. }
            | Message::SetVBucketState { vbucket, .. }
            | Message::StreamEnd { vbucket, .. }
            | Message::BufferAck { vbucket, .. } => *vbucket,
        }
    }

    pub fn opaque(&self) -> u32 {
        match self {
            Message::SnapshotMarker { opaque, .. }
            | Message::Mutation { opaque, .. }
            | Message::Deletion { opaque, .. }
            | Message::Expiration { opaque, .. }
            | Message::SetVBucketState { opaque, .. }
            | Message::StreamEnd { opaque, .. }
            | Message::BufferAck { opaque, .. } => *opaque,
        }
    }

    /// Seqno carried by this message, if any (control messages have none).
    pub fn seqno(&self) -> Option<u64> {
        match self {
            Message::Mutation { seqno, .. }
            | Message::Deletion { seqno, .. }
            | Message::Expiration { seqno, .. } => Some(*seqno),
            _ => None,
        }
    }

    /// The number of bytes this message will occupy when encoded, used to
    /// maintain `ready_queue_bytes` without re-serialising on every read.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Message::SnapshotMarker { .. } => 2 + 4 + 8 + 8 + 1,
            Message::Mutation { key, value, .. } => 2 + 4 + 8 + 2 + key.len() + 4 + value.len(),
            Message::Deletion { key, .. } | Message::Expiration { key, .. } => {
                2 + 4 + 8 + 2 + key.len()
            }
            Message::SetVBucketState { .. } => 2 + 4 + 1,
            Message::StreamEnd { .. } => 2 + 4 + 1,
            Message::BufferAck { .. } => 2 + 4 + 4,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Message::SnapshotMarker {
                vbucket,
                opaque,
                start_seqno,
                end_seqno,
                flags,
            } => {
                buf.put_u8(MessageType::SnapshotMarker as u8);
                buf.put_u16(*vbucket);
                buf.put_u32(*opaque);
                buf.put_u64(*start_seqno);
                buf.put_u64(*end_seqno);
                buf.put_u8(flags.0);
            }
            Message::Mutation {
                vbucket,
                opaque,
                seqno,
                key,
                value,
            } => {
                buf.put_u8(MessageType::Mutation as u8);
                buf.put_u16(*vbucket);
                buf.put_u32(*opaque);
                buf.put_u64(*seqno);
                buf.put_u16(key.len() as u16);
                buf.put_slice(key);
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
            }
            Message::Deletion {
                vbucket,
                opaque,
                seqno,
                key,
            } => {
                buf.put_u8(MessageType::Deletion as u8);
                buf.put_u16(*vbucket);
                buf.put_u32(*opaque);
                buf.put_u64(*seqno);
                buf.put_u16(key.len() as u16);
                buf.put_slice(key);
            }
            Message::Expiration {
                vbucket,
                opaque,
                seqno,
                key,
            } => {
                buf.put_u8(MessageType::Expiration as u8);
                buf.put_u16(*vbucket);
                buf.put_u32(*opaque);
                buf.put_u64(*seqno);
                buf.put_u16(key.len() as u16);
                buf.put_slice(key);
            }
            Message::SetVBucketState {
                vbucket,
                opaque,
                state,
            } => {
                buf.put_u8(MessageType::SetVBucketState as u8);
                buf.put_u16(*vbucket);
                buf.put_u32(*opaque);
                buf.put_u8(*state as u8);
            }
            Message::StreamEnd {
                vbucket,
                opaque,
                reason,
            } => {
                buf.put_u8(MessageType::StreamEnd as u8);
                buf.put_u16(*vbucket);
                buf.put_u32(*opaque);
                buf.put_u8(*reason as u8);
            }
            Message::BufferAck {
                vbucket,
                opaque,
                bytes_acked,
            } => {
                buf.put_u8(MessageType::BufferAck as u8);
                buf.put_u16(*vbucket);
                buf.put_u32(*opaque);
                buf.put_u32(*bytes_acked);
            }
        }
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(StreamError::FrameTooShort {
                expected: 1,
                actual: 0,
            });
        }
        let message_type = MessageType::try_from(data[0])?;
        data = &data[1..];

        match message_type {
            MessageType::SnapshotMarker => {
                ensure_len(data, 2 + 4 + 8 + 8 + 1)?;
                let vbucket = (&data[0..2]).get_u16();
                let opaque = (&data[2..6]).get_u32();
                let start_seqno = (&data[6..14]).get_u64();
                let end_seqno = (&data[14..22]).get_u64();
                let flags = SnapshotFlags(data[22]);
                Ok(Message::SnapshotMarker {
                    vbucket,
                    opaque,
                    start_seqno,
                    end_seqno,
                    flags,
                })
            }
            MessageType::Mutation => {
                ensure_len(data, 2 + 4 + 8 + 2)?;
                let vbucket = (&data[0..2]).get_u16();
                let opaque = (&data[2..6]).get_u32();
                let seqno = (&data[6..14]).get_u64();
                let key_len = (&data[14..16]).get_u16() as usize;
                let rest = &data[16..];
                ensure_len(rest, key_len + 4)?;
                let key = Bytes::copy_from_slice(&rest[..key_len]);
                let rest = &rest[key_len..];
                let value_len = (&rest[0..4]).get_u32() as usize;
                check_payload_len(value_len)?;
                let rest = &rest[4..];
                ensure_len(rest, value_len)?;
                let value = Bytes::copy_from_slice(&rest[..value_len]);
                Ok(Message::Mutation {
                    vbucket,
                    opaque,
                    seqno,
                    key,
                    value,
                })
            }
            MessageType::Deletion | MessageType::Expiration => {
                ensure_len(data, 2 + 4 + 8 + 2)?;
                let vbucket = (&data[0..2]).get_u16();
                let opaque = (&data[2..6]).get_u32();
                let seqno = (&data[6..14]).get_u64();
                let key_len = (&data[14..16]).get_u16() as usize;
                let rest = &data[16..];
                ensure_len(rest, key_len)?;
                let key = Bytes::copy_from_slice(&rest[..key_len]);
                if message_type == MessageType::Deletion {
                    Ok(Message::Deletion {
                        vbucket,
                        opaque,
                        seqno,
                        key,
                    })
                } else {
                    Ok(Message::Expiration {
                        vbucket,
                        opaque,
                        seqno,
                        key,
                    })
                }
            }
            MessageType::SetVBucketState => {
                ensure_len(data, 2 + 4 + 1)?;
                let vbucket = (&data[0..2]).get_u16();
                let opaque = (&data[2..6]).get_u32();
                let state = VBucketState::try_from(data[6])?;
                Ok(Message::SetVBucketState {
                    vbucket,
                    opaque,
                    state,
                })
            }
            MessageType::StreamEnd => {
                ensure_len(data, 2 + 4 + 1)?;
                let vbucket = (&data[0..2]).get_u16();
                let opaque = (&data[2..6]).get_u32();
                let reason = CloseReason::try_from(data[6])?;
                Ok(Message::StreamEnd {
                    vbucket,
                    opaque,
                    reason,
                })
            }
            MessageType::BufferAck => {
                ensure_len(data, 2 + 4 + 4)?;
                let vbucket = (&data[0..2]).get_u16();
                let opaque = (&data[2..6]).get_u32();
                let bytes_acked = (&data[6..10]).get_u32();
                Ok(Message::BufferAck {
                    vbucket,
                    opaque,
                    bytes_acked,
                })
            }
        }
    }
}

fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        Err(StreamError::FrameTooShort {
            expected: needed,
            actual: data.len(),
        })
    } else {
        Ok(())
    }
}

fn check_payload_len(len: usize) -> Result<()> {
    if len > MAX_PAYLOAD {
        Err(StreamError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_round_trip() {
        let msg = Message::Mutation {
            vbucket: 7,
            opaque: 42,
            seqno: 100,
            key: Bytes::from_static(b"user:1"),
            value: Bytes::from_static(b"{}"),
        };
        let encoded = msg.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(encoded.len(), msg.encoded_len());
    }

    #[test]
    fn snapshot_marker_round_trip() {
        let msg = Message::SnapshotMarker {
            vbucket: 3,
            opaque: 1,
            start_seqno: 10,
            end_seqno: 20,
            flags: SnapshotFlags::DISK,
        };
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn stream_end_round_trip() {
        let msg = Message::StreamEnd {
            vbucket: 3,
            opaque: 1,
            reason: CloseReason::Slow,
        };
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let msg = Message::Deletion {
            vbucket: 1,
            opaque: 1,
            seqno: 5,
            key: Bytes::from_static(b"k"),
        };
        let encoded = msg.encode();
        let truncated = &encoded[..encoded.len() - 1];
        assert!(Message::decode(truncated).is_err());
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let bytes = [0xEE];
        assert!(matches!(
            Message::decode(&bytes),
            Err(StreamError::UnknownMessageType(0xEE))
        ));
    }

    #[test]
    fn decode_empty_is_frame_too_short() {
        assert!(matches!(
            Message::decode(&[]),
            Err(StreamError::FrameTooShort {
                expected: 1,
                actual: 0
            })
        ));
    }

    #[test]
    fn snapshot_flags_contains() {
        let f = SnapshotFlags::DISK;
        assert!(f.contains(SnapshotFlags::DISK));
        assert!(!f.contains(SnapshotFlags::MEMORY));
        assert!(!f.is_memory());
        assert!(f.is_disk());
    }
}
