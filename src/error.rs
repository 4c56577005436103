use thiserror::Error;

/// All errors produced by the replication stream state machine.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unknown message opcode: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("unknown close reason code: 0x{0:02x}")]
    InvalidCloseReason(u8),

    #[error("unknown snapshot type flag: 0x{0:02x}")]
    InvalidSnapshotType(u8),

    #[error("vbucket {0} not found")]
    StreamNotFound(u16),

    #[error("vbucket {0} already has a stream")]
    StreamAlreadyExists(u16),

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: &'static str, to: &'static str },

    #[error("stream for vbucket {0} is dead")]
    StreamDead(u16),

    #[error(
        "snapshot not yet consumed on vbucket {vbucket}: last_seqno={last_seqno} < snap_end={snap_end}"
    )]
    SnapshotNotConsumed {
        vbucket: u16,
        last_seqno: u64,
        snap_end: u64,
    },

    #[error(
        "seqno {seqno} outside current snapshot [{snap_start}, {snap_end}] on vbucket {vbucket}"
    )]
    SeqnoOutOfSnapshot {
        vbucket: u16,
        seqno: u64,
        snap_start: u64,
        snap_end: u64,
    },

    #[error("duplicate or regressed seqno {seqno} on vbucket {vbucket}: last_seqno={last_seqno}")]
    DuplicateOrOldSeqno {
        vbucket: u16,
        seqno: u64,
        last_seqno: u64,
    },

    #[error("ready queue over budget on vbucket {vbucket}: {bytes} bytes exceeds {max}")]
    ReadyQueueOverflow {
        vbucket: u16,
        bytes: usize,
        max: usize,
    },

    #[error("backfill buffer over budget on vbucket {vbucket}: {bytes} bytes exceeds {max}")]
    BackfillBufferOverflow {
        vbucket: u16,
        bytes: usize,
        max: usize,
    },

    #[error("consumer buffer over budget on vbucket {vbucket}: {bytes} bytes exceeds {max}")]
    ConsumerBufferOverflow {
        vbucket: u16,
        bytes: usize,
        max: usize,
    },

    #[error("takeover handoff on vbucket {0} exceeded its deadline")]
    TakeoverTimedOut(u16),

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
