//! Shared stream identity, state, and ready-queue machinery.
//!
//! A `Stream` in the wider sense is one of [`active::ActiveStream`],
//! [`notifier::NotifierStream`], or [`passive::PassiveStream`]. Rust has no
//! base class to hang shared state off, so instead each of the three embeds
//! a [`StreamCore`] (identity + atomic state + the ready-queue byte counter)
//! and its own `parking_lot::Mutex`-guarded inner struct that pairs the
//! [`ReadyQueue`] with whatever phase-specific state must change atomically
//! alongside it — mirroring the discipline in the concurrency model: ready
//! queue, `items_ready`, and snapshot windows are one critical section.

pub mod active;
pub mod notifier;
pub mod passive;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::message::Message;

/// Sentinel meaning "until the stream is explicitly closed".
pub const MAX_SEQNO: u64 = u64::MAX;

/// Flags negotiated at stream-open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags(pub u32);

impl StreamFlags {
    pub const NONE: Self = Self(0);
    pub const TAKEOVER: Self = Self(0x01);
    pub const DISK_ONLY: Self = Self(0x02);
    pub const LATEST_ONLY: Self = Self(0x04);
    pub const NO_VALUE: Self = Self(0x08);

    pub fn contains(self, flag: StreamFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

/// Fields fixed for the lifetime of a stream, with one exception: `opaque`
/// is only the value at construction time. A `PassiveStream` may have its
/// opaque reassigned when the transport reconnects (`reconnect_stream`) or
/// accepts a stream under a different add-stream opaque (`accept_stream`);
/// the live value lives in [`StreamCore`]'s atomic, not here.
#[derive(Debug, Clone)]
pub struct StreamIdentity {
    pub name: String,
    pub opaque: u32,
    pub vbucket: u16,
    pub flags: StreamFlags,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub vb_uuid: u64,
    /// Snapshot boundaries the peer reported being mid-way through when it
    /// last disconnected, used by the owner to decide whether a rollback is
    /// needed before this stream is even constructed.
    pub snap_start_seqno: u64,
    pub snap_end_seqno: u64,
}

/// States shared across all three stream variants. Not every state is
/// reachable from every variant: see `active`/`notifier`/`passive` for the
/// transition graph each actually implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Pending = 0,
    Backfilling = 1,
    InMemory = 2,
    TakeoverSend = 3,
    TakeoverWait = 4,
    Reading = 5,
    Dead = 6,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StreamState::Pending,
            1 => StreamState::Backfilling,
            2 => StreamState::InMemory,
            3 => StreamState::TakeoverSend,
            4 => StreamState::TakeoverWait,
            5 => StreamState::Reading,
            6 => StreamState::Dead,
            _ => unreachable!("invalid StreamState byte {v}"),
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Pending => write!(f, "pending"),
            StreamState::Backfilling => write!(f, "backfilling"),
            StreamState::InMemory => write!(f, "in-memory"),
            StreamState::TakeoverSend => write!(f, "takeover-send"),
            StreamState::TakeoverWait => write!(f, "takeover-wait"),
            StreamState::Reading => write!(f, "reading"),
            StreamState::Dead => write!(f, "dead"),
        }
    }
}

/// Identity + atomic bookkeeping shared by all stream variants.
///
/// `state` is written only while the owner holds its `stream_mutex`, but may
/// be read without it — a reader may observe a value that is stale by one
/// transition, which every writer re-checking state under the lock is
/// required to tolerate (see the concurrency notes in each variant).
pub struct StreamCore {
    pub identity: StreamIdentity,
    state: AtomicU8,
    opaque: AtomicU32,
    ready_queue_bytes: AtomicUsize,
}

impl StreamCore {
    pub fn new(identity: StreamIdentity, initial_state: StreamState) -> Self {
        let opaque = AtomicU32::new(identity.opaque);
        Self {
            identity,
            state: AtomicU8::new(initial_state as u8),
            opaque,
            ready_queue_bytes: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn opaque(&self) -> u32 {
        self.opaque.load(Ordering::Acquire)
    }

    pub fn vbucket(&self) -> u16 {
        self.identity.vbucket
    }

    pub fn flags(&self) -> StreamFlags {
        self.identity.flags
    }

    pub fn start_seqno(&self) -> u64 {
        self.identity.start_seqno
    }

    pub fn end_seqno(&self) -> u64 {
        self.identity.end_seqno
    }

    pub fn vb_uuid(&self) -> u64 {
        self.identity.vb_uuid
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_dead(&self) -> bool {
        self.state() == StreamState::Dead
    }

    pub fn ready_queue_bytes(&self) -> usize {
        self.ready_queue_bytes.load(Ordering::Acquire)
    }

    /// Must only be called while the owner holds its `stream_mutex`.
    pub(crate) fn set_state(&self, new: StreamState) {
        self.state.store(new as u8, Ordering::Release);
    }

    /// Reassigns the live opaque, e.g. on reconnect or a re-accepted stream.
    /// Must only be called while the owner holds its `stream_mutex`.
    pub(crate) fn set_opaque(&self, new: u32) {
        self.opaque.store(new, Ordering::Release);
    }

    pub(crate) fn ready_queue_bytes_counter(&self) -> &AtomicUsize {
        &self.ready_queue_bytes
    }
}

/// The outbound message queue plus its empty-to-nonempty edge trigger.
/// Always accessed while the owner's `stream_mutex` is held.
#[derive(Default)]
pub struct ReadyQueue {
    items: VecDeque<Message>,
    items_ready: bool,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message, updating `bytes` alongside. Returns `true` on the
    /// empty-to-nonempty edge so callers can wake a waiting connection
    /// exactly once.
    pub fn push(&mut self, msg: Message, bytes: &AtomicUsize) -> bool {
        let was_empty = self.items.is_empty();
        bytes.fetch_add(msg.encoded_len(), Ordering::AcqRel);
        self.items.push_back(msg);
        let edge = was_empty && !self.items_ready;
        self.items_ready = true;
        edge
    }

    pub fn pop(&mut self, bytes: &AtomicUsize) -> Option<Message> {
        let msg = self.items.pop_front()?;
        bytes.fetch_sub(msg.encoded_len(), Ordering::AcqRel);
        if self.items.is_empty() {
            self.items_ready = false;
        }
        Some(msg)
    }

    pub fn peek(&self) -> Option<&Message> {
        self.items.front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Drains the queue, returning the total bytes freed.
    pub fn clear(&mut self, bytes: &AtomicUsize) -> usize {
        let freed: usize = self.items.iter().map(Message::encoded_len).sum();
        self.items.clear();
        self.items_ready = false;
        bytes.fetch_sub(freed, Ordering::AcqRel);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg(seqno: u64) -> Message {
        Message::Mutation {
            vbucket: 0,
            opaque: 0,
            seqno,
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
        }
    }

    #[test]
    fn ready_queue_tracks_bytes_and_edge_trigger() {
        let bytes = AtomicUsize::new(0);
        let mut q = ReadyQueue::new();
        assert!(q.push(msg(1), &bytes));
        assert!(!q.push(msg(2), &bytes));
        assert_eq!(bytes.load(Ordering::Acquire), msg(1).encoded_len() + msg(2).encoded_len());

        q.pop(&bytes);
        assert_eq!(bytes.load(Ordering::Acquire), msg(2).encoded_len());
        q.pop(&bytes);
        assert_eq!(bytes.load(Ordering::Acquire), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn ready_queue_clear_frees_all_bytes() {
        let bytes = AtomicUsize::new(0);
        let mut q = ReadyQueue::new();
        q.push(msg(1), &bytes);
        q.push(msg(2), &bytes);
        let freed = q.clear(&bytes);
        assert_eq!(freed, msg(1).encoded_len() + msg(2).encoded_len());
        assert_eq!(bytes.load(Ordering::Acquire), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn state_round_trips_through_core() {
        let identity = StreamIdentity {
            name: "test".into(),
            opaque: 1,
            vbucket: 0,
            flags: StreamFlags::NONE,
            start_seqno: 0,
            end_seqno: MAX_SEQNO,
            vb_uuid: 1,
            snap_start_seqno: 0,
            snap_end_seqno: 0,
        };
        let core = StreamCore::new(identity, StreamState::Pending);
        assert_eq!(core.state(), StreamState::Pending);
        core.set_state(StreamState::Backfilling);
        assert_eq!(core.state(), StreamState::Backfilling);
        assert!(!core.is_dead());
        core.set_state(StreamState::Dead);
        assert!(core.is_dead());
    }
}
