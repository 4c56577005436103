//! `ActiveStream`: the producer side. Drives backfill -> in-memory ->
//! takeover transitions and emits wire messages.
//!
//! Grounded on two pieces of the base crate: `reliable_ordered.rs`'s
//! sender/receiver pair for the idea of stitching two ordered sources into
//! one monotonic run, and `flow_control.rs`'s budget-gated `consume`/
//! `release` for the byte-budget back-pressure on both the ready queue and
//! the backfill buffer. Per the ownership note in `collaborators`, the
//! backfill manager is only ever given a `Weak` handle to this stream, so a
//! disk scan that outlives its stream simply finds nothing to call back
//! into.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::collaborators::{
    BackfillManager, BackfillSink, BackfillSource, CheckpointCursor, CheckpointManager,
    Connection, MutationItem, MutationKind, VBucket,
};
use crate::config::StreamConfig;
use crate::message::{CloseReason, Message, SnapshotFlags, SnapshotType, VBucketState};
use crate::stream::{ReadyQueue, StreamCore, StreamFlags, StreamIdentity, StreamState};

/// Whether mutations are shipped with their value or key-only (a
/// negotiated wire optimization for consumers that only need keys, e.g.
/// index builders).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    KeyOnly,
    KeyAndValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutboundSnapshot {
    start: u64,
    end: u64,
    #[allow(dead_code)]
    kind: SnapshotType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TakeoverPhase {
    NotTakingOver,
    AwaitingPendingAck,
    AwaitingActiveAck,
}

struct ActiveInner {
    queue: ReadyQueue,
    outbound_snapshot: Option<OutboundSnapshot>,
    first_marker_sent: bool,
    checkpoint_cursor: Option<Box<dyn CheckpointCursor>>,
    backfill_complete: bool,
    buffered_backfill: VecDeque<Message>,
    takeover_phase: TakeoverPhase,
    takeover_deadline: Option<Instant>,
}

/// The producer side of a replication stream for one (connection, vbucket)
/// pair.
pub struct ActiveStream {
    core: StreamCore,
    config: StreamConfig,
    payload_type: PayloadType,
    vbucket: Arc<dyn VBucket>,
    checkpoint_mgr: Arc<dyn CheckpointManager>,
    backfill_mgr: Arc<dyn BackfillManager>,
    connection: Arc<dyn Connection>,
    inner: Mutex<ActiveInner>,

    last_read_seqno: AtomicU64,
    last_sent_seqno: AtomicU64,
    backfill_items_memory: AtomicU64,
    backfill_items_disk: AtomicU64,
    items_from_memory_phase: AtomicU64,
    buffered_backfill_bytes: AtomicUsize,
}

impl ActiveStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        opaque: u32,
        vbucket_id: u16,
        flags: StreamFlags,
        start_seqno: u64,
        end_seqno: u64,
        vb_uuid: u64,
        snap_start_seqno: u64,
        snap_end_seqno: u64,
        payload_type: PayloadType,
        config: StreamConfig,
        vbucket: Arc<dyn VBucket>,
        checkpoint_mgr: Arc<dyn CheckpointManager>,
        backfill_mgr: Arc<dyn BackfillManager>,
        connection: Arc<dyn Connection>,
    ) -> Arc<Self> {
        let identity = StreamIdentity {
            name,
            opaque,
            vbucket: vbucket_id,
            flags,
            start_seqno,
            end_seqno,
            vb_uuid,
            snap_start_seqno,
            snap_end_seqno,
        };
        Arc::new(Self {
            core: StreamCore::new(identity, StreamState::Pending),
            config,
            payload_type,
            vbucket,
            checkpoint_mgr,
            backfill_mgr,
            connection,
            inner: Mutex::new(ActiveInner {
                queue: ReadyQueue::new(),
                outbound_snapshot: None,
                first_marker_sent: false,
                checkpoint_cursor: None,
                backfill_complete: false,
                buffered_backfill: VecDeque::new(),
                takeover_phase: TakeoverPhase::NotTakingOver,
                takeover_deadline: None,
            }),
            last_read_seqno: AtomicU64::new(0),
            last_sent_seqno: AtomicU64::new(0),
            backfill_items_memory: AtomicU64::new(0),
            backfill_items_disk: AtomicU64::new(0),
            items_from_memory_phase: AtomicU64::new(0),
            buffered_backfill_bytes: AtomicUsize::new(0),
        })
    }

    pub fn core(&self) -> &StreamCore {
        &self.core
    }

    pub fn last_read_seqno(&self) -> u64 {
        self.last_read_seqno.load(Ordering::Acquire)
    }

    pub fn last_sent_seqno(&self) -> u64 {
        self.last_sent_seqno.load(Ordering::Acquire)
    }

    pub fn backfill_items(&self) -> (u64, u64) {
        (
            self.backfill_items_memory.load(Ordering::Acquire),
            self.backfill_items_disk.load(Ordering::Acquire),
        )
    }

    pub fn items_from_memory_phase(&self) -> u64 {
        self.items_from_memory_phase.load(Ordering::Acquire)
    }

    fn bytes_counter(&self) -> &AtomicUsize {
        self.core.ready_queue_bytes_counter()
    }

    /// `Pending -> {Backfilling, InMemory}` per the producer's backfill
    /// policy. Must be called once, after construction, before the first
    /// `next()`.
    pub fn schedule_backfill(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if self.core.state() != StreamState::Pending {
            return;
        }
        let high = self.vbucket.high_seqno();
        let chk_start = self.checkpoint_mgr.earliest_seqno();
        let start = self.core.start_seqno();
        let end = self.core.end_seqno();

        if start > high {
            self.register_cursor(&mut inner, start);
            self.core.set_state(StreamState::InMemory);
            info!(vbucket = self.core.vbucket(), "nothing historical to replay, starting in-memory");
            return;
        }
        if start >= chk_start {
            self.register_cursor(&mut inner, start);
            self.core.set_state(StreamState::InMemory);
            info!(vbucket = self.core.vbucket(), "requested start already in checkpoint range, skipping disk");
            return;
        }

        let backfill_end = end.min(high);
        self.register_cursor(&mut inner, chk_start);
        self.core.set_state(StreamState::Backfilling);
        drop(inner);
        info!(vbucket = self.core.vbucket(), start, backfill_end, "scheduling disk backfill");
        let weak: Weak<dyn BackfillSink> = Arc::downgrade(self);
        self.backfill_mgr.schedule(self.core.vbucket(), start, backfill_end, weak);
    }

    fn register_cursor(&self, inner: &mut ActiveInner, start: u64) {
        inner.checkpoint_cursor = Some(self.checkpoint_mgr.register_cursor(start));
    }

    fn to_wire_message(&self, item: &MutationItem) -> Message {
        let vbucket = self.core.vbucket();
        let opaque = self.core.opaque();
        match item.kind {
            MutationKind::Set => Message::Mutation {
                vbucket,
                opaque,
                seqno: item.seqno,
                key: item.key.clone(),
                value: match self.payload_type {
                    PayloadType::KeyOnly => Bytes::new(),
                    PayloadType::KeyAndValue => item.value.clone().unwrap_or_default(),
                },
            },
            MutationKind::Delete => Message::Deletion {
                vbucket,
                opaque,
                seqno: item.seqno,
                key: item.key.clone(),
            },
            MutationKind::Expire => Message::Expiration {
                vbucket,
                opaque,
                seqno: item.seqno,
                key: item.key.clone(),
            },
        }
    }

    /// Single pull interface: returns the next outbound message, or `None`
    /// if nothing is ready (the caller should then wait for the
    /// `items_ready` edge).
    pub fn next(&self) -> Option<Message> {
        if !self.core.is_dead() && self.vbucket.state() != VBucketState::Active {
            let mut inner = self.inner.lock();
            self.set_dead_locked(&mut inner, CloseReason::StateChanged);
        }

        loop {
            let mut inner = self.inner.lock();
            if let Some(msg) = inner.queue.pop(self.bytes_counter()) {
                if let Some(seqno) = msg.seqno() {
                    self.last_sent_seqno.fetch_max(seqno, Ordering::AcqRel);
                }
                return Some(msg);
            }

            let produced = match self.core.state() {
                StreamState::Backfilling => self.drive_backfill(&mut inner),
                StreamState::InMemory => self.drive_in_memory(&mut inner),
                StreamState::TakeoverSend | StreamState::TakeoverWait => {
                    self.check_takeover_deadline(&mut inner)
                }
                _ => false,
            };
            if !produced {
                return None;
            }
        }
    }

    fn drive_backfill(&self, inner: &mut ActiveInner) -> bool {
        if let Some(msg) = inner.buffered_backfill.pop_front() {
            let len = msg.encoded_len();
            self.buffered_backfill_bytes.fetch_sub(len, Ordering::AcqRel);
            self.push_checked(inner, msg);
            return true;
        }
        if inner.backfill_complete {
            return self.drive_in_memory(inner);
        }
        false
    }

    fn drive_in_memory(&self, inner: &mut ActiveInner) -> bool {
        let batch = match inner.checkpoint_cursor.as_mut() {
            Some(cursor) => cursor.next_batch(self.config.checkpoint_batch_size),
            None => Vec::new(),
        };
        let mut produced = false;

        if !batch.is_empty() {
            let first = batch.first().expect("checked non-empty").seqno;
            let last = batch.last().expect("checked non-empty").seqno;
            let marker_start = if inner.first_marker_sent {
                first
            } else {
                self.core.identity.snap_start_seqno
            };
            inner.first_marker_sent = true;
            inner.outbound_snapshot = Some(OutboundSnapshot {
                start: marker_start,
                end: last,
                kind: SnapshotType::Memory,
            });
            let mut alive = self.push_checked(
                inner,
                Message::SnapshotMarker {
                    vbucket: self.core.vbucket(),
                    opaque: self.core.opaque(),
                    start_seqno: marker_start,
                    end_seqno: last,
                    flags: SnapshotFlags::MEMORY,
                },
            );
            for item in &batch {
                if !alive {
                    break;
                }
                let msg = self.to_wire_message(item);
                alive = self.push_checked(inner, msg);
            }
            if !alive {
                return true;
            }
            self.last_read_seqno.fetch_max(last, Ordering::AcqRel);
            self.items_from_memory_phase
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            if self.core.state() == StreamState::Backfilling {
                self.core.set_state(StreamState::InMemory);
            }
            produced = true;
        }

        let cursor_at_end = inner
            .checkpoint_cursor
            .as_ref()
            .map(|c| c.is_at_end())
            .unwrap_or(true);
        if cursor_at_end && self.core.state() != StreamState::Dead {
            let last_read = self.last_read_seqno.load(Ordering::Acquire);
            if self.core.flags().contains(StreamFlags::TAKEOVER) && last_read >= self.vbucket.high_seqno()
            {
                self.enter_takeover_send(inner);
                produced = true;
            } else if last_read >= self.core.end_seqno() {
                self.push_checked(
                    inner,
                    Message::StreamEnd {
                        vbucket: self.core.vbucket(),
                        opaque: self.core.opaque(),
                        reason: CloseReason::Ok,
                    },
                );
                self.core.set_state(StreamState::Dead);
                produced = true;
            }
        }
        produced
    }

    /// Pushes a message, then kills the stream with `Slow` if that push put
    /// `ready_queue_bytes` over budget — the one place resource exhaustion
    /// from the producer side is detected.
    fn push_checked(&self, inner: &mut ActiveInner, msg: Message) -> bool {
        inner.queue.push(msg, self.bytes_counter());
        if self.bytes_counter().load(Ordering::Acquire) > self.config.ready_queue_byte_limit {
            warn!(vbucket = self.core.vbucket(), "ready queue over budget, killing stream");
            self.set_dead_locked(inner, CloseReason::Slow);
            false
        } else {
            true
        }
    }

    fn enter_takeover_send(&self, inner: &mut ActiveInner) {
        inner.queue.push(
            Message::SetVBucketState {
                vbucket: self.core.vbucket(),
                opaque: self.core.opaque(),
                state: VBucketState::Pending,
            },
            self.bytes_counter(),
        );
        inner.takeover_phase = TakeoverPhase::AwaitingPendingAck;
        inner.takeover_deadline = Some(Instant::now() + self.config.takeover_max_time);
        self.core.set_state(StreamState::TakeoverSend);
        info!(vbucket = self.core.vbucket(), "entering takeover handoff");
    }

    /// The peer acknowledged the most recent `SetVBucketState`. Advances
    /// the handoff one step, or ends the stream on the final ack.
    pub fn set_vbucket_state_ack_received(&self) {
        let mut inner = self.inner.lock();
        match inner.takeover_phase {
            TakeoverPhase::AwaitingPendingAck => {
                inner.queue.push(
                    Message::SetVBucketState {
                        vbucket: self.core.vbucket(),
                        opaque: self.core.opaque(),
                        state: VBucketState::Active,
                    },
                    self.bytes_counter(),
                );
                inner.takeover_phase = TakeoverPhase::AwaitingActiveAck;
                self.core.set_state(StreamState::TakeoverWait);
            }
            TakeoverPhase::AwaitingActiveAck => {
                inner.queue.push(
                    Message::StreamEnd {
                        vbucket: self.core.vbucket(),
                        opaque: self.core.opaque(),
                        reason: CloseReason::Ok,
                    },
                    self.bytes_counter(),
                );
                inner.takeover_phase = TakeoverPhase::NotTakingOver;
                inner.takeover_deadline = None;
                self.core.set_state(StreamState::Dead);
                info!(vbucket = self.core.vbucket(), "takeover handoff complete");
            }
            TakeoverPhase::NotTakingOver => {}
        }
    }

    fn check_takeover_deadline(&self, inner: &mut ActiveInner) -> bool {
        let Some(deadline) = inner.takeover_deadline else {
            return false;
        };
        if Instant::now() < deadline {
            return false;
        }
        warn!(vbucket = self.core.vbucket(), "takeover handoff exceeded its deadline");
        inner.takeover_deadline = None;
        inner.takeover_phase = TakeoverPhase::NotTakingOver;
        inner.queue.push(
            Message::StreamEnd {
                vbucket: self.core.vbucket(),
                opaque: self.core.opaque(),
                reason: CloseReason::Closed,
            },
            self.bytes_counter(),
        );
        self.core.set_state(StreamState::Dead);
        true
    }

    fn set_dead_locked(&self, inner: &mut ActiveInner, reason: CloseReason) -> usize {
        if self.core.is_dead() {
            return 0;
        }
        let freed = inner.queue.clear(self.bytes_counter());
        inner.buffered_backfill.clear();
        self.buffered_backfill_bytes.store(0, Ordering::Release);
        self.core.set_state(StreamState::Dead);
        inner.queue.push(
            Message::StreamEnd {
                vbucket: self.core.vbucket(),
                opaque: self.core.opaque(),
                reason,
            },
            self.bytes_counter(),
        );
        freed
    }

    /// Transitions to Dead, reporting how many bytes the discarded ready
    /// queue held. Idempotent.
    pub fn set_dead(&self, reason: CloseReason) -> usize {
        let mut inner = self.inner.lock();
        self.set_dead_locked(&mut inner, reason)
    }

    /// Hint that a new mutation is available at `seqno` — wakes anything
    /// blocked on `items_ready` via the connection if the ready queue was
    /// empty.
    pub fn notify_seqno_available(&self, seqno: u64) {
        if seqno > self.vbucket.high_seqno() {
            return;
        }
        self.connection.schedule_notify(self.core.vbucket());
    }
}

impl BackfillSink for ActiveStream {
    fn mark_disk_snapshot(&self, start: u64, end: u64) {
        let mut inner = self.inner.lock();
        inner.first_marker_sent = true;
        inner.outbound_snapshot = Some(OutboundSnapshot {
            start,
            end,
            kind: SnapshotType::Disk,
        });
        inner.queue.push(
            Message::SnapshotMarker {
                vbucket: self.core.vbucket(),
                opaque: self.core.opaque(),
                start_seqno: start,
                end_seqno: end,
                flags: SnapshotFlags::DISK,
            },
            self.bytes_counter(),
        );
        drop(inner);
        self.connection.schedule_notify(self.core.vbucket());
    }

    fn backfill_received(&self, item: MutationItem, source: BackfillSource) -> bool {
        match source {
            BackfillSource::Disk => {
                self.backfill_items_disk.fetch_add(1, Ordering::Relaxed);
            }
            BackfillSource::Memory => {
                self.backfill_items_memory.fetch_add(1, Ordering::Relaxed);
            }
        }
        let msg = self.to_wire_message(&item);
        let len = msg.encoded_len();
        let mut inner = self.inner.lock();
        let projected = self.buffered_backfill_bytes.load(Ordering::Acquire) + len;
        if projected > self.config.backfill_buffer_byte_limit {
            debug!(vbucket = self.core.vbucket(), projected, "backfill buffer over budget, pausing task");
            return false;
        }
        self.buffered_backfill_bytes.fetch_add(len, Ordering::AcqRel);
        inner.buffered_backfill.push_back(msg);
        self.last_read_seqno.fetch_max(item.seqno, Ordering::AcqRel);
        drop(inner);
        self.connection.schedule_notify(self.core.vbucket());
        true
    }

    fn complete_backfill(&self) {
        let mut inner = self.inner.lock();
        inner.backfill_complete = true;
        drop(inner);
        self.connection.schedule_notify(self.core.vbucket());
    }

    fn backfill_failed(&self) {
        let mut inner = self.inner.lock();
        warn!(vbucket = self.core.vbucket(), "disk backfill failed");
        self.set_dead_locked(&mut inner, CloseReason::Closed);
    }
}
