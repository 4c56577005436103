//! Trait boundaries for everything this crate treats as an external
//! collaborator: the vbucket, the checkpoint manager, the backfill manager,
//! and the owning connection.
//!
//! None of these are implemented here beyond simple in-memory mocks used by
//! the test suite — production implementations live in the storage engine,
//! the scheduler, and the transport layer. The shape of the boundary mirrors
//! the pluggable sender/receiver pair the base crate uses per transport mode:
//! a small trait object resolved once at construction, rather than a generic
//! parameter threaded through every type.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::message::VBucketState;

/// A single in-memory mutation as handed to the stream by either the
/// checkpoint cursor or the backfill manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationItem {
    pub seqno: u64,
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub kind: MutationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Set,
    Delete,
    Expire,
}

/// One entry of a vbucket's failover history: an epoch identifier paired
/// with the seqno at which that epoch began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverEntry {
    pub vb_uuid: u64,
    pub seqno: u64,
}

/// Most-recent-first lineage record. Only read by this crate, never
/// mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverTable(pub Vec<FailoverEntry>);

impl FailoverTable {
    pub fn current_uuid(&self) -> Option<u64> {
        self.0.first().map(|e| e.vb_uuid)
    }
}

/// Read-only view onto the vbucket this stream replicates.
pub trait VBucket: Send + Sync {
    fn state(&self) -> VBucketState;
    fn high_seqno(&self) -> u64;
    fn failover_table(&self) -> FailoverTable;
    fn manifest_uid(&self) -> u64;
}

/// A cursor registered into the checkpoint manager at some starting seqno.
/// Each `ActiveStream` owns exactly one.
pub trait CheckpointCursor: Send {
    /// Pull up to `max_items` consecutive mutations. May return fewer than
    /// requested even when more will eventually arrive.
    fn next_batch(&mut self, max_items: usize) -> Vec<MutationItem>;
    /// Whether the cursor has caught up with the checkpoint's current tail.
    fn is_at_end(&self) -> bool;
    /// Highest seqno this cursor has yielded so far (0 if none yet).
    fn position(&self) -> u64;
}

/// Registers cursors for active streams.
pub trait CheckpointManager: Send + Sync {
    /// Earliest seqno still retained in memory.
    fn earliest_seqno(&self) -> u64;
    fn register_cursor(&self, start_seqno: u64) -> Box<dyn CheckpointCursor>;
}

/// Where a backfilled item came from — affects stats bucketing only, not
/// ordering (the stream stitches both sources into one monotonic run).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillSource {
    Memory,
    Disk,
}

/// The callback surface a scheduled backfill task drives. `ActiveStream`
/// implements this; the backfill manager holds only a `Weak` reference to
/// it, per the ownership note in [`crate::stream::active`] — a backfill
/// task outliving its stream simply finds the weak reference gone and
/// drops the work instead of resurrecting a dead stream.
pub trait BackfillSink: Send + Sync {
    fn mark_disk_snapshot(&self, start: u64, end: u64);
    /// Returns `false` to ask the task to pause (buffer over budget).
    fn backfill_received(&self, item: MutationItem, source: BackfillSource) -> bool;
    fn complete_backfill(&self);
    fn backfill_failed(&self);
}

/// Schedules asynchronous disk scans. `schedule` returns once the scan is
/// queued; results arrive later via the `BackfillSink` the stream passed in.
pub trait BackfillManager: Send + Sync {
    fn schedule(&self, vbucket: u16, start: u64, end: u64, sink: Weak<dyn BackfillSink>);
}

/// Outcome of handing one applied message to the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Temporary failure (e.g. momentary OOM). The caller must reschedule
    /// without tearing the stream down.
    Transient,
}

/// The consumer-side storage engine a `PassiveStream` applies mutations
/// into. Out of scope for this crate beyond this contract.
pub trait MutationSink: Send + Sync {
    fn apply(&self, item: &MutationItem) -> ApplyOutcome;
    /// Called when a disk-sourced snapshot is fully consumed, so the engine
    /// can promote it into its own checkpoint history.
    fn flush_snapshot(&self, vbucket: u16, start: u64, end: u64);
}

/// The owning connection: drains the ready queue and carries wire framing.
pub trait Connection: Send + Sync {
    fn notify_paused(&self, vbucket: u16);
    fn notify_resumed(&self, vbucket: u16);
    /// Ask the connection to poll this stream's `next()` again soon (an
    /// `items_ready` edge fired with nothing currently listening).
    fn schedule_notify(&self, vbucket: u16);
}

/// In-memory `CheckpointManager` + `CheckpointCursor` used by tests: a
/// fixed, pre-populated run of mutations, served out in order from
/// whatever seqno a cursor is registered at.
pub struct InMemoryCheckpointManager {
    items: Arc<Vec<MutationItem>>,
    earliest: u64,
}

impl InMemoryCheckpointManager {
    /// `earliest` is the lowest seqno this checkpoint can still serve —
    /// pass `0` to mean "everything since vbucket creation is in memory",
    /// or the first retained item's seqno once older history has been
    /// evicted to disk.
    pub fn new(items: Vec<MutationItem>, earliest: u64) -> Self {
        Self {
            items: Arc::new(items),
            earliest,
        }
    }
}

impl CheckpointManager for InMemoryCheckpointManager {
    fn earliest_seqno(&self) -> u64 {
        self.earliest
    }

    fn register_cursor(&self, start_seqno: u64) -> Box<dyn CheckpointCursor> {
        let idx = self
            .items
            .iter()
            .position(|i| i.seqno >= start_seqno)
            .unwrap_or(self.items.len());
        Box::new(InMemoryCheckpointCursor {
            items: self.items.clone(),
            idx,
            position: start_seqno.saturating_sub(1),
        })
    }
}

struct InMemoryCheckpointCursor {
    items: Arc<Vec<MutationItem>>,
    idx: usize,
    position: u64,
}

impl CheckpointCursor for InMemoryCheckpointCursor {
    fn next_batch(&mut self, max_items: usize) -> Vec<MutationItem> {
        let end = (self.idx + max_items).min(self.items.len());
        let batch: Vec<MutationItem> = self.items[self.idx..end].to_vec();
        self.idx = end;
        if let Some(last) = batch.last() {
            self.position = last.seqno;
        }
        batch
    }

    fn is_at_end(&self) -> bool {
        self.idx >= self.items.len()
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Records every scheduled range so tests can assert on backfill requests,
/// then lets the test drive the sink manually (there is no real disk scan
/// behind it).
#[derive(Default)]
pub struct RecordingBackfillManager {
    pub scheduled: Mutex<Vec<(u16, u64, u64)>>,
}

impl BackfillManager for RecordingBackfillManager {
    fn schedule(&self, vbucket: u16, start: u64, end: u64, _sink: Weak<dyn BackfillSink>) {
        self.scheduled.lock().push((vbucket, start, end));
    }
}

/// Records connection notifications for assertions; never panics on
/// concurrent use so it's safe to share across threads in tests.
#[derive(Default)]
pub struct RecordingConnection {
    pub paused: Mutex<VecDeque<u16>>,
    pub resumed: Mutex<VecDeque<u16>>,
    pub notified: Mutex<VecDeque<u16>>,
}

impl Connection for RecordingConnection {
    fn notify_paused(&self, vbucket: u16) {
        self.paused.lock().push_back(vbucket);
    }

    fn notify_resumed(&self, vbucket: u16) {
        self.resumed.lock().push_back(vbucket);
    }

    fn schedule_notify(&self, vbucket: u16) {
        self.notified.lock().push_back(vbucket);
    }
}

/// Simple fixed-state `VBucket` mock; `high_seqno` is an atomic so tests can
/// advance it mid-scenario without rebuilding the stream.
pub struct FixedVBucket {
    state: VBucketState,
    high_seqno: AtomicU64,
    failover_table: FailoverTable,
    manifest_uid: u64,
}

impl FixedVBucket {
    pub fn new(state: VBucketState, high_seqno: u64) -> Self {
        Self {
            state,
            high_seqno: AtomicU64::new(high_seqno),
            failover_table: FailoverTable(vec![FailoverEntry {
                vb_uuid: 1,
                seqno: 0,
            }]),
            manifest_uid: 0,
        }
    }

    pub fn set_high_seqno(&self, seqno: u64) {
        self.high_seqno.store(seqno, Ordering::Release);
    }
}

impl VBucket for FixedVBucket {
    fn state(&self) -> VBucketState {
        self.state
    }

    fn high_seqno(&self) -> u64 {
        self.high_seqno.load(Ordering::Acquire)
    }

    fn failover_table(&self) -> FailoverTable {
        self.failover_table.clone()
    }

    fn manifest_uid(&self) -> u64 {
        self.manifest_uid
    }
}

/// Records every applied item and every snapshot flush; always reports
/// `Applied` unless primed to fail the next N calls.
pub struct RecordingMutationSink {
    pub applied: Mutex<Vec<MutationItem>>,
    pub flushed: Mutex<Vec<(u16, u64, u64)>>,
    fail_next: AtomicU64,
}

impl Default for RecordingMutationSink {
    fn default() -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            flushed: Mutex::new(Vec::new()),
            fail_next: AtomicU64::new(0),
        }
    }
}

impl RecordingMutationSink {
    pub fn fail_next_n(&self, n: u64) {
        self.fail_next.store(n, Ordering::Release);
    }
}

impl MutationSink for RecordingMutationSink {
    fn apply(&self, item: &MutationItem) -> ApplyOutcome {
        let remaining = self.fail_next.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::Release);
            return ApplyOutcome::Transient;
        }
        self.applied.lock().push(item.clone());
        ApplyOutcome::Applied
    }

    fn flush_snapshot(&self, vbucket: u16, start: u64, end: u64) {
        self.flushed.lock().push((vbucket, start, end));
    }
}
