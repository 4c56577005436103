//! `PassiveStream`: the consumer side. Validates and applies inbound
//! messages, buffering under back-pressure.
//!
//! The buffer is guarded by its own `buffer_mutex`, deliberately separate
//! from the `stream_mutex` that guards snapshot/seqno state — the lock
//! order is always `stream_mutex` before `buffer_mutex`, mirrored here by
//! never taking `inner` while `buffer` is held. `messageReceived` is the
//! one place both are touched, and it always acquires `inner` first only
//! to decide whether to buffer, releasing it before touching `buffer`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::collaborators::{ApplyOutcome, MutationItem, MutationKind, MutationSink};
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::message::{CloseReason, Message, SnapshotFlags, SnapshotType};
use crate::stream::{StreamCore, StreamFlags, StreamIdentity, StreamState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SnapshotWindow {
    start: u64,
    end: u64,
    kind: SnapshotType,
    ack: bool,
}

struct PassiveInner {
    last_seqno: u64,
    snapshot: Option<SnapshotWindow>,
    /// Encoded bytes of mutations applied since the current snapshot's
    /// `SnapshotMarker`, reported back to the producer in `BufferAck`.
    snapshot_bytes_processed: usize,
    /// Control messages (buffer-ack, add-stream responses) awaiting pickup.
    control_queue: VecDeque<Message>,
}

struct BufferedEntry {
    msg: Message,
    bytes: usize,
}

struct Buffer {
    items: VecDeque<BufferedEntry>,
    bytes: usize,
}

impl Buffer {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            bytes: 0,
        }
    }

    fn push(&mut self, msg: Message) {
        let bytes = msg.encoded_len();
        self.bytes += bytes;
        self.items.push_back(BufferedEntry { msg, bytes });
    }

    fn clear(&mut self) -> usize {
        let freed = self.bytes;
        self.items.clear();
        self.bytes = 0;
        freed
    }
}

/// Result of draining the buffer, mirroring the three outcomes the spec
/// distinguishes: fully drained, more work remains, or a fatal apply error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    AllProcessed,
    MoreToProcess,
    CannotProcess,
}

pub struct PassiveStream {
    core: StreamCore,
    config: StreamConfig,
    sink: Arc<dyn MutationSink>,
    inner: Mutex<PassiveInner>,
    buffer: Mutex<Buffer>,
}

impl PassiveStream {
    pub fn new(
        name: String,
        opaque: u32,
        vbucket: u16,
        start_seqno: u64,
        end_seqno: u64,
        config: StreamConfig,
        sink: Arc<dyn MutationSink>,
    ) -> Self {
        let identity = StreamIdentity {
            name,
            opaque,
            vbucket,
            flags: StreamFlags::NONE,
            start_seqno,
            end_seqno,
            vb_uuid: 0,
            snap_start_seqno: start_seqno,
            snap_end_seqno: start_seqno,
        };
        Self {
            core: StreamCore::new(identity, StreamState::Pending),
            config,
            sink,
            inner: Mutex::new(PassiveInner {
                last_seqno: start_seqno.saturating_sub(1),
                snapshot: None,
                snapshot_bytes_processed: 0,
                control_queue: VecDeque::new(),
            }),
            buffer: Mutex::new(Buffer::new()),
        }
    }

    pub fn core(&self) -> &StreamCore {
        &self.core
    }

    pub fn last_seqno(&self) -> u64 {
        self.inner.lock().last_seqno
    }

    /// `Pending -> Reading` on `status == Ok`, adopting `add_opaque` as the
    /// stream's live opaque; any other status maps to a `CloseReason` and
    /// the stream dies immediately.
    pub fn accept_stream(&self, status_ok: bool, add_opaque: u32, close_reason_if_failed: CloseReason) {
        let mut inner = self.inner.lock();
        if self.core.state() != StreamState::Pending {
            return;
        }
        if status_ok {
            self.core.set_opaque(add_opaque);
            self.core.set_state(StreamState::Reading);
        } else {
            self.core.set_state(StreamState::Dead);
            inner.control_queue.clear();
        }
    }

    /// Validates and either applies immediately (buffer empty and sink not
    /// backed up) or appends to the back-pressure buffer.
    pub fn message_received(&self, msg: Message) -> Result<()> {
        if self.core.is_dead() {
            return Ok(());
        }

        if let Message::SnapshotMarker {
            start_seqno,
            end_seqno,
            flags,
            ..
        } = &msg
        {
            let mut inner = self.inner.lock();
            if let Some(win) = inner.snapshot {
                if inner.last_seqno < win.end {
                    self.protocol_violation(&mut inner, StreamError::SnapshotNotConsumed {
                        vbucket: self.core.vbucket(),
                        last_seqno: inner.last_seqno,
                        snap_end: win.end,
                    });
                    return Ok(());
                }
            }
            inner.snapshot = Some(SnapshotWindow {
                start: *start_seqno,
                end: *end_seqno,
                kind: if flags.is_disk() {
                    SnapshotType::Disk
                } else {
                    SnapshotType::Memory
                },
                ack: flags.contains(SnapshotFlags::ACK),
            });
            inner.snapshot_bytes_processed = 0;
            return Ok(());
        }

        if let Some(seqno) = msg.seqno() {
            let mut inner = self.inner.lock();
            let Some(win) = inner.snapshot else {
                self.protocol_violation(&mut inner, StreamError::SeqnoOutOfSnapshot {
                    vbucket: self.core.vbucket(),
                    seqno,
                    snap_start: 0,
                    snap_end: 0,
                });
                return Ok(());
            };
            if seqno < win.start || seqno > win.end {
                self.protocol_violation(&mut inner, StreamError::SeqnoOutOfSnapshot {
                    vbucket: self.core.vbucket(),
                    seqno,
                    snap_start: win.start,
                    snap_end: win.end,
                });
                return Ok(());
            }
            if seqno <= inner.last_seqno {
                self.protocol_violation(&mut inner, StreamError::DuplicateOrOldSeqno {
                    vbucket: self.core.vbucket(),
                    seqno,
                    last_seqno: inner.last_seqno,
                });
                return Ok(());
            }
            drop(inner);
        }

        let buffered_first = {
            let buffer = self.buffer.lock();
            !buffer.items.is_empty()
        };

        if buffered_first {
            self.enqueue_buffered(msg)?;
        } else {
            match self.apply_one(&msg) {
                ApplyOutcome::Applied => {
                    self.advance_after_apply(&msg);
                }
                ApplyOutcome::Transient => {
                    self.enqueue_buffered(msg)?;
                }
            }
        }
        Ok(())
    }

    fn protocol_violation(&self, inner: &mut PassiveInner, err: StreamError) {
        warn!(vbucket = self.core.vbucket(), error = %err, "passive protocol violation");
        self.core.set_state(StreamState::Dead);
        inner.control_queue.clear();
        inner.snapshot = None;
        drop(inner);
        let freed = self.buffer.lock().clear();
        debug!(vbucket = self.core.vbucket(), freed, "buffer cleared after protocol violation");
    }

    fn enqueue_buffered(&self, msg: Message) -> Result<()> {
        let mut buffer = self.buffer.lock();
        let projected = buffer.bytes + msg.encoded_len();
        if projected > self.config.consumer_buffer_byte_limit {
            drop(buffer);
            let mut inner = self.inner.lock();
            self.protocol_violation_slow(&mut inner, projected);
            return Err(StreamError::ConsumerBufferOverflow {
                vbucket: self.core.vbucket(),
                bytes: projected,
                max: self.config.consumer_buffer_byte_limit,
            });
        }
        buffer.push(msg);
        Ok(())
    }

    fn protocol_violation_slow(&self, inner: &mut PassiveInner, bytes: usize) {
        warn!(vbucket = self.core.vbucket(), bytes, "consumer buffer over budget");
        self.core.set_state(StreamState::Dead);
        inner.control_queue.clear();
    }

    fn apply_one(&self, msg: &Message) -> ApplyOutcome {
        let item = to_mutation_item(msg);
        self.sink.apply(&item)
    }

    fn advance_after_apply(&self, msg: &Message) {
        let Some(seqno) = msg.seqno() else { return };
        let mut inner = self.inner.lock();
        inner.last_seqno = seqno;
        inner.snapshot_bytes_processed += msg.encoded_len();
        if let Some(win) = inner.snapshot {
            if seqno == win.end {
                self.handle_snapshot_end_locked(&mut inner, win);
            }
        }
    }

    fn handle_snapshot_end_locked(&self, inner: &mut PassiveInner, win: SnapshotWindow) {
        if win.kind == SnapshotType::Disk {
            self.sink.flush_snapshot(self.core.vbucket(), win.start, win.end);
        }
        let bytes_acked = std::mem::take(&mut inner.snapshot_bytes_processed);
        if win.ack {
            inner.control_queue.push_back(Message::BufferAck {
                vbucket: self.core.vbucket(),
                opaque: self.core.opaque(),
                bytes_acked: bytes_acked as u32,
            });
        }
        inner.snapshot = None;
    }

    /// Drains up to `process_batch_size` bytes from the buffer, applying
    /// each entry in order. Stops early on a fatal apply error.
    pub fn process_buffered_messages(&self, processed_bytes: &mut usize) -> ProcessOutcome {
        *processed_bytes = 0;
        loop {
            if *processed_bytes >= self.config.process_batch_size {
                return ProcessOutcome::MoreToProcess;
            }
            let entry = {
                let mut buffer = self.buffer.lock();
                let entry = buffer.items.pop_front();
                if let Some(e) = &entry {
                    buffer.bytes -= e.bytes;
                }
                entry
            };
            let Some(entry) = entry else {
                return ProcessOutcome::AllProcessed;
            };
            *processed_bytes += entry.bytes;

            if matches!(entry.msg, Message::SnapshotMarker { .. }) {
                continue;
            }

            match self.apply_one(&entry.msg) {
                ApplyOutcome::Applied => {
                    self.advance_after_apply(&entry.msg);
                }
                ApplyOutcome::Transient => {
                    let mut buffer = self.buffer.lock();
                    buffer.bytes += entry.bytes;
                    buffer.items.push_front(entry);
                    return ProcessOutcome::CannotProcess;
                }
            }
        }
    }

    /// `next()` for the consumer: control messages only (buffer-ack,
    /// add-stream response). Mutations are applied, never re-emitted.
    pub fn next(&self) -> Option<Message> {
        self.inner.lock().control_queue.pop_front()
    }

    /// Resets identity for a re-established transport while keeping the
    /// stream object itself: clears buffer, returns to Pending.
    pub fn reconnect_stream(&self, new_opaque: u32, start_seqno: u64) {
        let mut inner = self.inner.lock();
        inner.snapshot = None;
        inner.control_queue.clear();
        inner.last_seqno = start_seqno.saturating_sub(1);
        drop(inner);
        self.buffer.lock().clear();
        self.core.set_opaque(new_opaque);
        self.core.set_state(StreamState::Pending);
    }
}

fn to_mutation_item(msg: &Message) -> MutationItem {
    match msg {
        Message::Mutation {
            seqno, key, value, ..
        } => MutationItem {
            seqno: *seqno,
            key: key.clone(),
            value: Some(value.clone()),
            kind: MutationKind::Set,
        },
        Message::Deletion { seqno, key, .. } => MutationItem {
            seqno: *seqno,
            key: key.clone(),
            value: None,
            kind: MutationKind::Delete,
        },
        Message::Expiration { seqno, key, .. } => MutationItem {
            seqno: *seqno,
            key: key.clone(),
            value: None,
            kind: MutationKind::Expire,
        },
        other => unreachable!("non-mutation message passed to apply path: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::RecordingMutationSink;
    use bytes::Bytes;

    fn marker(start: u64, end: u64) -> Message {
        Message::SnapshotMarker {
            vbucket: 0,
            opaque: 1,
            start_seqno: start,
            end_seqno: end,
            flags: SnapshotFlags::MEMORY,
        }
    }

    fn mutation(seqno: u64) -> Message {
        Message::Mutation {
            vbucket: 0,
            opaque: 1,
            seqno,
            key: Bytes::from(format!("k{seqno}")),
            value: Bytes::from_static(b"v"),
        }
    }

    fn stream() -> (PassiveStream, Arc<RecordingMutationSink>) {
        let sink = Arc::new(RecordingMutationSink::default());
        let s = PassiveStream::new(
            "p".into(),
            1,
            0,
            0,
            100,
            StreamConfig::default(),
            sink.clone(),
        );
        s.accept_stream(true, 1, CloseReason::Closed);
        (s, sink)
    }

    #[test]
    fn applies_in_order_within_snapshot() {
        let (s, sink) = stream();
        s.message_received(marker(1, 3)).unwrap();
        s.message_received(mutation(1)).unwrap();
        s.message_received(mutation(2)).unwrap();
        s.message_received(mutation(3)).unwrap();
        assert_eq!(s.last_seqno(), 3);
        assert_eq!(sink.applied.lock().len(), 3);
        assert_eq!(s.core().state(), StreamState::Reading);
    }

    #[test]
    fn rejects_seqno_outside_snapshot() {
        let (s, _sink) = stream();
        s.message_received(marker(1, 40)).unwrap();
        s.message_received(mutation(50)).unwrap();
        assert_eq!(s.core().state(), StreamState::Dead);
    }

    #[test]
    fn rejects_duplicate_seqno() {
        let (s, _sink) = stream();
        s.message_received(marker(1, 10)).unwrap();
        s.message_received(mutation(5)).unwrap();
        s.message_received(mutation(5)).unwrap();
        assert_eq!(s.core().state(), StreamState::Dead);
    }

    #[test]
    fn rejects_marker_before_prior_snapshot_consumed() {
        let (s, _sink) = stream();
        s.message_received(marker(1, 10)).unwrap();
        s.message_received(mutation(1)).unwrap();
        s.message_received(marker(11, 20)).unwrap();
        assert_eq!(s.core().state(), StreamState::Dead);
    }

    #[test]
    fn transient_failure_buffers_and_retries() {
        let (s, sink) = stream();
        s.message_received(marker(1, 2)).unwrap();
        sink.fail_next_n(1);
        s.message_received(mutation(1)).unwrap();
        assert_eq!(s.last_seqno(), 0);

        let mut processed = 0;
        let outcome = s.process_buffered_messages(&mut processed);
        assert_eq!(outcome, ProcessOutcome::AllProcessed);
        assert_eq!(s.last_seqno(), 1);
    }

    #[test]
    fn reconnect_resets_to_pending_with_empty_buffer() {
        let (s, _sink) = stream();
        s.message_received(marker(1, 10)).unwrap();
        s.reconnect_stream(9, 74);
        assert_eq!(s.core().state(), StreamState::Pending);
        assert_eq!(s.last_seqno(), 73);
        assert_eq!(s.core().opaque(), 9);
        assert!(s.buffer.lock().items.is_empty());
    }

    #[test]
    fn disk_snapshot_end_flushes_to_sink() {
        let (s, sink) = stream();
        let disk_marker = Message::SnapshotMarker {
            vbucket: 0,
            opaque: 1,
            start_seqno: 1,
            end_seqno: 2,
            flags: SnapshotFlags::DISK,
        };
        s.message_received(disk_marker).unwrap();
        s.message_received(mutation(1)).unwrap();
        s.message_received(mutation(2)).unwrap();
        assert_eq!(sink.flushed.lock().as_slice(), &[(0, 1, 2)]);
    }
}
