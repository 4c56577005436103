//! `NotifierStream`: a data-free producer stream that exists only to tell
//! the peer "you're caught up" once a target seqno has been reached.
//!
//! Grounded on the minimal single-shot shape of `BestEffortSender` in the
//! base crate: no retransmit buffer, no ordering state, one message and
//! done.

use parking_lot::Mutex;
use tracing::info;

use crate::message::{CloseReason, Message};
use crate::stream::{ReadyQueue, StreamCore, StreamFlags, StreamIdentity, StreamState};

struct NotifierInner {
    queue: ReadyQueue,
}

/// Waits for `notify_seqno_available(s)` with `s >= end_seqno`, then emits a
/// single `StreamEnd(Ok)` and dies.
pub struct NotifierStream {
    core: StreamCore,
    inner: Mutex<NotifierInner>,
}

impl NotifierStream {
    pub fn new(name: String, opaque: u32, vbucket: u16, end_seqno: u64) -> Self {
        let identity = StreamIdentity {
            name,
            opaque,
            vbucket,
            flags: StreamFlags::NONE,
            start_seqno: 0,
            end_seqno,
            vb_uuid: 0,
            snap_start_seqno: 0,
            snap_end_seqno: 0,
        };
        Self {
            core: StreamCore::new(identity, StreamState::Pending),
            inner: Mutex::new(NotifierInner {
                queue: ReadyQueue::new(),
            }),
        }
    }

    pub fn core(&self) -> &StreamCore {
        &self.core
    }

    /// If `seqno >= end_seqno`, enqueues `StreamEnd(Ok)` and transitions to
    /// Dead. A no-op once already Dead or already fired.
    pub fn notify_seqno_available(&self, seqno: u64) {
        if self.core.is_dead() || seqno < self.core.end_seqno() {
            return;
        }
        let mut inner = self.inner.lock();
        if self.core.is_dead() {
            return;
        }
        inner.queue.push(
            Message::StreamEnd {
                vbucket: self.core.vbucket(),
                opaque: self.core.opaque(),
                reason: CloseReason::Ok,
            },
            self.core.ready_queue_bytes_counter(),
        );
        self.core.set_state(StreamState::Dead);
        info!(vbucket = self.core.vbucket(), seqno, "notifier threshold reached");
    }

    pub fn next(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        inner.queue.pop(self.core.ready_queue_bytes_counter())
    }

    /// Idempotent; returns bytes freed from the (at most one message) queue.
    pub fn set_dead(&self) -> usize {
        let mut inner = self.inner.lock();
        if self.core.is_dead() {
            return 0;
        }
        self.core.set_state(StreamState::Dead);
        inner.queue.clear(self.core.ready_queue_bytes_counter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_threshold_reached() {
        let n = NotifierStream::new("n".into(), 1, 0, 100);
        assert!(n.next().is_none());
        n.notify_seqno_available(50);
        assert_eq!(n.core().state(), StreamState::Pending);
        assert!(n.next().is_none());

        n.notify_seqno_available(100);
        assert_eq!(n.core().state(), StreamState::Dead);
        let msg = n.next().expect("stream end enqueued");
        assert!(matches!(
            msg,
            Message::StreamEnd {
                reason: CloseReason::Ok,
                ..
            }
        ));
        assert!(n.next().is_none());
    }

    #[test]
    fn notify_after_death_is_noop() {
        let n = NotifierStream::new("n".into(), 1, 0, 10);
        n.notify_seqno_available(10);
        n.next();
        n.notify_seqno_available(20);
        assert!(n.next().is_none());
    }

    #[test]
    fn set_dead_frees_queued_bytes() {
        let n = NotifierStream::new("n".into(), 1, 0, 10);
        n.notify_seqno_available(10);
        assert!(n.core().ready_queue_bytes() > 0);
        let freed = n.set_dead();
        assert!(freed > 0);
        assert_eq!(n.core().ready_queue_bytes(), 0);
        assert_eq!(n.set_dead(), 0);
    }
}
