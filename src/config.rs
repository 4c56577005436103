//! Tunables that govern back-pressure and batching.
//!
//! These are per-stream defaults; a connection may override them per-open
//! request if the transport negotiates different limits.

use std::time::Duration;

/// Configuration shared by `ActiveStream` and `PassiveStream`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Ceiling on `ready_queue_bytes` before the stream is killed with
    /// `CloseReason::Slow`.
    pub ready_queue_byte_limit: usize,
    /// Ceiling on bytes buffered from the backfill source awaiting dispatch.
    /// Crossing this tells the backfill task to pause.
    pub backfill_buffer_byte_limit: usize,
    /// Max number of consecutive checkpoint items batched into one snapshot.
    pub checkpoint_batch_size: usize,
    /// Ceiling on the passive side's buffered-but-unapplied message bytes.
    pub consumer_buffer_byte_limit: usize,
    /// Max bytes drained from the passive buffer per `processBufferedMessages`
    /// call before yielding back to the scheduler.
    pub process_batch_size: usize,
    /// Deadline for a full takeover handoff (SetVBucketState(pending) through
    /// StreamEnd(OK)). Exceeding it ends the stream with `CloseReason::Closed`.
    pub takeover_max_time: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ready_queue_byte_limit: 40 * 1024 * 1024,
            backfill_buffer_byte_limit: 20 * 1024 * 1024,
            checkpoint_batch_size: 1000,
            consumer_buffer_byte_limit: 20 * 1024 * 1024,
            process_batch_size: 1024 * 1024,
            takeover_max_time: Duration::from_secs(60),
        }
    }
}
