//! vbstream -- the per-vbucket replication stream state machine for a
//! distributed key-value store's change-propagation protocol.
//!
//! Streams a vbucket's ordered mutations from a producer to a consumer over
//! a long-lived, externally-framed connection. This crate owns only the
//! per-(connection, vbucket) state machine: negotiating a starting position,
//! stitching a disk backfill and a live in-memory checkpoint cursor into one
//! monotonic sequence, framing snapshots, and handling back-pressure and
//! teardown. Wire framing, the RPC transport, the storage engine, the
//! checkpoint manager, and cluster membership are external collaborators
//! (see [`collaborators`]).
//!
//! Three stream variants share [`stream::StreamCore`] (identity, atomic
//! state, ready-queue accounting):
//!
//! - [`stream::active::ActiveStream`] -- producer side; drives
//!   backfill -> in-memory -> takeover transitions and emits messages.
//! - [`stream::notifier::NotifierStream`] -- producer side; no data, just a
//!   single "you're caught up" signal.
//! - [`stream::passive::PassiveStream`] -- consumer side; validates and
//!   applies inbound messages, buffering under back-pressure.
//!
//! [`mux::StreamTable`] is the per-connection lookup from vbucket id to
//! whichever variant is registered there.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod message;
pub mod mux;
pub mod stream;

pub use config::StreamConfig;
pub use error::{Result, StreamError};
pub use message::{CloseReason, Message, MessageType, SnapshotFlags, SnapshotType, VBucketState};
pub use mux::{StreamHandle, StreamTable};
pub use stream::active::ActiveStream;
pub use stream::notifier::NotifierStream;
pub use stream::passive::PassiveStream;
pub use stream::{StreamFlags, StreamIdentity, StreamState, MAX_SEQNO};
