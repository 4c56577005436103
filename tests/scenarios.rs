//! Integration tests exercising the documented replication scenarios
//! end-to-end through the crate's public API.

use std::sync::Arc;

use bytes::Bytes;
use vbstream::collaborators::{
    FixedVBucket, InMemoryCheckpointManager, MutationItem, MutationKind, RecordingBackfillManager,
    RecordingConnection, RecordingMutationSink,
};
use vbstream::config::StreamConfig;
use vbstream::message::{CloseReason, Message, VBucketState};
use vbstream::stream::active::{ActiveStream, PayloadType};
use vbstream::stream::passive::PassiveStream;
use vbstream::stream::{StreamFlags, StreamState, MAX_SEQNO};

fn mutation(seqno: u64) -> MutationItem {
    MutationItem {
        seqno,
        key: Bytes::from(format!("key-{seqno}")),
        value: Some(Bytes::from_static(b"value")),
        kind: MutationKind::Set,
    }
}

fn active_harness(
    high_seqno: u64,
    checkpoint_items: Vec<MutationItem>,
    checkpoint_earliest: u64,
    start: u64,
    end: u64,
    flags: StreamFlags,
) -> Arc<ActiveStream> {
    let vbucket = Arc::new(FixedVBucket::new(VBucketState::Active, high_seqno));
    let checkpoint = Arc::new(InMemoryCheckpointManager::new(
        checkpoint_items,
        checkpoint_earliest,
    ));
    let backfill = Arc::new(RecordingBackfillManager::default());
    let connection = Arc::new(RecordingConnection::default());
    let stream = ActiveStream::new(
        "scenario".into(),
        1,
        0,
        flags,
        start,
        end,
        1,
        start,
        start,
        PayloadType::KeyAndValue,
        StreamConfig::default(),
        vbucket,
        checkpoint,
        backfill,
        connection,
    );
    stream.schedule_backfill();
    stream
}

fn drain(stream: &ActiveStream) -> Vec<Message> {
    let mut out = Vec::new();
    while let Some(msg) = stream.next() {
        out.push(msg);
    }
    out
}

/// Scenario 1: memory-only stream. VBucket high=100, checkpoint has
/// seqnos [1..100]. Expect SnapshotMarker(1,100,Memory) then 100 Mutations,
/// no StreamEnd (end_seqno is unbounded), last_sent_seqno=100.
#[test]
fn memory_only_stream() {
    let items: Vec<_> = (1..=100).map(mutation).collect();
    let stream = active_harness(100, items, 0, 0, MAX_SEQNO, StreamFlags::NONE);

    let msgs = drain(&stream);
    let markers: Vec<_> = msgs
        .iter()
        .filter(|m| matches!(m, Message::SnapshotMarker { .. }))
        .collect();
    assert_eq!(markers.len(), 1);
    assert!(matches!(
        markers[0],
        Message::SnapshotMarker {
            start_seqno: 0,
            end_seqno: 100,
            ..
        }
    ));
    let mutations = msgs
        .iter()
        .filter(|m| matches!(m, Message::Mutation { .. }))
        .count();
    assert_eq!(mutations, 100);
    assert!(!msgs.iter().any(|m| matches!(m, Message::StreamEnd { .. })));
    assert_eq!(stream.last_sent_seqno(), 100);
}

/// Scenario 2: disk+memory stitch. High=200, checkpoint earliest=150,
/// start=0. Expect SnapshotMarker(0,149,Disk), 150 items,
/// SnapshotMarker(150,200,Memory), 51 items.
#[test]
fn disk_and_memory_stitch() {
    let memory_items: Vec<_> = (150..=200).map(mutation).collect();
    let stream = active_harness(200, memory_items, 150, 0, MAX_SEQNO, StreamFlags::NONE);
    assert_eq!(stream.core().state(), StreamState::Backfilling);

    stream.mark_disk_snapshot(0, 149);
    for seqno in 0..=149 {
        stream.backfill_received(mutation(seqno), vbstream::collaborators::BackfillSource::Disk);
    }
    stream.complete_backfill();

    let msgs = drain(&stream);
    let disk_marker_idx = msgs
        .iter()
        .position(|m| matches!(m, Message::SnapshotMarker { start_seqno: 0, end_seqno: 149, .. }))
        .expect("disk marker present");
    let memory_marker_idx = msgs
        .iter()
        .position(|m| matches!(m, Message::SnapshotMarker { start_seqno: 150, end_seqno: 200, .. }))
        .expect("memory marker present");
    assert!(disk_marker_idx < memory_marker_idx);

    let before_memory_marker = &msgs[disk_marker_idx + 1..memory_marker_idx];
    assert_eq!(before_memory_marker.len(), 150);
    let after_memory_marker = &msgs[memory_marker_idx + 1..];
    assert_eq!(after_memory_marker.len(), 51);
    assert_eq!(stream.core().state(), StreamState::InMemory);
}

/// Scenario 3: takeover handoff. Flags=TakeOver, start=0, high=10. After
/// 10 mutations: SetVBucketState(pending), peer ack,
/// SetVBucketState(active), peer ack, StreamEnd(OK), Dead.
#[test]
fn takeover_handoff_full_sequence() {
    let items: Vec<_> = (1..=10).map(mutation).collect();
    let stream = active_harness(10, items, 0, 0, MAX_SEQNO, StreamFlags::TAKEOVER);

    let msgs = drain(&stream);
    assert!(matches!(
        msgs.last(),
        Some(Message::SetVBucketState {
            state: VBucketState::Pending,
            ..
        })
    ));
    assert_eq!(stream.core().state(), StreamState::TakeoverSend);

    stream.set_vbucket_state_ack_received();
    assert_eq!(stream.core().state(), StreamState::TakeoverWait);
    let active_msg = stream.next().expect("active set-state");
    assert!(matches!(
        active_msg,
        Message::SetVBucketState {
            state: VBucketState::Active,
            ..
        }
    ));

    stream.set_vbucket_state_ack_received();
    let end_msg = stream.next().expect("stream end");
    assert!(matches!(end_msg, Message::StreamEnd { reason: CloseReason::Ok, .. }));
    assert_eq!(stream.core().state(), StreamState::Dead);
}

/// Scenario 4: slow consumer. Ready queue reaches the configured byte cap.
/// Expect StreamEnd(Slow), Dead, and `next()` returns None thereafter.
#[test]
fn slow_consumer_is_killed() {
    let items: Vec<_> = (1..=1000)
        .map(|seqno| MutationItem {
            seqno,
            key: Bytes::from(format!("k{seqno}")),
            value: Some(Bytes::from(vec![0u8; 10_000])),
            kind: MutationKind::Set,
        })
        .collect();
    let mut config = StreamConfig::default();
    config.ready_queue_byte_limit = 50_000;

    let vbucket = Arc::new(FixedVBucket::new(VBucketState::Active, 1000));
    let checkpoint = Arc::new(InMemoryCheckpointManager::new(items, 0));
    let backfill = Arc::new(RecordingBackfillManager::default());
    let connection = Arc::new(RecordingConnection::default());
    let stream = ActiveStream::new(
        "slow".into(),
        1,
        0,
        StreamFlags::NONE,
        0,
        MAX_SEQNO,
        1,
        0,
        0,
        PayloadType::KeyAndValue,
        config,
        vbucket,
        checkpoint,
        backfill,
        connection,
    );
    stream.schedule_backfill();

    let msgs = drain(&stream);
    assert!(matches!(msgs.last(), Some(Message::StreamEnd { reason: CloseReason::Slow, .. })));
    assert_eq!(stream.core().state(), StreamState::Dead);
    assert_eq!(stream.next(), None);
}

/// Scenario 5: passive protocol violation. Consumer receives
/// Mutation(seqno=50) while cur_snapshot_end=40. Expect setDead(Closed) (via
/// state, not a returned error), buffer cleared.
#[test]
fn passive_protocol_violation_on_out_of_range_seqno() {
    let sink = Arc::new(RecordingMutationSink::default());
    let stream = PassiveStream::new(
        "consumer".into(),
        1,
        0,
        0,
        100,
        StreamConfig::default(),
        sink,
    );
    stream.accept_stream(true, 1, CloseReason::Closed);

    stream
        .message_received(Message::SnapshotMarker {
            vbucket: 0,
            opaque: 1,
            start_seqno: 1,
            end_seqno: 40,
            flags: vbstream::message::SnapshotFlags::MEMORY,
        })
        .unwrap();
    stream
        .message_received(Message::Mutation {
            vbucket: 0,
            opaque: 1,
            seqno: 50,
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
        })
        .unwrap();

    assert_eq!(stream.core().state(), StreamState::Dead);
}

/// Scenario 6: reconnect. PassiveStream in Reading with last_seqno=73.
/// Connection drops; reconnectStream(new_opaque=9, start=74) called. State
/// -> Pending, buffer empty, opaque=9. On acceptStream(OK, 9) -> Reading.
#[test]
fn reconnect_resets_stream_to_pending() {
    let sink = Arc::new(RecordingMutationSink::default());
    let stream = PassiveStream::new(
        "consumer".into(),
        1,
        0,
        0,
        100,
        StreamConfig::default(),
        sink,
    );
    stream.accept_stream(true, 1, CloseReason::Closed);
    stream
        .message_received(Message::SnapshotMarker {
            vbucket: 0,
            opaque: 1,
            start_seqno: 1,
            end_seqno: 73,
            flags: vbstream::message::SnapshotFlags::MEMORY,
        })
        .unwrap();
    for seqno in 1..=73 {
        stream
            .message_received(Message::Mutation {
                vbucket: 0,
                opaque: 1,
                seqno,
                key: Bytes::from(format!("k{seqno}")),
                value: Bytes::from_static(b"v"),
            })
            .unwrap();
    }
    assert_eq!(stream.last_seqno(), 73);
    assert_eq!(stream.core().state(), StreamState::Reading);
    assert_eq!(stream.core().opaque(), 1);

    stream.reconnect_stream(9, 74);
    assert_eq!(stream.core().state(), StreamState::Pending);
    assert_eq!(stream.last_seqno(), 73);
    assert_eq!(stream.core().opaque(), 9);

    stream.accept_stream(true, 9, CloseReason::Closed);
    assert_eq!(stream.core().state(), StreamState::Reading);
    assert_eq!(stream.core().opaque(), 9);
}
