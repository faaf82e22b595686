use std::sync::Mutex as StdMutex;

use shared::protocol::ChannelSnapshot;
use storage::MemoryStore;
use tokio::time::timeout;

use super::*;
use crate::{
    error::TransportError,
    test_support::{
        eventually, message, position, pts_of, record_messages, test_config, ScriptedUpdates,
    },
};

struct Harness {
    store: Arc<MemoryStore>,
    updates: Arc<ScriptedUpdates>,
    seen: Arc<StdMutex<Vec<(i64, i64)>>>,
    coordinator: Arc<RecoveryCoordinator>,
}

fn harness(positions: Vec<SequencePosition>, config: UpdatesConfig) -> Harness {
    let store = Arc::new(MemoryStore::with_positions(positions));
    let updates = Arc::new(ScriptedUpdates::default());
    let dispatcher = Arc::new(Dispatcher::new());
    let seen = record_messages(&dispatcher);
    let coordinator = RecoveryCoordinator::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::clone(&updates) as Arc<dyn UpdatesApi>,
        dispatcher,
        config,
        CancellationToken::new(),
    );
    Harness {
        store,
        updates,
        seen,
        coordinator,
    }
}

impl Harness {
    async fn stored(&self, channel: i64) -> Option<i64> {
        self.store
            .get(ChannelId(channel))
            .await
            .expect("store read")
            .map(|p| p.pts)
    }

    async fn wait_for_stored(&self, channel: i64, pts: i64) -> bool {
        eventually(move || async move { self.stored(channel).await == Some(pts) }).await
    }

    async fn wait_for_status(&self, channel: i64, status: ChannelStatus) -> bool {
        let coordinator = &self.coordinator;
        eventually(move || async move { coordinator.status(ChannelId(channel)) == Some(status) })
            .await
    }

    async fn wait_for_pts(&self, channel: i64, expected: &[i64]) {
        let seen = &self.seen;
        let done = eventually(move || async move { pts_of(seen, channel) == expected }).await;
        assert!(
            done,
            "channel {channel}: expected {expected:?}, got {:?}",
            pts_of(&self.seen, channel)
        );
    }
}

async fn next_event(events: &mut broadcast::Receiver<RecoveryEvent>) -> RecoveryEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("event channel open")
}

#[test]
fn pending_buffer_drops_oldest_on_overflow() {
    let mut buffer = PendingBuffer::new(2);
    assert!(buffer.push(message(1, 5)).is_none());
    assert!(buffer.push(message(1, 6)).is_none());
    let evicted = buffer.push(message(1, 7)).expect("evicted");
    assert_eq!(evicted.pts, 5);
    assert_eq!(buffer.len(), 2);
}

#[test]
fn pending_buffer_drains_in_pts_order() {
    let mut buffer = PendingBuffer::new(8);
    for pts in [9, 4, 7] {
        buffer.push(message(1, pts));
    }
    let drained: Vec<i64> = buffer.drain_sorted().iter().map(|e| e.pts).collect();
    assert_eq!(drained, vec![4, 7, 9]);
    assert!(buffer.is_empty());
}

#[test]
fn requeued_items_go_before_newer_arrivals() {
    let mut buffer = PendingBuffer::new(3);
    buffer.push(message(1, 30));
    let evicted = buffer.requeue_front(vec![message(1, 10), message(1, 20), message(1, 25)]);
    assert_eq!(evicted.iter().map(|e| e.pts).collect::<Vec<_>>(), vec![10]);
    let order: Vec<i64> = std::iter::from_fn(|| buffer.pop_front())
        .map(|e| e.pts)
        .collect();
    assert_eq!(order, vec![20, 25, 30]);
}

#[tokio::test]
async fn in_order_updates_are_delivered_then_acknowledged() {
    let h = harness(vec![position(1, 10)], test_config());

    h.coordinator.ingest(message(1, 11)).await;
    h.coordinator.ingest(message(1, 12)).await;

    h.wait_for_pts(1, &[11, 12]).await;
    assert!(h.wait_for_stored(1, 12).await);
    assert!(h.updates.fetches_for(1).is_empty());
}

#[tokio::test]
async fn redelivered_update_is_dispatched_once() {
    let h = harness(vec![position(1, 10)], test_config());

    h.coordinator.ingest(message(1, 11)).await;
    h.coordinator.ingest(message(1, 11)).await;
    h.coordinator.ingest(message(1, 9)).await;
    h.coordinator.ingest(message(1, 12)).await;

    h.wait_for_pts(1, &[11, 12]).await;
    assert_eq!(h.stored(1).await, Some(12));
}

#[tokio::test]
async fn first_update_of_unknown_channel_becomes_baseline() {
    let h = harness(Vec::new(), test_config());

    h.coordinator.ingest(message(3, 500)).await;
    h.coordinator.ingest(message(3, 501)).await;

    h.wait_for_pts(3, &[500, 501]).await;
    assert!(h.updates.fetches_for(3).is_empty());
}

#[tokio::test]
async fn gap_is_closed_with_exactly_one_fetch() {
    let h = harness(vec![position(1, 10)], test_config());
    h.updates.push_difference(
        1,
        Ok(Difference::Complete {
            updates: (11..=14).map(|pts| message(1, pts)).collect(),
            position: position(1, 14),
        }),
    );
    let mut events = h.coordinator.subscribe_events();

    h.coordinator.ingest(message(1, 15)).await;

    h.wait_for_pts(1, &[11, 12, 13, 14, 15]).await;
    assert_eq!(h.updates.fetches_for(1), vec![10]);
    assert!(h.wait_for_stored(1, 15).await);
    match next_event(&mut events).await {
        RecoveryEvent::Recovered {
            channel_id,
            fetched,
            ..
        } => {
            assert_eq!(channel_id, ChannelId(1));
            assert_eq!(fetched, 4);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.coordinator.status(ChannelId(1)), Some(ChannelStatus::Live));
}

#[tokio::test]
async fn fetched_updates_are_applied_in_pts_order() {
    let h = harness(vec![position(1, 10)], test_config());
    h.updates.push_difference(
        1,
        Ok(Difference::Complete {
            updates: vec![message(1, 13), message(1, 11), message(1, 12), message(1, 10)],
            position: position(1, 13),
        }),
    );

    h.coordinator.ingest(message(1, 14)).await;

    h.wait_for_pts(1, &[11, 12, 13, 14]).await;
}

#[tokio::test]
async fn updates_arriving_during_recovery_are_replayed_once() {
    let h = harness(vec![position(1, 10)], test_config());
    h.updates.push_difference(
        1,
        Ok(Difference::Complete {
            updates: (11..=14).map(|pts| message(1, pts)).collect(),
            position: position(1, 14),
        }),
    );

    for pts in [15, 17, 16, 12, 15] {
        h.coordinator.ingest(message(1, pts)).await;
    }

    h.wait_for_pts(1, &[11, 12, 13, 14, 15, 16, 17]).await;
    assert_eq!(h.updates.fetches_for(1), vec![10]);
}

#[tokio::test]
async fn gap_left_open_after_replay_is_fetched_again() {
    let h = harness(vec![position(1, 10)], test_config());
    h.updates.push_difference(
        1,
        Ok(Difference::Complete {
            updates: vec![message(1, 11), message(1, 12)],
            position: position(1, 12),
        }),
    );
    h.updates.push_difference(
        1,
        Ok(Difference::Complete {
            updates: vec![message(1, 13), message(1, 14)],
            position: position(1, 14),
        }),
    );
    let mut events = h.coordinator.subscribe_events();

    h.coordinator.ingest(message(1, 15)).await;

    h.wait_for_pts(1, &[11, 12, 13, 14, 15]).await;
    assert_eq!(h.updates.fetches_for(1), vec![10, 12]);
    assert!(h.wait_for_stored(1, 15).await);
    match next_event(&mut events).await {
        RecoveryEvent::Recovered { channel_id, pts, .. } => {
            assert_eq!(channel_id, ChannelId(1));
            assert_eq!(pts, 15);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn gap_that_never_closes_hits_the_round_ceiling() {
    let h = harness(vec![position(1, 10)], test_config());
    let mut events = h.coordinator.subscribe_events();

    h.coordinator.ingest(message(1, 15)).await;

    match next_event(&mut events).await {
        RecoveryEvent::Unrecoverable(failure) => {
            assert_eq!(failure.channel_id, ChannelId(1));
            assert!(failure.reason.contains("3 recovery rounds"), "{}", failure.reason);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.updates.fetches_for(1), vec![10, 10, 10]);
    assert!(h.wait_for_status(1, ChannelStatus::Unrecoverable).await);

    h.coordinator.ingest(message(1, 11)).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(pts_of(&h.seen, 1).is_empty());
    assert_eq!(h.stored(1).await, Some(10));
}

#[tokio::test]
async fn difference_slices_are_followed() {
    let h = harness(vec![position(1, 10)], test_config());
    h.updates.push_difference(
        1,
        Ok(Difference::Slice {
            updates: vec![message(1, 11), message(1, 12)],
            next: position(1, 12),
        }),
    );
    h.updates.push_difference(
        1,
        Ok(Difference::Complete {
            updates: vec![message(1, 13), message(1, 14)],
            position: position(1, 14),
        }),
    );

    h.coordinator.ingest(message(1, 15)).await;

    h.wait_for_pts(1, &[11, 12, 13, 14, 15]).await;
    assert_eq!(h.updates.fetches_for(1), vec![10, 12]);
}

#[tokio::test]
async fn too_long_gap_falls_back_to_resync() {
    let h = harness(vec![position(1, 10)], test_config());
    h.updates.push_difference(
        1,
        Ok(Difference::TooLong {
            position: position(1, 59),
        }),
    );
    h.updates.snapshots.lock().unwrap().insert(
        ChannelId(1),
        ChannelSnapshot {
            position: position(1, 59),
            updates: vec![message(1, 58), message(1, 59)],
        },
    );
    let mut events = h.coordinator.subscribe_events();

    h.coordinator.ingest(message(1, 60)).await;

    h.wait_for_pts(1, &[58, 59, 60]).await;
    assert_eq!(*h.updates.resyncs.lock().unwrap(), vec![ChannelId(1)]);
    assert!(h.wait_for_stored(1, 60).await);
    assert!(matches!(
        next_event(&mut events).await,
        RecoveryEvent::Resynced { pts: 59, .. }
    ));
}

#[tokio::test]
async fn exhausted_fetch_retries_abandon_only_that_channel() {
    let h = harness(vec![position(1, 10), position(2, 20)], test_config());
    for _ in 0..3 {
        h.updates.push_difference(
            1,
            Err(TransportError::Unavailable("connection reset".into())),
        );
    }
    let mut events = h.coordinator.subscribe_events();

    h.coordinator.ingest(message(1, 15)).await;

    match next_event(&mut events).await {
        RecoveryEvent::Unrecoverable(failure) => assert_eq!(failure.channel_id, ChannelId(1)),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        h.coordinator.status(ChannelId(1)),
        Some(ChannelStatus::Unrecoverable)
    );
    assert_eq!(h.updates.fetches_for(1).len(), 3);

    h.coordinator.ingest(message(1, 11)).await;
    h.coordinator.ingest(message(2, 21)).await;
    h.wait_for_pts(2, &[21]).await;
    assert!(pts_of(&h.seen, 1).is_empty());
    assert_eq!(h.stored(1).await, Some(10));
}

#[tokio::test]
async fn stalled_recovery_does_not_block_other_channels() {
    let h = harness(vec![position(1, 10), position(2, 20)], test_config());
    h.updates.stall(1);

    h.coordinator.ingest(message(1, 15)).await;
    assert!(h.wait_for_status(1, ChannelStatus::Recovering).await);
    h.coordinator.ingest(message(1, 16)).await;
    h.coordinator.ingest(message(2, 21)).await;
    h.coordinator.ingest(message(2, 22)).await;

    h.wait_for_pts(2, &[21, 22]).await;
    assert!(pts_of(&h.seen, 1).is_empty());
    assert_eq!(h.coordinator.pending_len(ChannelId(1)), 2);
    assert_eq!(h.updates.fetches_for(1), vec![10]);
}

#[tokio::test]
async fn overflow_while_recovering_drops_oldest() {
    let config = UpdatesConfig {
        pending_capacity: 2,
        ..test_config()
    };
    let h = harness(vec![position(1, 10)], config);
    h.updates.stall(1);
    let mut events = h.coordinator.subscribe_events();

    h.coordinator.ingest(message(1, 15)).await;
    assert!(h.wait_for_status(1, ChannelStatus::Recovering).await);
    h.coordinator.ingest(message(1, 16)).await;
    h.coordinator.ingest(message(1, 17)).await;

    assert!(matches!(
        next_event(&mut events).await,
        RecoveryEvent::PendingOverflow { dropped_pts: 15, .. }
    ));
    assert_eq!(h.coordinator.pending_len(ChannelId(1)), 2);
}

#[tokio::test]
async fn baseline_is_taken_from_server_when_nothing_is_stored() {
    let h = harness(Vec::new(), test_config());
    *h.updates.state.lock().unwrap() = Some(position(0, 100));

    h.coordinator
        .establish_baseline(false)
        .await
        .expect("baseline");

    assert_eq!(h.stored(0).await, Some(100));
    assert!(h.updates.fetches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stored_state_is_caught_up_instead_of_replaced() {
    let h = harness(vec![position(0, 50), position(4, 7)], test_config());
    *h.updates.state.lock().unwrap() = Some(position(0, 100));

    h.coordinator
        .establish_baseline(false)
        .await
        .expect("baseline");

    let updates = &h.updates;
    assert!(
        eventually(move || async move {
            updates.fetches_for(0) == vec![50] && updates.fetches_for(4) == vec![7]
        })
        .await
    );
    assert_eq!(h.stored(0).await, Some(50));
}

#[tokio::test]
async fn forget_mode_discards_stored_channels() {
    let h = harness(vec![position(0, 50), position(4, 7)], test_config());
    *h.updates.state.lock().unwrap() = Some(position(0, 100));

    h.coordinator
        .establish_baseline(true)
        .await
        .expect("baseline");

    assert_eq!(h.stored(0).await, Some(100));
    assert_eq!(h.stored(4).await, None);
}

#[tokio::test]
async fn shutdown_stops_accepting_updates() {
    let h = harness(vec![position(1, 10)], test_config());
    h.coordinator.ingest(message(1, 11)).await;
    h.wait_for_pts(1, &[11]).await;

    h.coordinator.shutdown().await;
    h.coordinator.ingest(message(1, 12)).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pts_of(&h.seen, 1), vec![11]);
    assert_eq!(h.stored(1).await, Some(11));
}
