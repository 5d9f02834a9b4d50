use cable_core::{DeliverableEvent, TargetHandle};
use cable_events::{DeliverableEventStream, EventStreamError};

fn ev(cell: u32, time: f64, weight: f64) -> DeliverableEvent {
    DeliverableEvent {
        cell,
        handle: TargetHandle {
            mech_id: 0,
            index: cell,
        },
        time,
        weight,
    }
}

fn staged() -> Vec<DeliverableEvent> {
    vec![
        ev(0, 1.0, 0.1),
        ev(0, 2.0, 0.2),
        ev(0, 5.0, 0.3),
        ev(2, 1.5, 0.4),
        ev(2, 4.0, 0.5),
    ]
}

#[test]
fn init_partitions_streams() {
    let mut streams = DeliverableEventStream::new(3);
    streams.init(&staged()).unwrap();
    assert!(!streams.empty());
    assert_eq!(streams.marked_range(0).count(), 0);
    assert_eq!(streams.min_pending_time(), Some(1.0));
}

#[test]
fn init_rejects_unsorted_batches() {
    let mut streams = DeliverableEventStream::new(3);
    let bad = vec![ev(0, 2.0, 0.1), ev(0, 1.0, 0.1)];
    assert_eq!(
        streams.init(&bad),
        Err(EventStreamError::UnsortedBatch { position: 1 })
    );

    let nan = vec![ev(0, 1.0, 0.1), ev(0, f64::NAN, 0.1)];
    assert_eq!(
        streams.init(&nan),
        Err(EventStreamError::UnsortedBatch { position: 1 })
    );

    let out_of_range = vec![ev(7, 1.0, 0.1)];
    assert_eq!(
        streams.init(&out_of_range),
        Err(EventStreamError::CellOutOfRange {
            cell: 7,
            n_streams: 3
        })
    );
}

#[test]
fn mark_and_drop_consume_prefixes() {
    let mut streams = DeliverableEventStream::new(3);
    streams.init(&staged()).unwrap();

    streams.mark_until_after(&[2.0, 2.0, 2.0]);
    let marked0: Vec<f64> = streams.marked_range(0).map(|m| m.time).collect();
    assert_eq!(marked0, vec![1.0, 2.0]);
    let marked2: Vec<f64> = streams.marked_range(2).map(|m| m.time).collect();
    assert_eq!(marked2, vec![1.5]);
    assert_eq!(streams.marked_range(1).count(), 0);

    streams.drop_marked_events();
    assert_eq!(streams.marked_range(0).count(), 0);
    assert_eq!(streams.min_pending_time(), Some(4.0));

    streams.mark_until_after(&[10.0, 10.0, 10.0]);
    streams.drop_marked_events();
    assert!(streams.empty());
}

#[test]
fn event_time_if_before_shortens_the_step() {
    let mut streams = DeliverableEventStream::new(3);
    streams.init(&staged()).unwrap();

    let mut t_until = [3.0, 3.0, 1.2];
    streams.event_time_if_before(&mut t_until);
    assert_eq!(t_until, [1.0, 3.0, 1.2]);

    // After consuming the head events the next pending times apply.
    streams.mark_until_after(&[1.0, 1.0, 1.5]);
    streams.drop_marked_events();
    let mut t_until = [3.0, 3.0, 3.0];
    streams.event_time_if_before(&mut t_until);
    assert_eq!(t_until, [2.0, 3.0, 3.0]);
}

#[test]
fn weights_and_handles_survive_the_trip() {
    let mut streams = DeliverableEventStream::new(3);
    streams.init(&staged()).unwrap();
    streams.mark_until_after(&[1.0, 0.0, 0.0]);
    let m: Vec<_> = streams.marked_range(0).collect();
    assert_eq!(m.len(), 1);
    let (handle, weight) = m[0].data;
    assert_eq!(weight, 0.1);
    assert_eq!(handle.index, 0);
}
