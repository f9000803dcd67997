//! Store-level laws for the timeseries adapter: raw round-trips, window
//! shapes, changed ranges, nearest-point reads, timestamp validity, and
//! annotation CAS.

use std::collections::HashMap;
use std::sync::Arc;

use granary::engine::memory::MemoryEngine;
use granary::engine::MAXIMUM_TIME;
use granary::models::{Timeseries, TimeseriesReading, UnitOfTime};
use granary::stores::{StreamStore, TimeseriesStore};
use uuid::Uuid;

const T0: i64 = 1_700_000_000_000_000_000;
const SECOND: i64 = 1_000_000_000;

fn reading(time: i64, value: f64) -> TimeseriesReading {
    TimeseriesReading {
        time,
        unit: UnitOfTime::Nanoseconds,
        value,
    }
}

async fn store_with_stream(uuid: Uuid) -> StreamStore {
    let store = StreamStore::new(Arc::new(MemoryEngine::new()));
    store
        .register_stream(uuid, "test/stream", "sensor", "C")
        .await
        .expect("register");
    store
}

#[tokio::test]
async fn insert_then_read_back_sorted() {
    let uuid = Uuid::from_u128(1);
    let store = store_with_stream(uuid).await;

    // deliberately unsorted input
    let times = [5i64, 1, 4, 2, 3];
    let records: Vec<_> = times
        .iter()
        .map(|&i| reading(T0 + i * SECOND, i as f64))
        .collect();
    store
        .add_readings(&Timeseries {
            uuid,
            generation: 0,
            records,
        })
        .await
        .expect("insert");

    let got = store
        .get_data(&[uuid], T0, T0 + 6 * SECOND)
        .await
        .expect("read");
    assert_eq!(got.len(), 1);
    let ts = &got[0];
    assert_eq!(ts.records.len(), 5);
    let sorted: Vec<i64> = ts.records.iter().map(|r| r.time).collect();
    let mut expect: Vec<i64> = times.iter().map(|&i| T0 + i * SECOND).collect();
    expect.sort_unstable();
    assert_eq!(sorted, expect);
    assert!(ts.generation > 0);
}

#[tokio::test]
async fn unknown_uuids_read_as_no_streams() {
    let store = StreamStore::new(Arc::new(MemoryEngine::new()));
    let got = store
        .get_data(&[Uuid::from_u128(42)], 0, i64::MAX)
        .await
        .expect("read");
    assert!(got.is_empty());
    assert!(!store.stream_exists(Uuid::from_u128(42)).await.unwrap());
}

#[tokio::test]
async fn hour_of_seconds_makes_sixty_minute_windows() {
    let uuid = Uuid::from_u128(2);
    let store = store_with_stream(uuid).await;
    let records: Vec<_> = (0..3600).map(|i| reading(T0 + i * SECOND, 1.0)).collect();
    store
        .add_readings(&Timeseries {
            uuid,
            generation: 0,
            records,
        })
        .await
        .expect("insert");

    let width = 60 * SECOND as u64;
    let got = store
        .window_data(&[uuid], width, T0, T0 + 3600 * SECOND)
        .await
        .expect("windows");
    assert_eq!(got.len(), 1);
    let windows = &got[0].records;
    assert_eq!(windows.len(), 60);
    for (i, w) in windows.iter().enumerate() {
        assert_eq!(w.time, T0 + (i as i64) * 60 * SECOND);
        assert_eq!(w.count, 60);
        assert_eq!(w.min, 1.0);
        assert_eq!(w.max, 1.0);
        assert_eq!(w.mean, 1.0);
    }
}

#[tokio::test]
async fn window_narrower_than_width_is_empty() {
    let uuid = Uuid::from_u128(3);
    let store = store_with_stream(uuid).await;
    store
        .add_readings(&Timeseries {
            uuid,
            generation: 0,
            records: vec![reading(T0, 1.0)],
        })
        .await
        .expect("insert");

    let got = store
        .window_data(&[uuid], 60 * SECOND as u64, T0, T0 + SECOND)
        .await
        .expect("windows");
    assert!(got[0].records.is_empty());
}

#[tokio::test]
async fn ragged_window_end_is_lowered_to_a_multiple() {
    let uuid = Uuid::from_u128(4);
    let store = store_with_stream(uuid).await;
    let records: Vec<_> = (0..150).map(|i| reading(T0 + i * SECOND, 1.0)).collect();
    store
        .add_readings(&Timeseries {
            uuid,
            generation: 0,
            records,
        })
        .await
        .expect("insert");

    // 150 s of data, 60 s windows: the trailing 30 s are cut off
    let got = store
        .window_data(&[uuid], 60 * SECOND as u64, T0, T0 + 150 * SECOND)
        .await
        .expect("windows");
    assert_eq!(got[0].records.len(), 2);
}

#[tokio::test]
async fn aligned_windows_clear_low_bits_and_omit_empty() {
    let uuid = Uuid::from_u128(5);
    let store = store_with_stream(uuid).await;
    // pointwidth 10: 1024 ns windows. Occupy windows 0 and 2, skip 1.
    store
        .add_readings(&Timeseries {
            uuid,
            generation: 0,
            records: vec![
                reading(10, 1.0),
                reading(20, 3.0),
                reading(2048 + 5, 7.0),
            ],
        })
        .await
        .expect("insert");

    // unaligned bounds; the engine clears the bottom ten bits
    let got = store
        .statistical_data(&[uuid], 10, 3, 3 * 1024 + 17)
        .await
        .expect("stats");
    let windows = &got[0].records;
    assert_eq!(windows.len(), 2, "empty window omitted");
    assert_eq!(windows[0].time, 0);
    assert_eq!(windows[0].count, 2);
    assert_eq!(windows[0].min, 1.0);
    assert_eq!(windows[0].max, 3.0);
    assert_eq!(windows[0].mean, 2.0);
    assert_eq!(windows[1].time, 2048);
    assert_eq!(windows[1].count, 1);
}

#[tokio::test]
async fn changed_ranges_cover_exactly_the_new_points() {
    let uuid = Uuid::from_u128(6);
    let store = store_with_stream(uuid).await;
    store
        .add_readings(&Timeseries {
            uuid,
            generation: 0,
            records: vec![reading(T0 - 1000 * SECOND, 0.5)],
        })
        .await
        .expect("seed");

    let g0 = store.current_generation(uuid).await.expect("g0");
    let records: Vec<_> = (0..10).map(|i| reading(T0 + i * SECOND, i as f64)).collect();
    store
        .add_readings(&Timeseries {
            uuid,
            generation: 0,
            records,
        })
        .await
        .expect("insert");
    let g1 = store.current_generation(uuid).await.expect("g1");
    assert!(g1 > g0);

    let got = store
        .changed_ranges(&[uuid], g0, g1, 0)
        .await
        .expect("changes");
    assert_eq!(got.len(), 1);
    let ranges = &got[0].ranges;
    assert_eq!(ranges.len(), 1, "one coalesced range for one insert");
    assert!(ranges[0].start_time <= T0);
    assert!(ranges[0].end_time > T0 + 9 * SECOND);
    // the seed point predates g0 and must not appear
    assert!(ranges[0].start_time > T0 - 1000 * SECOND);
}

#[tokio::test]
async fn prev_and_next_pick_the_neighbouring_points() {
    let uuid = Uuid::from_u128(7);
    let store = store_with_stream(uuid).await;
    store
        .add_readings(&Timeseries {
            uuid,
            generation: 0,
            records: vec![reading(T0, 1.0), reading(T0 + SECOND, 2.0)],
        })
        .await
        .expect("insert");

    let prev = store.prev(&[uuid], T0 + SECOND).await.expect("prev");
    assert_eq!(prev.len(), 1);
    assert_eq!(prev[0].records[0].time, T0);

    let next = store.next(&[uuid], T0 + 1).await.expect("next");
    assert_eq!(next[0].records[0].time, T0 + SECOND);

    // nothing before the first point: the stream contributes no result
    let none = store.prev(&[uuid], T0).await.expect("prev");
    assert!(none.is_empty());
}

#[tokio::test]
async fn delete_removes_the_range() {
    let uuid = Uuid::from_u128(8);
    let store = store_with_stream(uuid).await;
    let records: Vec<_> = (0..10).map(|i| reading(T0 + i * SECOND, i as f64)).collect();
    store
        .add_readings(&Timeseries {
            uuid,
            generation: 0,
            records,
        })
        .await
        .expect("insert");

    store
        .delete_data(&[uuid], T0, T0 + 5 * SECOND)
        .await
        .expect("delete");
    let got = store
        .get_data(&[uuid], T0, T0 + 10 * SECOND)
        .await
        .expect("read");
    assert_eq!(got[0].records.len(), 5);
    assert_eq!(got[0].records[0].time, T0 + 5 * SECOND);
}

#[tokio::test]
async fn timestamp_validity_boundaries() {
    let store = StreamStore::new(Arc::new(MemoryEngine::new()));
    assert!(store.valid_timestamp(0, UnitOfTime::Nanoseconds));
    assert!(!store.valid_timestamp(-1, UnitOfTime::Nanoseconds));
    assert!(store.valid_timestamp(MAXIMUM_TIME, UnitOfTime::Nanoseconds));
    assert!(!store.valid_timestamp(MAXIMUM_TIME + 1, UnitOfTime::Nanoseconds));
    // seconds scale overflows long before i64::MAX seconds
    assert!(store.valid_timestamp(1_700_000_000, UnitOfTime::Seconds));
    assert!(!store.valid_timestamp(i64::MAX, UnitOfTime::Seconds));
}

#[tokio::test]
async fn annotations_lowercase_and_bump_version() {
    let uuid = Uuid::from_u128(9);
    let store = store_with_stream(uuid).await;
    let (_, v0) = store.annotations(uuid).await.expect("annotations");

    store
        .add_annotations(
            uuid,
            HashMap::from([("Location".to_owned(), "soda hall".to_owned())]),
        )
        .await
        .expect("annotate");

    let (ann, v1) = store.annotations(uuid).await.expect("annotations");
    assert!(v1 > v0, "version strictly increases");
    assert_eq!(ann.get("location").map(String::as_str), Some("soda hall"));
    assert!(!ann.contains_key("Location"));
}
