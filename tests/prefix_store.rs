//! The persistent prefix index: superstring scans, UUID buckets, and
//! durability across reopen.

use granary::prefix::PrefixStore;
use uuid::Uuid;

#[test]
fn superstring_scans_are_prefix_bounded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PrefixStore::open(&dir.path().join("prefix.db")).expect("open");

    store.add_timeseries_uri("scratch/r1/temp").expect("add");
    store.add_timeseries_uri("scratch/r1/hum").expect("add");
    store.add_timeseries_uri("scratch/r2/temp").expect("add");
    store.add_timeseries_uri("other/r1/temp").expect("add");

    let mut got = store.timeseries_superstrings("scratch/r1").expect("scan");
    got.sort();
    assert_eq!(got, vec!["scratch/r1/hum", "scratch/r1/temp"]);

    let got = store.timeseries_superstrings("scratch").expect("scan");
    assert_eq!(got.len(), 3);

    let got = store.timeseries_superstrings("zzz").expect("scan");
    assert!(got.is_empty());
}

#[test]
fn metadata_and_timeseries_sets_are_separate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PrefixStore::open(&dir.path().join("prefix.db")).expect("open");

    store.add_metadata_uri("scratch").expect("add");
    store.add_timeseries_uri("scratch/r1/temp").expect("add");

    assert_eq!(
        store.metadata_superstrings("scratch").expect("scan"),
        vec!["scratch"]
    );
    assert_eq!(
        store.timeseries_superstrings("scratch").expect("scan"),
        vec!["scratch/r1/temp"]
    );
}

#[test]
fn adds_are_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PrefixStore::open(&dir.path().join("prefix.db")).expect("open");

    for _ in 0..3 {
        store.add_timeseries_uri("scratch/r1/temp").expect("add");
        store.add_metadata_uri("scratch").expect("add");
    }
    assert_eq!(
        store.timeseries_superstrings("scratch").expect("scan").len(),
        1
    );
    assert_eq!(store.metadata_superstrings("scratch").expect("scan").len(), 1);
}

#[test]
fn uuid_bucket_unions_over_superstrings_and_dedups() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PrefixStore::open(&dir.path().join("prefix.db")).expect("open");

    let u1 = Uuid::from_u128(1);
    let u2 = Uuid::from_u128(2);
    let u3 = Uuid::from_u128(3);

    store.add_timeseries_uri("scratch/r1/temp").expect("add");
    store.add_timeseries_uri("scratch/r2/temp").expect("add");
    // two streams on the same URI (different PO / expression)
    store.add_uuid_for_uri("scratch/r1/temp", u1).expect("add");
    store.add_uuid_for_uri("scratch/r1/temp", u2).expect("add");
    store.add_uuid_for_uri("scratch/r1/temp", u2).expect("dup");
    store.add_uuid_for_uri("scratch/r2/temp", u3).expect("add");

    let mut got = store.uuids_for("scratch/r1/temp").expect("uuids");
    got.sort();
    assert_eq!(got, vec![u1, u2]);

    let got = store.uuids_for("scratch").expect("uuids");
    assert_eq!(got.len(), 3, "prefix unions every registered stream");
}

#[test]
fn registrations_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("prefix.db");
    let u1 = Uuid::from_u128(11);

    {
        let store = PrefixStore::open(&path).expect("open");
        store.add_timeseries_uri("scratch/r1/temp").expect("add");
        store.add_uuid_for_uri("scratch/r1/temp", u1).expect("add");
        store.add_metadata_uri("scratch").expect("add");
    }

    let store = PrefixStore::open(&path).expect("reopen");
    assert_eq!(
        store.timeseries_superstrings("scratch").expect("scan"),
        vec!["scratch/r1/temp"]
    );
    assert_eq!(store.uuids_for("scratch/r1/temp").expect("uuids"), vec![u1]);
    assert_eq!(
        store.metadata_superstrings("scratch").expect("scan"),
        vec!["scratch"]
    );
}

#[test]
fn every_prefix_of_a_registered_uri_finds_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PrefixStore::open(&dir.path().join("prefix.db")).expect("open");

    let uri = "scratch/r1/temp";
    let uuid = Uuid::from_u128(21);
    store.add_timeseries_uri(uri).expect("add");
    store.add_uuid_for_uri(uri, uuid).expect("add");

    for prefix in granary::uri::prefixes(uri) {
        let supers = store.timeseries_superstrings(&prefix).expect("scan");
        assert!(supers.contains(&uri.to_owned()), "prefix {prefix} misses {uri}");
        assert!(!store.uuids_for(&prefix).expect("uuids").is_empty());
    }
}
