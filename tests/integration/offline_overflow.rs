// Offline store at scale: the per-receiver cap drops from the head and
// paging reports what remains.

use dim_core::Id;
use dim_station::harness;
use station::config::TuningConfig;

#[test]
fn overflow_drops_the_first_inserted_message() {
    let tuning = TuningConfig {
        offline_cap: 70_000,
        ..TuningConfig::default()
    };
    let booted = harness::boot_with(&[], &[], tuning);
    let station = &booted.station;
    let alice: Id = "alice@a1".parse().unwrap();

    // 70 001 distinct messages for an offline user.
    for n in 0..70_001u64 {
        let msg = harness::ciphertext_message(
            "bob@b1",
            "alice@a1",
            "bob-key",
            format!("payload-{n}").as_bytes(),
        );
        assert!(station.store.save(&msg, &alice));
    }

    assert_eq!(station.store.count(&alice), 70_000);
    assert_eq!(station.store.dropped_count(), 1);

    let (page, remaining) = station.store.fetch(&alice, 0, 1024);
    assert_eq!(page.len(), 1024);
    assert_eq!(remaining, 68_976);

    // The very first inserted message is no longer present.
    assert_eq!(page[0].data_bytes().unwrap(), b"payload-1");
    let first = harness::ciphertext_message("bob@b1", "alice@a1", "bob-key", b"payload-0");
    assert!(!station.store.remove(&first, &alice));
}

#[test]
fn duplicate_saves_do_not_consume_capacity() {
    let tuning = TuningConfig {
        offline_cap: 10,
        ..TuningConfig::default()
    };
    let booted = harness::boot_with(&[], &[], tuning);
    let station = &booted.station;
    let alice: Id = "alice@a1".parse().unwrap();

    let msg = harness::ciphertext_message("bob@b1", "alice@a1", "bob-key", b"once");
    assert!(station.store.save(&msg, &alice));
    for _ in 0..20 {
        assert!(!station.store.save(&msg, &alice));
    }
    assert_eq!(station.store.count(&alice), 1);
    assert_eq!(station.store.dropped_count(), 0);
}

#[test]
fn negative_start_pages_from_the_tail() {
    let booted = harness::boot(&[], &[]);
    let station = &booted.station;
    let alice: Id = "alice@a1".parse().unwrap();

    for n in 0..10u64 {
        let msg = harness::ciphertext_message(
            "bob@b1",
            "alice@a1",
            "bob-key",
            format!("m-{n}").as_bytes(),
        );
        station.store.save(&msg, &alice);
    }
    let (tail, remaining) = station.store.fetch(&alice, -4, 100);
    assert_eq!(tail.len(), 4);
    assert_eq!(remaining, 0);
    assert_eq!(tail[0].data_bytes().unwrap(), b"m-6");
}
