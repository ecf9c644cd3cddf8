// Cycle suppression: a message whose traces already list this station
// produces no outbound copies when its receiver is a station set.

use dim_core::Id;
use dim_station::harness;
use station::state::Metrics;

#[test]
fn traced_station_broadcast_is_dropped() {
    let booted = harness::boot(&["gsp@s002"], &[]);
    let station = &booted.station;

    let s002 = harness::bind_session(station, "gsp@s002");

    // Arrives from the neighbor station (trusted peer) but has already
    // passed through this station.
    let mut msg = harness::ciphertext_message(
        "gsp@s002",
        "stations@everywhere",
        "peer-key",
        b"looped broadcast",
    );
    msg.add_trace(&Id::station("gsp", "s001"));

    let responses = harness::process(station, &s002, &msg);

    // No receipts, no outbound copies, store untouched.
    assert!(responses.is_empty());
    assert!(harness::peek_all(&s002).is_empty());
    assert_eq!(Metrics::get(&station.metrics.cycle_dropped), 1);
    assert_eq!(station.store.dropped_count(), 0);
    assert_eq!(station.store.count(&"gsp@s002".parse::<Id>().unwrap()), 0);
}

#[test]
fn traced_station_receiver_is_dropped() {
    let booted = harness::boot(&["gsp@s002", "gsp@s003"], &[]);
    let station = &booted.station;

    let s002 = harness::bind_session(station, "gsp@s002");
    let s003 = harness::bind_session(station, "gsp@s003");

    let mut msg =
        harness::ciphertext_message("gsp@s002", "gsp@s003", "peer-key", b"station to station");
    msg.add_trace(&Id::station("gsp", "s001"));

    let responses = harness::process(station, &s002, &msg);
    assert!(responses.is_empty());
    assert!(harness::peek_all(&s003).is_empty());
    assert_eq!(Metrics::get(&station.metrics.cycle_dropped), 1);
}

#[test]
fn traced_user_message_still_delivers() {
    let booted = harness::boot(&["gsp@s002"], &[]);
    let station = &booted.station;

    let s002 = harness::bind_session(station, "gsp@s002");
    let alice = harness::bind_session(station, "alice@a1");

    // A user message that looped back is still delivered locally; the
    // trace is not duplicated.
    let mut msg =
        harness::ciphertext_message("gsp@s002", "alice@a1", "peer-key", b"redelivered");
    msg.add_trace(&Id::station("gsp", "s001"));

    let _ = harness::process(station, &s002, &msg);
    let delivered = harness::peek_all(&alice);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].traces, vec!["gsp@s001"]);
}
