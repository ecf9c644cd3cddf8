// Broadcast to everyone@everywhere: copies to every configured neighbor
// (minus self), to the station bots, plus one local copy; `recipients`
// on the outbound copies equals the enumerated union.

use dim_core::Id;
use dim_station::harness;
use station::state::Metrics;

#[test]
fn everyone_reaches_neighbors_bots_and_local() {
    let booted = harness::boot(&["gsp@s002", "gsp@s003"], &[("archivist", "archivist@a9")]);
    let station = &booted.station;

    // Both neighbors and the archivist bot keep live sessions here.
    let s002 = harness::bind_session(station, "gsp@s002");
    let s003 = harness::bind_session(station, "gsp@s003");
    let archivist = harness::bind_session(station, "archivist@a9");
    let bob = harness::bind_session(station, "bob@b1");

    let msg = harness::ciphertext_message(
        "bob@b1",
        "everyone@everywhere",
        "bob-key",
        b"hello world",
    );
    assert!(msg.traces.is_empty());
    let responses = harness::process(station, &bob, &msg);
    assert_eq!(responses.len(), 1);

    // One copy per enumerated target.
    let to_s002 = harness::peek_all(&s002);
    let to_s003 = harness::peek_all(&s003);
    let to_archivist = harness::peek_all(&archivist);
    assert_eq!(to_s002.len(), 1);
    assert_eq!(to_s003.len(), 1);
    assert_eq!(to_archivist.len(), 1);

    // Outbound copies carry the enumerated union and the local trace.
    for copy in [&to_s002[0], &to_s003[0], &to_archivist[0]] {
        assert_eq!(
            copy.recipients,
            vec!["gsp@s002", "gsp@s003", "archivist@a9"]
        );
        assert_eq!(copy.traces, vec!["gsp@s001"]);
        assert_eq!(copy.receiver.to_string(), "everyone@everywhere");
    }

    // Exactly one local copy was kept.
    assert_eq!(Metrics::get(&station.metrics.broadcast_local), 1);

    // Broadcast messages are never persisted.
    assert_eq!(station.store.count(&"gsp@s002".parse::<Id>().unwrap()), 0);
    assert_eq!(
        station.store.count(&"archivist@a9".parse::<Id>().unwrap()),
        0
    );
}

#[test]
fn every_station_skips_bots_and_keeps_no_local_copy() {
    let booted = harness::boot(&["gsp@s002"], &[("archivist", "archivist@a9")]);
    let station = &booted.station;

    let s002 = harness::bind_session(station, "gsp@s002");
    let archivist = harness::bind_session(station, "archivist@a9");
    let bob = harness::bind_session(station, "bob@b1");

    let msg = harness::ciphertext_message(
        "bob@b1",
        "stations@everywhere",
        "bob-key",
        b"station announce",
    );
    let _ = harness::process(station, &bob, &msg);

    assert_eq!(harness::peek_all(&s002).len(), 1);
    assert!(harness::peek_all(&archivist).is_empty());
    assert_eq!(Metrics::get(&station.metrics.broadcast_local), 0);
}

#[test]
fn previously_enumerated_recipients_get_no_second_copy() {
    let booted = harness::boot(&["gsp@s002", "gsp@s003"], &[]);
    let station = &booted.station;

    let s002 = harness::bind_session(station, "gsp@s002");
    let s003 = harness::bind_session(station, "gsp@s003");
    let bob = harness::bind_session(station, "bob@b1");

    // An upstream hop already enumerated s002.
    let mut msg = harness::ciphertext_message(
        "bob@b1",
        "stations@everywhere",
        "bob-key",
        b"partial broadcast",
    );
    msg.add_recipients([&Id::station("gsp", "s002")]);
    let _ = harness::process(station, &bob, &msg);

    assert!(harness::peek_all(&s002).is_empty());
    let delivered = harness::peek_all(&s003);
    assert_eq!(delivered.len(), 1);
    // The union only grew.
    assert_eq!(delivered[0].recipients, vec!["gsp@s002", "gsp@s003"]);
}
