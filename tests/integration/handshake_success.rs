// Four-step handshake against a live station context.
//
// offer -> DIM? (challenge with fresh key) -> respond with key -> DIM!
// and the session ends up bound, active, and registered in the center.

use dim_core::{Command, HandshakeTitle};
use dim_station::harness;

#[test]
fn handshake_binds_identifier_and_activates_session() {
    let booted = harness::boot(&[], &[]);
    let station = &booted.station;
    let session = harness::open_session(station);

    // Alice's meta must be on record (or attached) for verification.
    harness::register_key(station, "alice@a1", "alice-key");

    // Step 1: offer without a session key.
    let offer = harness::command_message(
        "alice@a1",
        "station@anywhere",
        "alice-key",
        &Command::handshake_hello(None),
    );
    let responses = harness::process(station, &session, &offer);

    // Step 2: challenge carries a freshly issued session key.
    assert_eq!(responses.len(), 1);
    let challenge = harness::command_of(&responses[0]);
    let Command::Handshake(hs) = &challenge else {
        panic!("expected handshake, got {:?}", challenge);
    };
    assert_eq!(hs.title, HandshakeTitle::Again);
    let key = hs.session.clone().expect("challenge carries the key");
    assert_eq!(key, session.state.key);
    // Pre-handshake replies to station@anywhere carry the station meta.
    let (meta, _visa) = harness::attachments_of(&responses[0]);
    assert!(meta.is_some() || station.accounts.station_meta().is_none());

    // Session is not yet authenticated.
    assert!(session.state.identifier().is_none());
    assert!(!session.state.is_active());

    // Step 3: respond with the issued key.
    let respond = harness::command_message(
        "alice@a1",
        "station@anywhere",
        "alice-key",
        &Command::handshake_hello(Some(key)),
    );
    let responses = harness::process(station, &session, &respond);

    // Step 4: accepted.
    let accepted = harness::command_of(&responses[0]);
    let Command::Handshake(hs) = &accepted else {
        panic!("expected handshake, got {:?}", accepted);
    };
    assert_eq!(hs.title, HandshakeTitle::Success);

    // The session is bound to the envelope sender and active.
    assert_eq!(
        session.state.identifier().expect("bound").to_string(),
        "alice@a1"
    );
    assert!(session.state.is_active());
    let bound = station.center.sessions(&"alice@a1".parse().unwrap());
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].state.key, session.state.key);
}

#[test]
fn wrong_session_key_reissues_the_challenge() {
    let booted = harness::boot(&[], &[]);
    let station = &booted.station;
    let session = harness::open_session(station);
    harness::register_key(station, "alice@a1", "alice-key");

    let respond = harness::command_message(
        "alice@a1",
        "station@anywhere",
        "alice-key",
        &Command::handshake_hello(Some("STALEKEY0000".to_owned())),
    );
    let responses = harness::process(station, &session, &respond);

    let reissued = harness::command_of(&responses[0]);
    let Command::Handshake(hs) = &reissued else {
        panic!("expected handshake, got {:?}", reissued);
    };
    assert_eq!(hs.title, HandshakeTitle::Again);
    assert_eq!(hs.session.as_deref(), Some(session.state.key.as_str()));
    assert!(session.state.identifier().is_none());
}

#[test]
fn suspended_message_is_redriven_after_handshake() {
    let booted = harness::boot(&[], &[]);
    let station = &booted.station;
    let session = harness::open_session(station);
    harness::register_key(station, "alice@a1", "alice-key");

    // A user message before the handshake is suspended and answered with
    // a forced re-handshake.
    let early = harness::ciphertext_message("alice@a1", "bob@b1", "alice-key", b"hi bob");
    let responses = harness::process(station, &session, &early);
    let key = harness::session_key_of(&responses).expect("forced DIM?");
    assert_eq!(station.store.count(&"bob@b1".parse().unwrap()), 0);

    // Finish the handshake; the parked message is delivered (stored for
    // the offline receiver).
    let respond = harness::command_message(
        "alice@a1",
        "station@anywhere",
        "alice-key",
        &Command::handshake_hello(Some(key)),
    );
    let _ = harness::process(station, &session, &respond);
    assert_eq!(station.store.count(&"bob@b1".parse().unwrap()), 1);
}
