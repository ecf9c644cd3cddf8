// Online fan-out: a user with two live sessions gets one copy on each
// queue; the store holds the message until both sends are accepted.

use dim_station::harness;

#[test]
fn message_fans_out_to_every_active_session() {
    let booted = harness::boot(&[], &[]);
    let station = &booted.station;

    // Alice is online twice (two devices); Bob sends from his own session.
    let alice_1 = harness::bind_session(station, "alice@a1");
    let alice_2 = harness::bind_session(station, "alice@a1");
    let bob = harness::bind_session(station, "bob@b1");

    let msg = harness::ciphertext_message("bob@b1", "alice@a1", "bob-key", b"hello alice");
    let responses = harness::process(station, &bob, &msg);

    // Sender got a delivering receipt.
    assert_eq!(responses.len(), 1);

    // Exactly one copy per session.
    let alice_id: dim_core::Id = "alice@a1".parse().unwrap();
    assert_eq!(station.store.count(&alice_id), 1);
    let copies_1 = harness::peek_all(&alice_1);
    let copies_2 = harness::peek_all(&alice_2);
    assert_eq!(copies_1.len(), 1);
    assert_eq!(copies_2.len(), 1);
    assert_eq!(copies_1[0].signature, msg.signature);
    assert_eq!(copies_2[0].signature, msg.signature);

    // peek_all did not touch the store.
    assert_eq!(station.store.count(&alice_id), 1);
}

#[test]
fn store_empties_once_both_sessions_accept() {
    let booted = harness::boot(&[], &[]);
    let station = &booted.station;

    let alice_1 = harness::bind_session(station, "alice@a1");
    let alice_2 = harness::bind_session(station, "alice@a1");
    let bob = harness::bind_session(station, "bob@b1");

    let msg = harness::ciphertext_message("bob@b1", "alice@a1", "bob-key", b"hello alice");
    let _ = harness::process(station, &bob, &msg);

    let alice_id: dim_core::Id = "alice@a1".parse().unwrap();
    assert_eq!(station.store.count(&alice_id), 1);

    // First accept removes the entry; the second is a no-op.
    let sent_1 = harness::accept_all(station, &alice_1);
    assert_eq!(sent_1.len(), 1);
    assert_eq!(station.store.count(&alice_id), 0);
    let sent_2 = harness::accept_all(station, &alice_2);
    assert_eq!(sent_2.len(), 1);
    assert_eq!(station.store.count(&alice_id), 0);
}

#[test]
fn offline_receiver_is_stored_and_notified() {
    let booted = harness::boot(&[], &[]);
    let station = &booted.station;
    let bob = harness::bind_session(station, "bob@b1");

    let msg = harness::ciphertext_message("bob@b1", "carol@c3", "bob-key", b"hello carol");
    let responses = harness::process(station, &bob, &msg);

    // Cached receipt plus a queued push notification.
    assert_eq!(responses.len(), 1);
    let carol_id: dim_core::Id = "carol@c3".parse().unwrap();
    assert_eq!(station.store.count(&carol_id), 1);
    assert_eq!(station.pusher.queue_len(), 1);
}
