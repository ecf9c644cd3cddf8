// Roaming: messages for a user attached to a neighbor station are
// redirected — directly into the neighbor's session when it is
// connected, else via the bridge with `target` set.

use dim_core::{Id, LoginCommand, LoginStation};
use dim_station::harness;
use serde_json::json;

fn record_roaming(station: &station::state::Station, user: &str, at: &str) {
    let command = LoginCommand {
        id: user.parse().unwrap(),
        station: LoginStation {
            id: at.parse::<Id>().unwrap().with_network(dim_core::EntityType::Station),
            host: Some("10.0.0.2".to_owned()),
            port: Some(9394),
        },
        time: 1_700_000_000.0,
        agent: None,
    };
    station
        .accounts
        .save_login(command, json!({"sender": user}))
        .unwrap();
}

#[test]
fn redirects_into_a_connected_neighbor_session() {
    let booted = harness::boot(&["gsp@s002"], &[]);
    let station = &booted.station;

    // Alice roams on s002, which keeps a session here.
    record_roaming(station, "alice@a1", "gsp@s002");
    let neighbor = harness::bind_session(station, "gsp@s002");
    let bob = harness::bind_session(station, "bob@b1");

    let msg = harness::ciphertext_message("bob@b1", "alice@a1", "bob-key", b"hi alice");
    let _ = harness::process(station, &bob, &msg);

    let alice_id: Id = "alice@a1".parse().unwrap();
    assert_eq!(station.store.count(&alice_id), 1);

    // The copy went into the neighbor session, unmodified (no target).
    let forwarded = harness::accept_all(station, &neighbor);
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].signature, msg.signature);
    assert!(forwarded[0].target.is_none());

    // Accepting the send cleared the store.
    assert_eq!(station.store.count(&alice_id), 0);
}

#[test]
fn falls_back_to_the_bridge_with_target_set() {
    let booted = harness::boot(&["gsp@s002"], &[]);
    let station = &booted.station;

    record_roaming(station, "alice@a1", "gsp@s002");
    // No s002 session; the edge keeps a session bound to our own ID.
    let bridge = harness::bind_session(station, "gsp@s001");
    let bob = harness::bind_session(station, "bob@b1");

    let msg = harness::ciphertext_message("bob@b1", "alice@a1", "bob-key", b"hi alice");
    let _ = harness::process(station, &bob, &msg);

    let forwarded = harness::accept_all(station, &bridge);
    assert_eq!(forwarded.len(), 1);
    assert_eq!(
        forwarded[0].target.as_ref().map(ToString::to_string),
        Some("alice@a1".to_owned())
    );
    assert_eq!(station.store.count(&"alice@a1".parse::<Id>().unwrap()), 0);
}

#[test]
fn local_login_means_no_redirect() {
    let booted = harness::boot(&["gsp@s002"], &[]);
    let station = &booted.station;

    // Alice's login names this station; with no live session she is
    // simply offline here.
    record_roaming(station, "alice@a1", "gsp@s001");
    let bob = harness::bind_session(station, "bob@b1");

    let msg = harness::ciphertext_message("bob@b1", "alice@a1", "bob-key", b"hi alice");
    let _ = harness::process(station, &bob, &msg);

    assert_eq!(station.store.count(&"alice@a1".parse::<Id>().unwrap()), 1);
    assert_eq!(station.pusher.queue_len(), 1);
}

#[tokio::test]
async fn login_triggers_replay_toward_the_roaming_station() {
    let booted = harness::boot(&["gsp@s002"], &[]);
    let station = &booted.station;

    // Two messages parked for Alice while she was nowhere.
    let bob = harness::bind_session(station, "bob@b1");
    for n in 0..2 {
        let msg = harness::ciphertext_message(
            "bob@b1",
            "alice@a1",
            "bob-key",
            format!("msg-{n}").as_bytes(),
        );
        let _ = harness::process(station, &bob, &msg);
    }
    let alice_id: Id = "alice@a1".parse().unwrap();
    assert_eq!(station.store.count(&alice_id), 2);

    // The neighbor connects, then Alice's login (relayed here) points at it.
    let neighbor = harness::bind_session(station, "gsp@s002");
    let login = dim_core::Command::Login(LoginCommand {
        id: alice_id.clone(),
        station: LoginStation {
            id: Id::station("gsp", "s002"),
            host: None,
            port: None,
        },
        time: 1_700_000_100.0,
        agent: None,
    });
    let alice_session = harness::bind_session(station, "alice@a1");
    let login_msg = harness::command_message("alice@a1", "gsp@s001", "alice-key", &login);
    let _ = harness::process(station, &alice_session, &login_msg);

    // Run the roaming worker over the queued job.
    let (sd_tx, sd_rx) = tokio::sync::watch::channel(false);
    let workers = booted.workers;
    let worker = tokio::spawn(station::dispatcher::run_roaming_worker(
        station.clone(),
        workers.roaming_rx,
        sd_rx,
    ));
    let mut replayed = Vec::new();
    for _ in 0..100 {
        replayed.extend(harness::peek_all(&neighbor));
        if replayed.len() >= 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(replayed.len(), 2);
    // Insertion order is preserved on replay.
    assert_eq!(replayed[0].data_bytes().unwrap(), b"msg-0");
    assert_eq!(replayed[1].data_bytes().unwrap(), b"msg-1");

    sd_tx.send(true).unwrap();
    let _ = worker.await;
}
