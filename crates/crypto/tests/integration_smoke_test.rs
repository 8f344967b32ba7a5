//! End-to-end flow between two agent devices sharing nothing but messages:
//! device key exchange, Olm session from a claimed key, room key share,
//! Megolm encrypt/decrypt, a decryption gap closed by a forwarded key, and
//! session rotation.

use std::collections::BTreeMap;

use mxagent_crypto::devices::{self, DeviceListUpdate};
use mxagent_crypto::group::{
    self, IngestOutcome, KeyOrigin, RoomDecryption, RoomKeyMaterial, RotationPolicy,
};
use mxagent_crypto::identity;
use mxagent_crypto::message;
use mxagent_crypto::prekeys;
use mxagent_crypto::session;
use mxagent_crypto::storage::device_store::DeviceRecord;
use mxagent_crypto::storage::migrations::run_crypto_migrations;
use mxagent_crypto::storage::CryptoStore;
use mxagent_crypto::trust::TrustPolicy;
use mxagent_shared::api::keys::DeviceKeys;
use mxagent_shared::api::to_device::RoomKeyContent;
use mxagent_shared::constants::EVENT_ROOM_KEY;
use mxagent_shared::ids::DeviceId;
use serde_json::json;

const ROOM: &str = "!room:hs";

fn init_test_db() -> rusqlite::Connection {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "PRAGMA key = \"x'0000000000000000000000000000000000000000000000000000000000000000'\";",
    )
    .unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    run_crypto_migrations(&conn).unwrap();
    conn
}

fn device(user: &str, device_id: &str) -> rusqlite::Connection {
    let conn = init_test_db();
    identity::generate_identity(&conn, user, device_id).unwrap();
    devices::record_own_device(&conn, 0).unwrap();
    conn
}

fn learn(conn: &rusqlite::Connection, user: &str, keys: DeviceKeys) -> DeviceListUpdate {
    let query: BTreeMap<DeviceId, DeviceKeys> = BTreeMap::from([(keys.device_id.clone(), keys)]);
    devices::ingest_device_keys(conn, user, &query, 0).unwrap()
}

/// Alice learns Bob's device and opens an Olm session with a claimed key.
fn connect(alice: &rusqlite::Connection, bob: &rusqlite::Connection) -> DeviceRecord {
    let update = learn(alice, "@bob:hs", identity::device_keys(bob).unwrap());
    let bob_device = update.new_devices[0].clone();
    learn(bob, "@alice:hs", identity::device_keys(alice).unwrap());

    let claimed = prekeys::keys_to_upload(bob, 0).unwrap().into_values().next().unwrap();
    prekeys::mark_keys_published(bob).unwrap();
    session::establish_from_claim(alice, &bob_device, &claimed).unwrap();
    bob_device
}

/// Bob receives whatever room keys Alice shares and installs them.
fn deliver_room_keys(alice: &rusqlite::Connection, bob: &rusqlite::Connection, recipients: &[DeviceRecord], now: i64) -> String {
    let plan = group::prepare_outbound(alice, ROOM, recipients, &RotationPolicy::default(), now).unwrap();
    let shares = group::share_room_key(alice, ROOM, &plan.unshared).unwrap();
    for (_, content) in &shares {
        let decrypted = message::decrypt_to_device(bob, "@alice:hs", content).unwrap();
        assert_eq!(decrypted.event_type, EVENT_ROOM_KEY);
        let key: RoomKeyContent = serde_json::from_value(decrypted.content).unwrap();
        group::ingest_room_key(
            bob,
            key.room_id.as_str(),
            &key.session_id,
            &decrypted.sender_key,
            RoomKeyMaterial::Session(&key.session_key),
            KeyOrigin::RoomKey,
        )
        .unwrap();
    }
    group::mark_shared(alice, ROOM, &plan.session_id, &plan.unshared).unwrap();
    plan.session_id
}

#[test]
fn room_message_roundtrip() {
    let alice = device("@alice:hs", "ALICE");
    let bob = device("@bob:hs", "BOB");
    let bob_device = connect(&alice, &bob);

    let recipients =
        devices::recipient_devices(&alice, &["@bob:hs".to_string()], TrustPolicy::TrustOnFirstUse).unwrap();
    assert_eq!(recipients, vec![bob_device]);
    let session_id = deliver_room_keys(&alice, &bob, &recipients, 1_000);

    let encrypted = group::encrypt_room_event(
        &alice,
        ROOM,
        &recipients,
        "m.room.message",
        json!({"msgtype": "m.text", "body": "hello"}),
        1_000,
    )
    .unwrap();
    assert_eq!(encrypted.session_id, session_id);

    match group::decrypt_room_event(&bob, ROOM, "$e1", &encrypted).unwrap() {
        RoomDecryption::Plaintext(event) => {
            assert_eq!(event.content["body"], "hello");
            assert_eq!(event.message_index, 0);
        }
        RoomDecryption::Gap { .. } => panic!("bob holds the key"),
    }

    // A second message reuses the session without another share.
    let plan = group::prepare_outbound(&alice, ROOM, &recipients, &RotationPolicy::default(), 1_001).unwrap();
    assert_eq!(plan.session_id, session_id);
    assert!(plan.unshared.is_empty());
}

#[test]
fn missing_key_is_a_gap_until_forwarded() {
    let alice = device("@alice:hs", "ALICE");
    let bob = device("@bob:hs", "BOB");
    connect(&alice, &bob);
    let recipients =
        devices::recipient_devices(&alice, &["@bob:hs".to_string()], TrustPolicy::TrustOnFirstUse).unwrap();

    // The m.room_key to-device message never reaches Bob.
    let plan = group::prepare_outbound(&alice, ROOM, &recipients, &RotationPolicy::default(), 0).unwrap();
    group::mark_shared(&alice, ROOM, &plan.session_id, &plan.unshared).unwrap();
    let encrypted = group::encrypt_room_event(
        &alice,
        ROOM,
        &recipients,
        "m.room.message",
        json!({"body": "lost"}),
        0,
    )
    .unwrap();

    let result = group::decrypt_room_event(&bob, ROOM, "$lost", &encrypted).unwrap();
    assert!(matches!(result, RoomDecryption::Gap { .. }));
    let gaps = CryptoStore::new(&bob).pending_gaps().unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].session_id, plan.session_id);
    assert_eq!(gaps[0].event_ids, vec!["$lost".to_string()]);

    let forwarded = group::forwarded_key_content(&alice, ROOM, &plan.session_id)
        .unwrap()
        .unwrap();
    let ingest = |origin| {
        group::ingest_room_key(
            &bob,
            ROOM,
            &forwarded.session_id,
            &forwarded.sender_key,
            RoomKeyMaterial::Exported(&forwarded.session_key),
            origin,
        )
        .unwrap()
    };
    assert_eq!(ingest(KeyOrigin::Forwarded), IngestOutcome::Inserted);
    assert!(CryptoStore::new(&bob).pending_gaps().unwrap().is_empty());

    match group::decrypt_room_event(&bob, ROOM, "$lost", &encrypted).unwrap() {
        RoomDecryption::Plaintext(event) => assert_eq!(event.content["body"], "lost"),
        RoomDecryption::Gap { .. } => panic!("forwarded key should decrypt"),
    }

    // Receiving the same key from backup later changes nothing.
    assert_eq!(ingest(KeyOrigin::Backup), IngestOutcome::Unchanged);
}

#[test]
fn session_rotates_after_message_limit() {
    let alice = device("@alice:hs", "ALICE");
    let bob = device("@bob:hs", "BOB");
    connect(&alice, &bob);
    let recipients =
        devices::recipient_devices(&alice, &["@bob:hs".to_string()], TrustPolicy::TrustOnFirstUse).unwrap();
    let policy = RotationPolicy {
        max_messages: 2,
        ..RotationPolicy::default()
    };

    let first = group::prepare_outbound(&alice, ROOM, &recipients, &policy, 0).unwrap();
    group::share_room_key(&alice, ROOM, &first.unshared).unwrap();
    group::mark_shared(&alice, ROOM, &first.session_id, &first.unshared).unwrap();
    for i in 0..2 {
        group::encrypt_room_event(&alice, ROOM, &recipients, "m.room.message", json!({"n": i}), 0).unwrap();
    }

    let second = group::prepare_outbound(&alice, ROOM, &recipients, &policy, 0).unwrap();
    assert!(second.rotated);
    assert_ne!(second.session_id, first.session_id);
    assert_eq!(second.unshared.len(), 1);
}

#[test]
fn to_device_payload_survives_both_directions() {
    let alice = device("@alice:hs", "ALICE");
    let bob = device("@bob:hs", "BOB");
    let bob_device = connect(&alice, &bob);

    let first = message::encrypt_to_device(&alice, &bob_device, "m.dummy", json!({})).unwrap();
    let received = message::decrypt_to_device(&bob, "@alice:hs", &first).unwrap();
    assert!(received.new_session);
    assert_eq!(received.sender_device.as_deref(), Some("ALICE"));

    let alice_device = devices::list_devices(&bob, "@alice:hs").unwrap().remove(0);
    let reply = message::encrypt_to_device(&bob, &alice_device, "m.dummy", json!({"pong": true})).unwrap();
    let back = message::decrypt_to_device(&alice, "@bob:hs", &reply).unwrap();
    assert!(!back.new_session);
    assert_eq!(back.content["pong"], true);
}
