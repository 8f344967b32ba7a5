mod common;

use mxagent::service::AgentSession;
use mxagent_shared::error::MxError;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use common::{config, endpoint, homeserver, mount_device_query};

#[tokio::test]
async fn persisted_cursor_is_used_after_reopening() {
    let server = homeserver().await;
    mount_device_query(&server, &[]).await;
    Mock::given(method("GET"))
        .and(path(endpoint("sync")))
        .and(query_param("since", "s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"next_batch": "s2"})))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(endpoint("sync")))
        .and(query_param("timeout", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"next_batch": "s1"})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    {
        let session = AgentSession::open(config(&server, dir.path())).await.unwrap();
        assert_eq!(session.manager().sync_token().unwrap(), None);
        let outcome = session.catch_up().await.unwrap();
        assert_eq!(outcome.next_batch, "s1");
    }

    let session = AgentSession::open(config(&server, dir.path())).await.unwrap();
    assert_eq!(session.manager().sync_token().unwrap().as_deref(), Some("s1"));
    let outcome = session.catch_up().await.unwrap();
    assert_eq!(outcome.next_batch, "s2");
    assert_eq!(session.manager().sync_token().unwrap().as_deref(), Some("s2"));

    // Keys went up once; the reopened store remembered it.
    let uploads = common::request_bodies(&server, &endpoint("keys/upload")).await;
    assert_eq!(uploads.len(), 1);
}

#[tokio::test]
async fn transient_sync_failure_is_retried() {
    let server = homeserver().await;
    mount_device_query(&server, &[]).await;
    Mock::given(method("GET"))
        .and(path(endpoint("sync")))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    common::mount_empty_sync(&server, "s1").await;

    let dir = tempfile::tempdir().unwrap();
    let session = AgentSession::open(config(&server, dir.path())).await.unwrap();
    session.catch_up().await.unwrap();
    assert_eq!(session.manager().sync_token().unwrap().as_deref(), Some("s1"));
}

#[tokio::test]
async fn rejected_token_is_not_retried() {
    let server = homeserver().await;
    Mock::given(method("GET"))
        .and(path(endpoint("sync")))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "errcode": "M_UNKNOWN_TOKEN",
            "error": "Invalid access token"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let session = AgentSession::open(config(&server, dir.path())).await.unwrap();
    let err = session.catch_up().await.unwrap_err();
    assert!(matches!(err, MxError::AuthFailure(_)), "{err:?}");
    assert_eq!(session.manager().sync_token().unwrap(), None);
}

#[tokio::test]
async fn joined_member_devices_are_queried() {
    let server = homeserver().await;
    let bob = common::Peer::new("@bob:hs", "BOBDEV");
    mount_device_query(&server, &[("@bob:hs", bob.device_keys(Some("Element")))]).await;
    Mock::given(method("GET"))
        .and(path(endpoint("sync")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next_batch": "s1",
            "rooms": {"join": {"!room:hs": {"state": {"events": [
                {"event_id": "$m", "type": "m.room.member", "sender": "@bob:hs",
                 "state_key": "@bob:hs", "content": {"membership": "join"}}
            ]}}}},
            "device_lists": {"changed": ["@bob:hs"]}
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let session = AgentSession::open(config(&server, dir.path())).await.unwrap();
    let outcome = session.catch_up().await.unwrap();
    assert_eq!(outcome.new_devices, 1);

    let devices = session.manager().devices_of("@bob:hs").unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, "BOBDEV");
    assert_eq!(devices[0].display_name.as_deref(), Some("Element"));
}
