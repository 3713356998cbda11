use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use courier::fanout::FanoutPolicy;
use courier::identity;
use courier::mailbox::MailboxEntry;
use courier::membership;
use courier::push::RecordingPushGateway;
use courier::server::{self, ServerContext, SESSION_HEADER};
use courier::storage::{DeviceState, Storage};

struct TestServer {
    base_url: String,
    ctx: ServerContext,
    _shutdown: oneshot::Sender<()>,
}

async fn start_server() -> TestServer {
    let ctx = ServerContext::new(
        Storage::open_in_memory().expect("open storage"),
        Arc::new(RecordingPushGateway::new()),
        FanoutPolicy::default(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = server::run(listener, ctx.clone(), async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    TestServer {
        base_url: format!("http://{}", addr),
        ctx,
        _shutdown: shutdown_tx,
    }
}

/// Register a verified device and return a session token for it.
async fn provision(server: &TestServer, user_id: &str, device_id: &str) -> String {
    let storage = server.ctx.store().lock().await;
    storage
        .upsert_device(user_id, device_id, DeviceState::Verified)
        .expect("upsert device");
    identity::issue_session(&storage, user_id, device_id).expect("issue session")
}

/// Issue a blocking request; returns status and body text for both success
/// and error statuses.
fn send(method: &str, url: &str, token: &str, body: Option<Value>) -> (u16, String) {
    let request = ureq::request(method, url).set(SESSION_HEADER, token);
    let result = match body {
        Some(body) => request.send_json(body),
        None => request.call(),
    };
    match result {
        Ok(response) => {
            let status = response.status();
            (status, response.into_string().expect("response body"))
        }
        Err(ureq::Error::Status(status, response)) => {
            (status, response.into_string().expect("error body"))
        }
        Err(err) => panic!("transport error: {err}"),
    }
}

async fn request(method: &str, url: String, token: &str, body: Option<Value>) -> (u16, String) {
    let method = method.to_string();
    let token = token.to_string();
    tokio::task::spawn_blocking(move || send(&method, &url, &token, body))
        .await
        .expect("request task")
}

async fn fetch_messages(base_url: &str, token: &str) -> Vec<MailboxEntry> {
    let (status, body) = request("GET", format!("{base_url}/messages"), token, None).await;
    assert_eq!(status, 200);
    body.lines()
        .map(|line| serde_json::from_str(line).expect("ndjson line"))
        .collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn direct_message_reaches_both_devices_once() {
    let server = start_server().await;
    let alice = provision(&server, "alice", "alice-phone").await;
    let bob_1 = provision(&server, "bob", "bob-1").await;
    let bob_2 = provision(&server, "bob", "bob-2").await;

    let (status, body) = request(
        "POST",
        format!("{}/messages", server.base_url),
        &alice,
        Some(json!({"recipient_id": "bob", "contents": "hi", "excerpt": "hi"})),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    let receipt: Value = serde_json::from_str(&body).unwrap();
    let message_id = receipt["message_id"].as_i64().unwrap();
    assert!(receipt["message_timestamp"].as_f64().unwrap() > 0.0);

    for token in [&bob_1, &bob_2] {
        let entries = fetch_messages(&server.base_url, token).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sender_id, "alice");
        assert_eq!(entries[0].contents, "hi");
        assert_eq!(entries[0].message_id, message_id);
        assert!(fetch_messages(&server.base_url, token).await.is_empty());
    }

    for (token, peer) in [(&bob_1, "alice"), (&alice, "bob")] {
        let (status, body) =
            request("GET", format!("{}/conversations", server.base_url), token, None).await;
        assert_eq!(status, 200);
        let summaries: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(summaries[0]["chat_id"], peer);
        assert_eq!(summaries[0]["excerpt"], "hi");
    }
}

#[tokio::test]
async fn bad_tokens_and_encrypted_sends_are_rejected() {
    let server = start_server().await;
    let alice = provision(&server, "alice", "alice-phone").await;
    provision(&server, "bob", "bob-1").await;

    let (status, body) = request(
        "POST",
        format!("{}/messages", server.base_url),
        "not-a-token",
        Some(json!({"recipient_id": "bob", "contents": "hi"})),
    )
    .await;
    assert_eq!(status, 401);
    let error: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(error["kind"], "invalid_session");

    let (status, body) = request(
        "POST",
        format!("{}/messages", server.base_url),
        &alice,
        Some(json!({"recipient_id": "bob", "contents": "x", "encrypted": true})),
    )
    .await;
    assert_eq!(status, 501);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["kind"], "not_implemented");

    let ws_url = format!(
        "{}/notifications?token=nope",
        server.base_url.replace("http://", "ws://")
    );
    assert!(tokio_tungstenite::connect_async(ws_url).await.is_err());
}

#[tokio::test]
async fn notification_stream_wakes_and_is_superseded() {
    let server = start_server().await;
    let alice = provision(&server, "alice", "alice-phone").await;
    let bob = provision(&server, "bob", "bob-1").await;
    let ws_url = format!(
        "{}/notifications?token={}",
        server.base_url.replace("http://", "ws://"),
        bob
    );

    let (mut first, _) = tokio_tungstenite::connect_async(ws_url.clone())
        .await
        .expect("connect first");
    let presence = server.ctx.presence().clone();
    wait_until(|| presence.is_live("bob-1")).await;

    let (status, _) = request(
        "POST",
        format!("{}/messages", server.base_url),
        &alice,
        Some(json!({"recipient_id": "bob", "contents": "ping", "excerpt": "ping"})),
    )
    .await;
    assert_eq!(status, 200);

    let frame = tokio::time::timeout(Duration::from_secs(5), first.next())
        .await
        .expect("wake in time")
        .expect("stream open")
        .expect("frame");
    let text = match frame {
        WsMessage::Text(text) => text,
        other => panic!("unexpected frame {other:?}"),
    };
    let wake: Value = serde_json::from_str(&text).unwrap();
    assert!(wake["timestamp"].as_f64().unwrap() > 0.0);

    let (_second, _) = tokio_tungstenite::connect_async(ws_url)
        .await
        .expect("connect second");

    // The first stream closes without seeing any further wake.
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = first.next().await {
            match frame {
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(WsMessage::Text(text)) => panic!("superseded stream got {text}"),
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
    assert!(presence.is_live("bob-1"));
    assert_eq!(presence.live_count(), 1);
}

#[tokio::test]
async fn receipts_become_management_messages() {
    let server = start_server().await;
    let alice = provision(&server, "alice", "alice-phone").await;
    let bob = provision(&server, "bob", "bob-1").await;

    let (status, body) = request(
        "POST",
        format!("{}/messages/state", server.base_url),
        &bob,
        Some(json!({"chat_id": "alice", "message_id": 1234, "status": "read"})),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["success"], true);

    let entries = fetch_messages(&server.base_url, &alice).await;
    assert_eq!(entries.len(), 1);
    let contents: Value = serde_json::from_str(&entries[0].contents).unwrap();
    assert_eq!(contents["messageType"], "management");
    assert_eq!(contents["command"]["messageId"], 1234);
    assert_eq!(contents["command"]["type"], "read");

    // Receipts never touch the conversation list.
    let (_, body) =
        request("GET", format!("{}/conversations", server.base_url), &alice, None).await;
    assert_eq!(body, "[]");

    let (status, body) = request(
        "POST",
        format!("{}/messages/state", server.base_url),
        &bob,
        Some(json!({"chat_id": "nobody", "message_id": 1, "status": "received"})),
    )
    .await;
    assert_eq!(status, 404);
    assert_eq!(
        serde_json::from_str::<Value>(&body).unwrap()["kind"],
        "recipient_not_found"
    );
}

#[tokio::test]
async fn group_administration_and_fanout() {
    let server = start_server().await;
    let alice = provision(&server, "alice", "alice-phone").await;
    let bob = provision(&server, "bob", "bob-1").await;
    let carol = provision(&server, "carol", "carol-1").await;
    let base = server.base_url.clone();

    let (status, body) = request(
        "POST",
        format!("{base}/groups"),
        &alice,
        Some(json!({"title": "team", "participants": ["bob"]})),
    )
    .await;
    assert_eq!(status, 201, "{body}");
    let group_id = serde_json::from_str::<Value>(&body).unwrap()["group_id"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, _) = request(
        "POST",
        format!("{base}/groups/{group_id}/members"),
        &bob,
        Some(json!({"user_ids": ["carol"]})),
    )
    .await;
    assert_eq!(status, 403);

    let (status, body) = request(
        "POST",
        format!("{base}/groups/{group_id}/members"),
        &alice,
        Some(json!({"user_ids": ["carol"]})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["added"], 1);

    let (status, _) = request(
        "DELETE",
        format!("{base}/groups/{group_id}/members/alice"),
        &alice,
        None,
    )
    .await;
    assert_eq!(status, 400);

    let (status, _) = request("POST", format!("{base}/groups/{group_id}/exit"), &bob, None).await;
    assert_eq!(status, 200);

    let (status, _) = request(
        "POST",
        format!("{base}/messages"),
        &alice,
        Some(json!({"recipient_id": group_id, "contents": "hello", "excerpt": "hello"})),
    )
    .await;
    assert_eq!(status, 200);

    assert_eq!(fetch_messages(&base, &alice).await.len(), 1);
    assert_eq!(fetch_messages(&base, &carol).await.len(), 1);
    assert!(fetch_messages(&base, &bob).await.is_empty());

    let (status, _) = request(
        "DELETE",
        format!("{base}/groups/{group_id}/admins/alice"),
        &alice,
        None,
    )
    .await;
    assert_eq!(status, 200);
    let (status, _) = request(
        "POST",
        format!("{base}/groups/{group_id}/members"),
        &alice,
        Some(json!({"user_ids": ["bob"]})),
    )
    .await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn group_rename_and_participant_listing() {
    let server = start_server().await;
    let alice = provision(&server, "alice", "alice-phone").await;
    let bob = provision(&server, "bob", "bob-1").await;
    let carol = provision(&server, "carol", "carol-1").await;
    let base = server.base_url.clone();

    let (status, body) = request(
        "POST",
        format!("{base}/groups"),
        &alice,
        Some(json!({"title": "team", "participants": ["bob"]})),
    )
    .await;
    assert_eq!(status, 201, "{body}");
    let group_id = serde_json::from_str::<Value>(&body).unwrap()["group_id"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, _) = request(
        "PUT",
        format!("{base}/groups/{group_id}/title"),
        &bob,
        Some(json!({"title": "bob's team"})),
    )
    .await;
    assert_eq!(status, 403);

    let (status, body) = request(
        "PUT",
        format!("{base}/groups/{group_id}/title"),
        &alice,
        Some(json!({"title": "renamed"})),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    {
        let storage = server.ctx.store().lock().await;
        let group = membership::get_group(storage.connection(), &group_id)
            .unwrap()
            .unwrap();
        assert_eq!(group.title, "renamed");
    }

    let (status, body) = request(
        "GET",
        format!("{base}/groups/{group_id}/members"),
        &bob,
        None,
    )
    .await;
    assert_eq!(status, 200, "{body}");
    let participants: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(participants[0]["user_id"], "alice");
    assert_eq!(participants[0]["is_admin"], true);
    assert_eq!(participants[1]["user_id"], "bob");
    assert_eq!(participants[1]["is_admin"], false);

    let (status, _) = request(
        "GET",
        format!("{base}/groups/{group_id}/members"),
        &carol,
        None,
    )
    .await;
    assert_eq!(status, 403);

    let (status, _) = request("GET", format!("{base}/groups/missing/members"), &alice, None).await;
    assert_eq!(status, 404);
    let (status, _) = request(
        "PUT",
        format!("{base}/groups/missing/title"),
        &alice,
        Some(json!({"title": "x"})),
    )
    .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn ack_and_push_token_registration() {
    let server = start_server().await;
    let bob = provision(&server, "bob", "bob-1").await;

    let (status, _) = request(
        "POST",
        format!("{}/notifications/ack", server.base_url),
        &bob,
        Some(json!({"recipient": "alice"})),
    )
    .await;
    assert_eq!(status, 403);

    let (status, _) = request(
        "POST",
        format!("{}/notifications/ack", server.base_url),
        &bob,
        Some(json!({"recipient": "bob"})),
    )
    .await;
    assert_eq!(status, 200);

    let (status, _) = request(
        "POST",
        format!("{}/push-token", server.base_url),
        &bob,
        Some(json!({"token": "fcm-bob"})),
    )
    .await;
    assert_eq!(status, 200);
    let storage = server.ctx.store().lock().await;
    assert_eq!(
        storage.get_push_token("bob-1").unwrap().unwrap().token,
        "fcm-bob"
    );
}

#[tokio::test]
async fn health_reports_live_subscriptions() {
    let server = start_server().await;
    let (status, body) = request("GET", format!("{}/health", server.base_url), "", None).await;
    assert_eq!(status, 200);
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["live_subscriptions"], 0);
}
