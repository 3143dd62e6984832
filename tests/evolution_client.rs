use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use inbox_server::{
    error::GatewayError,
    evolution::{EvolutionClient, Gateway, MessageKind, OutgoingMedia},
};

#[derive(Default)]
struct Recorded {
    requests: Vec<(String, Option<String>, Value)>,
}

type Shared = Arc<Mutex<Recorded>>;

async fn record(state: &Shared, path: String, headers: &HeaderMap, body: Value) {
    let apikey = headers
        .get("apikey")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.lock().await.requests.push((path, apikey, body));
}

async fn send_text(
    Path(instance): Path<String>,
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    record(&state, format!("sendText/{instance}"), &headers, body.clone()).await;
    if body["number"] == json!("000") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": ["number does not exist"] })),
        );
    }
    (
        StatusCode::CREATED,
        Json(json!({
            "key": { "id": "3EB0SENT", "remoteJid": format!("{}@s.whatsapp.net", body["number"].as_str().unwrap_or("")), "fromMe": true },
            "status": "PENDING"
        })),
    )
}

async fn send_media(
    Path(instance): Path<String>,
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    record(&state, format!("sendMedia/{instance}"), &headers, body).await;
    Json(json!({ "key": { "id": "3EB0MEDIA", "remoteJid": "5511987654321@s.whatsapp.net" } }))
}

async fn find_messages(
    Path(instance): Path<String>,
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    record(&state, format!("findMessages/{instance}"), &headers, body).await;
    Json(json!({
        "messages": {
            "total": 2,
            "records": [
                {
                    "key": { "id": "M1", "remoteJid": "5511987654321@s.whatsapp.net", "fromMe": false },
                    "pushName": "Maria",
                    "message": { "conversation": "oi" },
                    "messageTimestamp": 1_700_000_000
                },
                {
                    "key": { "id": "M2", "remoteJid": "5511987654321@s.whatsapp.net", "fromMe": true },
                    "message": { "imageMessage": { "url": "https://cdn/x.jpg", "caption": "foto" } },
                    "messageTimestamp": 1_700_000_100
                },
                { "key": { "remoteJid": "broken" } }
            ]
        }
    }))
}

async fn find_contacts(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    record(&state, "findContacts".to_string(), &headers, body).await;
    Json(json!([
        { "remoteJid": "5511987654321@s.whatsapp.net", "pushName": "Maria", "profilePicUrl": "https://pics/maria.jpg" },
        { "id": "cmabc", "remoteJid": "123456789012345@lid", "pushName": null },
        { "id": "no-jid" }
    ]))
}

async fn find_chats(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    record(&state, "findChats".to_string(), &headers, body).await;
    Json(json!([
        { "remoteJid": "5511987654321@s.whatsapp.net", "name": "Maria", "unreadCount": 2 },
        { "id": "120363000000000000@g.us", "name": "Equipe" }
    ]))
}

async fn profile_picture(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    let missing = body["number"] == json!("5511000000000");
    record(&state, "fetchProfilePictureUrl".to_string(), &headers, body).await;
    if missing {
        return Json(json!({ "wuid": "5511000000000@s.whatsapp.net", "profilePictureUrl": null }));
    }
    Json(json!({ "wuid": "5511987654321@s.whatsapp.net", "profilePictureUrl": "https://pics/maria.jpg" }))
}

async fn connection_state(Path(instance): Path<String>) -> (StatusCode, Json<Value>) {
    if instance == "ghost" {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "instance not found" })));
    }
    (StatusCode::OK, Json(json!({ "instance": { "instanceName": instance, "state": "open" } })))
}

async fn start_mock() -> (String, Shared) {
    let state: Shared = Arc::default();
    let app = Router::new()
        .route("/message/sendText/{instance}", post(send_text))
        .route("/message/sendMedia/{instance}", post(send_media))
        .route("/chat/findMessages/{instance}", post(find_messages))
        .route("/chat/findContacts/{instance}", post(find_contacts))
        .route("/chat/findChats/{instance}", post(find_chats))
        .route("/chat/fetchProfilePictureUrl/{instance}", post(profile_picture))
        .route("/instance/connectionState/{instance}", get(connection_state))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock gateway");
    let addr = listener.local_addr().expect("mock address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock gateway");
    });
    (format!("http://{addr}/"), state)
}

fn client(base_url: &str) -> EvolutionClient {
    EvolutionClient::new(base_url, "evo-key", Duration::from_secs(5)).expect("client")
}

#[tokio::test]
async fn send_text_posts_number_and_reads_key() {
    let (base_url, state) = start_mock().await;
    let sent = client(&base_url)
        .send_text("inst1", "5511987654321", "hello")
        .await
        .expect("send");
    assert_eq!(sent.external_id, "3EB0SENT");
    assert_eq!(sent.status, "pending");

    let recorded = state.lock().await;
    let (path, apikey, body) = &recorded.requests[0];
    assert_eq!(path, "sendText/inst1");
    assert_eq!(apikey.as_deref(), Some("evo-key"));
    assert_eq!(body, &json!({ "number": "5511987654321", "text": "hello" }));
}

#[tokio::test]
async fn rejected_send_is_a_permanent_status_error() {
    let (base_url, _) = start_mock().await;
    let err = client(&base_url)
        .send_text("inst1", "000", "hello")
        .await
        .expect_err("gateway should reject");
    match &err {
        GatewayError::Status { status, body } => {
            assert_eq!(*status, 400);
            assert!(body.contains("number does not exist"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_permanent());
}

#[tokio::test]
async fn send_media_includes_file_name() {
    let (base_url, state) = start_mock().await;
    let media = OutgoingMedia {
        media_type: "document".to_string(),
        url: "https://files/contract.pdf".to_string(),
        caption: "contrato".to_string(),
        file_name: Some("contract.pdf".to_string()),
    };
    let sent = client(&base_url)
        .send_media("inst1", "5511987654321", &media)
        .await
        .expect("send media");
    assert_eq!(sent.external_id, "3EB0MEDIA");
    assert_eq!(sent.status, "sent");

    let recorded = state.lock().await;
    let (_, _, body) = &recorded.requests[0];
    assert_eq!(body["mediatype"], json!("document"));
    assert_eq!(body["fileName"], json!("contract.pdf"));
}

#[tokio::test]
async fn find_messages_filters_by_chat_and_skips_malformed_records() {
    let (base_url, state) = start_mock().await;
    let messages = client(&base_url)
        .find_messages("inst1", "5511987654321@s.whatsapp.net", 25)
        .await
        .expect("history");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].external_id, "M1");
    assert_eq!(messages[0].push_name, "Maria");
    assert_eq!(messages[1].kind, MessageKind::Image);
    assert_eq!(messages[1].media_url, "https://cdn/x.jpg");
    assert!(messages[1].from_me);

    let recorded = state.lock().await;
    let (_, _, body) = &recorded.requests[0];
    assert_eq!(body["where"]["key"]["remoteJid"], json!("5511987654321@s.whatsapp.net"));
    assert_eq!(body["limit"], json!(25));
}

#[tokio::test]
async fn find_contacts_and_chats_accept_bare_arrays() {
    let (base_url, _) = start_mock().await;
    let gateway = client(&base_url);

    let contacts = gateway.find_contacts("inst1").await.expect("contacts");
    assert_eq!(contacts.len(), 2);
    assert_eq!(contacts[0].push_name.as_deref(), Some("Maria"));
    assert_eq!(contacts[0].profile_pic_url.as_deref(), Some("https://pics/maria.jpg"));
    assert_eq!(contacts[1].remote_jid, "123456789012345@lid");
    assert_eq!(contacts[1].push_name, None);

    let chats = gateway.find_chats("inst1").await.expect("chats");
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0].unread_count, 2);
    assert_eq!(chats[1].remote_jid, "120363000000000000@g.us");
}

#[tokio::test]
async fn profile_picture_may_be_missing() {
    let (base_url, _) = start_mock().await;
    let gateway = client(&base_url);
    assert_eq!(
        gateway
            .fetch_profile_picture("inst1", "5511987654321")
            .await
            .expect("picture"),
        Some("https://pics/maria.jpg".to_string())
    );
    assert_eq!(
        gateway
            .fetch_profile_picture("inst1", "5511000000000")
            .await
            .expect("picture"),
        None
    );
}

#[tokio::test]
async fn connection_state_reads_nested_state() {
    let (base_url, _) = start_mock().await;
    let gateway = client(&base_url);
    assert_eq!(gateway.connection_state("inst1").await.expect("state"), "open");
    let err = gateway.connection_state("ghost").await.expect_err("missing instance");
    assert!(matches!(err, GatewayError::Status { status: 404, .. }));
}
