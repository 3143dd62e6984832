use std::sync::{atomic::Ordering, Arc};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    handlers::token_matches,
    types::{AppState, Conversation, EventEnvelopeIn, Message},
};

pub const MESSAGE_NEW: &str = "message:new";
pub const MESSAGE_STATUS: &str = "message:status";
pub const CONVERSATION_UPDATED: &str = "conversation:updated";

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

async fn emit_to_client<T: Serialize>(state: &Arc<AppState>, client_id: usize, event: &str, data: T) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };

    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

pub async fn emit_to_company<T: Serialize>(
    state: &Arc<AppState>,
    company_id: &str,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        rt.company_subscribers
            .get(company_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| rt.clients.get(id).cloned())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

pub async fn emit_message_new(state: &Arc<AppState>, message: &Message) {
    emit_to_company(state, &message.company_id, MESSAGE_NEW, message).await;
}

pub async fn emit_message_status(
    state: &Arc<AppState>,
    company_id: &str,
    message_id: &str,
    conversation_id: &str,
    status: &str,
) {
    emit_to_company(
        state,
        company_id,
        MESSAGE_STATUS,
        json!({
            "messageId": message_id,
            "conversationId": conversation_id,
            "status": status,
        }),
    )
    .await;
}

pub async fn emit_conversation_updated(state: &Arc<AppState>, conversation: &Conversation) {
    emit_to_company(state, &conversation.company_id, CONVERSATION_UPDATED, conversation).await;
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn subscribe(state: &Arc<AppState>, client_id: usize, data: &Value) {
    let company_id = data
        .get("companyId")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    let token = data.get("token").and_then(Value::as_str).unwrap_or("");

    if company_id.is_empty() {
        emit_to_client(state, client_id, "error", json!({ "message": "companyId is required" }))
            .await;
        return;
    }
    if !token_matches(&state.config.api_token, token) {
        emit_to_client(state, client_id, "auth:error", json!({ "message": "invalid token" }))
            .await;
        return;
    }

    {
        let mut rt = state.realtime.lock().await;
        if let Some(previous) = rt.subscribed_company.insert(client_id, company_id.to_string()) {
            if let Some(set) = rt.company_subscribers.get_mut(&previous) {
                set.remove(&client_id);
            }
        }
        rt.company_subscribers
            .entry(company_id.to_string())
            .or_default()
            .insert(client_id);
    }

    debug!(client_id, company_id, "realtime client subscribed");
    emit_to_client(state, client_id, "subscribed", json!({ "companyId": company_id })).await;
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "subscribe" => subscribe(&state, client_id, &envelope.data).await,
            "ping" => emit_to_client(&state, client_id, "pong", json!({})).await,
            other => debug!(client_id, event = other, "ignoring realtime event"),
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        if let Some(company_id) = rt.subscribed_company.remove(&client_id) {
            let now_empty = match rt.company_subscribers.get_mut(&company_id) {
                Some(set) => {
                    set.remove(&client_id);
                    set.is_empty()
                }
                None => false,
            };
            if now_empty {
                rt.company_subscribers.remove(&company_id);
            }
        }
    }
    info!(client_id, "realtime client disconnected");

    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_wraps_event_and_data() {
        let payload = event_payload("message:status", json!({ "status": "read" })).expect("payload");
        let value: Value = serde_json::from_str(&payload).expect("json");
        assert_eq!(value["event"], "message:status");
        assert_eq!(value["data"]["status"], "read");
    }
}
