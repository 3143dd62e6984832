use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, AppResult},
    evolution::{map_gateway_status, parse_gateway_contact, parse_gateway_message},
    jid::{Jid, JidKind},
    realtime,
    store::{self, config_text, ContactIdentity},
    sync::{ingest_gateway_message, IngestOutcome, IngestSource},
    types::{AppState, Channel},
};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// `MESSAGES_UPSERT`, `messages.upsert` and `Messages.Upsert` name the same event.
pub fn normalize_event(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('_', ".")
}

pub fn verify_signature(secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Channels without a `webhookSecret` accept every delivery. Otherwise the
/// body must be signed, or carry the secret in its `apikey` field as
/// Evolution does when no signing proxy sits in front of it.
pub fn authenticate(secret: &str, signature_header: Option<&str>, body: &[u8], payload: &Value) -> bool {
    if secret.is_empty() {
        return true;
    }
    if signature_header.is_some() {
        return verify_signature(secret, signature_header, body);
    }
    payload
        .get("apikey")
        .and_then(Value::as_str)
        .is_some_and(|key| key.trim() == secret)
}

fn data_items(payload: &Value) -> Vec<Value> {
    match payload.get("data") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(obj)) => match obj.get("messages").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => vec![Value::Object(obj.clone())],
        },
        _ => Vec::new(),
    }
}

/// `(external_id, status)` out of a `messages.update` item. Evolution v2 sends
/// a flat `{ keyId, status }`, older versions `{ key: { id }, update: { status } }`.
pub fn parse_status_update(item: &Value) -> Option<(String, &'static str)> {
    let external_id = item
        .get("keyId")
        .and_then(Value::as_str)
        .into_iter()
        .chain(item.get("key").and_then(|k| k.get("id")).and_then(Value::as_str))
        .map(str::trim)
        .find(|id| !id.is_empty())?;
    let status = item
        .get("status")
        .or_else(|| item.get("update").and_then(|u| u.get("status")))
        .and_then(map_gateway_status)?;
    Some((external_id.to_string(), status))
}

async fn handle_messages(state: &Arc<AppState>, channel: &Channel, payload: &Value) -> AppResult<usize> {
    let mut processed = 0usize;
    for item in data_items(payload) {
        let Some(msg) = parse_gateway_message(&item) else {
            warn!(channel_id = %channel.id, "skipping malformed webhook message");
            continue;
        };
        match ingest_gateway_message(state, channel, &msg, IngestSource::Webhook).await? {
            IngestOutcome::Inserted(_) => processed += 1,
            IngestOutcome::Duplicate => {}
            IngestOutcome::Skipped(reason) => {
                debug!(external_id = %msg.external_id, reason, "webhook message skipped");
            }
        }
    }
    Ok(processed)
}

async fn handle_status_updates(
    state: &Arc<AppState>,
    channel: &Channel,
    payload: &Value,
) -> AppResult<usize> {
    let mut processed = 0usize;
    for item in data_items(payload) {
        let Some((external_id, status)) = parse_status_update(&item) else {
            continue;
        };
        if let Some((message_id, conversation_id)) = store::set_message_status_by_external_id(
            &state.db,
            &channel.company_id,
            &external_id,
            status,
        )
        .await?
        {
            realtime::emit_message_status(
                state,
                &channel.company_id,
                &message_id,
                &conversation_id,
                status,
            )
            .await;
            processed += 1;
        }
    }
    Ok(processed)
}

async fn handle_contacts(state: &Arc<AppState>, channel: &Channel, payload: &Value) -> AppResult<usize> {
    let mut processed = 0usize;
    for item in data_items(payload) {
        let Some(contact) = parse_gateway_contact(&item) else {
            continue;
        };
        let Some(jid) = Jid::parse(&contact.remote_jid) else {
            continue;
        };
        if !matches!(jid.kind, JidKind::Phone | JidKind::Lid) {
            continue;
        }
        let mut identity = ContactIdentity::from_jids(&channel.company_id, &jid, None);
        identity.push_name = contact.push_name;
        identity.avatar_url = contact.profile_pic_url;
        if store::upsert_contact_identity(&state.db, &identity).await?.is_some() {
            processed += 1;
        }
    }
    Ok(processed)
}

async fn handle_connection(state: &Arc<AppState>, channel: &Channel, payload: &Value) -> AppResult<usize> {
    let connection_state = payload
        .get("data")
        .and_then(|d| d.get("state"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let Some(connection_state) = connection_state else {
        return Ok(0);
    };
    store::set_channel_connection_state(&state.db, &channel.id, connection_state).await?;
    info!(channel_id = %channel.id, state = connection_state, "channel connection changed");
    Ok(1)
}

pub async fn evolution_webhook(
    Path(channel_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let channel = store::find_channel(&state.db, &channel_id)
        .await?
        .ok_or(AppError::NotFound("channel"))?;
    if channel.channel_type != "whatsapp" {
        return Err(AppError::BadRequest(format!(
            "channel exists but type is '{}', expected 'whatsapp'",
            channel.channel_type
        )));
    }

    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    let secret = config_text(&channel.config, "webhookSecret");
    let signature_header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if !authenticate(&secret, signature_header, &body, &payload) {
        return Err(AppError::Unauthorized("invalid webhook signature".to_string()));
    }

    let event = payload
        .get("event")
        .and_then(Value::as_str)
        .map(normalize_event)
        .unwrap_or_default();
    let processed = match event.as_str() {
        "messages.upsert" | "send.message" => handle_messages(&state, &channel, &payload).await?,
        "messages.update" => handle_status_updates(&state, &channel, &payload).await?,
        "contacts.upsert" | "contacts.update" => handle_contacts(&state, &channel, &payload).await?,
        "connection.update" => handle_connection(&state, &channel, &payload).await?,
        _ => {
            debug!(channel_id = %channel.id, event = %event, "ignoring webhook event");
            0
        }
    };

    Ok(Json(json!({ "received": true, "event": event, "processed": processed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("key");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn normalizes_event_names() {
        assert_eq!(normalize_event("MESSAGES_UPSERT"), "messages.upsert");
        assert_eq!(normalize_event(" send.message "), "send.message");
        assert_eq!(normalize_event("Connection.Update"), "connection.update");
    }

    #[test]
    fn accepts_valid_hmac_and_rejects_tampering() {
        let body = br#"{"event":"messages.upsert"}"#;
        let header = sign("s3cret", body);
        assert!(verify_signature("s3cret", Some(&header), body));
        assert!(!verify_signature("s3cret", Some(&header), br#"{"event":"x"}"#));
        assert!(!verify_signature("other", Some(&header), body));
        assert!(!verify_signature("s3cret", Some("sha256=zz"), body));
        assert!(!verify_signature("s3cret", None, body));
    }

    #[test]
    fn apikey_in_payload_authenticates_unsigned_deliveries() {
        let body = b"{}";
        assert!(authenticate("", None, body, &json!({})));
        assert!(authenticate("s3cret", None, body, &json!({ "apikey": "s3cret" })));
        assert!(!authenticate("s3cret", None, body, &json!({ "apikey": "nope" })));
        assert!(!authenticate("s3cret", None, body, &json!({})));
        // a bad signature is not rescued by the apikey field
        assert!(!authenticate(
            "s3cret",
            Some("sha256=00"),
            body,
            &json!({ "apikey": "s3cret" })
        ));
    }

    #[test]
    fn reads_single_and_batched_data() {
        assert_eq!(data_items(&json!({ "data": { "key": {} } })).len(), 1);
        assert_eq!(data_items(&json!({ "data": [{}, {}] })).len(), 2);
        assert_eq!(data_items(&json!({ "data": { "messages": [{}, {}, {}] } })).len(), 3);
        assert!(data_items(&json!({})).is_empty());
    }

    #[test]
    fn parses_both_status_update_shapes() {
        assert_eq!(
            parse_status_update(&json!({ "keyId": "E1", "status": "READ" })),
            Some(("E1".to_string(), "read"))
        );
        assert_eq!(
            parse_status_update(&json!({ "key": { "id": "E2" }, "update": { "status": 3 } })),
            Some(("E2".to_string(), "delivered"))
        );
        assert_eq!(parse_status_update(&json!({ "keyId": "E3" })), None);
        assert_eq!(parse_status_update(&json!({ "status": "READ" })), None);
    }
}
