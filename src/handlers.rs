use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    extract::{ApiJson, ApiQuery},
    queue::{queue_outbound, Outbound},
    realtime,
    store,
    sync::{self, load_channel, whatsapp_instance},
    types::{
        AppState, Channel, CompanyQuery, ContactsQuery, ConversationStatusBody, CreateChannelBody,
        ListConversationsQuery, ListMessagesQuery, SendMessageBody, SyncAvatarsQuery,
        SyncHistoryQuery, UpdateChannelBody,
    },
};

pub const CHANNEL_TYPES: [&str; 4] = ["whatsapp", "web", "instagram", "api"];
pub const CONVERSATION_STATUSES: [&str; 3] = ["open", "pending", "resolved"];
pub const MEDIA_TYPES: [&str; 4] = ["image", "audio", "video", "document"];
const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 200;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get("authorization")?.to_str().ok()?;
    Some(header.strip_prefix("Bearer ")?.trim())
}

/// Constant-time comparison of a presented token with the configured one.
pub fn token_matches(expected: &str, provided: &str) -> bool {
    let provided = provided.trim();
    if expected.is_empty() || provided.is_empty() || expected.len() != provided.len() {
        return false;
    }
    expected
        .bytes()
        .zip(provided.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

pub fn authorize(state: &Arc<AppState>, headers: &HeaderMap) -> AppResult<()> {
    let token = bearer_token(headers)
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;
    if !token_matches(&state.config.api_token, token) {
        return Err(AppError::Unauthorized("invalid token".to_string()));
    }
    Ok(())
}

/// Runs before extractors so a missing token wins over a malformed request.
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    match authorize(&state, request.headers()) {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}

fn page_size(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

fn require_company(company_id: &str) -> AppResult<&str> {
    let company_id = company_id.trim();
    if company_id.is_empty() {
        return Err(AppError::BadRequest("companyId is required".to_string()));
    }
    Ok(company_id)
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now() }))
}

// ── Channels ────────────────────────────────────────────────────────────

pub async fn list_channels(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<CompanyQuery>,
) -> AppResult<Json<Value>> {
    let company_id = require_company(&query.company_id)?;
    let channels = store::list_channels(&state.db, company_id).await?;
    Ok(Json(json!({ "channels": channels, "availableTypes": CHANNEL_TYPES })))
}

fn validate_channel(channel_type: &str, instance_name: &str, config: &Value) -> AppResult<()> {
    if !CHANNEL_TYPES.contains(&channel_type) {
        return Err(AppError::BadRequest(format!(
            "channelType must be one of {}",
            CHANNEL_TYPES.join(", ")
        )));
    }
    if channel_type == "whatsapp" && instance_name.is_empty() {
        return Err(AppError::BadRequest(
            "instanceName is required for whatsapp channels".to_string(),
        ));
    }
    if !config.is_object() {
        return Err(AppError::BadRequest("config must be an object".to_string()));
    }
    Ok(())
}

pub async fn create_channel(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<CreateChannelBody>,
) -> AppResult<impl IntoResponse> {
    let company_id = require_company(&body.company_id)?;
    let channel_type = body.channel_type.trim().to_ascii_lowercase();
    let instance_name = body.instance_name.as_deref().unwrap_or("").trim().to_string();
    let config = body.config.unwrap_or_else(|| json!({}));
    validate_channel(&channel_type, &instance_name, &config)?;
    let name = body
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{channel_type} channel"));

    store::ensure_company(&state.db, company_id).await?;
    let now = Utc::now();
    let channel = Channel {
        id: Uuid::new_v4().to_string(),
        company_id: company_id.to_string(),
        channel_type,
        name,
        instance_name,
        config,
        enabled: true,
        connection_state: "unknown".to_string(),
        created_at: now,
        updated_at: now,
    };
    store::create_channel(&state.db, &channel).await?;
    info!(channel_id = %channel.id, company_id = %channel.company_id, "channel created");
    Ok((StatusCode::CREATED, Json(json!({ "channel": channel }))))
}

pub async fn update_channel(
    Path(channel_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<UpdateChannelBody>,
) -> AppResult<Json<Value>> {
    let mut channel = load_channel(&state, &channel_id).await?;
    if let Some(name) = body.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
        channel.name = name;
    }
    if let Some(instance_name) = body.instance_name {
        channel.instance_name = instance_name.trim().to_string();
    }
    if let Some(config) = body.config {
        channel.config = config;
    }
    if let Some(enabled) = body.enabled {
        channel.enabled = enabled;
    }
    validate_channel(&channel.channel_type, &channel.instance_name, &channel.config)?;
    channel.updated_at = Utc::now();
    store::update_channel(&state.db, &channel).await?;
    Ok(Json(json!({ "channel": channel })))
}

pub async fn delete_channel(
    Path(channel_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Value>> {
    if !store::delete_channel(&state.db, &channel_id).await? {
        return Err(AppError::NotFound("channel"));
    }
    info!(channel_id = %channel_id, "channel deleted");
    Ok(Json(json!({ "deleted": true })))
}

pub async fn channel_connection(
    Path(channel_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Value>> {
    let channel = load_channel(&state, &channel_id).await?;
    let instance = whatsapp_instance(&channel)?;
    let connection_state = state.gateway.connection_state(instance).await?;
    store::set_channel_connection_state(&state.db, &channel.id, &connection_state).await?;
    Ok(Json(json!({ "channelId": channel.id, "state": connection_state })))
}

// ── Contacts ────────────────────────────────────────────────────────────

pub async fn list_contacts(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ContactsQuery>,
) -> AppResult<Json<Value>> {
    let company_id = require_company(&query.company_id)?;
    let contacts = store::list_contacts(&state.db, company_id, query.q.as_deref()).await?;
    Ok(Json(json!({ "contacts": contacts })))
}

pub async fn get_contact(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<CompanyQuery>,
) -> AppResult<Json<Value>> {
    let company_id = require_company(&query.company_id)?;
    let contact = store::get_contact(&state.db, &contact_id)
        .await?
        .filter(|c| c.company_id == company_id)
        .ok_or(AppError::NotFound("contact"))?;
    Ok(Json(json!({ "contact": contact })))
}

pub async fn delete_contact(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<CompanyQuery>,
) -> AppResult<Json<Value>> {
    let company_id = require_company(&query.company_id)?;
    if !store::delete_contact(&state.db, company_id, &contact_id).await? {
        return Err(AppError::NotFound("contact"));
    }
    Ok(Json(json!({ "deleted": true })))
}

// ── Conversations ───────────────────────────────────────────────────────

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ListConversationsQuery>,
) -> AppResult<Json<Value>> {
    let company_id = require_company(&query.company_id)?;
    let status = query.status.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if let Some(status) = status {
        if !CONVERSATION_STATUSES.contains(&status) {
            return Err(AppError::BadRequest(format!("unknown status '{status}'")));
        }
    }
    let conversations =
        store::list_conversations(&state.db, company_id, status, page_size(query.limit)).await?;
    Ok(Json(json!({ "conversations": conversations })))
}

pub async fn get_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Value>> {
    let conversation = store::get_conversation(&state.db, &conversation_id)
        .await?
        .ok_or(AppError::NotFound("conversation"))?;
    let contact = match conversation.contact_id.as_deref() {
        Some(id) => store::get_contact(&state.db, id).await?,
        None => None,
    };
    Ok(Json(json!({ "conversation": conversation, "contact": contact })))
}

pub async fn update_conversation_status(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<ConversationStatusBody>,
) -> AppResult<Json<Value>> {
    let status = body.status.trim().to_ascii_lowercase();
    if !CONVERSATION_STATUSES.contains(&status.as_str()) {
        return Err(AppError::BadRequest(format!(
            "status must be one of {}",
            CONVERSATION_STATUSES.join(", ")
        )));
    }
    if !store::set_conversation_status(&state.db, &conversation_id, &status).await? {
        return Err(AppError::NotFound("conversation"));
    }
    let conversation = store::get_conversation(&state.db, &conversation_id)
        .await?
        .ok_or(AppError::NotFound("conversation"))?;
    realtime::emit_conversation_updated(&state, &conversation).await;
    Ok(Json(json!({ "conversation": conversation })))
}

pub async fn mark_conversation_read(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Value>> {
    if !store::mark_read(&state.db, &conversation_id).await? {
        return Err(AppError::NotFound("conversation"));
    }
    let conversation = store::get_conversation(&state.db, &conversation_id)
        .await?
        .ok_or(AppError::NotFound("conversation"))?;
    realtime::emit_conversation_updated(&state, &conversation).await;
    Ok(Json(json!({ "conversation": conversation })))
}

// ── Messages ────────────────────────────────────────────────────────────

pub async fn list_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ListMessagesQuery>,
) -> AppResult<Json<Value>> {
    if store::get_conversation(&state.db, &conversation_id).await?.is_none() {
        return Err(AppError::NotFound("conversation"));
    }
    let cursor = store::MessageCursor {
        before: query.before,
        before_id: query.before_id.as_deref().map(str::trim).filter(|id| !id.is_empty()),
    };
    let messages =
        store::list_messages(&state.db, &conversation_id, &cursor, page_size(query.limit)).await?;
    Ok(Json(json!({ "messages": messages })))
}

/// `(message_type, media_url)` for an outbound message.
pub fn outbound_kind(body: &SendMessageBody) -> AppResult<(String, String)> {
    let media_url = body.media_url.as_deref().unwrap_or("").trim().to_string();
    if media_url.is_empty() {
        if body.content.trim().is_empty() {
            return Err(AppError::BadRequest("content or mediaUrl is required".to_string()));
        }
        return Ok(("text".to_string(), media_url));
    }
    let media_type = body
        .media_type
        .as_deref()
        .map(|t| t.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "document".to_string());
    if !MEDIA_TYPES.contains(&media_type.as_str()) {
        return Err(AppError::BadRequest(format!(
            "mediaType must be one of {}",
            MEDIA_TYPES.join(", ")
        )));
    }
    Ok((media_type, media_url))
}

pub async fn send_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<SendMessageBody>,
) -> AppResult<impl IntoResponse> {
    let (message_type, media_url) = outbound_kind(&body)?;
    let conversation = store::get_conversation(&state.db, &conversation_id)
        .await?
        .ok_or(AppError::NotFound("conversation"))?;
    let channel = sync::conversation_channel(&state, &conversation).await?;
    whatsapp_instance(&channel)?;

    let mut metadata = json!({ "remoteJid": conversation.remote_jid });
    if let Some(file_name) = body.file_name.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        metadata["fileName"] = json!(file_name);
    }
    let (message, job) = queue_outbound(
        &state,
        &conversation,
        Outbound {
            content: body.content.trim(),
            message_type: &message_type,
            media_url: &media_url,
            metadata,
            broadcast_id: None,
            send_at: Utc::now(),
        },
    )
    .await?;
    info!(message_id = %message.id, job_id = %job.id, "outbound message queued");
    Ok((StatusCode::ACCEPTED, Json(json!({ "message": message, "job": job }))))
}

// ── Gateway sync ────────────────────────────────────────────────────────

pub async fn sync_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<SyncHistoryQuery>,
) -> AppResult<Json<Value>> {
    let report = sync::sync_conversation_history(&state, &conversation_id, query.limit).await?;
    Ok(Json(json!(report)))
}

pub async fn sync_channel_contacts(
    Path(channel_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Value>> {
    let report = sync::sync_contacts(&state, &channel_id).await?;
    Ok(Json(json!(report)))
}

pub async fn sync_channel_avatars(
    Path(channel_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<SyncAvatarsQuery>,
) -> AppResult<Json<Value>> {
    let report = sync::sync_avatars(&state, &channel_id, query.only_missing).await?;
    Ok(Json(json!(report)))
}

pub async fn sync_channel_chats(
    Path(channel_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Value>> {
    let report = sync::sync_chats(&state, &channel_id).await?;
    Ok(Json(json!(report)))
}
