use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use sqlx::{postgres::PgRow, Postgres, Row, Transaction};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    extract::{ApiJson, ApiQuery},
    jid::Jid,
    queue::{stage_outbound, Outbound},
    realtime,
    store::{self, NewConversation},
    sync::{conversation_jids, whatsapp_instance},
    templating::{render_broadcast, validate_template, RecipientContext},
    types::{
        AppState, Broadcast, CompanyQuery, CreateBroadcastBody, CreateScheduledMessageBody, Message,
        ScheduledMessage,
    },
};

const BROADCAST_COLUMNS: &str =
    "id, company_id, channel_id, name, template, status, total, sent, failed, created_at, updated_at";

const SCHEDULED_COLUMNS: &str =
    "id, company_id, conversation_id, content, send_at, status, message_id, created_at";

pub const MAX_BROADCAST_RECIPIENTS: usize = 1000;
pub const MAX_BROADCAST_INTERVAL_SECS: i64 = 3600;
const SCHEDULER_BATCH: i64 = 100;

fn parse_broadcast_row(row: &PgRow) -> Broadcast {
    Broadcast {
        id: row.get("id"),
        company_id: row.get("company_id"),
        channel_id: row.get("channel_id"),
        name: row.get("name"),
        template: row.get("template"),
        status: row.get("status"),
        total: row.get("total"),
        sent: row.get("sent"),
        failed: row.get("failed"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_scheduled_row(row: &PgRow) -> ScheduledMessage {
    ScheduledMessage {
        id: row.get("id"),
        company_id: row.get("company_id"),
        conversation_id: row.get("conversation_id"),
        content: row.get("content"),
        send_at: row.get("send_at"),
        status: row.get("status"),
        message_id: row.get("message_id"),
        created_at: row.get("created_at"),
    }
}

/// Field-level problems with a broadcast request, before any lookup.
pub fn validate_broadcast(body: &CreateBroadcastBody) -> Result<(), String> {
    if body.company_id.trim().is_empty() {
        return Err("companyId is required".to_string());
    }
    if body.name.trim().is_empty() {
        return Err("name is required".to_string());
    }
    if body.contact_ids.is_empty() {
        return Err("contactIds must not be empty".to_string());
    }
    if body.contact_ids.len() > MAX_BROADCAST_RECIPIENTS {
        return Err(format!(
            "at most {MAX_BROADCAST_RECIPIENTS} recipients per broadcast"
        ));
    }
    if !(0..=MAX_BROADCAST_INTERVAL_SECS).contains(&body.interval_secs) {
        return Err(format!(
            "intervalSecs must be between 0 and {MAX_BROADCAST_INTERVAL_SECS}"
        ));
    }
    validate_template(&body.template).map_err(|err| format!("invalid template: {err}"))
}

pub async fn create_broadcast(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<CreateBroadcastBody>,
) -> AppResult<impl IntoResponse> {
    validate_broadcast(&body).map_err(AppError::BadRequest)?;

    let channel = store::find_channel(&state.db, &body.channel_id)
        .await?
        .filter(|c| c.company_id == body.company_id)
        .ok_or(AppError::NotFound("channel"))?;
    whatsapp_instance(&channel)?;

    let mut recipients = Vec::new();
    let mut skipped = Vec::new();
    for contact_id in &body.contact_ids {
        let contact = store::get_contact(&state.db, contact_id)
            .await?
            .filter(|c| c.company_id == body.company_id);
        let jid = contact.as_ref().and_then(|c| {
            Jid::phone(&c.phone).or_else(|| Jid::parse(&format!("{}@lid", c.lid.trim())))
        });
        match (contact, jid) {
            (Some(contact), Some(jid)) => recipients.push((contact, jid)),
            _ => skipped.push(contact_id.clone()),
        }
    }
    if recipients.is_empty() {
        return Err(AppError::BadRequest(
            "none of the contacts can be reached on whatsapp".to_string(),
        ));
    }

    // the broadcast row and every job commit together, so a counter never
    // waits on jobs that were never queued
    let mut tx = state.db.begin().await?;
    let row = sqlx::query(&format!(
        "INSERT INTO broadcasts (id, company_id, channel_id, name, template, status, total) \
         VALUES ($1,$2,$3,$4,$5,'running',$6) \
         RETURNING {BROADCAST_COLUMNS}"
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(&body.company_id)
    .bind(&channel.id)
    .bind(body.name.trim())
    .bind(&body.template)
    .bind(recipients.len() as i32)
    .fetch_one(&mut *tx)
    .await?;
    let broadcast = parse_broadcast_row(&row);

    let start = Utc::now();
    let mut queued = Vec::with_capacity(recipients.len());
    for (index, (contact, jid)) in recipients.iter().enumerate() {
        let candidates = conversation_jids(jid, None, Some(contact));
        let remote_jid = match store::find_conversation_by_jids(&state.db, &body.company_id, &candidates)
            .await?
        {
            Some(existing) => existing.remote_jid,
            None => candidates.first().cloned().unwrap_or_else(|| jid.to_string()),
        };
        let conversation = store::upsert_conversation(
            &mut tx,
            &NewConversation {
                company_id: &body.company_id,
                channel_id: Some(&channel.id),
                contact_id: Some(&contact.id),
                remote_jid: &remote_jid,
                is_group: false,
            },
        )
        .await?;

        let text = render_broadcast(
            &body.template,
            &RecipientContext {
                name: contact.name.trim(),
                phone: &contact.phone,
            },
        );
        let (message, _) = stage_outbound(
            &mut tx,
            &conversation,
            Outbound {
                content: &text,
                message_type: "text",
                media_url: "",
                metadata: json!({ "broadcastId": broadcast.id }),
                broadcast_id: Some(&broadcast.id),
                send_at: start + Duration::seconds(body.interval_secs * index as i64),
            },
            state.config.queue.max_attempts,
        )
        .await?;
        queued.push(message);
    }
    tx.commit().await?;

    for message in &queued {
        realtime::emit_message_new(&state, message).await;
    }
    if !skipped.is_empty() {
        warn!(broadcast_id = %broadcast.id, skipped = skipped.len(), "broadcast skipped unreachable contacts");
    }
    info!(broadcast_id = %broadcast.id, total = broadcast.total, "broadcast queued");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "broadcast": broadcast, "skipped": skipped })),
    ))
}

pub async fn list_broadcasts(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<CompanyQuery>,
) -> AppResult<Json<Value>> {
    let rows = sqlx::query(&format!(
        "SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE company_id = $1 ORDER BY created_at DESC"
    ))
    .bind(&query.company_id)
    .fetch_all(&state.db)
    .await?;
    let broadcasts = rows.iter().map(parse_broadcast_row).collect::<Vec<_>>();
    Ok(Json(json!({ "broadcasts": broadcasts })))
}

pub async fn create_scheduled_message(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<CreateScheduledMessageBody>,
) -> AppResult<impl IntoResponse> {
    let content = body.content.trim();
    if content.is_empty() {
        return Err(AppError::BadRequest("content is required".to_string()));
    }
    if body.send_at <= Utc::now() {
        return Err(AppError::BadRequest("sendAt must be in the future".to_string()));
    }
    let conversation = store::get_conversation(&state.db, &body.conversation_id)
        .await?
        .ok_or(AppError::NotFound("conversation"))?;

    let row = sqlx::query(&format!(
        "INSERT INTO scheduled_messages (id, company_id, conversation_id, content, send_at, status) \
         VALUES ($1,$2,$3,$4,$5,'scheduled') \
         RETURNING {SCHEDULED_COLUMNS}"
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(&conversation.company_id)
    .bind(&conversation.id)
    .bind(content)
    .bind(body.send_at)
    .fetch_one(&state.db)
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "scheduledMessage": parse_scheduled_row(&row) })),
    ))
}

pub async fn list_scheduled_messages(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<CompanyQuery>,
) -> AppResult<Json<Value>> {
    let rows = sqlx::query(&format!(
        "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE company_id = $1 ORDER BY send_at ASC"
    ))
    .bind(&query.company_id)
    .fetch_all(&state.db)
    .await?;
    let scheduled = rows.iter().map(parse_scheduled_row).collect::<Vec<_>>();
    Ok(Json(json!({ "scheduledMessages": scheduled })))
}

pub async fn cancel_scheduled_message(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Value>> {
    let row = sqlx::query(&format!(
        "UPDATE scheduled_messages SET status = 'cancelled', updated_at = now() \
         WHERE id = $1 AND status = 'scheduled' \
         RETURNING {SCHEDULED_COLUMNS}"
    ))
    .bind(&id)
    .fetch_optional(&state.db)
    .await?;
    if let Some(row) = row {
        return Ok(Json(json!({ "scheduledMessage": parse_scheduled_row(&row) })));
    }

    let exists = sqlx::query("SELECT 1 FROM scheduled_messages WHERE id = $1")
        .bind(&id)
        .fetch_optional(&state.db)
        .await?
        .is_some();
    Err(if exists {
        AppError::Conflict("only scheduled messages can be cancelled".to_string())
    } else {
        AppError::NotFound("scheduled message")
    })
}

/// Locks the oldest due scheduled message, skipping rows other schedulers
/// hold and rows that already failed during this pass.
async fn claim_next_scheduled(
    tx: &mut Transaction<'_, Postgres>,
    skip: &[String],
) -> Result<Option<ScheduledMessage>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages \
         WHERE status = 'scheduled' AND send_at <= now() AND NOT (id = ANY($1::text[])) \
         ORDER BY send_at ASC \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(skip)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.as_ref().map(parse_scheduled_row))
}

/// Stages the outbound message for a locked scheduled row and marks the row
/// `queued`. Returns `None` when the conversation is gone.
async fn promote_scheduled(
    state: &Arc<AppState>,
    tx: &mut Transaction<'_, Postgres>,
    scheduled: &ScheduledMessage,
) -> Result<Option<Message>, sqlx::Error> {
    let Some(conversation) = store::get_conversation(&state.db, &scheduled.conversation_id).await?
    else {
        sqlx::query("UPDATE scheduled_messages SET status = 'cancelled', updated_at = now() WHERE id = $1")
            .bind(&scheduled.id)
            .execute(&mut **tx)
            .await?;
        return Ok(None);
    };
    let (message, _) = stage_outbound(
        tx,
        &conversation,
        Outbound {
            content: &scheduled.content,
            message_type: "text",
            media_url: "",
            metadata: json!({ "scheduledMessageId": scheduled.id }),
            broadcast_id: None,
            send_at: Utc::now(),
        },
        state.config.queue.max_attempts,
    )
    .await?;
    sqlx::query(
        "UPDATE scheduled_messages SET status = 'queued', message_id = $2, updated_at = now() WHERE id = $1",
    )
    .bind(&scheduled.id)
    .bind(&message.id)
    .execute(&mut **tx)
    .await?;
    Ok(Some(message))
}

/// Moves due scheduled messages into the outbound queue, one transaction per
/// row. A row that fails stays `scheduled` and is retried on the next pass.
pub async fn promote_due_scheduled(state: &Arc<AppState>) -> Result<usize, sqlx::Error> {
    let mut promoted = 0usize;
    let mut failed = Vec::new();
    for _ in 0..SCHEDULER_BATCH {
        let mut tx = state.db.begin().await?;
        let Some(scheduled) = claim_next_scheduled(&mut tx, &failed).await? else {
            break;
        };
        match promote_scheduled(state, &mut tx, &scheduled).await {
            Ok(message) => {
                tx.commit().await?;
                if let Some(message) = message {
                    realtime::emit_message_new(state, &message).await;
                    promoted += 1;
                }
            }
            Err(e) => {
                error!(scheduled_id = %scheduled.id, "scheduler: failed to promote: {e}");
                if let Err(e) = tx.rollback().await {
                    warn!(scheduled_id = %scheduled.id, "scheduler: rollback failed: {e}");
                }
                failed.push(scheduled.id);
            }
        }
    }
    Ok(promoted)
}

pub async fn scheduler_worker(state: Arc<AppState>) {
    let poll_interval = state.config.queue.poll_interval;
    info!(poll_secs = poll_interval.as_secs(), "scheduler started");
    loop {
        tokio::time::sleep(poll_interval).await;
        match promote_due_scheduled(&state).await {
            Ok(0) => {}
            Ok(n) => info!(promoted = n, "scheduled messages queued"),
            Err(e) => error!("scheduler: failed to promote due messages: {e}"),
        }
    }
}
