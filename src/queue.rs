use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult, GatewayError},
    evolution::{OutgoingMedia, SentMessage},
    extract::ApiQuery,
    jid::{send_target, Jid},
    realtime,
    store::{self, NewMessage},
    sync::{conversation_channel, whatsapp_instance},
    types::{AppState, CompanyQuery, Conversation, Message, QueueJob},
};

const QUEUE_COLUMNS: &str = "id, company_id, conversation_id, message_id, broadcast_id, status, \
     attempts, max_attempts, next_attempt_at, last_error";

/// Jobs left in `processing` this long belong to a worker that died mid-send.
const STALE_PROCESSING_SECS: i64 = 600;

/// Delay before the next attempt after `attempts` failed ones:
/// `min(base * 2^(attempts - 1), max)`.
pub fn backoff_secs(attempts: i32, base_secs: i64, max_secs: i64) -> i64 {
    let exponent = attempts.saturating_sub(1).clamp(0, 32) as u32;
    base_secs
        .max(0)
        .saturating_mul(2i64.saturating_pow(exponent))
        .min(max_secs)
}

fn parse_queue_row(row: &PgRow) -> QueueJob {
    QueueJob {
        id: row.get("id"),
        company_id: row.get("company_id"),
        conversation_id: row.get("conversation_id"),
        message_id: row.get("message_id"),
        broadcast_id: row.get("broadcast_id"),
        status: row.get("status"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        next_attempt_at: row.get("next_attempt_at"),
        last_error: row.get("last_error"),
    }
}

pub struct NewJob<'a> {
    pub company_id: &'a str,
    pub conversation_id: &'a str,
    pub message_id: &'a str,
    pub broadcast_id: Option<&'a str>,
    pub send_at: DateTime<Utc>,
}

pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    job: &NewJob<'_>,
    max_attempts: i32,
) -> Result<QueueJob, sqlx::Error> {
    let row = sqlx::query(&format!(
        "INSERT INTO message_queue (id, company_id, conversation_id, message_id, broadcast_id, status, attempts, max_attempts, next_attempt_at) \
         VALUES ($1,$2,$3,$4,$5,'pending',0,$6,$7) \
         RETURNING {QUEUE_COLUMNS}"
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(job.company_id)
    .bind(job.conversation_id)
    .bind(job.message_id)
    .bind(job.broadcast_id)
    .bind(max_attempts)
    .bind(job.send_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(parse_queue_row(&row))
}

pub struct Outbound<'a> {
    pub content: &'a str,
    pub message_type: &'a str,
    pub media_url: &'a str,
    pub metadata: Value,
    pub broadcast_id: Option<&'a str>,
    pub send_at: DateTime<Utc>,
}

/// Stores an agent message as `pending` and queues its delivery inside the
/// caller's transaction. Nothing is broadcast until the caller commits.
pub async fn stage_outbound(
    tx: &mut Transaction<'_, Postgres>,
    conversation: &Conversation,
    outbound: Outbound<'_>,
    max_attempts: i32,
) -> Result<(Message, QueueJob), sqlx::Error> {
    let message = store::insert_message_idempotent(
        tx,
        &NewMessage {
            company_id: &conversation.company_id,
            conversation_id: &conversation.id,
            sender_type: "agent",
            from_me: true,
            content: outbound.content,
            message_type: outbound.message_type,
            media_url: outbound.media_url,
            external_id: None,
            status: "pending",
            metadata: outbound.metadata,
            created_at: Utc::now(),
            counts_as_new: true,
        },
    )
    .await?
    // rows without an external id never conflict
    .ok_or(sqlx::Error::RowNotFound)?;

    let job = enqueue(
        tx,
        &NewJob {
            company_id: &conversation.company_id,
            conversation_id: &conversation.id,
            message_id: &message.id,
            broadcast_id: outbound.broadcast_id,
            send_at: outbound.send_at,
        },
        max_attempts,
    )
    .await?;
    Ok((message, job))
}

pub async fn queue_outbound(
    state: &Arc<AppState>,
    conversation: &Conversation,
    outbound: Outbound<'_>,
) -> Result<(Message, QueueJob), sqlx::Error> {
    let mut tx = state.db.begin().await?;
    let (message, job) =
        stage_outbound(&mut tx, conversation, outbound, state.config.queue.max_attempts).await?;
    tx.commit().await?;

    realtime::emit_message_new(state, &message).await;
    Ok((message, job))
}

/// Claims due jobs for this worker. Rows locked by another worker are
/// skipped, so a job is never sent twice concurrently.
async fn claim_due_jobs(pool: &PgPool, batch_size: i64) -> Result<Vec<QueueJob>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "UPDATE message_queue SET status = 'processing', attempts = attempts + 1, updated_at = now() \
         WHERE id IN ( \
             SELECT id FROM message_queue \
             WHERE status = 'pending' AND next_attempt_at <= now() \
             ORDER BY next_attempt_at ASC \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING {QUEUE_COLUMNS}"
    ))
    .bind(batch_size)
    .fetch_all(pool)
    .await?;
    let mut jobs = rows.iter().map(parse_queue_row).collect::<Vec<_>>();
    jobs.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at));
    Ok(jobs)
}

async fn requeue_stale_jobs(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE message_queue SET status = 'pending', updated_at = now() \
         WHERE status = 'processing' AND updated_at < now() - make_interval(secs => $1)",
    )
    .bind(STALE_PROCESSING_SECS as f64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

struct SendFailure {
    message: String,
    permanent: bool,
}

impl SendFailure {
    fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }
}

impl From<GatewayError> for SendFailure {
    fn from(err: GatewayError) -> Self {
        Self {
            permanent: err.is_permanent(),
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for SendFailure {
    fn from(err: sqlx::Error) -> Self {
        Self {
            message: err.to_string(),
            permanent: false,
        }
    }
}

async fn deliver(state: &Arc<AppState>, job: &QueueJob) -> Result<SentMessage, SendFailure> {
    let message = store::get_message(&state.db, &job.message_id)
        .await?
        .ok_or_else(|| SendFailure::permanent("message no longer exists"))?;
    let conversation = store::get_conversation(&state.db, &job.conversation_id)
        .await?
        .ok_or_else(|| SendFailure::permanent("conversation no longer exists"))?;
    let channel = conversation_channel(state, &conversation)
        .await
        .map_err(|err| SendFailure::permanent(err.to_string()))?;
    let instance =
        whatsapp_instance(&channel).map_err(|err| SendFailure::permanent(err.to_string()))?;
    let jid = Jid::parse(&conversation.remote_jid)
        .ok_or_else(|| SendFailure::permanent(format!("invalid remote jid {}", conversation.remote_jid)))?;
    let number = send_target(&jid);

    let sent = if message.media_url.trim().is_empty() {
        state
            .gateway
            .send_text(instance, &number, &message.content)
            .await?
    } else {
        let media = OutgoingMedia {
            media_type: message.message_type.clone(),
            url: message.media_url.clone(),
            caption: message.content.clone(),
            file_name: message
                .metadata
                .get("fileName")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        state.gateway.send_media(instance, &number, &media).await?
    };
    Ok(sent)
}

async fn bump_broadcast(pool: &PgPool, broadcast_id: &str, delivered: bool) -> Result<(), sqlx::Error> {
    let counter = if delivered { "sent" } else { "failed" };
    sqlx::query(&format!(
        "UPDATE broadcasts SET {counter} = {counter} + 1, \
             status = CASE WHEN sent + failed + 1 >= total THEN 'completed' ELSE status END, \
             updated_at = now() \
         WHERE id = $1"
    ))
    .bind(broadcast_id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn complete_job(state: &Arc<AppState>, job: &QueueJob, sent: &SentMessage) -> Result<(), sqlx::Error> {
    let status = match sent.status {
        "delivered" | "read" => sent.status,
        _ => "sent",
    };
    store::attach_external_id(&state.db, &job.company_id, &job.message_id, &sent.external_id, status)
        .await?;
    sqlx::query(
        "UPDATE message_queue SET status = 'sent', last_error = '', updated_at = now() WHERE id = $1",
    )
    .bind(&job.id)
    .execute(&state.db)
    .await?;
    if let Some(broadcast_id) = &job.broadcast_id {
        bump_broadcast(&state.db, broadcast_id, true).await?;
    }
    realtime::emit_message_status(state, &job.company_id, &job.message_id, &job.conversation_id, status)
        .await;
    Ok(())
}

async fn fail_job(state: &Arc<AppState>, job: &QueueJob, failure: &SendFailure) -> Result<(), sqlx::Error> {
    let queue = &state.config.queue;
    if !failure.permanent && job.attempts < job.max_attempts {
        let delay = backoff_secs(job.attempts, queue.backoff_base_secs, queue.backoff_max_secs);
        sqlx::query(
            "UPDATE message_queue SET status = 'pending', next_attempt_at = $2, last_error = $3, updated_at = now() \
             WHERE id = $1",
        )
        .bind(&job.id)
        .bind(Utc::now() + Duration::seconds(delay))
        .bind(&failure.message)
        .execute(&state.db)
        .await?;
        warn!(
            job_id = %job.id,
            attempts = job.attempts,
            retry_in_secs = delay,
            error = %failure.message,
            "send failed, retrying"
        );
        return Ok(());
    }

    sqlx::query(
        "UPDATE message_queue SET status = 'failed', last_error = $2, updated_at = now() WHERE id = $1",
    )
    .bind(&job.id)
    .bind(&failure.message)
    .execute(&state.db)
    .await?;
    store::set_message_status(&state.db, &job.message_id, "failed").await?;
    if let Some(broadcast_id) = &job.broadcast_id {
        bump_broadcast(&state.db, broadcast_id, false).await?;
    }
    realtime::emit_message_status(state, &job.company_id, &job.message_id, &job.conversation_id, "failed")
        .await;
    error!(job_id = %job.id, attempts = job.attempts, error = %failure.message, "send failed permanently");
    Ok(())
}

/// Sends one batch of due jobs. Returns how many were claimed.
pub async fn process_message_queue(state: &Arc<AppState>) -> Result<usize, sqlx::Error> {
    let jobs = claim_due_jobs(&state.db, state.config.queue.batch_size).await?;
    for job in &jobs {
        let recorded = match deliver(state, job).await {
            Ok(sent) => complete_job(state, job, &sent).await,
            Err(failure) => fail_job(state, job, &failure).await,
        };
        if let Err(e) = recorded {
            error!(job_id = %job.id, "queue: failed to record job outcome: {e}");
        }
    }
    Ok(jobs.len())
}

pub async fn queue_worker(state: Arc<AppState>) {
    let poll_interval = state.config.queue.poll_interval;
    info!(poll_secs = poll_interval.as_secs(), "queue worker started");
    loop {
        tokio::time::sleep(poll_interval).await;

        match requeue_stale_jobs(&state.db).await {
            Ok(0) => {}
            Ok(n) => warn!(requeued = n, "requeued stale queue jobs"),
            Err(e) => error!("queue: failed to requeue stale jobs: {e}"),
        }
        match process_message_queue(&state).await {
            Ok(0) => {}
            Ok(n) => info!(processed = n, "queue batch processed"),
            Err(e) => error!("queue: batch failed: {e}"),
        }
    }
}

pub async fn queue_status(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<CompanyQuery>,
) -> AppResult<Json<Value>> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*)::bigint AS n FROM message_queue WHERE company_id = $1 GROUP BY status",
    )
    .bind(&query.company_id)
    .fetch_all(&state.db)
    .await?;

    let mut counts = ["pending", "processing", "sent", "failed"]
        .into_iter()
        .map(|status| (status.to_string(), 0i64))
        .collect::<BTreeMap<_, _>>();
    for row in rows {
        counts.insert(row.get("status"), row.get("n"));
    }
    Ok(Json(json!({ "companyId": query.company_id, "counts": counts })))
}

pub async fn retry_job(
    Path(job_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Value>> {
    let row = sqlx::query(&format!(
        "UPDATE message_queue SET status = 'pending', attempts = 0, next_attempt_at = now(), last_error = '', updated_at = now() \
         WHERE id = $1 AND status = 'failed' \
         RETURNING {QUEUE_COLUMNS}"
    ))
    .bind(&job_id)
    .fetch_optional(&state.db)
    .await?;

    let Some(row) = row else {
        let exists = sqlx::query("SELECT 1 FROM message_queue WHERE id = $1")
            .bind(&job_id)
            .fetch_optional(&state.db)
            .await?
            .is_some();
        return Err(if exists {
            AppError::Conflict("only failed jobs can be retried".to_string())
        } else {
            AppError::NotFound("queue job")
        });
    };
    let job = parse_queue_row(&row);
    store::set_message_status(&state.db, &job.message_id, "pending").await?;
    info!(job_id = %job.id, "queue job reset for retry");
    Ok(Json(json!({ "job": job })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let delays = (1..=8).map(|n| backoff_secs(n, 30, 3600)).collect::<Vec<_>>();
        assert_eq!(delays, vec![30, 60, 120, 240, 480, 960, 1920, 3600]);
    }

    #[test]
    fn backoff_handles_degenerate_attempts() {
        assert_eq!(backoff_secs(0, 30, 3600), 30);
        assert_eq!(backoff_secs(-3, 30, 3600), 30);
        assert_eq!(backoff_secs(500, 30, 3600), 3600);
        assert_eq!(backoff_secs(3, 0, 3600), 0);
    }

    #[test]
    fn permanent_gateway_errors_skip_retries() {
        let rejected: SendFailure = GatewayError::Status {
            status: 400,
            body: "number does not exist".to_string(),
        }
        .into();
        assert!(rejected.permanent);
        let throttled: SendFailure = GatewayError::Status {
            status: 429,
            body: String::new(),
        }
        .into();
        assert!(!throttled.permanent);
    }
}
