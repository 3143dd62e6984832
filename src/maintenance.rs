use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    Json,
};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::{
    error::{AppError, AppResult},
    extract::{ApiJson, ApiQuery},
    reconcile::{
        plan_contact_merge, plan_conversation_merge, plan_message_dedup, plan_name_enrichment,
        ConversationRow, MessageRow, ObservedName, DEFAULT_DEDUP_WINDOW_SECS,
    },
    store::{self, parse_json_text},
    sync::lid_phone_pairs,
    types::{AppState, CompanyQuery, MaintenanceBody, MaintenanceReport},
};

pub const MAX_WINDOW_SECS: i64 = 3600;
const MAX_DETAILS: usize = 200;

fn report(body: &MaintenanceBody, operation: &str, groups: usize, affected: usize, details: Vec<Value>) -> MaintenanceReport {
    MaintenanceReport {
        dry_run: body.dry_run,
        company_id: body.company_id.clone(),
        operation: operation.to_string(),
        groups,
        affected,
        details: details.into_iter().take(MAX_DETAILS).collect(),
    }
}

fn require_company(company_id: &str) -> AppResult<()> {
    if company_id.trim().is_empty() {
        return Err(AppError::BadRequest("companyId is required".to_string()));
    }
    Ok(())
}

pub fn dedup_window(window_secs: Option<i64>) -> AppResult<i64> {
    let window = window_secs.unwrap_or(DEFAULT_DEDUP_WINDOW_SECS);
    if !(0..=MAX_WINDOW_SECS).contains(&window) {
        return Err(AppError::BadRequest(format!(
            "windowSecs must be between 0 and {MAX_WINDOW_SECS}"
        )));
    }
    Ok(window)
}

async fn load_message_rows(pool: &PgPool, company_id: &str) -> Result<Vec<MessageRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, conversation_id, from_me, message_type, content, media_url, external_id, created_at \
         FROM messages WHERE company_id = $1",
    )
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| MessageRow {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            from_me: row.get("from_me"),
            message_type: row.get("message_type"),
            content: row.get("content"),
            media_url: row.get("media_url"),
            external_id: row.get("external_id"),
            created_at: row.get("created_at"),
        })
        .collect())
}

async fn load_conversation_rows(
    pool: &PgPool,
    company_id: &str,
) -> Result<Vec<ConversationRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT c.id, c.remote_jid, c.contact_id, c.created_at, \
                (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)::bigint AS message_count \
         FROM conversations c WHERE c.company_id = $1",
    )
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| ConversationRow {
            id: row.get("id"),
            remote_jid: row.get("remote_jid"),
            contact_id: row.get("contact_id"),
            message_count: row.get("message_count"),
            created_at: row.get("created_at"),
        })
        .collect())
}

async fn load_observed_names(pool: &PgPool, company_id: &str) -> Result<Vec<ObservedName>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT c.contact_id, m.metadata, m.created_at \
         FROM messages m JOIN conversations c ON c.id = m.conversation_id \
         WHERE m.company_id = $1 AND m.from_me = false AND c.is_group = false AND c.contact_id IS NOT NULL",
    )
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .filter_map(|row| {
            let metadata = parse_json_text(&row.get::<String, _>("metadata"));
            let push_name = metadata.get("pushName").and_then(Value::as_str)?.trim().to_string();
            (!push_name.is_empty()).then(|| ObservedName {
                contact_id: row.get("contact_id"),
                push_name,
                seen_at: row.get("created_at"),
            })
        })
        .collect())
}

async fn lid_to_phone(pool: &PgPool, company_id: &str) -> Result<HashMap<String, String>, sqlx::Error> {
    let contacts = store::list_contacts(pool, company_id, None).await?;
    Ok(lid_phone_pairs(&contacts).into_iter().collect())
}

pub async fn dedupe_messages(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<MaintenanceBody>,
) -> AppResult<Json<MaintenanceReport>> {
    require_company(&body.company_id)?;
    let window = dedup_window(body.window_secs)?;

    let rows = load_message_rows(&state.db, &body.company_id).await?;
    let plan = plan_message_dedup(&rows, window);

    if !body.dry_run && !plan.is_empty() {
        let mut tx = state.db.begin().await?;
        sqlx::query("DELETE FROM messages WHERE company_id = $1 AND id = ANY($2::text[])")
            .bind(&body.company_id)
            .bind(&plan.remove)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    info!(
        company_id = %body.company_id,
        dry_run = body.dry_run,
        groups = plan.groups.len(),
        removed = plan.remove.len(),
        "dedupe-messages"
    );
    let details = plan.groups.iter().map(|g| json!(g)).collect();
    Ok(Json(report(&body, "dedupe-messages", plan.groups.len(), plan.remove.len(), details)))
}

pub async fn merge_conversations(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<MaintenanceBody>,
) -> AppResult<Json<MaintenanceReport>> {
    require_company(&body.company_id)?;

    let conversations = load_conversation_rows(&state.db, &body.company_id).await?;
    let lids = lid_to_phone(&state.db, &body.company_id).await?;
    let groups = plan_conversation_merge(&conversations, &lids);
    let affected = groups
        .iter()
        .map(|g| g.merged.len() + usize::from(g.remote_jid.is_some()))
        .sum();

    if !body.dry_run && !groups.is_empty() {
        let mut tx = state.db.begin().await?;
        for group in &groups {
            if !group.merged.is_empty() {
                for table in ["messages", "message_queue", "scheduled_messages"] {
                    sqlx::query(&format!(
                        "UPDATE {table} SET conversation_id = $1 WHERE conversation_id = ANY($2::text[])"
                    ))
                    .bind(&group.survivor)
                    .bind(&group.merged)
                    .execute(&mut *tx)
                    .await?;
                }
                sqlx::query(
                    "UPDATE conversations s SET \
                         unread_count = s.unread_count + COALESCE((SELECT SUM(o.unread_count) FROM conversations o WHERE o.id = ANY($2::text[])), 0), \
                         last_message_at = GREATEST(s.last_message_at, (SELECT MAX(o.last_message_at) FROM conversations o WHERE o.id = ANY($2::text[]))), \
                         contact_id = COALESCE(s.contact_id, (SELECT o.contact_id FROM conversations o WHERE o.id = ANY($2::text[]) AND o.contact_id IS NOT NULL ORDER BY o.created_at LIMIT 1)), \
                         updated_at = now() \
                     WHERE s.id = $1",
                )
                .bind(&group.survivor)
                .bind(&group.merged)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM conversations WHERE id = ANY($1::text[])")
                    .bind(&group.merged)
                    .execute(&mut *tx)
                    .await?;
            }
            if let Some(remote_jid) = &group.remote_jid {
                sqlx::query(
                    "UPDATE conversations SET remote_jid = $2, \
                         metadata = (COALESCE(NULLIF(metadata, ''), '{}')::jsonb || jsonb_build_object('remoteJid', $2::text))::text, \
                         updated_at = now() \
                     WHERE id = $1",
                )
                .bind(&group.survivor)
                .bind(remote_jid)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
    }

    info!(
        company_id = %body.company_id,
        dry_run = body.dry_run,
        groups = groups.len(),
        affected,
        "merge-conversations"
    );
    let details = groups.iter().map(|g| json!(g)).collect();
    Ok(Json(report(&body, "merge-conversations", groups.len(), affected, details)))
}

pub async fn merge_contacts(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<MaintenanceBody>,
) -> AppResult<Json<MaintenanceReport>> {
    require_company(&body.company_id)?;

    let contacts = store::list_contacts(&state.db, &body.company_id, None).await?;
    let groups = plan_contact_merge(&contacts);
    let affected = groups.iter().map(|g| g.merged.len()).sum();

    if !body.dry_run && !groups.is_empty() {
        let mut tx = state.db.begin().await?;
        for group in &groups {
            sqlx::query("UPDATE conversations SET contact_id = $1 WHERE contact_id = ANY($2::text[])")
                .bind(&group.survivor)
                .bind(&group.merged)
                .execute(&mut *tx)
                .await?;
            // identifiers move to the survivor only once their old owners are gone
            sqlx::query("DELETE FROM contacts WHERE id = ANY($1::text[])")
                .bind(&group.merged)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE contacts SET \
                     name = COALESCE($2, name), \
                     phone = COALESCE($3, phone), \
                     lid = COALESCE($4, lid), \
                     avatar_url = COALESCE($5, avatar_url), \
                     remote_jid = CASE \
                         WHEN COALESCE($3, phone) <> '' THEN COALESCE($3, phone) || '@s.whatsapp.net' \
                         WHEN remote_jid = '' AND COALESCE($4, lid) <> '' THEN COALESCE($4, lid) || '@lid' \
                         ELSE remote_jid END, \
                     updated_at = now() \
                 WHERE id = $1",
            )
            .bind(&group.survivor)
            .bind(&group.fill.name)
            .bind(&group.fill.phone)
            .bind(&group.fill.lid)
            .bind(&group.fill.avatar_url)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
    }

    info!(
        company_id = %body.company_id,
        dry_run = body.dry_run,
        groups = groups.len(),
        affected,
        "merge-contacts"
    );
    let details = groups.iter().map(|g| json!(g)).collect();
    Ok(Json(report(&body, "merge-contacts", groups.len(), affected, details)))
}

pub async fn enrich_contact_names(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<MaintenanceBody>,
) -> AppResult<Json<MaintenanceReport>> {
    require_company(&body.company_id)?;

    let contacts = store::list_contacts(&state.db, &body.company_id, None).await?;
    let observed = load_observed_names(&state.db, &body.company_id).await?;
    let fixes = plan_name_enrichment(&contacts, &observed);

    if !body.dry_run && !fixes.is_empty() {
        let mut tx = state.db.begin().await?;
        for fix in &fixes {
            sqlx::query(
                "UPDATE contacts SET name = $3, updated_at = now() WHERE id = $1 AND company_id = $2",
            )
            .bind(&fix.contact_id)
            .bind(&body.company_id)
            .bind(&fix.to)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
    }

    info!(
        company_id = %body.company_id,
        dry_run = body.dry_run,
        renamed = fixes.len(),
        "enrich-contact-names"
    );
    let details = fixes.iter().map(|f| json!(f)).collect();
    Ok(Json(report(&body, "enrich-contact-names", fixes.len(), fixes.len(), details)))
}

pub async fn diagnose(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<CompanyQuery>,
) -> AppResult<Json<Value>> {
    require_company(&query.company_id)?;

    let messages = load_message_rows(&state.db, &query.company_id).await?;
    let dedup = plan_message_dedup(&messages, DEFAULT_DEDUP_WINDOW_SECS);
    let conversations = load_conversation_rows(&state.db, &query.company_id).await?;
    let lids = lid_to_phone(&state.db, &query.company_id).await?;
    let conversation_groups = plan_conversation_merge(&conversations, &lids);
    let contacts = store::list_contacts(&state.db, &query.company_id, None).await?;
    let contact_groups = plan_contact_merge(&contacts);
    let observed = load_observed_names(&state.db, &query.company_id).await?;
    let name_fixes = plan_name_enrichment(&contacts, &observed);

    Ok(Json(json!({
        "companyId": query.company_id,
        "messages": messages.len(),
        "duplicateMessageGroups": dedup.groups.len(),
        "duplicateMessages": dedup.remove.len(),
        "conversations": conversations.len(),
        "conversationMergeGroups": conversation_groups.len(),
        "contacts": contacts.len(),
        "contactMergeGroups": contact_groups.len(),
        "contactsToRename": name_fixes.len(),
    })))
}
