use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::{
    jid::{is_placeholder_name, phone_key, phone_variants, Jid},
    types::{Channel, Contact, Conversation, ConversationSummary, Message},
};

const CHANNEL_COLUMNS: &str = "id, company_id, channel_type, name, instance_name, config, enabled, \
     connection_state, created_at, updated_at";

const CONTACT_COLUMNS: &str = "id, company_id, name, phone, remote_jid, lid, avatar_url, metadata, \
     created_at, updated_at";

const CONVERSATION_COLUMNS: &str = "id, company_id, channel_id, contact_id, channel, remote_jid, \
     is_group, status, unread_count, last_message_at, metadata, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, company_id, conversation_id, sender_type, from_me, content, \
     message_type, media_url, external_id, status, metadata, created_at";

/// Delivery statuses only move forward; `failed` may replace an unconfirmed send.
const STATUS_ADVANCES_SQL: &str = "(CASE status WHEN 'pending' THEN 0 WHEN 'sent' THEN 1 \
     WHEN 'delivered' THEN 2 WHEN 'read' THEN 3 ELSE 4 END) \
     < (CASE $3 WHEN 'pending' THEN 0 WHEN 'sent' THEN 1 WHEN 'delivered' THEN 2 \
     WHEN 'read' THEN 3 ELSE -1 END) \
     OR ($3 = 'failed' AND status IN ('pending', 'sent'))";

pub fn json_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

pub fn parse_json_text(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or(Value::Null)
}

pub fn config_text(config: &Value, key: &str) -> String {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

pub fn parse_channel_row(row: &PgRow) -> Channel {
    Channel {
        id: row.get("id"),
        company_id: row.get("company_id"),
        channel_type: row.get("channel_type"),
        name: row.get("name"),
        instance_name: row.get("instance_name"),
        config: parse_json_text(&row.get::<String, _>("config")),
        enabled: row.get("enabled"),
        connection_state: row.get("connection_state"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn parse_contact_row(row: &PgRow) -> Contact {
    Contact {
        id: row.get("id"),
        company_id: row.get("company_id"),
        name: row.get("name"),
        phone: row.get("phone"),
        remote_jid: row.get("remote_jid"),
        lid: row.get("lid"),
        avatar_url: row.get("avatar_url"),
        metadata: parse_json_text(&row.get::<String, _>("metadata")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn parse_conversation_row(row: &PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        company_id: row.get("company_id"),
        channel_id: row.get("channel_id"),
        contact_id: row.get("contact_id"),
        channel: row.get("channel"),
        remote_jid: row.get("remote_jid"),
        is_group: row.get("is_group"),
        status: row.get("status"),
        unread_count: row.get("unread_count"),
        last_message_at: row.get("last_message_at"),
        metadata: parse_json_text(&row.get::<String, _>("metadata")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_message_columns(row: &PgRow, prefix: &str) -> Message {
    let col = |name: &str| format!("{prefix}{name}");
    Message {
        id: row.get(col("id").as_str()),
        company_id: row.get(col("company_id").as_str()),
        conversation_id: row.get(col("conversation_id").as_str()),
        sender_type: row.get(col("sender_type").as_str()),
        from_me: row.get(col("from_me").as_str()),
        content: row.get(col("content").as_str()),
        message_type: row.get(col("message_type").as_str()),
        media_url: row.get(col("media_url").as_str()),
        external_id: row.get(col("external_id").as_str()),
        status: row.get(col("status").as_str()),
        metadata: parse_json_text(&row.get::<String, _>(col("metadata").as_str())),
        created_at: row.get(col("created_at").as_str()),
    }
}

pub fn parse_message_row(row: &PgRow) -> Message {
    parse_message_columns(row, "")
}

// ── Companies & channels ────────────────────────────────────────────────

pub async fn ensure_company(pool: &PgPool, company_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO companies (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
        .bind(company_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_channel(pool: &PgPool, channel_id: &str) -> Result<Option<Channel>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = $1"))
        .bind(channel_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(parse_channel_row))
}

pub async fn list_channels(pool: &PgPool, company_id: &str) -> Result<Vec<Channel>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM channels WHERE company_id = $1 ORDER BY created_at ASC"
    ))
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(parse_channel_row).collect())
}

pub async fn create_channel(pool: &PgPool, channel: &Channel) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channels (id, company_id, channel_type, name, instance_name, config, enabled, connection_state, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
    )
    .bind(&channel.id)
    .bind(&channel.company_id)
    .bind(&channel.channel_type)
    .bind(&channel.name)
    .bind(&channel.instance_name)
    .bind(json_text(&channel.config))
    .bind(channel.enabled)
    .bind(&channel.connection_state)
    .bind(channel.created_at)
    .bind(channel.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_channel(pool: &PgPool, channel: &Channel) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE channels SET name = $1, instance_name = $2, config = $3, enabled = $4, updated_at = $5 WHERE id = $6",
    )
    .bind(&channel.name)
    .bind(&channel.instance_name)
    .bind(json_text(&channel.config))
    .bind(channel.enabled)
    .bind(channel.updated_at)
    .bind(&channel.id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_channel(pool: &PgPool, channel_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM channels WHERE id = $1")
        .bind(channel_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_channel_connection_state(
    pool: &PgPool,
    channel_id: &str,
    state: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE channels SET connection_state = $1, updated_at = now() WHERE id = $2")
        .bind(state)
        .bind(channel_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Contacts ────────────────────────────────────────────────────────────

pub async fn list_contacts(
    pool: &PgPool,
    company_id: &str,
    query: Option<&str>,
) -> Result<Vec<Contact>, sqlx::Error> {
    let pattern = query
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(|q| format!("%{q}%"));
    let rows = sqlx::query(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts \
         WHERE company_id = $1 AND ($2::text IS NULL OR name ILIKE $2 OR phone ILIKE $2) \
         ORDER BY name ASC, created_at ASC"
    ))
    .bind(company_id)
    .bind(pattern)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(parse_contact_row).collect())
}

pub async fn get_contact(pool: &PgPool, contact_id: &str) -> Result<Option<Contact>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = $1"))
        .bind(contact_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(parse_contact_row))
}

pub async fn delete_contact(
    pool: &PgPool,
    company_id: &str,
    contact_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM contacts WHERE id = $1 AND company_id = $2")
        .bind(contact_id)
        .bind(company_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_contact_avatar(
    pool: &PgPool,
    contact_id: &str,
    avatar_url: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE contacts SET avatar_url = $1, updated_at = now() WHERE id = $2")
        .bind(avatar_url)
        .bind(contact_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// What the gateway told us about a person. Either identifier may be missing.
#[derive(Debug, Clone, Default)]
pub struct ContactIdentity {
    pub company_id: String,
    pub phone: Option<String>,
    pub lid: Option<String>,
    pub push_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl ContactIdentity {
    /// Builds an identity from a chat JID plus the optional phone JID the
    /// gateway exposes behind a lid.
    pub fn from_jids(company_id: &str, remote_jid: &Jid, alt_jid: Option<&Jid>) -> Self {
        let mut identity = ContactIdentity {
            company_id: company_id.to_string(),
            ..Default::default()
        };
        for jid in std::iter::once(remote_jid).chain(alt_jid) {
            if let Some(digits) = jid.phone_digits() {
                identity.phone.get_or_insert_with(|| phone_key(digits));
            } else if jid.is_lid() {
                identity.lid.get_or_insert_with(|| jid.user.clone());
            }
        }
        identity
    }

    fn remote_jid(&self) -> String {
        match (&self.phone, &self.lid) {
            (Some(phone), _) => format!("{phone}@s.whatsapp.net"),
            (None, Some(lid)) => format!("{lid}@lid"),
            (None, None) => String::new(),
        }
    }
}

async fn find_contact_by_lid(
    pool: &PgPool,
    company_id: &str,
    lid: &str,
) -> Result<Option<Contact>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts WHERE company_id = $1 AND lid = $2 LIMIT 1"
    ))
    .bind(company_id)
    .bind(lid)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(parse_contact_row))
}

async fn find_contact_by_phone(
    pool: &PgPool,
    company_id: &str,
    phone: &str,
) -> Result<Option<Contact>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts \
         WHERE company_id = $1 AND phone = ANY($2::text[]) \
         ORDER BY created_at ASC LIMIT 1"
    ))
    .bind(company_id)
    .bind(phone_variants(phone))
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(parse_contact_row))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactChange {
    Created,
    Updated,
    Unchanged,
}

/// Finds the contact behind an identity, creating it when unknown, and fills
/// in whatever the stored row is missing. A real name is never replaced by a
/// pushName; placeholder names are.
pub async fn upsert_contact_identity(
    pool: &PgPool,
    identity: &ContactIdentity,
) -> Result<Option<(Contact, ContactChange)>, sqlx::Error> {
    if identity.phone.is_none() && identity.lid.is_none() {
        return Ok(None);
    }
    let by_lid = match &identity.lid {
        Some(lid) => find_contact_by_lid(pool, &identity.company_id, lid).await?,
        None => None,
    };
    let by_phone = match &identity.phone {
        Some(phone) => find_contact_by_phone(pool, &identity.company_id, phone).await?,
        None => None,
    };

    let (mut contact, link_identifiers) = match (by_lid, by_phone) {
        (Some(lid_contact), Some(phone_contact)) if lid_contact.id != phone_contact.id => {
            warn!(
                company_id = %identity.company_id,
                lid_contact = %lid_contact.id,
                phone_contact = %phone_contact.id,
                "identity split across two contacts; merge-contacts will fold them"
            );
            (phone_contact, false)
        }
        (Some(found), _) | (None, Some(found)) => (found, true),
        (None, None) => return insert_contact_identity(pool, identity).await,
    };

    let mut changed = false;
    if link_identifiers {
        if contact.phone.is_empty() {
            if let Some(phone) = &identity.phone {
                contact.phone = phone.clone();
                contact.remote_jid = format!("{phone}@s.whatsapp.net");
                changed = true;
            }
        }
        if contact.lid.is_empty() {
            if let Some(lid) = &identity.lid {
                contact.lid = lid.clone();
                if contact.remote_jid.is_empty() {
                    contact.remote_jid = format!("{lid}@lid");
                }
                changed = true;
            }
        }
    }
    if let Some(name) = identity.push_name.as_deref().map(str::trim) {
        if !name.is_empty()
            && is_placeholder_name(&contact.name, &contact.phone, &contact.lid)
            && !is_placeholder_name(name, &contact.phone, &contact.lid)
            && contact.name != name
        {
            contact.name = name.to_string();
            changed = true;
        }
    }
    if let Some(avatar) = identity.avatar_url.as_deref().filter(|a| !a.is_empty()) {
        if contact.avatar_url != avatar {
            contact.avatar_url = avatar.to_string();
            changed = true;
        }
    }

    if changed {
        let updated = sqlx::query(
            "UPDATE contacts SET name = $1, phone = $2, lid = $3, remote_jid = $4, avatar_url = $5, updated_at = now() \
             WHERE id = $6",
        )
        .bind(&contact.name)
        .bind(&contact.phone)
        .bind(&contact.lid)
        .bind(&contact.remote_jid)
        .bind(&contact.avatar_url)
        .bind(&contact.id)
        .execute(pool)
        .await;
        match updated {
            Ok(_) => contact.updated_at = Utc::now(),
            // another row claimed the phone/lid concurrently; keep the stored identifiers
            Err(err) if is_unique_violation(&err) => {
                warn!(contact_id = %contact.id, "identifier already owned by another contact");
            }
            Err(err) => return Err(err),
        }
    }
    let change = if changed {
        ContactChange::Updated
    } else {
        ContactChange::Unchanged
    };
    Ok(Some((contact, change)))
}

async fn insert_contact_identity(
    pool: &PgPool,
    identity: &ContactIdentity,
) -> Result<Option<(Contact, ContactChange)>, sqlx::Error> {
    let phone = identity.phone.clone().unwrap_or_default();
    let lid = identity.lid.clone().unwrap_or_default();
    let name = identity
        .push_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !is_placeholder_name(n, &phone, &lid))
        .unwrap_or("")
        .to_string();
    let row = sqlx::query(&format!(
        "INSERT INTO contacts (id, company_id, name, phone, remote_jid, lid, avatar_url, metadata) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,'{{}}') \
         ON CONFLICT DO NOTHING \
         RETURNING {CONTACT_COLUMNS}"
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(&identity.company_id)
    .bind(&name)
    .bind(&phone)
    .bind(identity.remote_jid())
    .bind(&lid)
    .bind(identity.avatar_url.clone().unwrap_or_default())
    .fetch_optional(pool)
    .await?;
    if let Some(row) = row {
        return Ok(Some((parse_contact_row(&row), ContactChange::Created)));
    }
    // lost a race with a concurrent insert of the same identity
    let existing = match &identity.lid {
        Some(lid) => find_contact_by_lid(pool, &identity.company_id, lid).await?,
        None => None,
    };
    let existing = match (existing, &identity.phone) {
        (Some(found), _) => Some(found),
        (None, Some(phone)) => find_contact_by_phone(pool, &identity.company_id, phone).await?,
        (None, None) => None,
    };
    Ok(existing.map(|contact| (contact, ContactChange::Unchanged)))
}

// ── Conversations ───────────────────────────────────────────────────────

pub struct NewConversation<'a> {
    pub company_id: &'a str,
    pub channel_id: Option<&'a str>,
    pub contact_id: Option<&'a str>,
    pub remote_jid: &'a str,
    pub is_group: bool,
}

/// One conversation per (company, remote_jid): concurrent callers converge on
/// the same row through the unique constraint.
pub async fn upsert_conversation(
    tx: &mut Transaction<'_, Postgres>,
    new: &NewConversation<'_>,
) -> Result<Conversation, sqlx::Error> {
    let row = sqlx::query(&format!(
        "INSERT INTO conversations (id, company_id, channel_id, contact_id, channel, remote_jid, is_group, status, metadata) \
         VALUES ($1,$2,$3,$4,'whatsapp',$5,$6,'open',$7) \
         ON CONFLICT (company_id, remote_jid) DO UPDATE SET \
             channel_id = COALESCE(conversations.channel_id, EXCLUDED.channel_id), \
             contact_id = COALESCE(EXCLUDED.contact_id, conversations.contact_id), \
             updated_at = now() \
         RETURNING {CONVERSATION_COLUMNS}"
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(new.company_id)
    .bind(new.channel_id)
    .bind(new.contact_id)
    .bind(new.remote_jid)
    .bind(new.is_group)
    .bind(json_text(&json!({ "remoteJid": new.remote_jid })))
    .fetch_one(&mut **tx)
    .await?;
    Ok(parse_conversation_row(&row))
}

/// First conversation of the company stored under any of `jids`, in the
/// order given.
pub async fn find_conversation_by_jids(
    pool: &PgPool,
    company_id: &str,
    jids: &[String],
) -> Result<Option<Conversation>, sqlx::Error> {
    if jids.is_empty() {
        return Ok(None);
    }
    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations \
         WHERE company_id = $1 AND remote_jid = ANY($2::text[]) \
         ORDER BY array_position($2::text[], remote_jid) ASC LIMIT 1"
    ))
    .bind(company_id)
    .bind(jids)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(parse_conversation_row))
}

pub async fn get_conversation(
    pool: &PgPool,
    conversation_id: &str,
) -> Result<Option<Conversation>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
    ))
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(parse_conversation_row))
}

pub async fn list_conversations(
    pool: &PgPool,
    company_id: &str,
    status: Option<&str>,
    limit: i64,
) -> Result<Vec<ConversationSummary>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT c.id, c.company_id, c.channel_id, c.contact_id, c.channel, c.remote_jid, c.is_group, \
                c.status, c.unread_count, c.last_message_at, c.metadata, c.created_at, c.updated_at, \
                ct.name AS contact_name, ct.phone AS contact_phone, ct.avatar_url AS contact_avatar_url, \
                lm.id AS lm_id, lm.company_id AS lm_company_id, lm.conversation_id AS lm_conversation_id, \
                lm.sender_type AS lm_sender_type, lm.from_me AS lm_from_me, lm.content AS lm_content, \
                lm.message_type AS lm_message_type, lm.media_url AS lm_media_url, \
                lm.external_id AS lm_external_id, lm.status AS lm_status, lm.metadata AS lm_metadata, \
                lm.created_at AS lm_created_at \
         FROM conversations c \
         LEFT JOIN contacts ct ON ct.id = c.contact_id \
         LEFT JOIN LATERAL ( \
             SELECT * FROM messages m WHERE m.conversation_id = c.id \
             ORDER BY m.created_at DESC LIMIT 1 \
         ) lm ON true \
         WHERE c.company_id = $1 AND ($2::text IS NULL OR c.status = $2) \
         ORDER BY c.last_message_at DESC NULLS LAST, c.created_at DESC \
         LIMIT $3",
    )
    .bind(company_id)
    .bind(status)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let last_message = row
                .get::<Option<String>, _>("lm_id")
                .map(|_| parse_message_columns(row, "lm_"));
            ConversationSummary {
                conversation: parse_conversation_row(row),
                contact_name: row.get("contact_name"),
                contact_phone: row.get("contact_phone"),
                contact_avatar_url: row.get("contact_avatar_url"),
                last_message,
            }
        })
        .collect())
}

pub async fn set_conversation_status(
    pool: &PgPool,
    conversation_id: &str,
    status: &str,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE conversations SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status)
            .bind(conversation_id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_read(pool: &PgPool, conversation_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE conversations SET unread_count = 0, updated_at = now() WHERE id = $1",
    )
    .bind(conversation_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

// ── Messages ────────────────────────────────────────────────────────────

pub struct NewMessage<'a> {
    pub company_id: &'a str,
    pub conversation_id: &'a str,
    pub sender_type: &'a str,
    pub from_me: bool,
    pub content: &'a str,
    pub message_type: &'a str,
    pub media_url: &'a str,
    pub external_id: Option<&'a str>,
    pub status: &'a str,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    /// Live traffic; backfilled history leaves unread and status alone.
    pub counts_as_new: bool,
}

/// Inserts unless a row with the same external id already exists for the
/// company. Returns the row only when it was actually inserted.
pub async fn insert_message_idempotent(
    tx: &mut Transaction<'_, Postgres>,
    new: &NewMessage<'_>,
) -> Result<Option<Message>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "INSERT INTO messages (id, company_id, conversation_id, sender_type, from_me, content, message_type, media_url, external_id, status, metadata, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12) \
         ON CONFLICT (company_id, external_id) WHERE external_id IS NOT NULL DO NOTHING \
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(new.company_id)
    .bind(new.conversation_id)
    .bind(new.sender_type)
    .bind(new.from_me)
    .bind(new.content)
    .bind(new.message_type)
    .bind(new.media_url)
    .bind(new.external_id.filter(|id| !id.is_empty()))
    .bind(new.status)
    .bind(json_text(&new.metadata))
    .bind(new.created_at)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let message = parse_message_row(&row);

    sqlx::query(
        "UPDATE conversations SET \
             last_message_at = GREATEST(COALESCE(last_message_at, $2), $2), \
             unread_count = unread_count + CASE WHEN $3 AND NOT $4 THEN 1 ELSE 0 END, \
             status = CASE WHEN $3 AND NOT $4 AND status = 'resolved' THEN 'open' ELSE status END, \
             updated_at = now() \
         WHERE id = $1",
    )
    .bind(&message.conversation_id)
    .bind(message.created_at)
    .bind(new.counts_as_new)
    .bind(message.from_me)
    .execute(&mut **tx)
    .await?;

    Ok(Some(message))
}

pub async fn get_message(pool: &PgPool, message_id: &str) -> Result<Option<Message>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"))
        .bind(message_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(parse_message_row))
}

pub struct MessageCursor<'a> {
    pub before: Option<DateTime<Utc>>,
    /// Id of the oldest message already shown; takes precedence over `before`.
    pub before_id: Option<&'a str>,
}

/// Newest `limit` messages older than the cursor, returned oldest first.
/// Rows are ordered by `(created_at, id)` so equal timestamps page cleanly.
pub async fn list_messages(
    pool: &PgPool,
    conversation_id: &str,
    cursor: &MessageCursor<'_>,
    limit: i64,
) -> Result<Vec<Message>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM ( \
             SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = $1 \
               AND ($2::timestamptz IS NULL OR $3::text IS NOT NULL OR created_at < $2) \
               AND ($3::text IS NULL OR (created_at, id) < ( \
                   SELECT c.created_at, c.id FROM messages c \
                   WHERE c.id = $3 AND c.conversation_id = $1)) \
             ORDER BY created_at DESC, id DESC LIMIT $4 \
         ) recent ORDER BY created_at ASC, id ASC"
    ))
    .bind(conversation_id)
    .bind(cursor.before)
    .bind(cursor.before_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(parse_message_row).collect())
}

/// Applies a delivery receipt. Returns `(message_id, conversation_id)` when
/// the status advanced.
pub async fn set_message_status_by_external_id(
    pool: &PgPool,
    company_id: &str,
    external_id: &str,
    status: &str,
) -> Result<Option<(String, String)>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "UPDATE messages SET status = $3 \
         WHERE company_id = $1 AND external_id = $2 AND ({STATUS_ADVANCES_SQL}) \
         RETURNING id, conversation_id"
    ))
    .bind(company_id)
    .bind(external_id)
    .bind(status)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| (r.get("id"), r.get("conversation_id"))))
}

pub async fn set_message_status(
    pool: &PgPool,
    message_id: &str,
    status: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE messages SET status = $2 WHERE id = $1")
        .bind(message_id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

/// Records the gateway id of an outbound message. If the webhook echo of the
/// same send was ingested first it holds the external id; the echo row is
/// dropped in favour of the original.
pub async fn attach_external_id(
    pool: &PgPool,
    company_id: &str,
    message_id: &str,
    external_id: &str,
    status: &str,
) -> Result<(), sqlx::Error> {
    match update_external_id(pool, message_id, external_id, status).await {
        Ok(()) => Ok(()),
        Err(err) if is_unique_violation(&err) => {
            sqlx::query("DELETE FROM messages WHERE company_id = $1 AND external_id = $2 AND id <> $3")
                .bind(company_id)
                .bind(external_id)
                .bind(message_id)
                .execute(pool)
                .await?;
            update_external_id(pool, message_id, external_id, status).await
        }
        Err(err) => Err(err),
    }
}

async fn update_external_id(
    pool: &PgPool,
    message_id: &str,
    external_id: &str,
    status: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE messages SET external_id = $2, status = $3 WHERE id = $1")
        .bind(message_id)
        .bind(external_id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_phone_and_keeps_lid() {
        let lid = Jid::parse("123456789012345@lid").expect("lid");
        let phone = Jid::parse("551187654321@s.whatsapp.net").expect("phone");
        let identity = ContactIdentity::from_jids("co1", &lid, Some(&phone));
        assert_eq!(identity.phone.as_deref(), Some("5511987654321"));
        assert_eq!(identity.lid.as_deref(), Some("123456789012345"));
        assert_eq!(identity.remote_jid(), "5511987654321@s.whatsapp.net");
    }

    #[test]
    fn lid_only_identity_uses_lid_jid() {
        let lid = Jid::parse("123456789012345@lid").expect("lid");
        let identity = ContactIdentity::from_jids("co1", &lid, None);
        assert_eq!(identity.phone, None);
        assert_eq!(identity.remote_jid(), "123456789012345@lid");
    }

    #[test]
    fn config_text_trims_and_defaults() {
        let config = json!({ "webhookSecret": "  s3cret ", "n": 1 });
        assert_eq!(config_text(&config, "webhookSecret"), "s3cret");
        assert_eq!(config_text(&config, "n"), "");
        assert_eq!(config_text(&config, "missing"), "");
    }

    #[test]
    fn json_text_round_trips_objects() {
        let value = json!({ "remoteJid": "5511987654321@s.whatsapp.net" });
        assert_eq!(parse_json_text(&json_text(&value)), value);
        assert_eq!(parse_json_text("not json"), Value::Null);
    }
}
