use std::{
    collections::{HashMap, HashSet},
    sync::{atomic::AtomicUsize, Arc},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};

use crate::{config::Config, evolution::Gateway};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub company_id: String,
    pub channel_type: String,
    pub name: String,
    pub instance_name: String,
    pub config: Value,
    pub enabled: bool,
    pub connection_state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub company_id: String,
    pub name: String,
    pub phone: String,
    pub remote_jid: String,
    pub lid: String,
    pub avatar_url: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub company_id: String,
    pub channel_id: Option<String>,
    pub contact_id: Option<String>,
    pub channel: String,
    pub remote_jid: String,
    pub is_group: bool,
    pub status: String,
    pub unread_count: i32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_avatar_url: Option<String>,
    pub last_message: Option<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub company_id: String,
    pub conversation_id: String,
    pub sender_type: String,
    pub from_me: bool,
    pub content: String,
    pub message_type: String,
    pub media_url: String,
    pub external_id: Option<String>,
    pub status: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub id: String,
    pub company_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub broadcast_id: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Broadcast {
    pub id: String,
    pub company_id: String,
    pub channel_id: String,
    pub name: String,
    pub template: String,
    pub status: String,
    pub total: i32,
    pub sent: i32,
    pub failed: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessage {
    pub id: String,
    pub company_id: String,
    pub conversation_id: String,
    pub content: String,
    pub send_at: DateTime<Utc>,
    pub status: String,
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyQuery {
    pub company_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListConversationsQuery {
    pub company_id: String,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMessagesQuery {
    pub before: Option<DateTime<Utc>>,
    pub before_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactsQuery {
    pub company_id: String,
    pub q: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelBody {
    pub company_id: String,
    pub channel_type: String,
    pub name: Option<String>,
    pub instance_name: Option<String>,
    pub config: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChannelBody {
    pub name: Option<String>,
    pub instance_name: Option<String>,
    pub config: Option<Value>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    #[serde(default)]
    pub content: String,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStatusBody {
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAvatarsQuery {
    #[serde(default = "default_true")]
    pub only_missing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBroadcastBody {
    pub company_id: String,
    pub channel_id: String,
    pub name: String,
    pub template: String,
    pub contact_ids: Vec<String>,
    #[serde(default)]
    pub interval_secs: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduledMessageBody {
    pub conversation_id: String,
    pub content: String,
    pub send_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceBody {
    pub company_id: String,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    pub window_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub dry_run: bool,
    pub company_id: String,
    pub operation: String,
    pub groups: usize,
    pub affected: usize,
    pub details: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

fn default_true() -> bool {
    true
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub company_subscribers: HashMap<String, HashSet<usize>>,
    pub subscribed_company: HashMap<usize, String>,
}

pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub gateway: Arc<dyn Gateway>,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
}

impl AppState {
    pub fn new(db: PgPool, config: Config, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            db,
            config,
            gateway,
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
        }
    }
}
