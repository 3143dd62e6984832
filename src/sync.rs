use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, AppResult},
    evolution::GatewayMessage,
    jid::{phone_key, phone_variants, send_target, Jid, JidKind},
    realtime,
    store::{self, ContactChange, ContactIdentity, NewConversation, NewMessage},
    types::{AppState, Channel, Contact, Conversation, Message},
};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 500;
const AVATAR_FETCH_DELAY: Duration = Duration::from_millis(250);

/// Where an ingested gateway message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    Webhook,
    History,
}

impl IngestSource {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestSource::Webhook => "webhook",
            IngestSource::History => "history",
        }
    }

    /// Only live deliveries count as unread and reopen resolved conversations.
    pub fn is_live(self) -> bool {
        matches!(self, IngestSource::Webhook)
    }
}

#[derive(Debug)]
pub enum IngestOutcome {
    Inserted(Message),
    Duplicate,
    Skipped(&'static str),
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReport {
    pub conversation_id: String,
    pub fetched: usize,
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactsReport {
    pub channel_id: String,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarReport {
    pub channel_id: String,
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatsReport {
    pub channel_id: String,
    pub fetched: usize,
    pub created: usize,
}

/// The Evolution instance behind a channel, or why it cannot be used.
pub fn whatsapp_instance(channel: &Channel) -> AppResult<&str> {
    if channel.channel_type != "whatsapp" {
        return Err(AppError::BadRequest(format!(
            "channel {} is not a whatsapp channel",
            channel.id
        )));
    }
    if !channel.enabled {
        return Err(AppError::Conflict(format!("channel {} is disabled", channel.id)));
    }
    let instance = channel.instance_name.trim();
    if instance.is_empty() {
        return Err(AppError::BadRequest(format!(
            "channel {} has no instance name",
            channel.id
        )));
    }
    Ok(instance)
}

/// Remote JIDs under which a chat may already be stored, best first. The
/// first entry is the one used when the conversation has to be created.
pub fn conversation_jids(jid: &Jid, alt: Option<&Jid>, contact: Option<&Contact>) -> Vec<String> {
    if jid.kind != JidKind::Phone && jid.kind != JidKind::Lid {
        return vec![jid.to_string()];
    }

    let phone = jid
        .phone_digits()
        .or_else(|| alt.and_then(Jid::phone_digits))
        .map(str::to_string)
        .or_else(|| {
            contact
                .map(|c| c.phone.trim().to_string())
                .filter(|p| !p.is_empty())
        });
    let lid = if jid.is_lid() {
        Some(jid.user.clone())
    } else {
        contact
            .map(|c| c.lid.trim().to_string())
            .filter(|l| !l.is_empty())
    };

    let mut jids = Vec::new();
    if let Some(phone) = phone {
        for variant in phone_variants(&phone) {
            jids.push(format!("{variant}@s.whatsapp.net"));
        }
    }
    if let Some(lid) = lid {
        jids.push(format!("{lid}@lid"));
    }
    jids.dedup();
    jids
}

/// Webhook deliveries and history sync both land here, so a message seen
/// twice is stored once.
pub async fn ingest_gateway_message(
    state: &Arc<AppState>,
    channel: &Channel,
    msg: &GatewayMessage,
    source: IngestSource,
) -> Result<IngestOutcome, sqlx::Error> {
    if !msg.kind.is_storable() {
        return Ok(IngestOutcome::Skipped("unstorable"));
    }
    let Some(jid) = Jid::parse(&msg.remote_jid) else {
        return Ok(IngestOutcome::Skipped("invalid_jid"));
    };
    if !jid.is_chat() {
        return Ok(IngestOutcome::Skipped("not_a_chat"));
    }
    let alt = msg
        .alt_jid
        .as_deref()
        .and_then(Jid::parse)
        .filter(|j| j.kind == JidKind::Phone);

    let contact = if jid.is_group() {
        None
    } else {
        let mut identity = ContactIdentity::from_jids(&channel.company_id, &jid, alt.as_ref());
        // on outbound messages pushName is our own profile name
        if !msg.from_me && !msg.push_name.trim().is_empty() {
            identity.push_name = Some(msg.push_name.trim().to_string());
        }
        store::upsert_contact_identity(&state.db, &identity)
            .await?
            .map(|(contact, _)| contact)
    };

    let candidates = conversation_jids(&jid, alt.as_ref(), contact.as_ref());
    let existing = store::find_conversation_by_jids(&state.db, &channel.company_id, &candidates).await?;
    let remote_jid = existing
        .map(|c| c.remote_jid)
        .or_else(|| candidates.first().cloned())
        .unwrap_or_else(|| jid.to_string());

    let mut tx = state.db.begin().await?;
    let conversation = store::upsert_conversation(
        &mut tx,
        &NewConversation {
            company_id: &channel.company_id,
            channel_id: Some(&channel.id),
            contact_id: contact.as_ref().map(|c| c.id.as_str()),
            remote_jid: &remote_jid,
            is_group: jid.is_group(),
        },
    )
    .await?;

    let status = msg
        .status
        .filter(|s| *s != "pending" || msg.from_me)
        .unwrap_or(if msg.from_me { "sent" } else { "delivered" });
    let inserted = store::insert_message_idempotent(
        &mut tx,
        &NewMessage {
            company_id: &channel.company_id,
            conversation_id: &conversation.id,
            sender_type: if msg.from_me { "agent" } else { "user" },
            from_me: msg.from_me,
            content: &msg.content,
            message_type: msg.kind.as_str(),
            media_url: &msg.media_url,
            external_id: Some(&msg.external_id),
            status,
            metadata: json!({
                "external_id": msg.external_id,
                "remoteJid": msg.remote_jid,
                "pushName": msg.push_name,
                "participant": msg.participant,
                "source": source.as_str(),
            }),
            created_at: msg.timestamp.unwrap_or_else(Utc::now),
            counts_as_new: source.is_live(),
        },
    )
    .await?;
    tx.commit().await?;

    let Some(message) = inserted else {
        debug!(external_id = %msg.external_id, "message already stored");
        return Ok(IngestOutcome::Duplicate);
    };

    realtime::emit_message_new(state, &message).await;
    if let Some(updated) = store::get_conversation(&state.db, &conversation.id).await? {
        realtime::emit_conversation_updated(state, &updated).await;
    }
    Ok(IngestOutcome::Inserted(message))
}

pub async fn load_channel(state: &Arc<AppState>, channel_id: &str) -> AppResult<Channel> {
    store::find_channel(&state.db, channel_id)
        .await?
        .ok_or(AppError::NotFound("channel"))
}

pub async fn conversation_channel(state: &Arc<AppState>, conversation: &Conversation) -> AppResult<Channel> {
    let channel_id = conversation
        .channel_id
        .as_deref()
        .ok_or_else(|| AppError::Conflict("conversation has no channel".to_string()))?;
    load_channel(state, channel_id).await
}

/// True when a history record belongs to one of the chats we asked for.
/// Some gateway versions ignore the `remoteJid` filter.
fn belongs_to(requested: &[Jid], msg: &GatewayMessage) -> bool {
    let keys = requested.iter().map(Jid::identity_key).collect::<Vec<_>>();
    [Some(msg.remote_jid.as_str()), msg.alt_jid.as_deref()]
        .into_iter()
        .flatten()
        .filter_map(Jid::parse)
        .any(|jid| keys.contains(&jid.identity_key()))
}

pub async fn sync_conversation_history(
    state: &Arc<AppState>,
    conversation_id: &str,
    limit: Option<usize>,
) -> AppResult<HistoryReport> {
    let conversation = store::get_conversation(&state.db, conversation_id)
        .await?
        .ok_or(AppError::NotFound("conversation"))?;
    let channel = conversation_channel(state, &conversation).await?;
    let instance = whatsapp_instance(&channel)?;
    let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);

    let contact = match conversation.contact_id.as_deref() {
        Some(id) => store::get_contact(&state.db, id).await?,
        None => None,
    };
    let mut requested = Jid::parse(&conversation.remote_jid).into_iter().collect::<Vec<_>>();
    if let Some(contact) = &contact {
        let alternatives = [
            Jid::phone(&contact.phone),
            Jid::parse(&format!("{}@lid", contact.lid.trim())),
        ];
        for jid in alternatives.into_iter().flatten() {
            if !requested.iter().any(|r| r.identity_key() == jid.identity_key()) {
                requested.push(jid);
            }
        }
    }

    let mut report = HistoryReport {
        conversation_id: conversation.id.clone(),
        ..Default::default()
    };
    for jid in &requested {
        let messages = state
            .gateway
            .find_messages(instance, &jid.to_string(), limit)
            .await?;
        report.fetched += messages.len();
        for msg in &messages {
            if !belongs_to(&requested, msg) {
                report.skipped += 1;
                continue;
            }
            match ingest_gateway_message(state, &channel, msg, IngestSource::History).await? {
                IngestOutcome::Inserted(_) => report.inserted += 1,
                IngestOutcome::Duplicate | IngestOutcome::Skipped(_) => report.skipped += 1,
            }
        }
    }

    info!(
        conversation_id = %report.conversation_id,
        fetched = report.fetched,
        inserted = report.inserted,
        skipped = report.skipped,
        "history sync finished"
    );
    Ok(report)
}

pub async fn sync_contacts(state: &Arc<AppState>, channel_id: &str) -> AppResult<ContactsReport> {
    let channel = load_channel(state, channel_id).await?;
    let instance = whatsapp_instance(&channel)?;
    let contacts = state.gateway.find_contacts(instance).await?;

    let mut report = ContactsReport {
        channel_id: channel.id.clone(),
        fetched: contacts.len(),
        ..Default::default()
    };
    for gateway_contact in &contacts {
        let Some(jid) = Jid::parse(&gateway_contact.remote_jid) else {
            continue;
        };
        if !matches!(jid.kind, JidKind::Phone | JidKind::Lid) {
            continue;
        }
        let mut identity = ContactIdentity::from_jids(&channel.company_id, &jid, None);
        identity.push_name = gateway_contact.push_name.clone();
        identity.avatar_url = gateway_contact.profile_pic_url.clone();
        match store::upsert_contact_identity(&state.db, &identity).await? {
            Some((_, ContactChange::Created)) => report.created += 1,
            Some((_, ContactChange::Updated)) => report.updated += 1,
            _ => {}
        }
    }

    info!(
        channel_id = %report.channel_id,
        fetched = report.fetched,
        created = report.created,
        updated = report.updated,
        "contact sync finished"
    );
    Ok(report)
}

fn avatar_target(contact: &Contact) -> Option<String> {
    if !contact.phone.trim().is_empty() {
        return Jid::phone(&contact.phone).map(|jid| send_target(&jid));
    }
    if !contact.lid.trim().is_empty() {
        return Jid::parse(&format!("{}@lid", contact.lid.trim())).map(|jid| send_target(&jid));
    }
    None
}

pub async fn sync_avatars(
    state: &Arc<AppState>,
    channel_id: &str,
    only_missing: bool,
) -> AppResult<AvatarReport> {
    let channel = load_channel(state, channel_id).await?;
    let instance = whatsapp_instance(&channel)?;
    let contacts = store::list_contacts(&state.db, &channel.company_id, None).await?;

    let mut report = AvatarReport {
        channel_id: channel.id.clone(),
        ..Default::default()
    };
    let mut first = true;
    for contact in contacts
        .iter()
        .filter(|c| !only_missing || c.avatar_url.trim().is_empty())
    {
        let Some(number) = avatar_target(contact) else {
            continue;
        };
        if !first {
            tokio::time::sleep(AVATAR_FETCH_DELAY).await;
        }
        first = false;
        report.checked += 1;
        match state.gateway.fetch_profile_picture(instance, &number).await {
            Ok(Some(url)) if url != contact.avatar_url => {
                store::set_contact_avatar(&state.db, &contact.id, &url).await?;
                report.updated += 1;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(contact_id = %contact.id, error = %err, "profile picture fetch failed");
                report.failed += 1;
            }
        }
    }

    info!(
        channel_id = %report.channel_id,
        checked = report.checked,
        updated = report.updated,
        failed = report.failed,
        "avatar sync finished"
    );
    Ok(report)
}

pub async fn sync_chats(state: &Arc<AppState>, channel_id: &str) -> AppResult<ChatsReport> {
    let channel = load_channel(state, channel_id).await?;
    let instance = whatsapp_instance(&channel)?;
    let chats = state.gateway.find_chats(instance).await?;

    let mut report = ChatsReport {
        channel_id: channel.id.clone(),
        fetched: chats.len(),
        ..Default::default()
    };
    for chat in &chats {
        let Some(jid) = Jid::parse(&chat.remote_jid) else {
            continue;
        };
        if !jid.is_chat() {
            continue;
        }
        let contact = if jid.is_group() {
            None
        } else {
            let mut identity = ContactIdentity::from_jids(&channel.company_id, &jid, None);
            identity.push_name = chat.name.clone();
            store::upsert_contact_identity(&state.db, &identity)
                .await?
                .map(|(contact, _)| contact)
        };
        let candidates = conversation_jids(&jid, None, contact.as_ref());
        if store::find_conversation_by_jids(&state.db, &channel.company_id, &candidates)
            .await?
            .is_some()
        {
            continue;
        }
        let remote_jid = candidates.first().cloned().unwrap_or_else(|| jid.to_string());
        let mut tx = state.db.begin().await?;
        let conversation = store::upsert_conversation(
            &mut tx,
            &NewConversation {
                company_id: &channel.company_id,
                channel_id: Some(&channel.id),
                contact_id: contact.as_ref().map(|c| c.id.as_str()),
                remote_jid: &remote_jid,
                is_group: jid.is_group(),
            },
        )
        .await?;
        tx.commit().await?;
        realtime::emit_conversation_updated(state, &conversation).await;
        report.created += 1;
    }

    info!(
        channel_id = %report.channel_id,
        fetched = report.fetched,
        created = report.created,
        "chat sync finished"
    );
    Ok(report)
}

/// `(lid, phone key)` for every contact that carries both identifiers.
pub fn lid_phone_pairs(contacts: &[Contact]) -> Vec<(String, String)> {
    contacts
        .iter()
        .filter(|c| !c.lid.trim().is_empty() && !c.phone.trim().is_empty())
        .map(|c| (c.lid.trim().to_string(), phone_key(c.phone.trim())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::MessageKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn channel(kind: &str, instance: &str, enabled: bool) -> Channel {
        Channel {
            id: "ch1".to_string(),
            company_id: "co1".to_string(),
            channel_type: kind.to_string(),
            name: "Atendimento".to_string(),
            instance_name: instance.to_string(),
            config: json!({}),
            enabled,
            connection_state: "open".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn contact(phone: &str, lid: &str) -> Contact {
        Contact {
            id: "ct1".to_string(),
            company_id: "co1".to_string(),
            name: "Maria".to_string(),
            phone: phone.to_string(),
            remote_jid: String::new(),
            lid: lid.to_string(),
            avatar_url: String::new(),
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn only_webhook_deliveries_count_as_new() {
        assert!(IngestSource::Webhook.is_live());
        assert!(!IngestSource::History.is_live());
        assert_eq!(IngestSource::History.as_str(), "history");
    }

    fn gateway_message(remote_jid: &str, alt: Option<&str>) -> GatewayMessage {
        GatewayMessage {
            external_id: "E1".to_string(),
            remote_jid: remote_jid.to_string(),
            alt_jid: alt.map(str::to_string),
            from_me: false,
            participant: None,
            push_name: String::new(),
            timestamp: None,
            kind: MessageKind::Text,
            content: "oi".to_string(),
            media_url: String::new(),
            status: None,
        }
    }

    #[test]
    fn only_enabled_whatsapp_channels_with_instance_are_usable() {
        assert_eq!(whatsapp_instance(&channel("whatsapp", " loja ", true)).ok(), Some("loja"));
        assert!(matches!(
            whatsapp_instance(&channel("web", "loja", true)),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            whatsapp_instance(&channel("whatsapp", "", true)),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            whatsapp_instance(&channel("whatsapp", "loja", false)),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn lid_chat_prefers_known_phone_for_new_conversations() {
        let jid = Jid::parse("123456789012345@lid").expect("lid");
        let alt = Jid::parse("551187654321@s.whatsapp.net").expect("phone");
        assert_eq!(
            conversation_jids(&jid, Some(&alt), None),
            vec![
                "5511987654321@s.whatsapp.net".to_string(),
                "551187654321@s.whatsapp.net".to_string(),
                "123456789012345@lid".to_string(),
            ]
        );
    }

    #[test]
    fn phone_chat_also_looks_under_contact_lid() {
        let jid = Jid::parse("14155550100@s.whatsapp.net").expect("phone");
        let known = contact("14155550100", "999");
        assert_eq!(
            conversation_jids(&jid, None, Some(&known)),
            vec!["14155550100@s.whatsapp.net".to_string(), "999@lid".to_string()]
        );
    }

    #[test]
    fn groups_only_match_themselves() {
        let jid = Jid::parse("120363025246125486@g.us").expect("group");
        assert_eq!(
            conversation_jids(&jid, None, Some(&contact("1", "2"))),
            vec!["120363025246125486@g.us".to_string()]
        );
    }

    #[test]
    fn history_records_from_other_chats_are_rejected() {
        let requested = vec![
            Jid::parse("5511987654321@s.whatsapp.net").expect("phone"),
            Jid::parse("123456789012345@lid").expect("lid"),
        ];
        assert!(belongs_to(&requested, &gateway_message("551187654321@s.whatsapp.net", None)));
        assert!(belongs_to(&requested, &gateway_message("123456789012345@lid", None)));
        assert!(belongs_to(
            &requested,
            &gateway_message("777@lid", Some("5511987654321@s.whatsapp.net"))
        ));
        assert!(!belongs_to(&requested, &gateway_message("5511911112222@s.whatsapp.net", None)));
    }

    #[test]
    fn avatar_lookup_uses_phone_then_lid() {
        assert_eq!(avatar_target(&contact("5511987654321", "9")), Some("5511987654321".to_string()));
        assert_eq!(avatar_target(&contact("", "9")), Some("9@lid".to_string()));
        assert_eq!(avatar_target(&contact("", "")), None);
    }

    #[test]
    fn lid_pairs_use_phone_keys() {
        let pairs = lid_phone_pairs(&[contact("551187654321", "42"), contact("1", "")]);
        assert_eq!(pairs, vec![("42".to_string(), "5511987654321".to_string())]);
    }
}
