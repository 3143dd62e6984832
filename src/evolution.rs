use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Sticker,
    Location,
    Contact,
    Reaction,
    Protocol,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Audio => "audio",
            MessageKind::Video => "video",
            MessageKind::Document => "document",
            MessageKind::Sticker => "sticker",
            MessageKind::Location => "location",
            MessageKind::Contact => "contact",
            MessageKind::Reaction => "reaction",
            MessageKind::Protocol => "protocol",
            MessageKind::Unknown => "unknown",
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(
            self,
            MessageKind::Image
                | MessageKind::Audio
                | MessageKind::Video
                | MessageKind::Document
                | MessageKind::Sticker
        )
    }

    /// Reactions and protocol frames (revokes, edits, key distribution) never
    /// become inbox rows.
    pub fn is_storable(&self) -> bool {
        !matches!(self, MessageKind::Reaction | MessageKind::Protocol)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayMessage {
    pub external_id: String,
    pub remote_jid: String,
    /// Phone JID behind a `@lid` chat, when the gateway reveals it.
    pub alt_jid: Option<String>,
    pub from_me: bool,
    pub participant: Option<String>,
    pub push_name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: MessageKind,
    pub content: String,
    pub media_url: String,
    pub status: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayContact {
    pub remote_jid: String,
    pub push_name: Option<String>,
    pub profile_pic_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayChat {
    pub remote_jid: String,
    pub name: Option<String>,
    pub unread_count: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub external_id: String,
    pub remote_jid: String,
    pub status: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMedia {
    pub media_type: String,
    pub url: String,
    pub caption: String,
    pub file_name: Option<String>,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send_text(
        &self,
        instance: &str,
        number: &str,
        text: &str,
    ) -> Result<SentMessage, GatewayError>;

    async fn send_media(
        &self,
        instance: &str,
        number: &str,
        media: &OutgoingMedia,
    ) -> Result<SentMessage, GatewayError>;

    async fn find_chats(&self, instance: &str) -> Result<Vec<GatewayChat>, GatewayError>;

    async fn find_messages(
        &self,
        instance: &str,
        remote_jid: &str,
        limit: usize,
    ) -> Result<Vec<GatewayMessage>, GatewayError>;

    async fn find_contacts(&self, instance: &str) -> Result<Vec<GatewayContact>, GatewayError>;

    async fn fetch_profile_picture(
        &self,
        instance: &str,
        number: &str,
    ) -> Result<Option<String>, GatewayError>;

    async fn connection_state(&self, instance: &str) -> Result<String, GatewayError>;
}

pub struct EvolutionClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl EvolutionClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }

    async fn read_response(response: reqwest::Response) -> Result<Value, GatewayError> {
        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: raw_body.chars().take(500).collect(),
            });
        }
        if raw_body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str::<Value>(&raw_body).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, GatewayError> {
        debug!(path, "evolution POST");
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("apikey", &self.api_key)
            .json(body)
            .send()
            .await?;
        Self::read_response(response).await
    }

    async fn get_json(&self, path: &str) -> Result<Value, GatewayError> {
        debug!(path, "evolution GET");
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("apikey", &self.api_key)
            .send()
            .await?;
        Self::read_response(response).await
    }
}

#[async_trait]
impl Gateway for EvolutionClient {
    async fn send_text(
        &self,
        instance: &str,
        number: &str,
        text: &str,
    ) -> Result<SentMessage, GatewayError> {
        let body = json!({ "number": number, "text": text });
        let response = self
            .post_json(&format!("/message/sendText/{}", instance.trim()), &body)
            .await?;
        parse_sent_message(&response)
    }

    async fn send_media(
        &self,
        instance: &str,
        number: &str,
        media: &OutgoingMedia,
    ) -> Result<SentMessage, GatewayError> {
        let mut body = json!({
            "number": number,
            "mediatype": media.media_type,
            "media": media.url,
            "caption": media.caption,
        });
        if let Some(file_name) = &media.file_name {
            body["fileName"] = json!(file_name);
        }
        let response = self
            .post_json(&format!("/message/sendMedia/{}", instance.trim()), &body)
            .await?;
        parse_sent_message(&response)
    }

    async fn find_chats(&self, instance: &str) -> Result<Vec<GatewayChat>, GatewayError> {
        let response = self
            .post_json(&format!("/chat/findChats/{}", instance.trim()), &json!({}))
            .await?;
        Ok(records(&response, "chats")
            .iter()
            .filter_map(parse_gateway_chat)
            .collect())
    }

    async fn find_messages(
        &self,
        instance: &str,
        remote_jid: &str,
        limit: usize,
    ) -> Result<Vec<GatewayMessage>, GatewayError> {
        let body = json!({
            "where": { "key": { "remoteJid": remote_jid } },
            "limit": limit,
        });
        let response = self
            .post_json(&format!("/chat/findMessages/{}", instance.trim()), &body)
            .await?;
        Ok(records(&response, "messages")
            .iter()
            .filter_map(parse_gateway_message)
            .collect())
    }

    async fn find_contacts(&self, instance: &str) -> Result<Vec<GatewayContact>, GatewayError> {
        let response = self
            .post_json(&format!("/chat/findContacts/{}", instance.trim()), &json!({}))
            .await?;
        Ok(records(&response, "contacts")
            .iter()
            .filter_map(parse_gateway_contact)
            .collect())
    }

    async fn fetch_profile_picture(
        &self,
        instance: &str,
        number: &str,
    ) -> Result<Option<String>, GatewayError> {
        let response = self
            .post_json(
                &format!("/chat/fetchProfilePictureUrl/{}", instance.trim()),
                &json!({ "number": number }),
            )
            .await?;
        Ok(non_empty_str(&response, "profilePictureUrl")
            .or_else(|| non_empty_str(&response, "profilePicUrl")))
    }

    async fn connection_state(&self, instance: &str) -> Result<String, GatewayError> {
        let response = self
            .get_json(&format!("/instance/connectionState/{}", instance.trim()))
            .await?;
        response
            .get("instance")
            .and_then(|i| i.get("state"))
            .or_else(|| response.get("state"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Decode("missing connection state".to_string()))
    }
}

fn non_empty_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Evolution answers list endpoints either with a bare array or with an
/// envelope such as `{ "messages": { "total": 3, "records": [...] } }`.
pub fn records(value: &Value, key: &str) -> Vec<Value> {
    if let Some(items) = value.as_array() {
        return items.clone();
    }
    let nested = value.get(key);
    if let Some(items) = nested
        .and_then(|n| n.get("records"))
        .and_then(Value::as_array)
    {
        return items.clone();
    }
    if let Some(items) = nested.and_then(Value::as_array) {
        return items.clone();
    }
    value
        .get("records")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Maps Baileys acknowledgement levels (names or numbers) to inbox statuses.
pub fn map_gateway_status(raw: &Value) -> Option<&'static str> {
    if let Some(level) = raw.as_i64() {
        return match level {
            0 => Some("failed"),
            1 => Some("pending"),
            2 => Some("sent"),
            3 => Some("delivered"),
            4 | 5 => Some("read"),
            _ => None,
        };
    }
    match raw.as_str()?.trim().to_ascii_uppercase().as_str() {
        "ERROR" | "FAILED" => Some("failed"),
        "PENDING" => Some("pending"),
        "SERVER_ACK" | "SENT" => Some("sent"),
        "DELIVERY_ACK" | "DELIVERED" => Some("delivered"),
        "READ" | "PLAYED" => Some("read"),
        _ => None,
    }
}

fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    let number = match raw {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        // protobuf Long serialized as { low, high, unsigned }
        Value::Object(obj) => obj.get("low").and_then(Value::as_i64)?,
        _ => return None,
    };
    if number <= 0 {
        return None;
    }
    if number > 1_000_000_000_000 {
        Utc.timestamp_millis_opt(number).single()
    } else {
        Utc.timestamp_opt(number, 0).single()
    }
}

fn text_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str().map(str::to_string)
}

fn unwrap_envelope(message: &Value) -> &Value {
    for wrapper in [
        "ephemeralMessage",
        "viewOnceMessage",
        "viewOnceMessageV2",
        "documentWithCaptionMessage",
        "editedMessage",
    ] {
        if let Some(inner) = message.get(wrapper).and_then(|w| w.get("message")) {
            return unwrap_envelope(inner);
        }
    }
    message
}

fn classify_content(message: &Value) -> (MessageKind, String, String) {
    let message = unwrap_envelope(message);
    let url = |key: &str| text_at(message, &[key, "url"]).unwrap_or_default();

    if let Some(text) = message.get("conversation").and_then(Value::as_str) {
        return (MessageKind::Text, text.to_string(), String::new());
    }
    if let Some(text) = text_at(message, &["extendedTextMessage", "text"]) {
        return (MessageKind::Text, text, String::new());
    }
    if message.get("imageMessage").is_some() {
        let caption = text_at(message, &["imageMessage", "caption"]).unwrap_or_default();
        return (MessageKind::Image, caption, url("imageMessage"));
    }
    if message.get("videoMessage").is_some() {
        let caption = text_at(message, &["videoMessage", "caption"]).unwrap_or_default();
        return (MessageKind::Video, caption, url("videoMessage"));
    }
    if message.get("audioMessage").is_some() {
        return (MessageKind::Audio, String::new(), url("audioMessage"));
    }
    if message.get("documentMessage").is_some() {
        let caption = text_at(message, &["documentMessage", "caption"])
            .or_else(|| text_at(message, &["documentMessage", "fileName"]))
            .unwrap_or_default();
        return (MessageKind::Document, caption, url("documentMessage"));
    }
    if message.get("stickerMessage").is_some() {
        return (MessageKind::Sticker, String::new(), url("stickerMessage"));
    }
    if let Some(location) = message.get("locationMessage") {
        let lat = location.get("degreesLatitude").and_then(Value::as_f64);
        let lng = location.get("degreesLongitude").and_then(Value::as_f64);
        let content = match (lat, lng) {
            (Some(lat), Some(lng)) => format!("{lat},{lng}"),
            _ => String::new(),
        };
        return (MessageKind::Location, content, String::new());
    }
    if message.get("contactMessage").is_some() {
        let name = text_at(message, &["contactMessage", "displayName"]).unwrap_or_default();
        return (MessageKind::Contact, name, String::new());
    }
    if message.get("reactionMessage").is_some() {
        let emoji = text_at(message, &["reactionMessage", "text"]).unwrap_or_default();
        return (MessageKind::Reaction, emoji, String::new());
    }
    if message.get("protocolMessage").is_some()
        || message.get("senderKeyDistributionMessage").is_some()
    {
        return (MessageKind::Protocol, String::new(), String::new());
    }
    (MessageKind::Unknown, String::new(), String::new())
}

pub fn parse_gateway_message(value: &Value) -> Option<GatewayMessage> {
    let key = value.get("key")?;
    let external_id = non_empty_str(key, "id")?;
    let remote_jid = non_empty_str(key, "remoteJid")?;
    let alt_jid = non_empty_str(key, "remoteJidAlt")
        .or_else(|| non_empty_str(key, "senderPn"))
        .or_else(|| non_empty_str(value, "senderPn"));

    let (kind, content, inner_url) = value
        .get("message")
        .map(classify_content)
        .unwrap_or((MessageKind::Unknown, String::new(), String::new()));
    let media_url = value
        .get("message")
        .and_then(|m| non_empty_str(m, "mediaUrl"))
        .unwrap_or(inner_url);

    Some(GatewayMessage {
        external_id,
        remote_jid,
        alt_jid,
        from_me: key.get("fromMe").and_then(Value::as_bool).unwrap_or(false),
        participant: non_empty_str(key, "participant"),
        push_name: non_empty_str(value, "pushName").unwrap_or_default(),
        timestamp: value.get("messageTimestamp").and_then(parse_timestamp),
        kind,
        content,
        media_url,
        status: value.get("status").and_then(map_gateway_status),
    })
}

pub fn parse_gateway_contact(value: &Value) -> Option<GatewayContact> {
    let remote_jid = non_empty_str(value, "remoteJid").or_else(|| {
        non_empty_str(value, "id").filter(|id| id.contains('@'))
    })?;
    Some(GatewayContact {
        remote_jid,
        push_name: non_empty_str(value, "pushName").or_else(|| non_empty_str(value, "name")),
        profile_pic_url: non_empty_str(value, "profilePicUrl")
            .or_else(|| non_empty_str(value, "profilePictureUrl")),
    })
}

pub fn parse_gateway_chat(value: &Value) -> Option<GatewayChat> {
    let remote_jid = non_empty_str(value, "remoteJid").or_else(|| {
        non_empty_str(value, "id").filter(|id| id.contains('@'))
    })?;
    Some(GatewayChat {
        remote_jid,
        name: non_empty_str(value, "name").or_else(|| non_empty_str(value, "pushName")),
        unread_count: value
            .get("unreadCount")
            .or_else(|| value.get("unreadMessages"))
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32,
    })
}

pub fn parse_sent_message(value: &Value) -> Result<SentMessage, GatewayError> {
    let key = value
        .get("key")
        .ok_or_else(|| GatewayError::Decode("send response without key".to_string()))?;
    let external_id = non_empty_str(key, "id")
        .ok_or_else(|| GatewayError::Decode("send response without key.id".to_string()))?;
    Ok(SentMessage {
        external_id,
        remote_jid: non_empty_str(key, "remoteJid").unwrap_or_default(),
        status: value
            .get("status")
            .and_then(map_gateway_status)
            .unwrap_or("sent"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_plain_text_message() {
        let payload = json!({
            "key": { "id": "3EB0ABC", "remoteJid": "5511987654321@s.whatsapp.net", "fromMe": false },
            "pushName": "Maria",
            "message": { "conversation": "Oi, tudo bem?" },
            "messageTimestamp": 1_700_000_000,
            "status": "DELIVERY_ACK"
        });
        let parsed = parse_gateway_message(&payload).expect("message");
        assert_eq!(parsed.external_id, "3EB0ABC");
        assert_eq!(parsed.kind, MessageKind::Text);
        assert_eq!(parsed.content, "Oi, tudo bem?");
        assert_eq!(parsed.push_name, "Maria");
        assert_eq!(parsed.status, Some("delivered"));
        assert_eq!(
            parsed.timestamp,
            Utc.timestamp_opt(1_700_000_000, 0).single()
        );
    }

    #[test]
    fn parses_lid_message_with_phone_alternative() {
        let payload = json!({
            "key": {
                "id": "ABC",
                "remoteJid": "123456789012345@lid",
                "remoteJidAlt": "5511987654321@s.whatsapp.net",
                "fromMe": true
            },
            "message": { "extendedTextMessage": { "text": "link" } },
            "messageTimestamp": "1700000000"
        });
        let parsed = parse_gateway_message(&payload).expect("message");
        assert_eq!(parsed.alt_jid.as_deref(), Some("5511987654321@s.whatsapp.net"));
        assert!(parsed.from_me);
        assert!(parsed.timestamp.is_some());
    }

    #[test]
    fn unwraps_ephemeral_media_and_prefers_stored_media_url() {
        let payload = json!({
            "key": { "id": "IMG1", "remoteJid": "5511987654321@s.whatsapp.net" },
            "message": {
                "ephemeralMessage": { "message": {
                    "imageMessage": { "caption": "nota fiscal", "url": "https://mmg.whatsapp.net/x" }
                }},
                "mediaUrl": "https://bucket.example.com/img1.jpg"
            },
            "messageTimestamp": 1_700_000_000_123i64
        });
        let parsed = parse_gateway_message(&payload).expect("message");
        assert_eq!(parsed.kind, MessageKind::Image);
        assert_eq!(parsed.content, "nota fiscal");
        assert_eq!(parsed.media_url, "https://bucket.example.com/img1.jpg");
        assert_eq!(
            parsed.timestamp,
            Utc.timestamp_millis_opt(1_700_000_000_123).single()
        );
    }

    #[test]
    fn marks_reactions_and_protocol_frames_unstorable() {
        let reaction = json!({
            "key": { "id": "R1", "remoteJid": "5511987654321@s.whatsapp.net" },
            "message": { "reactionMessage": { "text": "👍" } }
        });
        let revoke = json!({
            "key": { "id": "P1", "remoteJid": "5511987654321@s.whatsapp.net" },
            "message": { "protocolMessage": { "type": 0 } }
        });
        assert!(!parse_gateway_message(&reaction).expect("reaction").kind.is_storable());
        assert!(!parse_gateway_message(&revoke).expect("protocol").kind.is_storable());
    }

    #[test]
    fn rejects_messages_without_key_id() {
        let payload = json!({ "key": { "remoteJid": "5511987654321@s.whatsapp.net" } });
        assert_eq!(parse_gateway_message(&payload), None);
    }

    #[test]
    fn reads_records_from_every_envelope() {
        let bare = json!([{ "a": 1 }]);
        let nested = json!({ "messages": { "total": 1, "records": [{ "a": 1 }] } });
        let keyed = json!({ "messages": [{ "a": 1 }] });
        for value in [bare, nested, keyed] {
            assert_eq!(records(&value, "messages").len(), 1);
        }
        assert!(records(&json!({ "status": 404 }), "messages").is_empty());
    }

    #[test]
    fn maps_numeric_and_named_status() {
        assert_eq!(map_gateway_status(&json!(3)), Some("delivered"));
        assert_eq!(map_gateway_status(&json!("read")), Some("read"));
        assert_eq!(map_gateway_status(&json!("SERVER_ACK")), Some("sent"));
        assert_eq!(map_gateway_status(&json!("bogus")), None);
    }

    #[test]
    fn parses_contacts_and_chats_by_remote_jid() {
        let contact = json!({
            "id": "clx1",
            "remoteJid": "5511987654321@s.whatsapp.net",
            "pushName": "Maria",
            "profilePicUrl": "https://pps.whatsapp.net/p.jpg"
        });
        let parsed = parse_gateway_contact(&contact).expect("contact");
        assert_eq!(parsed.remote_jid, "5511987654321@s.whatsapp.net");
        assert_eq!(parsed.push_name.as_deref(), Some("Maria"));

        let legacy = json!({ "id": "120363025246125486@g.us", "name": "Equipe" });
        let chat = parse_gateway_chat(&legacy).expect("chat");
        assert_eq!(chat.remote_jid, "120363025246125486@g.us");
        assert_eq!(chat.name.as_deref(), Some("Equipe"));
        assert_eq!(parse_gateway_chat(&json!({ "id": "clx1" })), None);
    }

    #[test]
    fn send_response_requires_key_id() {
        let ok = json!({ "key": { "id": "BAE5", "remoteJid": "5511987654321@s.whatsapp.net" }, "status": "PENDING" });
        let sent = parse_sent_message(&ok).expect("sent");
        assert_eq!(sent.external_id, "BAE5");
        assert_eq!(sent.status, "pending");
        assert!(parse_sent_message(&json!({ "error": "x" })).is_err());
    }
}
