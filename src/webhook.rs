//! WhatsApp Cloud webhook payload schema.
//!
//! Every field the provider may omit is defaulted so a partially populated
//! change never fails the whole batch. Message bodies are a union keyed by
//! the `type` tag; kinds this service does not know decode to
//! [`MessageContent::Unsupported`] instead of an error.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

pub const BUSINESS_ACCOUNT_OBJECT: &str = "whatsapp_business_account";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub metadata: Option<ChangeMetadata>,
    #[serde(default)]
    pub contacts: Vec<ProfileContact>,
    #[serde(default, deserialize_with = "each_or_skip")]
    pub messages: Vec<InboundMessage>,
    #[serde(default, deserialize_with = "each_or_skip")]
    pub statuses: Vec<StatusUpdate>,
}

impl ChangeValue {
    pub fn phone_number_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .map(|m| m.phone_number_id.trim())
            .filter(|id| !id.is_empty())
    }

    /// Profile names keyed by normalized phone digits.
    pub fn profile_names(&self) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for contact in &self.contacts {
            let Some(digits) = normalize_phone(&contact.wa_id) else {
                continue;
            };
            let name = contact
                .profile
                .as_ref()
                .and_then(|p| p.name.as_deref())
                .unwrap_or("")
                .trim()
                .to_string();
            if !name.is_empty() {
                names.insert(digits, name);
            }
        }
        names
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeMetadata {
    #[serde(default)]
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileContact {
    #[serde(default)]
    pub wa_id: String,
    #[serde(default)]
    pub profile: Option<ContactProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusUpdate {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub errors: Vec<StatusError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusError {
    #[serde(default, deserialize_with = "code_text")]
    pub code: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Decodes a list element by element; an element that does not fit its
/// shape is logged and dropped so its siblings still get processed.
fn each_or_skip<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let items = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(error = %err, "skipping malformed webhook element");
                None
            }
        })
        .collect())
}

/// Error codes arrive as numbers, occasionally as strings.
fn code_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(TextBody),
    Image(MediaBody),
    Audio(MediaBody),
    Video(MediaBody),
    Document(MediaBody),
    Sticker(MediaBody),
    Location(LocationBody),
    Reaction(ReactionBody),
    Interactive(InteractiveBody),
    Button(ButtonBody),
    Order(OrderBody),
    System(SystemBody),
    Contacts(Vec<SharedContact>),
    Unsupported { kind: String },
}

impl MessageContent {
    /// Every `type` tag decoded into a dedicated variant.
    #[cfg(test)]
    pub const KNOWN_KINDS: [&'static str; 13] = [
        "text",
        "image",
        "audio",
        "video",
        "document",
        "sticker",
        "location",
        "reaction",
        "interactive",
        "button",
        "order",
        "system",
        "contacts",
    ];

    pub fn from_value(value: &Value) -> Self {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match kind.as_str() {
            "text" => MessageContent::Text(nested(value, "text")),
            "image" => MessageContent::Image(nested(value, "image")),
            "audio" => MessageContent::Audio(nested(value, "audio")),
            "video" => MessageContent::Video(nested(value, "video")),
            "document" => MessageContent::Document(nested(value, "document")),
            "sticker" => MessageContent::Sticker(nested(value, "sticker")),
            "location" => MessageContent::Location(nested(value, "location")),
            "reaction" => MessageContent::Reaction(nested(value, "reaction")),
            "interactive" => MessageContent::Interactive(nested(value, "interactive")),
            "button" => MessageContent::Button(nested(value, "button")),
            "order" => MessageContent::Order(nested(value, "order")),
            "system" => MessageContent::System(nested(value, "system")),
            "contacts" => MessageContent::Contacts(nested(value, "contacts")),
            _ => MessageContent::Unsupported { kind },
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            MessageContent::Text(_) => "text",
            MessageContent::Image(_) => "image",
            MessageContent::Audio(_) => "audio",
            MessageContent::Video(_) => "video",
            MessageContent::Document(_) => "document",
            MessageContent::Sticker(_) => "sticker",
            MessageContent::Location(_) => "location",
            MessageContent::Reaction(_) => "reaction",
            MessageContent::Interactive(_) => "interactive",
            MessageContent::Button(_) => "button",
            MessageContent::Order(_) => "order",
            MessageContent::System(_) => "system",
            MessageContent::Contacts(_) => "contacts",
            MessageContent::Unsupported { kind } => kind,
        }
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(MessageContent::from_value(&value))
    }
}

/// A malformed nested body degrades to its default rather than failing the message.
fn nested<T: DeserializeOwned + Default>(value: &Value, key: &str) -> T {
    value
        .get(key)
        .cloned()
        .and_then(|body| serde_json::from_value(body).ok())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TextBody {
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MediaBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LocationBody {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReactionBody {
    #[serde(default)]
    pub emoji: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InteractiveBody {
    #[serde(default)]
    pub button_reply: Option<ReplyOption>,
    #[serde(default)]
    pub list_reply: Option<ReplyOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReplyOption {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ButtonBody {
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OrderBody {
    #[serde(default)]
    pub text: Option<String>,
    /// Only the line count is surfaced.
    #[serde(default)]
    pub product_items: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SystemBody {
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SharedContact {
    #[serde(default)]
    pub name: Option<SharedContactName>,
    #[serde(default)]
    pub phones: Vec<SharedContactPhone>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SharedContactName {
    #[serde(default)]
    pub formatted_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SharedContactPhone {
    #[serde(default)]
    pub phone: String,
}

/// Digits-only phone form used as the contact key. `None` when no digits remain.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA_ID",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": { "display_phone_number": "15550001111", "phone_number_id": "PN1" },
                        "contacts": [{ "wa_id": "5511999990000", "profile": { "name": "Maria" } }],
                        "messages": [
                            { "from": "5511999990000", "id": "wamid.1", "timestamp": "1700000000",
                              "type": "text", "text": { "body": "Hello" } },
                            { "from": "5511999990000", "id": "wamid.2", "timestamp": "1700000001",
                              "type": "image", "image": { "id": "MEDIA1", "mime_type": "image/jpeg", "caption": "receipt" } },
                            { "from": "5511999990000", "id": "wamid.3", "type": "ephemeral" }
                        ],
                        "statuses": [
                            { "id": "wamid.out", "status": "failed", "timestamp": "1700000002",
                              "errors": [{ "code": 131047, "title": "Re-engagement message" }] }
                        ]
                    }
                }]
            }]
        })
    }

    #[test]
    fn parses_messages_and_statuses() {
        let payload: WebhookPayload = serde_json::from_value(sample_payload()).unwrap();
        assert_eq!(payload.object, BUSINESS_ACCOUNT_OBJECT);
        let value = &payload.entry[0].changes[0].value;
        assert_eq!(value.phone_number_id(), Some("PN1"));
        assert_eq!(value.messages.len(), 3);
        assert_eq!(
            value.messages[0].content,
            MessageContent::Text(TextBody { body: "Hello".into() })
        );
        match &value.messages[1].content {
            MessageContent::Image(media) => {
                assert_eq!(media.id.as_deref(), Some("MEDIA1"));
                assert_eq!(media.caption.as_deref(), Some("receipt"));
            }
            other => panic!("expected image, got {other:?}"),
        }
        assert_eq!(
            value.messages[2].content,
            MessageContent::Unsupported { kind: "ephemeral".into() }
        );
        assert_eq!(value.statuses[0].errors[0].code, "131047");
        assert_eq!(value.profile_names().get("5511999990000").map(String::as_str), Some("Maria"));
    }

    #[test]
    fn one_malformed_message_does_not_sink_its_siblings() {
        let value: ChangeValue = serde_json::from_value(json!({
            "metadata": { "phone_number_id": "PN1" },
            "messages": [
                { "from": "5511999990000", "id": 12345, "type": "text", "text": { "body": "bad id" } },
                "not an object",
                { "from": "5511999990000", "id": "wamid.ok", "type": "text", "text": { "body": "fine" } }
            ],
            "statuses": [
                { "id": ["wamid.out"], "status": "read" },
                { "id": "wamid.out", "status": "read" }
            ]
        }))
        .unwrap();
        assert_eq!(value.messages.len(), 1);
        assert_eq!(value.messages[0].id, "wamid.ok");
        assert_eq!(value.statuses.len(), 1);
        assert_eq!(value.statuses[0].status, "read");

        let empty: ChangeValue = serde_json::from_value(json!({ "messages": null })).unwrap();
        assert!(empty.messages.is_empty());
    }

    #[test]
    fn every_known_kind_decodes_to_its_own_variant() {
        for kind in MessageContent::KNOWN_KINDS {
            let content = MessageContent::from_value(&json!({ "type": kind }));
            assert_eq!(content.kind(), kind);
            assert!(
                !matches!(content, MessageContent::Unsupported { .. }),
                "{kind} fell through to unsupported"
            );
        }
    }

    #[test]
    fn malformed_body_degrades_to_default() {
        let content = MessageContent::from_value(&json!({ "type": "text", "text": 42 }));
        assert_eq!(content, MessageContent::Text(TextBody::default()));
    }

    #[test]
    fn phone_normalization_keeps_digits() {
        assert_eq!(normalize_phone("+55 (11) 99999-0000").as_deref(), Some("5511999990000"));
        assert_eq!(normalize_phone("n/a"), None);
    }
}
