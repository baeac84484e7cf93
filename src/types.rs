use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Pending,
    Open,
    Waiting,
    Resolved,
    Closed,
}

text_enum!(ConversationStatus {
    Pending => "pending",
    Open => "open",
    Waiting => "waiting",
    Resolved => "resolved",
    Closed => "closed",
});

impl ConversationStatus {
    /// Statuses in which a conversation still counts as the contact's live
    /// thread. An assigned conversation in one of these occupies a slot of
    /// its agent's capacity.
    pub const ACTIVE: [ConversationStatus; 3] = [
        ConversationStatus::Pending,
        ConversationStatus::Open,
        ConversationStatus::Waiting,
    ];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Away,
    Busy,
    Offline,
}

text_enum!(AgentStatus {
    Online => "online",
    Away => "away",
    Busy => "busy",
    Offline => "offline",
});

impl AgentStatus {
    pub fn accepts_assignments(self) -> bool {
        matches!(self, AgentStatus::Online | AgentStatus::Away)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Owner,
    Admin,
    Agent,
    Viewer,
}

text_enum!(AgentRole {
    Owner => "owner",
    Admin => "admin",
    Agent => "agent",
    Viewer => "viewer",
});

impl AgentRole {
    pub fn handles_conversations(self) -> bool {
        !matches!(self, AgentRole::Viewer)
    }
}

/// Routing category. Agents may affiliate with `Both`; conversations name a concrete queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    Sales,
    Support,
    Both,
}

text_enum!(Queue {
    Sales => "sales",
    Support => "support",
    Both => "both",
});

impl Queue {
    pub fn admits(self, requested: Queue) -> bool {
        self == Queue::Both || self == requested
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    Contact,
    Agent,
    System,
    Bot,
}

text_enum!(SenderType {
    Contact => "contact",
    Agent => "agent",
    System => "system",
    Bot => "bot",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Sticker,
    Location,
    Reaction,
    Interactive,
    Contacts,
    Template,
    System,
}

text_enum!(MessageType {
    Text => "text",
    Image => "image",
    Audio => "audio",
    Video => "video",
    Document => "document",
    Sticker => "sticker",
    Location => "location",
    Reaction => "reaction",
    Interactive => "interactive",
    Contacts => "contacts",
    Template => "template",
    System => "system",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

text_enum!(MessageStatus {
    Pending => "pending",
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
    Failed => "failed",
});

impl MessageStatus {
    const ALL: [MessageStatus; 5] = [
        MessageStatus::Pending,
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Read,
        MessageStatus::Failed,
    ];

    /// Provider delivery vocabulary. Anything else is ignored by the tracker.
    pub fn from_provider(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    /// Whether a stored `current` status may be overwritten by `self`.
    /// Delivery only moves forward; `failed` always lands.
    pub fn can_replace(self, current: MessageStatus) -> bool {
        match self {
            MessageStatus::Failed => true,
            next => current != MessageStatus::Failed && next.rank() > current.rank(),
        }
    }

    /// Stored statuses that `self` is allowed to overwrite.
    pub fn replaceable(self) -> Vec<MessageStatus> {
        MessageStatus::ALL
            .iter()
            .copied()
            .filter(|current| self.can_replace(*current))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub phone_number_id: String,
    #[serde(default, skip_serializing)]
    pub access_token: String,
    #[serde(default)]
    pub auto_reply_message: Option<String>,
    #[serde(default)]
    pub sla_minutes: Option<i32>,
    /// Offset used to decide which calendar day a protocol number belongs to.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_true")]
    pub mark_messages_read: bool,
    #[serde(default = "now_iso")]
    pub created_at: String,
    #[serde(default = "now_iso")]
    pub updated_at: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub queue: Queue,
    pub max_concurrent_chats: i32,
    #[serde(default = "now_iso")]
    pub created_at: String,
    #[serde(default = "now_iso")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub organization_id: String,
    pub phone: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub custom_fields: Value,
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewContact {
    pub organization_id: String,
    pub phone: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub organization_id: String,
    pub contact_id: String,
    pub assigned_agent_id: Option<String>,
    pub status: ConversationStatus,
    pub protocol_number: String,
    pub queue: Option<Queue>,
    pub classification: Option<String>,
    pub tags: Vec<String>,
    pub is_bot_active: bool,
    pub unread_count: i32,
    pub last_message_at: Option<String>,
    pub last_message_preview: Option<String>,
    pub sla_due_at: Option<String>,
    pub resolved_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for opening a conversation. The store allocates the protocol number
/// from its per-day counter for `protocol_day` (`YYYYMMDD`).
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub organization_id: String,
    pub contact_id: String,
    pub protocol_day: String,
    pub sla_due_at: Option<String>,
}

pub fn format_protocol_number(day: &str, sequence: i64) -> String {
    format!("{day}-{sequence:05}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub organization_id: String,
    pub sender_type: SenderType,
    pub sender_agent_id: Option<String>,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_mime_type: Option<String>,
    pub media_filename: Option<String>,
    pub whatsapp_message_id: Option<String>,
    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub organization_id: String,
    pub sender_type: SenderType,
    pub sender_agent_id: Option<String>,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_mime_type: Option<String>,
    pub media_filename: Option<String>,
    pub whatsapp_message_id: Option<String>,
    pub status: MessageStatus,
    pub error_message: Option<String>,
}

impl NewMessage {
    pub fn into_message(self, id: String, now: String) -> Message {
        Message {
            id,
            conversation_id: self.conversation_id,
            organization_id: self.organization_id,
            sender_type: self.sender_type,
            sender_agent_id: self.sender_agent_id,
            message_type: self.message_type,
            content: self.content,
            media_url: self.media_url,
            media_mime_type: self.media_mime_type,
            media_filename: self.media_filename,
            whatsapp_message_id: self.whatsapp_message_id,
            status: self.status,
            error_message: self.error_message,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Denormalized list fields written after every stored message.
#[derive(Debug, Clone)]
pub struct ConversationActivity {
    pub last_message_at: String,
    pub last_message_preview: String,
    pub increment_unread: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolEvent {
    ConversationCreated,
    AgentAssigned,
    Resolved,
    Closed,
}

text_enum!(ProtocolEvent {
    ConversationCreated => "conversation_created",
    AgentAssigned => "agent_assigned",
    Resolved => "resolved",
    Closed => "closed",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolLogEntry {
    pub id: String,
    pub organization_id: String,
    pub conversation_id: String,
    pub protocol_number: String,
    pub event: ProtocolEvent,
    pub details: String,
    pub agent_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    ConversationAssigned,
    ConversationResolved,
}

text_enum!(AgentAction {
    ConversationAssigned => "conversation_assigned",
    ConversationResolved => "conversation_resolved",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivity {
    pub id: String,
    pub organization_id: String,
    pub agent_id: String,
    pub conversation_id: Option<String>,
    pub action: AgentAction,
    pub details: String,
    pub created_at: String,
}

/// An agent together with the number of live conversations assigned to it.
#[derive(Debug, Clone)]
pub struct AgentLoad {
    pub agent: Agent,
    pub open_count: i64,
}

/// Outcome of one guarded count-then-assign attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignAttempt {
    Assigned,
    AgentAtCapacity,
    AgentUnavailable,
    /// The conversation is no longer pending and unassigned.
    AlreadyHandled,
}

/// Agent-facing partial update. Absent fields are left untouched; an explicit
/// `null` clears nullable fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPatch {
    #[serde(default)]
    pub status: Option<ConversationStatus>,
    #[serde(default, alias = "assigned_agent_id", deserialize_with = "double_option")]
    pub assigned_agent_id: Option<Option<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub classification: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub queue: Option<Option<Queue>>,
    #[serde(default, alias = "is_bot_active")]
    pub is_bot_active: Option<bool>,
}

impl ConversationPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.assigned_agent_id.is_none()
            && self.tags.is_none()
            && self.classification.is_none()
            && self.queue.is_none()
            && self.is_bot_active.is_none()
    }

    pub fn apply_to(&self, conversation: &mut Conversation, now: &str) {
        if let Some(status) = self.status {
            if status == ConversationStatus::Resolved && conversation.status != status {
                conversation.resolved_at = Some(now.to_string());
            }
            conversation.status = status;
        }
        if let Some(agent_id) = &self.assigned_agent_id {
            conversation.assigned_agent_id = agent_id.clone();
        }
        if let Some(tags) = &self.tags {
            conversation.tags = tags.clone();
        }
        if let Some(classification) = &self.classification {
            conversation.classification = classification.clone();
        }
        if let Some(queue) = self.queue {
            conversation.queue = queue;
        }
        if let Some(active) = self.is_bot_active {
            conversation.is_bot_active = active;
        }
        conversation.updated_at = now.to_string();
    }
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
