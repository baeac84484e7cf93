use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{capacity_claim, Store};
use crate::error::StoreError;
use crate::types::{
    format_protocol_number, new_id, now_iso, Agent, AgentActivity, AgentLoad, AssignAttempt,
    Contact, Conversation, ConversationActivity, ConversationPatch, ConversationStatus, Message,
    MessageStatus, NewContact, NewConversation, NewMessage, Organization, ProtocolLogEntry, Queue,
};

/// Organizations, agents and bearer tokens to preload into a [`MemoryStore`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedData {
    #[serde(default)]
    pub organizations: Vec<Organization>,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub tokens: Vec<SeedToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedToken {
    pub token: String,
    pub agent_id: String,
}

impl SeedData {
    pub async fn from_file(path: &Path) -> Result<Self, StoreError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::Decode(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| StoreError::Decode(format!("{}: {e}", path.display())))
    }
}

#[derive(Default)]
struct Tables {
    organizations: HashMap<String, Organization>,
    agents: HashMap<String, Agent>,
    tokens: HashMap<String, String>,
    contacts: Vec<Contact>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    protocol_sequences: HashMap<String, i64>,
    protocol_logs: Vec<ProtocolLogEntry>,
    agent_activity: Vec<AgentActivity>,
    greeted: HashSet<String>,
    #[cfg(test)]
    faults: Faults,
}

/// Injected misbehavior for exercising race and failure handling.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct Faults {
    /// `find_contact` answers `None` this many more times.
    pub stale_contact_reads: usize,
    /// `active_conversation` answers `None` this many more times.
    pub stale_conversation_reads: usize,
    pub fail_audit_writes: bool,
}

impl Tables {
    fn has_active_conversation(&self, contact_id: &str, except_id: Option<&str>) -> bool {
        self.conversations.iter().any(|c| {
            c.contact_id == contact_id && c.status.is_active() && Some(c.id.as_str()) != except_id
        })
    }

    fn open_count(&self, agent_id: &str) -> i64 {
        self.conversations
            .iter()
            .filter(|c| c.assigned_agent_id.as_deref() == Some(agent_id) && c.status.is_active())
            .count() as i64
    }

    #[cfg(test)]
    fn stale_contact_read(&mut self) -> bool {
        let stale = self.faults.stale_contact_reads > 0;
        self.faults.stale_contact_reads = self.faults.stale_contact_reads.saturating_sub(1);
        stale
    }

    #[cfg(not(test))]
    fn stale_contact_read(&mut self) -> bool {
        false
    }

    #[cfg(test)]
    fn stale_conversation_read(&mut self) -> bool {
        let stale = self.faults.stale_conversation_reads > 0;
        self.faults.stale_conversation_reads =
            self.faults.stale_conversation_reads.saturating_sub(1);
        stale
    }

    #[cfg(not(test))]
    fn stale_conversation_read(&mut self) -> bool {
        false
    }

    #[cfg(test)]
    fn audit_writes_fail(&self) -> bool {
        self.faults.fail_audit_writes
    }

    #[cfg(not(test))]
    fn audit_writes_fail(&self) -> bool {
        false
    }
}

/// Process-local store with the same uniqueness and atomicity guarantees as
/// the Postgres schema. Every operation runs under one lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: SeedData) -> Self {
        let mut tables = Tables::default();
        for organization in seed.organizations {
            tables
                .organizations
                .insert(organization.id.clone(), organization);
        }
        for agent in seed.agents {
            tables.agents.insert(agent.id.clone(), agent);
        }
        for token in seed.tokens {
            tables.tokens.insert(token.token, token.agent_id);
        }
        Self {
            tables: Mutex::new(tables),
        }
    }
}

#[cfg(test)]
impl MemoryStore {
    pub async fn put_organization(&self, organization: Organization) {
        let mut tables = self.tables.lock().await;
        tables
            .organizations
            .insert(organization.id.clone(), organization);
    }

    pub async fn put_agent(&self, agent: Agent) {
        let mut tables = self.tables.lock().await;
        tables.agents.insert(agent.id.clone(), agent);
    }

    pub async fn put_token(&self, token: &str, agent_id: &str) {
        let mut tables = self.tables.lock().await;
        tables.tokens.insert(token.to_string(), agent_id.to_string());
    }

    pub async fn set_agent_status(&self, agent_id: &str, status: crate::types::AgentStatus) {
        let mut tables = self.tables.lock().await;
        if let Some(agent) = tables.agents.get_mut(agent_id) {
            agent.status = status;
        }
    }

    pub(crate) async fn with_faults(&self, apply: impl FnOnce(&mut Faults)) {
        let mut tables = self.tables.lock().await;
        apply(&mut tables.faults);
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.tables.lock().await.contacts.clone()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.tables.lock().await.conversations.clone()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.tables.lock().await.messages.clone()
    }

    pub async fn protocol_logs(&self) -> Vec<ProtocolLogEntry> {
        self.tables.lock().await.protocol_logs.clone()
    }

    pub async fn agent_activity(&self) -> Vec<AgentActivity> {
        self.tables.lock().await.agent_activity.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn organization_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<Organization>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .organizations
            .values()
            .find(|o| o.phone_number_id == phone_number_id)
            .cloned())
    }

    async fn organization(&self, id: &str) -> Result<Option<Organization>, StoreError> {
        Ok(self.tables.lock().await.organizations.get(id).cloned())
    }

    async fn agent_for_token(&self, token: &str) -> Result<Option<Agent>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tokens
            .get(token)
            .and_then(|agent_id| tables.agents.get(agent_id))
            .cloned())
    }

    async fn agent(&self, organization_id: &str, id: &str) -> Result<Option<Agent>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .agents
            .get(id)
            .filter(|a| a.organization_id == organization_id)
            .cloned())
    }

    async fn find_contact(
        &self,
        organization_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.stale_contact_read() {
            return Ok(None);
        }
        Ok(tables
            .contacts
            .iter()
            .find(|c| c.organization_id == organization_id && c.phone == phone)
            .cloned())
    }

    async fn contact(&self, id: &str) -> Result<Option<Contact>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.contacts.iter().find(|c| c.id == id).cloned())
    }

    async fn insert_contact(&self, contact: NewContact) -> Result<Contact, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables
            .contacts
            .iter()
            .any(|c| c.organization_id == contact.organization_id && c.phone == contact.phone)
        {
            return Err(StoreError::UniqueViolation(
                "contacts_organization_phone_key".to_string(),
            ));
        }
        let now = now_iso();
        let created = Contact {
            id: new_id(),
            organization_id: contact.organization_id,
            phone: contact.phone,
            name: contact.name,
            avatar_url: contact.avatar_url,
            custom_fields: Value::Object(Default::default()),
            tags: vec![],
            created_at: now.clone(),
            updated_at: now,
        };
        tables.contacts.push(created.clone());
        Ok(created)
    }

    async fn update_contact_profile(
        &self,
        id: &str,
        name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Contact, StoreError> {
        let mut tables = self.tables.lock().await;
        let contact = tables
            .contacts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::NotFound)?;
        if let Some(name) = name {
            contact.name = Some(name.to_string());
        }
        if let Some(avatar_url) = avatar_url {
            contact.avatar_url = Some(avatar_url.to_string());
        }
        contact.updated_at = now_iso();
        Ok(contact.clone())
    }

    async fn active_conversation(
        &self,
        organization_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.stale_conversation_read() {
            return Ok(None);
        }
        Ok(tables
            .conversations
            .iter()
            .rev()
            .find(|c| {
                c.organization_id == organization_id
                    && c.contact_id == contact_id
                    && c.status.is_active()
            })
            .cloned())
    }

    async fn create_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.has_active_conversation(&conversation.contact_id, None) {
            return Err(StoreError::UniqueViolation(
                "conversations_one_active_per_contact".to_string(),
            ));
        }
        let sequence = tables
            .protocol_sequences
            .entry(conversation.protocol_day.clone())
            .or_insert(0);
        *sequence += 1;
        let protocol_number = format_protocol_number(&conversation.protocol_day, *sequence);

        let now = now_iso();
        let created = Conversation {
            id: new_id(),
            organization_id: conversation.organization_id,
            contact_id: conversation.contact_id,
            assigned_agent_id: None,
            status: ConversationStatus::Pending,
            protocol_number,
            queue: None,
            classification: None,
            tags: vec![],
            is_bot_active: false,
            unread_count: 0,
            last_message_at: None,
            last_message_preview: None,
            sla_due_at: conversation.sla_due_at,
            resolved_at: None,
            created_at: now.clone(),
            updated_at: now,
        };
        tables.conversations.push(created.clone());
        Ok(created)
    }

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.conversations.iter().find(|c| c.id == id).cloned())
    }

    async fn record_conversation_activity(
        &self,
        conversation_id: &str,
        activity: &ConversationActivity,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(conversation) = tables
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conversation.last_message_at = Some(activity.last_message_at.clone());
            conversation.last_message_preview = Some(activity.last_message_preview.clone());
            if activity.increment_unread {
                conversation.unread_count += 1;
            }
            conversation.updated_at = now_iso();
        }
        Ok(())
    }

    async fn update_conversation(
        &self,
        id: &str,
        patch: &ConversationPatch,
    ) -> Result<(Conversation, Conversation), StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        let mut after = before.clone();
        patch.apply_to(&mut after, &now_iso());
        if after.status.is_active() && tables.has_active_conversation(&after.contact_id, Some(id)) {
            return Err(StoreError::UniqueViolation(
                "conversations_one_active_per_contact".to_string(),
            ));
        }
        if let Some(agent_id) = capacity_claim(&before, &after) {
            let agent = tables.agents.get(agent_id).ok_or(StoreError::NotFound)?;
            if tables.open_count(agent_id) >= i64::from(agent.max_concurrent_chats) {
                return Err(StoreError::AgentAtCapacity(agent_id.to_string()));
            }
        }
        if let Some(slot) = tables.conversations.iter_mut().find(|c| c.id == id) {
            *slot = after.clone();
        }
        Ok((before, after))
    }

    async fn message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .iter()
            .find(|m| m.whatsapp_message_id.as_deref() == Some(provider_message_id))
            .cloned())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(provider_id) = message.whatsapp_message_id.as_deref() {
            if tables
                .messages
                .iter()
                .any(|m| m.whatsapp_message_id.as_deref() == Some(provider_id))
            {
                return Err(StoreError::UniqueViolation(
                    "messages_whatsapp_message_id_key".to_string(),
                ));
            }
        }
        let created = message.into_message(new_id(), now_iso());
        tables.messages.push(created.clone());
        Ok(created)
    }

    async fn conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn apply_delivery_status(
        &self,
        provider_message_id: &str,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut changed = 0;
        for message in tables
            .messages
            .iter_mut()
            .filter(|m| m.whatsapp_message_id.as_deref() == Some(provider_message_id))
        {
            if !status.can_replace(message.status) {
                continue;
            }
            message.status = status;
            if let Some(error_message) = error_message {
                message.error_message = Some(error_message.to_string());
            }
            message.updated_at = now_iso();
            changed += 1;
        }
        Ok(changed)
    }

    async fn assignment_candidates(
        &self,
        organization_id: &str,
        queue: Option<Queue>,
    ) -> Result<Vec<AgentLoad>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .agents
            .values()
            .filter(|a| {
                a.organization_id == organization_id
                    && a.status.accepts_assignments()
                    && a.role.handles_conversations()
                    && queue.map_or(true, |q| a.queue.admits(q))
            })
            .map(|agent| AgentLoad {
                open_count: tables.open_count(&agent.id),
                agent: agent.clone(),
            })
            .collect())
    }

    async fn try_assign(
        &self,
        conversation_id: &str,
        agent_id: &str,
    ) -> Result<AssignAttempt, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(agent) = tables.agents.get(agent_id).cloned() else {
            return Ok(AssignAttempt::AgentUnavailable);
        };
        if !agent.status.accepts_assignments() || !agent.role.handles_conversations() {
            return Ok(AssignAttempt::AgentUnavailable);
        }
        if tables.open_count(agent_id) >= i64::from(agent.max_concurrent_chats) {
            return Ok(AssignAttempt::AgentAtCapacity);
        }
        let Some(conversation) = tables.conversations.iter_mut().find(|c| {
            c.id == conversation_id
                && c.organization_id == agent.organization_id
                && c.status == ConversationStatus::Pending
                && c.assigned_agent_id.is_none()
        }) else {
            return Ok(AssignAttempt::AlreadyHandled);
        };
        conversation.assigned_agent_id = Some(agent.id);
        conversation.status = ConversationStatus::Open;
        conversation.updated_at = now_iso();
        Ok(AssignAttempt::Assigned)
    }

    async fn append_protocol_log(&self, entry: ProtocolLogEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.audit_writes_fail() {
            return Err(StoreError::Decode("protocol log unavailable".to_string()));
        }
        tables.protocol_logs.push(entry);
        Ok(())
    }

    async fn append_agent_activity(&self, entry: AgentActivity) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.audit_writes_fail() {
            return Err(StoreError::Decode("activity log unavailable".to_string()));
        }
        tables.agent_activity.push(entry);
        Ok(())
    }

    async fn claim_auto_reply(&self, conversation_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.greeted.insert(conversation_id.to_string()))
    }
}
