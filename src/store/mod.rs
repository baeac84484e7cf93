//! Access patterns the ingestion core needs from the relational store.
//!
//! The store is the only synchronization point between concurrent webhook
//! deliveries, so every cross-request invariant is enforced here:
//! contact uniqueness per (organization, phone), one active conversation per
//! contact, per-day protocol sequences, provider message id uniqueness and
//! capacity-checked assignment. Uniqueness violations surface as
//! [`StoreError::UniqueViolation`] for callers to resolve by re-reading.

mod memory;
mod postgres;

pub use memory::{MemoryStore, SeedData};
pub use postgres::PgStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{
    Agent, AgentActivity, AgentLoad, AssignAttempt, Contact, Conversation, ConversationActivity,
    ConversationPatch, Message, MessageStatus, NewContact, NewConversation, NewMessage,
    Organization, ProtocolLogEntry, Queue,
};

#[async_trait]
pub trait Store: Send + Sync {
    async fn organization_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<Organization>, StoreError>;

    async fn organization(&self, id: &str) -> Result<Option<Organization>, StoreError>;

    async fn agent_for_token(&self, token: &str) -> Result<Option<Agent>, StoreError>;

    async fn agent(&self, organization_id: &str, id: &str) -> Result<Option<Agent>, StoreError>;

    async fn find_contact(
        &self,
        organization_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, StoreError>;

    async fn contact(&self, id: &str) -> Result<Option<Contact>, StoreError>;

    /// Fails with `UniqueViolation` when (organization, phone) already exists.
    async fn insert_contact(&self, contact: NewContact) -> Result<Contact, StoreError>;

    /// Writes only the provided fields.
    async fn update_contact_profile(
        &self,
        id: &str,
        name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Contact, StoreError>;

    /// Most recently created pending/open/waiting conversation of the contact.
    async fn active_conversation(
        &self,
        organization_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Allocates the next protocol number for `protocol_day` and inserts a
    /// `pending` conversation atomically. Fails with `UniqueViolation` when the
    /// contact already has an active conversation.
    async fn create_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, StoreError>;

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn record_conversation_activity(
        &self,
        conversation_id: &str,
        activity: &ConversationActivity,
    ) -> Result<(), StoreError>;

    /// Applies an agent-driven update and returns the row before and after.
    /// Handing a live conversation to an agent, or reopening one that keeps
    /// its agent, fails with `AgentAtCapacity` when that agent is already full.
    async fn update_conversation(
        &self,
        id: &str,
        patch: &ConversationPatch,
    ) -> Result<(Conversation, Conversation), StoreError>;

    async fn message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError>;

    /// Fails with `UniqueViolation` on a repeated provider message id.
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn conversation_messages(&self, conversation_id: &str)
        -> Result<Vec<Message>, StoreError>;

    /// Sets the delivery status of the message with this provider id, but only
    /// when its current status is one `status` may replace. Returns rows changed.
    async fn apply_delivery_status(
        &self,
        provider_message_id: &str,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<u64, StoreError>;

    /// Agents eligible for routing (status online/away, conversation-handling
    /// role, queue match) with their current live conversation counts.
    async fn assignment_candidates(
        &self,
        organization_id: &str,
        queue: Option<Queue>,
    ) -> Result<Vec<AgentLoad>, StoreError>;

    /// Re-checks the agent's availability and capacity and assigns the
    /// conversation if it is still pending and unassigned, as one atomic step.
    async fn try_assign(
        &self,
        conversation_id: &str,
        agent_id: &str,
    ) -> Result<AssignAttempt, StoreError>;

    async fn append_protocol_log(&self, entry: ProtocolLogEntry) -> Result<(), StoreError>;

    async fn append_agent_activity(&self, entry: AgentActivity) -> Result<(), StoreError>;

    /// Marks the conversation's greeting as sent. Only the first caller gets `true`.
    async fn claim_auto_reply(&self, conversation_id: &str) -> Result<bool, StoreError>;
}

/// The agent whose capacity an update newly draws on, if any.
fn capacity_claim<'a>(before: &Conversation, after: &'a Conversation) -> Option<&'a str> {
    let agent_id = after.assigned_agent_id.as_deref()?;
    if !after.status.is_active() {
        return None;
    }
    let already_held =
        before.status.is_active() && before.assigned_agent_id.as_deref() == Some(agent_id);
    (!already_held).then_some(agent_id)
}
