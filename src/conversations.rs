use chrono::{DateTime, Duration, FixedOffset, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::error::{ApiError, StoreError};
use crate::store::Store;
use crate::types::{
    new_id, now_iso, Agent, AgentAction, AgentActivity, AgentRole, Conversation,
    ConversationPatch, ConversationStatus, NewConversation, Organization, ProtocolEvent,
    ProtocolLogEntry,
};

#[derive(Debug, Clone)]
pub struct ResolvedConversation {
    pub conversation: Conversation,
    /// True when this call opened the conversation.
    pub created: bool,
}

/// Calendar day (`YYYYMMDD`) of `now` at the organization's fixed UTC offset.
pub fn protocol_day(now: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    match utc_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
    {
        Some(offset) => now.with_timezone(&offset).format("%Y%m%d").to_string(),
        None => now.format("%Y%m%d").to_string(),
    }
}

pub fn sla_due_at(now: DateTime<Utc>, sla_minutes: Option<i32>) -> Option<String> {
    sla_minutes
        .filter(|m| *m > 0)
        .map(|m| (now + Duration::minutes(i64::from(m))).to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Returns the contact's live conversation, opening a `pending` one with a
/// fresh protocol number when none is pending/open/waiting.
pub async fn resolve(
    store: &dyn Store,
    organization: &Organization,
    contact_id: &str,
) -> Result<ResolvedConversation, StoreError> {
    if let Some(conversation) = store
        .active_conversation(&organization.id, contact_id)
        .await?
    {
        return Ok(ResolvedConversation {
            conversation,
            created: false,
        });
    }

    let now = Utc::now();
    let opened = store
        .create_conversation(NewConversation {
            organization_id: organization.id.clone(),
            contact_id: contact_id.to_string(),
            protocol_day: protocol_day(now, organization.utc_offset_minutes),
            sla_due_at: sla_due_at(now, organization.sla_minutes),
        })
        .await;

    match opened {
        Ok(conversation) => {
            info!(
                organization_id = %organization.id,
                conversation_id = %conversation.id,
                protocol_number = %conversation.protocol_number,
                "conversation opened"
            );
            record_protocol_event(
                store,
                &conversation,
                ProtocolEvent::ConversationCreated,
                "Conversation created from inbound WhatsApp message".to_string(),
                None,
            )
            .await;
            Ok(ResolvedConversation {
                conversation,
                created: true,
            })
        }
        Err(StoreError::UniqueViolation(_)) => {
            debug!(contact_id, "conversation opened concurrently, re-reading");
            let conversation = store
                .active_conversation(&organization.id, contact_id)
                .await?
                .ok_or(StoreError::NotFound)?;
            Ok(ResolvedConversation {
                conversation,
                created: false,
            })
        }
        Err(err) => Err(err),
    }
}

/// Applies an agent's PATCH and writes the matching audit entries.
pub async fn update(
    store: &dyn Store,
    actor: &Agent,
    conversation_id: &str,
    patch: &ConversationPatch,
) -> Result<Conversation, ApiError> {
    if actor.role == AgentRole::Viewer {
        return Err(ApiError::Forbidden("viewers cannot update conversations".into()));
    }
    if patch.is_empty() {
        return Err(ApiError::BadRequest("no updatable fields provided".into()));
    }
    scoped_conversation(store, &actor.organization_id, conversation_id).await?;

    let target = match &patch.assigned_agent_id {
        Some(Some(agent_id)) => Some(
            store
                .agent(&actor.organization_id, agent_id)
                .await?
                .ok_or_else(|| ApiError::BadRequest(format!("unknown agent {agent_id}")))?,
        ),
        _ => None,
    };

    let (before, after) = store.update_conversation(conversation_id, patch).await?;

    if after.status != before.status {
        match after.status {
            ConversationStatus::Resolved => {
                let details = format!(
                    "Conversation {} resolved by {}",
                    after.protocol_number, actor.name
                );
                record_agent_activity(
                    store,
                    &after,
                    &actor.id,
                    AgentAction::ConversationResolved,
                    details.clone(),
                )
                .await;
                record_protocol_event(
                    store,
                    &after,
                    ProtocolEvent::Resolved,
                    details,
                    Some(actor.id.clone()),
                )
                .await;
            }
            ConversationStatus::Closed => {
                record_protocol_event(
                    store,
                    &after,
                    ProtocolEvent::Closed,
                    format!("Conversation {} closed by {}", after.protocol_number, actor.name),
                    Some(actor.id.clone()),
                )
                .await;
            }
            _ => {}
        }
    }

    if patch.assigned_agent_id.is_some() && after.assigned_agent_id != before.assigned_agent_id {
        let (agent_id, details) = match &target {
            Some(agent) => (
                agent.id.clone(),
                format!("Assigned to {} by {}", agent.name, actor.name),
            ),
            None => (actor.id.clone(), format!("Unassigned by {}", actor.name)),
        };
        record_agent_activity(
            store,
            &after,
            &agent_id,
            AgentAction::ConversationAssigned,
            details,
        )
        .await;
    }

    Ok(after)
}

/// Loads a conversation, hiding other tenants' rows behind a 404.
pub async fn scoped_conversation(
    store: &dyn Store,
    organization_id: &str,
    conversation_id: &str,
) -> Result<Conversation, ApiError> {
    store
        .conversation(conversation_id)
        .await?
        .filter(|c| c.organization_id == organization_id)
        .ok_or_else(|| ApiError::NotFound("conversation not found".into()))
}

/// Appends a protocol log row. Failures are logged and swallowed.
pub async fn record_protocol_event(
    store: &dyn Store,
    conversation: &Conversation,
    event: ProtocolEvent,
    details: String,
    agent_id: Option<String>,
) {
    let entry = ProtocolLogEntry {
        id: new_id(),
        organization_id: conversation.organization_id.clone(),
        conversation_id: conversation.id.clone(),
        protocol_number: conversation.protocol_number.clone(),
        event,
        details,
        agent_id,
        created_at: now_iso(),
    };
    if let Err(err) = store.append_protocol_log(entry).await {
        warn!(conversation_id = %conversation.id, event = %event, error = %err, "protocol log write failed");
    }
}

/// Appends an agent activity row. Failures are logged and swallowed.
pub async fn record_agent_activity(
    store: &dyn Store,
    conversation: &Conversation,
    agent_id: &str,
    action: AgentAction,
    details: String,
) {
    let entry = AgentActivity {
        id: new_id(),
        organization_id: conversation.organization_id.clone(),
        agent_id: agent_id.to_string(),
        conversation_id: Some(conversation.id.clone()),
        action,
        details,
        created_at: now_iso(),
    };
    if let Err(err) = store.append_agent_activity(entry).await {
        warn!(conversation_id = %conversation.id, action = %action, error = %err, "agent activity write failed");
    }
}
