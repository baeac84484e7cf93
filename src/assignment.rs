use std::cmp::Ordering;

use tracing::{debug, info};

use crate::conversations::{record_agent_activity, record_protocol_event};
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{
    Agent, AgentAction, AgentLoad, AgentStatus, AssignAttempt, Conversation, ConversationStatus,
    ProtocolEvent, Queue,
};

/// Orders routable agents: online before away, then fewest open/waiting
/// conversations, then agent id. Agents at capacity are dropped.
pub fn rank_candidates(mut candidates: Vec<AgentLoad>) -> Vec<AgentLoad> {
    candidates.retain(|c| {
        c.agent.status.accepts_assignments()
            && c.agent.role.handles_conversations()
            && c.open_count < i64::from(c.agent.max_concurrent_chats)
    });
    candidates.sort_by(compare_candidates);
    candidates
}

fn compare_candidates(a: &AgentLoad, b: &AgentLoad) -> Ordering {
    let away = |load: &AgentLoad| load.agent.status != AgentStatus::Online;
    away(a)
        .cmp(&away(b))
        .then(a.open_count.cmp(&b.open_count))
        .then_with(|| a.agent.id.cmp(&b.agent.id))
}

/// Whether ingestion should try to route this conversation to a human.
pub fn needs_assignment(conversation: &Conversation) -> bool {
    !conversation.is_bot_active
        && conversation.status == ConversationStatus::Pending
        && conversation.assigned_agent_id.is_none()
}

/// Assigns the best available agent. Returns `None` when nobody could take
/// the conversation or it was already routed; it then stays `pending`.
///
/// Candidate counts are only a hint for ordering. Each attempt re-checks the
/// agent's capacity inside the store, so racing deliveries cannot push an
/// agent past `max_concurrent_chats`.
pub async fn assign(
    store: &dyn Store,
    conversation: &Conversation,
) -> Result<Option<Agent>, StoreError> {
    if !needs_assignment(conversation) {
        return Ok(None);
    }
    let queue = conversation.queue.filter(|q| *q != Queue::Both);
    let candidates = store
        .assignment_candidates(&conversation.organization_id, queue)
        .await?;

    for candidate in rank_candidates(candidates) {
        match store.try_assign(&conversation.id, &candidate.agent.id).await? {
            AssignAttempt::Assigned => {
                let agent = candidate.agent;
                info!(
                    conversation_id = %conversation.id,
                    agent_id = %agent.id,
                    open_count = candidate.open_count,
                    "conversation assigned"
                );
                let mut assigned = conversation.clone();
                assigned.assigned_agent_id = Some(agent.id.clone());
                assigned.status = ConversationStatus::Open;
                record_protocol_event(
                    store,
                    &assigned,
                    ProtocolEvent::AgentAssigned,
                    format!("Automatically assigned to {}", agent.name),
                    Some(agent.id.clone()),
                )
                .await;
                record_agent_activity(
                    store,
                    &assigned,
                    &agent.id,
                    AgentAction::ConversationAssigned,
                    format!("Auto-assigned conversation {}", assigned.protocol_number),
                )
                .await;
                return Ok(Some(agent));
            }
            AssignAttempt::AgentAtCapacity | AssignAttempt::AgentUnavailable => {
                debug!(
                    conversation_id = %conversation.id,
                    agent_id = %candidate.agent.id,
                    "candidate no longer eligible, trying next"
                );
            }
            AssignAttempt::AlreadyHandled => {
                debug!(conversation_id = %conversation.id, "conversation already routed");
                return Ok(None);
            }
        }
    }

    info!(conversation_id = %conversation.id, "no agent available, conversation stays pending");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{agent, organization};
    use crate::types::{AgentRole, NewConversation};

    fn load(id: &str, status: AgentStatus, open_count: i64) -> AgentLoad {
        AgentLoad {
            agent: agent(id, "org-1", status),
            open_count,
        }
    }

    async fn pending(store: &MemoryStore, contact_id: &str) -> Conversation {
        store
            .create_conversation(NewConversation {
                organization_id: "org-1".into(),
                contact_id: contact_id.into(),
                protocol_day: "20261019".into(),
                sla_due_at: None,
            })
            .await
            .unwrap()
    }

    #[test]
    fn online_agent_beats_freer_away_agent() {
        let mut online = load("online", AgentStatus::Online, 5);
        online.agent.max_concurrent_chats = 10;
        let ranked = rank_candidates(vec![load("away", AgentStatus::Away, 2), online]);
        assert_eq!(ranked[0].agent.id, "online");
        assert_eq!(ranked[1].agent.id, "away");
    }

    #[test]
    fn agents_at_capacity_are_not_routable() {
        let ranked = rank_candidates(vec![
            load("full", AgentStatus::Online, 5),
            load("away", AgentStatus::Away, 4),
        ]);
        let order = ranked.iter().map(|c| c.agent.id.as_str()).collect::<Vec<_>>();
        assert_eq!(order, ["away"]);
    }

    #[test]
    fn ties_break_on_load_then_agent_id() {
        let ranked = rank_candidates(vec![
            load("c", AgentStatus::Online, 1),
            load("b", AgentStatus::Online, 0),
            load("a", AgentStatus::Online, 1),
        ]);
        let order = ranked.iter().map(|c| c.agent.id.as_str()).collect::<Vec<_>>();
        assert_eq!(order, ["b", "a", "c"]);
    }

    #[test]
    fn ineligible_candidates_are_dropped() {
        let mut viewer = load("v", AgentStatus::Online, 0);
        viewer.agent.role = AgentRole::Viewer;
        let ranked = rank_candidates(vec![
            viewer,
            load("busy", AgentStatus::Busy, 0),
            load("off", AgentStatus::Offline, 0),
        ]);
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn assigns_and_audits() {
        let store = MemoryStore::new();
        store.put_organization(organization("org-1", "PN1")).await;
        store.put_agent(agent("a1", "org-1", AgentStatus::Online)).await;
        let conv = pending(&store, "c1").await;

        let chosen = assign(&store, &conv).await.unwrap().unwrap();
        assert_eq!(chosen.id, "a1");
        let stored = store.conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConversationStatus::Open);
        assert_eq!(stored.assigned_agent_id.as_deref(), Some("a1"));

        let logs = store.protocol_logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event, ProtocolEvent::AgentAssigned);
        assert_eq!(store.agent_activity().await[0].agent_id, "a1");

        assert!(assign(&store, &stored).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_restricts_candidates() {
        let store = MemoryStore::new();
        let mut sales = agent("sales", "org-1", AgentStatus::Online);
        sales.queue = Queue::Sales;
        let mut support = agent("support", "org-1", AgentStatus::Online);
        support.queue = Queue::Support;
        store.put_agent(sales).await;
        store.put_agent(support).await;

        let mut conv = pending(&store, "c1").await;
        conv.queue = Some(Queue::Support);
        let chosen = assign(&store, &conv).await.unwrap().unwrap();
        assert_eq!(chosen.id, "support");
    }

    #[tokio::test]
    async fn bot_active_or_routed_conversations_are_skipped() {
        let store = MemoryStore::new();
        store.put_agent(agent("a1", "org-1", AgentStatus::Online)).await;
        let mut conv = pending(&store, "c1").await;
        conv.is_bot_active = true;
        assert!(assign(&store, &conv).await.unwrap().is_none());
        let stored = store.conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConversationStatus::Pending);
    }

    #[tokio::test]
    async fn no_candidates_leaves_conversation_pending() {
        let store = MemoryStore::new();
        store.put_agent(agent("a1", "org-1", AgentStatus::Offline)).await;
        let conv = pending(&store, "c1").await;
        assert!(assign(&store, &conv).await.unwrap().is_none());
        let stored = store.conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConversationStatus::Pending);
        assert!(store.protocol_logs().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_assignments_respect_capacity() {
        let store = Arc::new(MemoryStore::new());
        let mut ana = agent("a1", "org-1", AgentStatus::Online);
        ana.max_concurrent_chats = 2;
        store.put_agent(ana).await;

        let mut conversations = Vec::new();
        for i in 0..10 {
            conversations.push(pending(&store, &format!("c{i}")).await);
        }
        let handles = conversations
            .into_iter()
            .map(|conv| {
                let store = store.clone();
                tokio::spawn(async move { assign(store.as_ref(), &conv).await })
            })
            .collect::<Vec<_>>();
        let assigned = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .filter(|joined| joined.as_ref().unwrap().as_ref().unwrap().is_some())
            .count();
        assert_eq!(assigned, 2);
        let open = store
            .conversations()
            .await
            .into_iter()
            .filter(|c| c.assigned_agent_id.as_deref() == Some("a1"))
            .count();
        assert_eq!(open, 2);
    }
}
