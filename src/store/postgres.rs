use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};

use super::{capacity_claim, Store};
use crate::error::StoreError;
use crate::types::{
    format_protocol_number, new_id, now_iso, Agent, AgentActivity, AgentLoad, AgentRole,
    AgentStatus, AssignAttempt, Contact, Conversation, ConversationActivity, ConversationPatch,
    ConversationStatus, Message, MessageStatus, MessageType, NewContact, NewConversation,
    NewMessage, Organization, ProtocolLogEntry, Queue, SenderType,
};

const ORGANIZATION_COLUMNS: &str = "id, name, phone_number_id, access_token, auto_reply_message, \
     sla_minutes, utc_offset_minutes, mark_messages_read, created_at, updated_at";

const AGENT_COLUMNS: &str = "a.id, a.organization_id, a.name, a.email, a.role, a.status, a.queue, \
     a.max_concurrent_chats, a.created_at, a.updated_at";

const CONTACT_COLUMNS: &str =
    "id, organization_id, phone, name, avatar_url, custom_fields, tags, created_at, updated_at";

const CONVERSATION_COLUMNS: &str = "id, organization_id, contact_id, assigned_agent_id, status, \
     protocol_number, queue, classification, tags, is_bot_active, unread_count, last_message_at, \
     last_message_preview, sla_due_at, resolved_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, organization_id, sender_type, sender_agent_id, \
     message_type, content, media_url, media_mime_type, media_filename, whatsapp_message_id, \
     status, error_message, created_at, updated_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn text_enum<T>(row: &PgRow, column: &str, parse: fn(&str) -> Option<T>) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    parse(&raw).ok_or_else(|| StoreError::Decode(format!("{column} '{raw}'")))
}

/// Locks the agent row for the rest of the transaction. Every capacity
/// check takes this lock before touching conversation rows.
async fn lock_agent(
    tx: &mut Transaction<'_, Postgres>,
    agent_id: &str,
) -> Result<Option<Agent>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents a WHERE a.id = $1 FOR UPDATE"
    ))
    .bind(agent_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(parse_agent_row).transpose()
}

/// Live conversations held by the agent, leaving out `except_id`.
async fn held_count(
    tx: &mut Transaction<'_, Postgres>,
    agent_id: &str,
    except_id: Option<&str>,
) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM conversations \
         WHERE assigned_agent_id = $1 AND status = ANY($2::text[]) \
           AND ($3::text IS NULL OR id <> $3)",
    )
    .bind(agent_id)
    .bind(status_list(&ConversationStatus::ACTIVE))
    .bind(except_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(count)
}

fn json_list(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

fn status_list(statuses: &[ConversationStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn parse_organization_row(row: &PgRow) -> Result<Organization, StoreError> {
    Ok(Organization {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        phone_number_id: row.try_get("phone_number_id")?,
        access_token: row.try_get("access_token")?,
        auto_reply_message: row.try_get("auto_reply_message")?,
        sla_minutes: row.try_get("sla_minutes")?,
        utc_offset_minutes: row.try_get("utc_offset_minutes")?,
        mark_messages_read: row.try_get("mark_messages_read")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_agent_row(row: &PgRow) -> Result<Agent, StoreError> {
    Ok(Agent {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        role: text_enum(row, "role", AgentRole::parse)?,
        status: text_enum(row, "status", AgentStatus::parse)?,
        queue: text_enum(row, "queue", Queue::parse)?,
        max_concurrent_chats: row.try_get("max_concurrent_chats")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_contact_row(row: &PgRow) -> Result<Contact, StoreError> {
    let custom_fields: String = row.try_get("custom_fields")?;
    let tags: String = row.try_get("tags")?;
    Ok(Contact {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        phone: row.try_get("phone")?,
        name: row.try_get("name")?,
        avatar_url: row.try_get("avatar_url")?,
        custom_fields: serde_json::from_str::<Value>(&custom_fields)
            .unwrap_or_else(|_| Value::Object(Default::default())),
        tags: json_list(&tags),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_conversation_row(row: &PgRow) -> Result<Conversation, StoreError> {
    let queue: Option<String> = row.try_get("queue")?;
    let tags: String = row.try_get("tags")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        contact_id: row.try_get("contact_id")?,
        assigned_agent_id: row.try_get("assigned_agent_id")?,
        status: text_enum(row, "status", ConversationStatus::parse)?,
        protocol_number: row.try_get("protocol_number")?,
        queue: queue.as_deref().and_then(Queue::parse),
        classification: row.try_get("classification")?,
        tags: json_list(&tags),
        is_bot_active: row.try_get("is_bot_active")?,
        unread_count: row.try_get("unread_count")?,
        last_message_at: row.try_get("last_message_at")?,
        last_message_preview: row.try_get("last_message_preview")?,
        sla_due_at: row.try_get("sla_due_at")?,
        resolved_at: row.try_get("resolved_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_message_row(row: &PgRow) -> Result<Message, StoreError> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        organization_id: row.try_get("organization_id")?,
        sender_type: text_enum(row, "sender_type", SenderType::parse)?,
        sender_agent_id: row.try_get("sender_agent_id")?,
        message_type: text_enum(row, "message_type", MessageType::parse)?,
        content: row.try_get("content")?,
        media_url: row.try_get("media_url")?,
        media_mime_type: row.try_get("media_mime_type")?,
        media_filename: row.try_get("media_filename")?,
        whatsapp_message_id: row.try_get("whatsapp_message_id")?,
        status: text_enum(row, "status", MessageStatus::parse)?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn organization_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<Organization>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE phone_number_id = $1"
        ))
        .bind(phone_number_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_organization_row).transpose()
    }

    async fn organization(&self, id: &str) -> Result<Option<Organization>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_organization_row).transpose()
    }

    async fn agent_for_token(&self, token: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM auth_tokens t JOIN agents a ON a.id = t.agent_id \
             WHERE t.token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_agent_row).transpose()
    }

    async fn agent(&self, organization_id: &str, id: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents a WHERE a.id = $1 AND a.organization_id = $2"
        ))
        .bind(id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_agent_row).transpose()
    }

    async fn find_contact(
        &self,
        organization_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE organization_id = $1 AND phone = $2"
        ))
        .bind(organization_id)
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_contact_row).transpose()
    }

    async fn contact(&self, id: &str) -> Result<Option<Contact>, StoreError> {
        let row = sqlx::query(&format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_contact_row).transpose()
    }

    async fn insert_contact(&self, contact: NewContact) -> Result<Contact, StoreError> {
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
        sqlx::query(
            "INSERT INTO contacts \
             (id, organization_id, phone, name, avatar_url, custom_fields, tags, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,'{}','[]',$6,$7)",
        )
        .bind(&created.id)
        .bind(&created.organization_id)
        .bind(&created.phone)
        .bind(&created.name)
        .bind(&created.avatar_url)
        .bind(&created.created_at)
        .bind(&created.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(created)
    }

    async fn update_contact_profile(
        &self,
        id: &str,
        name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Contact, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE contacts SET name = COALESCE($1, name), avatar_url = COALESCE($2, avatar_url), \
             updated_at = $3 WHERE id = $4 RETURNING {CONTACT_COLUMNS}"
        ))
        .bind(name)
        .bind(avatar_url)
        .bind(now_iso())
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        parse_contact_row(&row)
    }

    async fn active_conversation(
        &self,
        organization_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE organization_id = $1 AND contact_id = $2 AND status = ANY($3::text[]) \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(organization_id)
        .bind(contact_id)
        .bind(status_list(&ConversationStatus::ACTIVE))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_conversation_row).transpose()
    }

    async fn create_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sequence: i64 = sqlx::query_scalar(
            "INSERT INTO protocol_sequences (day, last_value) VALUES ($1, 1) \
             ON CONFLICT (day) DO UPDATE SET last_value = protocol_sequences.last_value + 1 \
             RETURNING last_value",
        )
        .bind(&conversation.protocol_day)
        .fetch_one(&mut *tx)
        .await?;

        let now = now_iso();
        let created = Conversation {
            id: new_id(),
            organization_id: conversation.organization_id,
            contact_id: conversation.contact_id,
            assigned_agent_id: None,
            status: ConversationStatus::Pending,
            protocol_number: format_protocol_number(&conversation.protocol_day, sequence),
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
        sqlx::query(
            "INSERT INTO conversations \
             (id, organization_id, contact_id, status, protocol_number, tags, is_bot_active, \
              unread_count, sla_due_at, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,'[]',false,0,$6,$7,$8)",
        )
        .bind(&created.id)
        .bind(&created.organization_id)
        .bind(&created.contact_id)
        .bind(created.status.as_str())
        .bind(&created.protocol_number)
        .bind(&created.sla_due_at)
        .bind(&created.created_at)
        .bind(&created.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_conversation_row).transpose()
    }

    async fn record_conversation_activity(
        &self,
        conversation_id: &str,
        activity: &ConversationActivity,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE conversations SET last_message_at = $1, last_message_preview = $2, \
             unread_count = unread_count + $3, updated_at = $4 WHERE id = $5",
        )
        .bind(&activity.last_message_at)
        .bind(&activity.last_message_preview)
        .bind(if activity.increment_unread { 1i32 } else { 0i32 })
        .bind(now_iso())
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_conversation(
        &self,
        id: &str,
        patch: &ConversationPatch,
    ) -> Result<(Conversation, Conversation), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut locked_agent = match &patch.assigned_agent_id {
            Some(Some(agent_id)) => lock_agent(&mut tx, agent_id).await?,
            _ => None,
        };
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;
        let before = parse_conversation_row(&row)?;
        let mut after = before.clone();
        patch.apply_to(&mut after, &now_iso());

        if let Some(agent_id) = capacity_claim(&before, &after) {
            // A reopen keeps the current agent, which was not known before the read.
            if locked_agent.as_ref().map(|a| a.id.as_str()) != Some(agent_id) {
                locked_agent = lock_agent(&mut tx, agent_id).await?;
            }
            let agent = locked_agent.as_ref().ok_or(StoreError::NotFound)?;
            let held = held_count(&mut tx, agent_id, Some(id)).await?;
            if held >= i64::from(agent.max_concurrent_chats) {
                return Err(StoreError::AgentAtCapacity(agent_id.to_string()));
            }
        }

        sqlx::query(
            "UPDATE conversations SET status = $1, assigned_agent_id = $2, tags = $3, \
             classification = $4, queue = $5, is_bot_active = $6, resolved_at = $7, updated_at = $8 \
             WHERE id = $9",
        )
        .bind(after.status.as_str())
        .bind(&after.assigned_agent_id)
        .bind(serde_json::to_string(&after.tags).unwrap_or_else(|_| "[]".to_string()))
        .bind(&after.classification)
        .bind(after.queue.map(Queue::as_str))
        .bind(after.is_bot_active)
        .bind(&after.resolved_at)
        .bind(&after.updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((before, after))
    }

    async fn message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE whatsapp_message_id = $1"
        ))
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_message_row).transpose()
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let created = message.into_message(new_id(), now_iso());
        sqlx::query(&format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)"
        ))
        .bind(&created.id)
        .bind(&created.conversation_id)
        .bind(&created.organization_id)
        .bind(created.sender_type.as_str())
        .bind(&created.sender_agent_id)
        .bind(created.message_type.as_str())
        .bind(&created.content)
        .bind(&created.media_url)
        .bind(&created.media_mime_type)
        .bind(&created.media_filename)
        .bind(&created.whatsapp_message_id)
        .bind(created.status.as_str())
        .bind(&created.error_message)
        .bind(&created.created_at)
        .bind(&created.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(created)
    }

    async fn conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY created_at ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_message_row).collect()
    }

    async fn apply_delivery_status(
        &self,
        provider_message_id: &str,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<u64, StoreError> {
        let replaceable = status
            .replaceable()
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect::<Vec<_>>();
        let result = sqlx::query(
            "UPDATE messages SET status = $1, error_message = COALESCE($2, error_message), \
             updated_at = $3 WHERE whatsapp_message_id = $4 AND status = ANY($5::text[])",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(now_iso())
        .bind(provider_message_id)
        .bind(&replaceable)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn assignment_candidates(
        &self,
        organization_id: &str,
        queue: Option<Queue>,
    ) -> Result<Vec<AgentLoad>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS}, \
                    (SELECT COUNT(1) FROM conversations c \
                      WHERE c.assigned_agent_id = a.id AND c.status = ANY($2::text[])) AS open_count \
             FROM agents a \
             WHERE a.organization_id = $1 \
               AND a.status IN ('online', 'away') \
               AND a.role IN ('owner', 'admin', 'agent') \
               AND ($3::text IS NULL OR a.queue = $3 OR a.queue = 'both')"
        ))
        .bind(organization_id)
        .bind(status_list(&ConversationStatus::ACTIVE))
        .bind(queue.map(Queue::as_str))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<AgentLoad, StoreError> {
                Ok(AgentLoad {
                    agent: parse_agent_row(row)?,
                    open_count: row.try_get("open_count")?,
                })
            })
            .collect()
    }

    async fn try_assign(
        &self,
        conversation_id: &str,
        agent_id: &str,
    ) -> Result<AssignAttempt, StoreError> {
        let mut tx = self.pool.begin().await?;
        // The agent row lock serializes every count-then-assign for this agent.
        let Some(agent) = lock_agent(&mut tx, agent_id).await? else {
            return Ok(AssignAttempt::AgentUnavailable);
        };
        if !agent.status.accepts_assignments() || !agent.role.handles_conversations() {
            return Ok(AssignAttempt::AgentUnavailable);
        }

        if held_count(&mut tx, agent_id, None).await? >= i64::from(agent.max_concurrent_chats) {
            return Ok(AssignAttempt::AgentAtCapacity);
        }

        let updated = sqlx::query(
            "UPDATE conversations SET assigned_agent_id = $1, status = 'open', updated_at = $2 \
             WHERE id = $3 AND organization_id = $4 AND status = 'pending' \
               AND assigned_agent_id IS NULL",
        )
        .bind(agent_id)
        .bind(now_iso())
        .bind(conversation_id)
        .bind(&agent.organization_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Ok(AssignAttempt::AlreadyHandled);
        }
        tx.commit().await?;
        Ok(AssignAttempt::Assigned)
    }

    async fn append_protocol_log(&self, entry: ProtocolLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO protocol_logs \
             (id, organization_id, conversation_id, protocol_number, event, details, agent_id, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(&entry.id)
        .bind(&entry.organization_id)
        .bind(&entry.conversation_id)
        .bind(&entry.protocol_number)
        .bind(entry.event.as_str())
        .bind(&entry.details)
        .bind(&entry.agent_id)
        .bind(&entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_agent_activity(&self, entry: AgentActivity) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agent_activity_logs \
             (id, organization_id, agent_id, conversation_id, action, details, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(&entry.id)
        .bind(&entry.organization_id)
        .bind(&entry.agent_id)
        .bind(&entry.conversation_id)
        .bind(entry.action.as_str())
        .bind(&entry.details)
        .bind(&entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_auto_reply(&self, conversation_id: &str) -> Result<bool, StoreError> {
        let claimed = sqlx::query(
            "UPDATE conversations SET auto_reply_sent_at = $1 \
             WHERE id = $2 AND auto_reply_sent_at IS NULL",
        )
        .bind(now_iso())
        .bind(conversation_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(claimed == 1)
    }
}

/// These run against a real database: `DATABASE_URL=postgres://... cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sqlx::postgres::PgPoolOptions;

    use super::*;

    async fn connect() -> (Arc<PgStore>, PgPool) {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(&url)
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        (Arc::new(PgStore::new(pool.clone())), pool)
    }

    /// A fresh organization plus a protocol day no other test run shares.
    async fn tenant(pool: &PgPool) -> (String, String) {
        let org = new_id();
        sqlx::query(
            "INSERT INTO organizations (id, name, phone_number_id, created_at, updated_at) \
             VALUES ($1, 'Acme', $2, $3, $3)",
        )
        .bind(&org)
        .bind(format!("PN-{org}"))
        .bind(now_iso())
        .execute(pool)
        .await
        .unwrap();
        let day = format!("t{}", org.replace('-', ""));
        (org, day)
    }

    async fn online_agent(pool: &PgPool, org: &str, max_concurrent_chats: i32) -> String {
        let id = new_id();
        sqlx::query(
            "INSERT INTO agents \
             (id, organization_id, name, role, status, queue, max_concurrent_chats, created_at, updated_at) \
             VALUES ($1, $2, 'Ana', 'agent', 'online', 'both', $3, $4, $4)",
        )
        .bind(&id)
        .bind(org)
        .bind(max_concurrent_chats)
        .bind(now_iso())
        .execute(pool)
        .await
        .unwrap();
        id
    }

    async fn contact(store: &PgStore, org: &str, phone: &str) -> Contact {
        store
            .insert_contact(NewContact {
                organization_id: org.to_string(),
                phone: phone.to_string(),
                name: None,
                avatar_url: None,
            })
            .await
            .unwrap()
    }

    async fn conversation(store: &PgStore, org: &str, day: &str, contact_id: &str) -> Conversation {
        store
            .create_conversation(NewConversation {
                organization_id: org.to_string(),
                contact_id: contact_id.to_string(),
                protocol_day: day.to_string(),
                sla_due_at: None,
            })
            .await
            .unwrap()
    }

    fn inbound(conversation: &Conversation, provider_id: &str) -> NewMessage {
        NewMessage {
            conversation_id: conversation.id.clone(),
            organization_id: conversation.organization_id.clone(),
            sender_type: SenderType::Contact,
            sender_agent_id: None,
            message_type: MessageType::Text,
            content: Some("hi".into()),
            media_url: None,
            media_mime_type: None,
            media_filename: None,
            whatsapp_message_id: Some(provider_id.to_string()),
            status: MessageStatus::Delivered,
            error_message: None,
        }
    }

    #[tokio::test]
    #[ignore = "needs Postgres at DATABASE_URL"]
    async fn protocol_numbers_are_per_day_and_threads_one_per_contact() {
        let (store, pool) = connect().await;
        let (org, day) = tenant(&pool).await;
        let maria = contact(&store, &org, "5511900000001").await;
        let joao = contact(&store, &org, "5511900000002").await;

        let first = conversation(&store, &org, &day, &maria.id).await;
        assert_eq!(first.protocol_number, format!("{day}-00001"));

        let again = store
            .create_conversation(NewConversation {
                organization_id: org.clone(),
                contact_id: maria.id.clone(),
                protocol_day: day.clone(),
                sla_due_at: None,
            })
            .await
            .unwrap_err();
        assert!(
            matches!(again, StoreError::UniqueViolation(ref c) if c == "conversations_one_active_per_contact")
        );

        let second = conversation(&store, &org, &day, &joao.id).await;
        assert_eq!(second.protocol_number, format!("{day}-00002"));
        let found = store.active_conversation(&org, &maria.id).await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    #[ignore = "needs Postgres at DATABASE_URL"]
    async fn duplicate_phone_and_provider_id_are_rejected() {
        let (store, pool) = connect().await;
        let (org, day) = tenant(&pool).await;
        let maria = contact(&store, &org, "5511900000003").await;
        let err = store
            .insert_contact(NewContact {
                organization_id: org.clone(),
                phone: maria.phone.clone(),
                name: None,
                avatar_url: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(ref c) if c == "contacts_organization_phone_key"));

        let conv = conversation(&store, &org, &day, &maria.id).await;
        let provider_id = format!("wamid.{}", new_id());
        store.insert_message(inbound(&conv, &provider_id)).await.unwrap();
        let err = store.insert_message(inbound(&conv, &provider_id)).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(ref c) if c == "messages_whatsapp_message_id_key"));
        assert_eq!(store.conversation_messages(&conv.id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs Postgres at DATABASE_URL"]
    async fn concurrent_assignment_never_exceeds_capacity() {
        let (store, pool) = connect().await;
        let (org, day) = tenant(&pool).await;
        let agent_id = online_agent(&pool, &org, 2).await;
        let mut conversations = Vec::new();
        for n in 0..6 {
            let who = contact(&store, &org, &format!("55119100000{n:02}")).await;
            conversations.push(conversation(&store, &org, &day, &who.id).await);
        }

        let attempts = conversations
            .iter()
            .map(|conv| {
                let store = store.clone();
                let conversation_id = conv.id.clone();
                let agent_id = agent_id.clone();
                tokio::spawn(async move { store.try_assign(&conversation_id, &agent_id).await })
            })
            .collect::<Vec<_>>();
        let outcomes = futures_util::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect::<Vec<_>>();
        let assigned = outcomes.iter().filter(|o| **o == AssignAttempt::Assigned).count();
        assert_eq!(assigned, 2);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, AssignAttempt::Assigned | AssignAttempt::AgentAtCapacity)));

        let candidates = store.assignment_candidates(&org, None).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].open_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs Postgres at DATABASE_URL"]
    async fn concurrent_manual_handovers_respect_capacity() {
        let (store, pool) = connect().await;
        let (org, day) = tenant(&pool).await;
        let agent_id = online_agent(&pool, &org, 1).await;
        let mut conversations = Vec::new();
        for n in 0..4 {
            let who = contact(&store, &org, &format!("55119200000{n:02}")).await;
            conversations.push(conversation(&store, &org, &day, &who.id).await);
        }

        let handovers = conversations
            .iter()
            .map(|conv| {
                let store = store.clone();
                let conversation_id = conv.id.clone();
                let patch = ConversationPatch {
                    assigned_agent_id: Some(Some(agent_id.clone())),
                    ..Default::default()
                };
                tokio::spawn(async move { store.update_conversation(&conversation_id, &patch).await })
            })
            .collect::<Vec<_>>();
        let outcomes = futures_util::future::join_all(handovers)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .filter_map(|o| o.as_ref().err())
            .all(|e| matches!(e, StoreError::AgentAtCapacity(_))));
    }

    #[tokio::test]
    #[ignore = "needs Postgres at DATABASE_URL"]
    async fn delivery_status_moves_forward_and_greeting_is_claimed_once() {
        let (store, pool) = connect().await;
        let (org, day) = tenant(&pool).await;
        let maria = contact(&store, &org, "5511900000004").await;
        let conv = conversation(&store, &org, &day, &maria.id).await;
        let provider_id = format!("wamid.{}", new_id());
        let mut outbound = inbound(&conv, &provider_id);
        outbound.sender_type = SenderType::System;
        outbound.status = MessageStatus::Sent;
        store.insert_message(outbound).await.unwrap();

        assert_eq!(
            store.apply_delivery_status(&provider_id, MessageStatus::Read, None).await.unwrap(),
            1
        );
        assert_eq!(
            store.apply_delivery_status(&provider_id, MessageStatus::Delivered, None).await.unwrap(),
            0
        );
        let stored = store.message_by_provider_id(&provider_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);

        assert!(store.claim_auto_reply(&conv.id).await.unwrap());
        assert!(!store.claim_auto_reply(&conv.id).await.unwrap());
    }
}
