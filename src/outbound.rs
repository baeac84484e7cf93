use serde::Deserialize;
use tracing::{info, warn};

use crate::content::truncate_preview;
use crate::conversations::scoped_conversation;
use crate::error::{ApiError, ProviderError, StoreError};
use crate::provider::{Credentials, MediaKind, OutboundMessage, Provider};
use crate::store::Store;
use crate::types::{
    now_iso, Agent, AgentRole, Conversation, ConversationActivity, Message, MessageStatus,
    MessageType, NewMessage, Organization, SenderType,
};

pub fn credentials(organization: &Organization) -> Credentials {
    Credentials {
        access_token: organization.access_token.clone(),
        phone_number_id: organization.phone_number_id.clone(),
    }
}

/// Body of `POST /api/conversations/{id}/messages`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SendRequest {
    Text {
        body: String,
    },
    Template {
        name: String,
        #[serde(default = "default_language")]
        language: String,
        #[serde(default)]
        params: Vec<String>,
    },
    Media {
        kind: MediaKind,
        link: String,
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        filename: Option<String>,
    },
}

fn default_language() -> String {
    "en_US".to_string()
}

impl SendRequest {
    pub fn into_outbound(self) -> Result<OutboundMessage, ApiError> {
        match self {
            SendRequest::Text { body } => {
                let body = body.trim().to_string();
                if body.is_empty() {
                    return Err(ApiError::BadRequest("message body is required".into()));
                }
                Ok(OutboundMessage::Text { body })
            }
            SendRequest::Template {
                name,
                language,
                params,
            } => {
                if name.trim().is_empty() {
                    return Err(ApiError::BadRequest("template name is required".into()));
                }
                Ok(OutboundMessage::Template {
                    name: name.trim().to_string(),
                    language,
                    params,
                })
            }
            SendRequest::Media {
                kind,
                link,
                caption,
                filename,
            } => {
                if link.trim().is_empty() {
                    return Err(ApiError::BadRequest("media link is required".into()));
                }
                Ok(OutboundMessage::Media {
                    kind,
                    link: link.trim().to_string(),
                    caption,
                    filename,
                })
            }
        }
    }
}

struct StoredShape {
    message_type: MessageType,
    content: Option<String>,
    media_url: Option<String>,
    media_filename: Option<String>,
}

fn stored_shape(message: &OutboundMessage) -> StoredShape {
    match message {
        OutboundMessage::Text { body } => StoredShape {
            message_type: MessageType::Text,
            content: Some(body.clone()),
            media_url: None,
            media_filename: None,
        },
        OutboundMessage::Template { name, .. } => StoredShape {
            message_type: MessageType::Template,
            content: Some(name.clone()),
            media_url: None,
            media_filename: None,
        },
        OutboundMessage::Media {
            kind,
            link,
            caption,
            filename,
        } => StoredShape {
            message_type: match kind {
                MediaKind::Image => MessageType::Image,
                MediaKind::Audio => MessageType::Audio,
                MediaKind::Video => MessageType::Video,
                MediaKind::Document => MessageType::Document,
                MediaKind::Sticker => MessageType::Sticker,
            },
            content: caption.clone(),
            media_url: Some(link.clone()),
            media_filename: filename.clone(),
        },
    }
}

fn preview_for(message: &OutboundMessage) -> String {
    match message {
        OutboundMessage::Text { body } => truncate_preview(body),
        OutboundMessage::Template { name, .. } => format!("Template: {name}"),
        OutboundMessage::Media { kind, caption, .. } => caption
            .as_deref()
            .map(truncate_preview)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| format!("Sent {}", kind.as_str())),
    }
}

/// Who an outbound message is attributed to.
#[derive(Debug, Clone)]
pub enum Author {
    Agent(String),
    System,
}

impl Author {
    fn sender_type(&self) -> SenderType {
        match self {
            Author::Agent(_) => SenderType::Agent,
            Author::System => SenderType::System,
        }
    }

    fn agent_id(&self) -> Option<String> {
        match self {
            Author::Agent(id) => Some(id.clone()),
            Author::System => None,
        }
    }
}

/// Outcome of one outbound send. The message row exists either way.
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    pub error: Option<ProviderError>,
}

/// Sends `message` to `to` and persists it with the send outcome: `sent` with
/// the provider id, or `failed` with the provider's error. A successful send
/// also becomes the conversation's preview; it never counts as unread.
pub async fn deliver(
    store: &dyn Store,
    provider: &dyn Provider,
    organization: &Organization,
    conversation: &Conversation,
    to: &str,
    author: Author,
    message: &OutboundMessage,
) -> Result<Delivery, StoreError> {
    let sender_type = author.sender_type();
    let outcome = provider.send(&credentials(organization), to, message).await;
    let (status, provider_message_id, error_message) = match &outcome {
        Ok(id) => (MessageStatus::Sent, Some(id.clone()), None),
        Err(err) => {
            warn!(
                conversation_id = %conversation.id,
                sender = %sender_type,
                error = %err,
                "outbound send failed"
            );
            (MessageStatus::Failed, None, Some(err.to_string()))
        }
    };

    let shape = stored_shape(message);
    let record = store
        .insert_message(NewMessage {
            conversation_id: conversation.id.clone(),
            organization_id: conversation.organization_id.clone(),
            sender_type,
            sender_agent_id: author.agent_id(),
            message_type: shape.message_type,
            content: shape.content,
            media_url: shape.media_url,
            media_mime_type: None,
            media_filename: shape.media_filename,
            whatsapp_message_id: provider_message_id,
            status,
            error_message,
        })
        .await?;

    if outcome.is_ok() {
        info!(
            conversation_id = %conversation.id,
            provider_message_id = record.whatsapp_message_id.as_deref().unwrap_or(""),
            sender = %sender_type,
            "outbound message sent"
        );
        store
            .record_conversation_activity(
                &conversation.id,
                &ConversationActivity {
                    last_message_at: now_iso(),
                    last_message_preview: preview_for(message),
                    increment_unread: false,
                },
            )
            .await?;
    }

    Ok(Delivery {
        message: record,
        error: outcome.err(),
    })
}

/// Agent-facing send. A provider rejection still stores the message as
/// `failed` and answers 502 with that record attached.
pub async fn send_as_agent(
    store: &dyn Store,
    provider: &dyn Provider,
    actor: &Agent,
    conversation_id: &str,
    request: SendRequest,
) -> Result<Message, ApiError> {
    if actor.role == AgentRole::Viewer {
        return Err(ApiError::Forbidden("viewers cannot send messages".into()));
    }
    let conversation = scoped_conversation(store, &actor.organization_id, conversation_id).await?;
    let message = request.into_outbound()?;
    let organization = store
        .organization(&conversation.organization_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("organization not found".into()))?;
    let contact = store
        .contact(&conversation.contact_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("contact not found".into()))?;

    let delivery = deliver(
        store,
        provider,
        &organization,
        &conversation,
        &contact.phone,
        Author::Agent(actor.id.clone()),
        &message,
    )
    .await?;

    match delivery.error {
        None => Ok(delivery.message),
        Some(err) => Err(ApiError::Upstream {
            message: err.to_string(),
            record: serde_json::to_value(&delivery.message).ok(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts;
    use crate::conversations;
    use crate::test_support::{agent, organization, Harness};
    use crate::types::AgentStatus;

    async fn open_thread(h: &Harness) -> Conversation {
        let org = organization("org-1", "PN1");
        let contact = contacts::resolve(h.store.as_ref(), "org-1", "5511999990000", None, None)
            .await
            .unwrap();
        conversations::resolve(h.store.as_ref(), &org, &contact.id)
            .await
            .unwrap()
            .conversation
    }

    #[test]
    fn send_request_is_tagged() {
        let request: SendRequest =
            serde_json::from_str(r#"{"type":"template","name":"order_update","params":["42"]}"#)
                .unwrap();
        let outbound = request.into_outbound().unwrap();
        assert_eq!(
            outbound,
            OutboundMessage::Template {
                name: "order_update".into(),
                language: "en_US".into(),
                params: vec!["42".into()],
            }
        );

        let blank: SendRequest = serde_json::from_str(r#"{"type":"text","body":"  "}"#).unwrap();
        assert!(matches!(blank.into_outbound(), Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn agent_send_persists_and_updates_preview() {
        let h = Harness::new(organization("org-1", "PN1")).await;
        let ana = agent("a1", "org-1", AgentStatus::Online);
        let conv = open_thread(&h).await;

        let message = send_as_agent(
            h.store.as_ref(),
            h.provider.as_ref(),
            &ana,
            &conv.id,
            SendRequest::Text {
                body: "On my way".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.sender_type, SenderType::Agent);
        assert_eq!(message.whatsapp_message_id.as_deref(), Some("wamid.out.1"));
        assert_eq!(h.provider.sent()[0].to, "5511999990000");

        let stored = h.store.conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(stored.last_message_preview.as_deref(), Some("On my way"));
        assert_eq!(stored.unread_count, 0);
    }

    #[tokio::test]
    async fn provider_rejection_keeps_a_failed_record() {
        let h = Harness::new(organization("org-1", "PN1")).await;
        h.provider.fail_sends_with(r#"{"error":{"code":131047}}"#);
        let ana = agent("a1", "org-1", AgentStatus::Online);
        let conv = open_thread(&h).await;

        let err = send_as_agent(
            h.store.as_ref(),
            h.provider.as_ref(),
            &ana,
            &conv.id,
            SendRequest::Text { body: "Hi".into() },
        )
        .await
        .unwrap_err();
        let ApiError::Upstream { message, record } = err else {
            panic!("expected upstream error");
        };
        assert!(message.contains("131047"));
        let record = record.unwrap();
        assert_eq!(record["status"], "failed");
        assert!(record["errorMessage"].as_str().unwrap().contains("131047"));

        let stored = h.store.conversation_messages(&conv.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, MessageStatus::Failed);
        let conv = h.store.conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(conv.last_message_preview, None);
    }

    #[tokio::test]
    async fn send_is_tenant_scoped() {
        let h = Harness::new(organization("org-1", "PN1")).await;
        let outsider = agent("x1", "org-2", AgentStatus::Online);
        let conv = open_thread(&h).await;
        let err = send_as_agent(
            h.store.as_ref(),
            h.provider.as_ref(),
            &outsider,
            &conv.id,
            SendRequest::Text { body: "Hi".into() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert!(h.provider.sent().is_empty());
    }
}
