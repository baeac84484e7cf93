//! Inbound ingestion: turns one verified webhook payload into contacts,
//! conversations, messages, assignments and replies.
//!
//! Runs detached from the HTTP request, so nothing here returns an error to
//! a caller. Each step after the message row is written is isolated: its
//! failure is logged and the remaining steps still run.

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, error, info, warn};

use crate::assignment;
use crate::contacts;
use crate::content::{self, ExtractedContent};
use crate::conversations::{self, ResolvedConversation};
use crate::error::StoreError;
use crate::media::MediaFetcher;
use crate::outbound::{self, Author};
use crate::provider::{OutboundMessage, Provider};
use crate::status;
use crate::store::Store;
use crate::templating::{render_auto_reply, AutoReplyContext};
use crate::types::{
    Contact, ConversationActivity, MessageStatus, NewMessage, Organization, SenderType,
};
use crate::webhook::{
    normalize_phone, ChangeValue, InboundMessage, WebhookPayload, BUSINESS_ACCOUNT_OBJECT,
};

/// Tally of what one payload did, mostly for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub stored: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub skipped_changes: usize,
    pub statuses_applied: u64,
}

enum MessageOutcome {
    Stored,
    Duplicate,
    Rejected,
}

#[derive(Clone)]
pub struct Ingestion {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    media: MediaFetcher,
}

impl Ingestion {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn Provider>, media: MediaFetcher) -> Self {
        Self {
            store,
            provider,
            media,
        }
    }

    pub async fn process(&self, payload: WebhookPayload) -> IngestReport {
        let mut report = IngestReport::default();
        if !payload.object.is_empty() && payload.object != BUSINESS_ACCOUNT_OBJECT {
            debug!(object = %payload.object, "ignoring non whatsapp webhook object");
            return report;
        }

        for entry in &payload.entry {
            for change in &entry.changes {
                if !change.field.is_empty() && change.field != "messages" {
                    debug!(field = %change.field, "ignoring webhook change field");
                    continue;
                }
                self.apply_statuses(&change.value, &mut report).await;
                if !change.value.messages.is_empty() {
                    self.ingest_change(&change.value, &mut report).await;
                }
            }
        }

        info!(
            stored = report.stored,
            duplicates = report.duplicates,
            failed = report.failed,
            statuses = report.statuses_applied,
            "webhook payload processed"
        );
        report
    }

    async fn apply_statuses(&self, value: &ChangeValue, report: &mut IngestReport) {
        for update in &value.statuses {
            match status::apply_status(self.store.as_ref(), update).await {
                Ok(changed) => report.statuses_applied += changed,
                Err(err) => error!(
                    provider_message_id = %update.id,
                    error = %err,
                    "delivery status update failed"
                ),
            }
        }
    }

    async fn ingest_change(&self, value: &ChangeValue, report: &mut IngestReport) {
        let Some(phone_number_id) = value.phone_number_id() else {
            warn!("webhook change without phone_number_id, skipping");
            report.skipped_changes += 1;
            return;
        };
        let organization = match self
            .store
            .organization_by_phone_number_id(phone_number_id)
            .await
        {
            Ok(Some(organization)) => organization,
            Ok(None) => {
                warn!(phone_number_id, "no organization for phone_number_id, skipping");
                report.skipped_changes += 1;
                return;
            }
            Err(err) => {
                error!(phone_number_id, error = %err, "organization lookup failed");
                report.skipped_changes += 1;
                return;
            }
        };

        let profile_names = value.profile_names();
        for message in &value.messages {
            match self
                .ingest_message(&organization, message, &profile_names)
                .await
            {
                Ok(MessageOutcome::Stored) => report.stored += 1,
                Ok(MessageOutcome::Duplicate) => report.duplicates += 1,
                Ok(MessageOutcome::Rejected) => report.failed += 1,
                Err(err) => {
                    error!(
                        organization_id = %organization.id,
                        provider_message_id = %message.id,
                        error = %err,
                        "inbound message could not be stored"
                    );
                    report.failed += 1;
                }
            }
        }
    }

    async fn ingest_message(
        &self,
        organization: &Organization,
        message: &InboundMessage,
        profile_names: &HashMap<String, String>,
    ) -> Result<MessageOutcome, StoreError> {
        let store = self.store.as_ref();
        let provider_message_id = Some(message.id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let Some(phone) = normalize_phone(&message.from) else {
            warn!(from = %message.from, "inbound message without a usable sender phone");
            return Ok(MessageOutcome::Rejected);
        };

        if let Some(id) = provider_message_id.as_deref() {
            if store.message_by_provider_id(id).await?.is_some() {
                debug!(provider_message_id = id, "duplicate delivery, already processed");
                return Ok(MessageOutcome::Duplicate);
            }
        }

        let contact = contacts::resolve(
            store,
            &organization.id,
            &phone,
            profile_names.get(&phone).map(String::as_str),
            None,
        )
        .await?;
        let resolved = conversations::resolve(store, organization, &contact.id).await?;
        let conversation = &resolved.conversation;

        let extracted = content::extract(&message.content);
        let (media_url, media_mime_type) = self
            .materialize_media(organization, &conversation.id, &extracted)
            .await;

        let inserted = store
            .insert_message(NewMessage {
                conversation_id: conversation.id.clone(),
                organization_id: organization.id.clone(),
                sender_type: SenderType::Contact,
                sender_agent_id: None,
                message_type: extracted.message_type,
                content: extracted.text.clone(),
                media_url,
                media_mime_type,
                media_filename: extracted.filename.clone(),
                whatsapp_message_id: provider_message_id.clone(),
                status: MessageStatus::Delivered,
                error_message: None,
            })
            .await;
        let stored = match inserted {
            Ok(stored) => stored,
            Err(StoreError::UniqueViolation(_)) => {
                debug!(
                    provider_message_id = provider_message_id.as_deref().unwrap_or(""),
                    "duplicate delivery caught on insert"
                );
                return Ok(MessageOutcome::Duplicate);
            }
            Err(err) => return Err(err),
        };
        info!(
            organization_id = %organization.id,
            conversation_id = %conversation.id,
            message_id = %stored.id,
            kind = message.content.kind(),
            message_type = %stored.message_type,
            "inbound message stored"
        );

        if let Err(err) = store
            .record_conversation_activity(
                &conversation.id,
                &ConversationActivity {
                    last_message_at: stored.created_at.clone(),
                    last_message_preview: extracted.preview(),
                    increment_unread: true,
                },
            )
            .await
        {
            warn!(conversation_id = %conversation.id, error = %err, "conversation aggregate update failed");
        }

        if conversation.is_bot_active {
            debug!(conversation_id = %conversation.id, "bot active, skipping routing and auto-reply");
        } else {
            if assignment::needs_assignment(conversation) {
                if let Err(err) = assignment::assign(store, conversation).await {
                    warn!(conversation_id = %conversation.id, error = %err, "agent assignment failed");
                }
            }
            // The delivery that stores a new conversation's first message greets,
            // even when a concurrent delivery created the row and then lost the insert.
            if resolved.created || conversation.last_message_at.is_none() {
                self.send_auto_reply(organization, &contact, &resolved).await;
            }
        }

        if organization.mark_messages_read {
            if let Some(id) = provider_message_id.as_deref() {
                let credentials = outbound::credentials(organization);
                if let Err(err) = self.provider.mark_as_read(&credentials, id).await {
                    warn!(provider_message_id = id, error = %err, "mark as read failed");
                }
            }
        }

        Ok(MessageOutcome::Stored)
    }

    /// Returns the re-hosted URL and MIME type, or no URL when the media is unavailable.
    async fn materialize_media(
        &self,
        organization: &Organization,
        conversation_id: &str,
        extracted: &ExtractedContent,
    ) -> (Option<String>, Option<String>) {
        let Some(media_id) = extracted.media_id.as_deref() else {
            return (None, extracted.mime_type.clone());
        };
        let credentials = outbound::credentials(organization);
        match self
            .media
            .materialize(media_id, &credentials, conversation_id)
            .await
        {
            Ok(stored) => (Some(stored.url), Some(stored.mime_type)),
            Err(err) => {
                warn!(conversation_id, media_id, error = %err, "media unavailable");
                (None, extracted.mime_type.clone())
            }
        }
    }

    async fn send_auto_reply(
        &self,
        organization: &Organization,
        contact: &Contact,
        resolved: &ResolvedConversation,
    ) {
        let Some(template) = organization
            .auto_reply_message
            .as_deref()
            .filter(|t| !t.trim().is_empty())
        else {
            return;
        };
        let conversation = &resolved.conversation;
        let body = render_auto_reply(
            template,
            &AutoReplyContext {
                organization_name: &organization.name,
                contact_name: contact.name.as_deref(),
                protocol_number: &conversation.protocol_number,
            },
        );
        if body.is_empty() {
            return;
        }
        match self.store.claim_auto_reply(&conversation.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(conversation_id = %conversation.id, "auto-reply already sent");
                return;
            }
            Err(err) => {
                warn!(conversation_id = %conversation.id, error = %err, "auto-reply claim failed");
                return;
            }
        }
        let sent = outbound::deliver(
            self.store.as_ref(),
            self.provider.as_ref(),
            organization,
            conversation,
            &contact.phone,
            Author::System,
            &OutboundMessage::Text { body },
        )
        .await;
        if let Err(err) = sent {
            warn!(conversation_id = %conversation.id, error = %err, "auto-reply could not be recorded");
        }
    }
}
