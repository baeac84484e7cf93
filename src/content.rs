use serde_json::json;

use crate::types::MessageType;
use crate::webhook::{MediaBody, MessageContent};

const PREVIEW_MAX_CHARS: usize = 120;

/// Normalized form of one provider message.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedContent {
    pub message_type: MessageType,
    pub text: Option<String>,
    pub media_id: Option<String>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
}

impl ExtractedContent {
    fn text(message_type: MessageType, text: Option<String>) -> Self {
        Self {
            message_type,
            text,
            media_id: None,
            mime_type: None,
            filename: None,
        }
    }

    fn media(message_type: MessageType, body: &MediaBody, with_caption: bool) -> Self {
        Self {
            message_type,
            text: if with_caption {
                non_blank(body.caption.as_deref())
            } else {
                None
            },
            media_id: non_blank(body.id.as_deref()),
            mime_type: non_blank(body.mime_type.as_deref()),
            filename: non_blank(body.filename.as_deref()),
        }
    }

    /// Short line shown in conversation lists.
    pub fn preview(&self) -> String {
        let fallback = match self.message_type {
            MessageType::Image => "Sent an image",
            MessageType::Audio => "Sent an audio message",
            MessageType::Video => "Sent a video",
            MessageType::Document => "Sent a document",
            MessageType::Sticker => "Sent a sticker",
            MessageType::Location => "Shared a location",
            MessageType::Reaction => "Reacted to a message",
            MessageType::Contacts => "Shared a contact",
            _ => "",
        };
        let text = match self.message_type {
            MessageType::Location => None,
            MessageType::Reaction => self.text.as_deref().map(|emoji| format!("Reacted {emoji}")),
            _ => self.text.clone(),
        };
        truncate_preview(text.as_deref().unwrap_or(fallback))
    }
}

/// Maps a provider message onto the stored message shape. Total and pure:
/// unknown kinds become a `text` placeholder so nothing is dropped.
pub fn extract(content: &MessageContent) -> ExtractedContent {
    match content {
        MessageContent::Text(body) => {
            ExtractedContent::text(MessageType::Text, non_blank(Some(&body.body)))
        }
        MessageContent::Image(body) => ExtractedContent::media(MessageType::Image, body, true),
        MessageContent::Video(body) => ExtractedContent::media(MessageType::Video, body, true),
        MessageContent::Document(body) => {
            ExtractedContent::media(MessageType::Document, body, true)
        }
        MessageContent::Audio(body) => ExtractedContent::media(MessageType::Audio, body, false),
        MessageContent::Sticker(body) => {
            ExtractedContent::media(MessageType::Sticker, body, false)
        }
        MessageContent::Location(location) => {
            let maps_url = match (location.latitude, location.longitude) {
                (Some(lat), Some(lng)) => Some(format!("https://maps.google.com/?q={lat},{lng}")),
                _ => None,
            };
            let blob = json!({
                "latitude": location.latitude,
                "longitude": location.longitude,
                "name": non_blank(location.name.as_deref()),
                "address": non_blank(location.address.as_deref()),
                "url": non_blank(location.url.as_deref()).or(maps_url),
            });
            ExtractedContent::text(MessageType::Location, Some(blob.to_string()))
        }
        MessageContent::Reaction(reaction) => {
            ExtractedContent::text(MessageType::Reaction, non_blank(reaction.emoji.as_deref()))
        }
        MessageContent::Interactive(interactive) => {
            let title = interactive
                .button_reply
                .as_ref()
                .or(interactive.list_reply.as_ref())
                .map(|reply| reply.title.as_str());
            ExtractedContent::text(MessageType::Interactive, non_blank(title))
        }
        MessageContent::Button(button) => {
            let text = non_blank(Some(&button.text)).or_else(|| non_blank(button.payload.as_deref()));
            ExtractedContent::text(MessageType::Interactive, text)
        }
        MessageContent::Order(order) => {
            let count = order.product_items.len();
            let mut summary = format!(
                "Order with {count} item{}",
                if count == 1 { "" } else { "s" }
            );
            if let Some(note) = non_blank(order.text.as_deref()) {
                summary.push_str(": ");
                summary.push_str(&note);
            }
            ExtractedContent::text(MessageType::Text, Some(summary))
        }
        MessageContent::System(system) => {
            ExtractedContent::text(MessageType::System, non_blank(Some(&system.body)))
        }
        MessageContent::Contacts(contacts) => {
            let shared = contacts
                .iter()
                .map(|contact| {
                    let name = contact
                        .name
                        .as_ref()
                        .map(|n| n.formatted_name.trim())
                        .filter(|n| !n.is_empty())
                        .unwrap_or("Unnamed contact");
                    let phones = contact
                        .phones
                        .iter()
                        .map(|p| p.phone.trim())
                        .filter(|p| !p.is_empty())
                        .collect::<Vec<_>>();
                    if phones.is_empty() {
                        name.to_string()
                    } else {
                        format!("{name} ({})", phones.join(", "))
                    }
                })
                .collect::<Vec<_>>();
            let text = if shared.is_empty() {
                None
            } else {
                Some(shared.join("\n"))
            };
            ExtractedContent::text(MessageType::Contacts, text)
        }
        MessageContent::Unsupported { kind } => {
            let kind = if kind.trim().is_empty() { "unknown" } else { kind.as_str() };
            ExtractedContent::text(
                MessageType::Text,
                Some(format!("[Unsupported message type: {kind}]")),
            )
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn truncate_preview(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= PREVIEW_MAX_CHARS {
        return text.to_string();
    }
    let mut cut = text.chars().take(PREVIEW_MAX_CHARS - 1).collect::<String>();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::*;
    use serde_json::{json, Value};

    #[test]
    fn text_body_becomes_content() {
        let extracted = extract(&MessageContent::Text(TextBody { body: "  Hello ".into() }));
        assert_eq!(extracted.message_type, MessageType::Text);
        assert_eq!(extracted.text.as_deref(), Some("Hello"));
        assert_eq!(extracted.media_id, None);
    }

    #[test]
    fn captions_only_for_visual_and_document_media() {
        let body = MediaBody {
            id: Some("M1".into()),
            mime_type: Some("application/pdf".into()),
            caption: Some("invoice".into()),
            filename: Some("invoice.pdf".into()),
        };
        let document = extract(&MessageContent::Document(body.clone()));
        assert_eq!(document.text.as_deref(), Some("invoice"));
        assert_eq!(document.filename.as_deref(), Some("invoice.pdf"));
        assert_eq!(document.media_id.as_deref(), Some("M1"));

        let audio = extract(&MessageContent::Audio(body.clone()));
        assert_eq!(audio.message_type, MessageType::Audio);
        assert_eq!(audio.text, None);
        assert_eq!(audio.media_id.as_deref(), Some("M1"));

        let sticker = extract(&MessageContent::Sticker(body));
        assert_eq!(sticker.text, None);
    }

    #[test]
    fn location_is_structured_text() {
        let extracted = extract(&MessageContent::Location(LocationBody {
            latitude: Some(-23.5),
            longitude: Some(-46.6),
            name: Some("Office".into()),
            address: None,
            url: None,
        }));
        assert_eq!(extracted.message_type, MessageType::Location);
        let blob: Value = serde_json::from_str(extracted.text.as_deref().unwrap()).unwrap();
        assert_eq!(blob["name"], "Office");
        assert_eq!(blob["latitude"], -23.5);
        assert_eq!(blob["url"], "https://maps.google.com/?q=-23.5,-46.6");
        assert_eq!(extracted.preview(), "Shared a location");
    }

    #[test]
    fn reaction_carries_emoji() {
        let extracted = extract(&MessageContent::Reaction(ReactionBody {
            emoji: Some("👍".into()),
        }));
        assert_eq!(extracted.message_type, MessageType::Reaction);
        assert_eq!(extracted.text.as_deref(), Some("👍"));
    }

    #[test]
    fn unknown_kind_becomes_placeholder_text() {
        let extracted = extract(&MessageContent::Unsupported { kind: "ephemeral".into() });
        assert_eq!(extracted.message_type, MessageType::Text);
        assert_eq!(
            extracted.text.as_deref(),
            Some("[Unsupported message type: ephemeral]")
        );
    }

    #[test]
    fn every_provider_kind_maps_to_a_message_type() {
        let mut kinds = MessageContent::KNOWN_KINDS.to_vec();
        kinds.push("brand_new_kind");
        for kind in kinds {
            let content = MessageContent::from_value(&json!({ "type": kind }));
            let extracted = extract(&content);
            assert_eq!(
                MessageType::parse(extracted.message_type.as_str()),
                Some(extracted.message_type),
                "{kind}"
            );
        }
    }

    #[test]
    fn preview_is_truncated() {
        let long = "x".repeat(500);
        let extracted = extract(&MessageContent::Text(TextBody { body: long }));
        assert_eq!(extracted.preview().chars().count(), PREVIEW_MAX_CHARS);
        let image = extract(&MessageContent::Image(MediaBody::default()));
        assert_eq!(image.preview(), "Sent an image");
    }
}
