//! WhatsApp Cloud API client: message sends, read receipts and media download.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use reqwest::{header, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ProviderError;

/// Per-organization provider credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_token: String,
    pub phone_number_id: String,
}

impl Credentials {
    fn require(&self) -> Result<(), ProviderError> {
        if self.access_token.trim().is_empty() || self.phone_number_id.trim().is_empty() {
            return Err(ProviderError::MissingCredentials);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
        }
    }

    fn takes_caption(self) -> bool {
        matches!(self, MediaKind::Image | MediaKind::Video | MediaKind::Document)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text {
        body: String,
    },
    Template {
        name: String,
        language: String,
        params: Vec<String>,
    },
    Media {
        kind: MediaKind,
        link: String,
        caption: Option<String>,
        filename: Option<String>,
    },
}

impl OutboundMessage {
    /// Graph API request body for `POST /{phone_number_id}/messages`.
    pub fn to_payload(&self, to: &str) -> Value {
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
        });
        match self {
            OutboundMessage::Text { body } => {
                payload["type"] = json!("text");
                payload["text"] = json!({ "preview_url": false, "body": body });
            }
            OutboundMessage::Template {
                name,
                language,
                params,
            } => {
                let mut template = json!({
                    "name": name,
                    "language": { "code": language },
                });
                if !params.is_empty() {
                    let parameters = params
                        .iter()
                        .map(|value| json!({ "type": "text", "text": value }))
                        .collect::<Vec<_>>();
                    template["components"] = json!([{ "type": "body", "parameters": parameters }]);
                }
                payload["type"] = json!("template");
                payload["template"] = template;
            }
            OutboundMessage::Media {
                kind,
                link,
                caption,
                filename,
            } => {
                let mut media = json!({ "link": link });
                if kind.takes_caption() {
                    if let Some(caption) = caption.as_deref().filter(|c| !c.trim().is_empty()) {
                        media["caption"] = json!(caption);
                    }
                }
                if *kind == MediaKind::Document {
                    media["filename"] = json!(filename.as_deref().unwrap_or("attachment"));
                }
                payload["type"] = json!(kind.as_str());
                payload[kind.as_str()] = media;
            }
        }
        payload
    }
}

/// Short-lived download location for a media object.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaLocation {
    pub url: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Sends one message and returns the provider message id.
    async fn send(
        &self,
        credentials: &Credentials,
        to: &str,
        message: &OutboundMessage,
    ) -> Result<String, ProviderError>;

    async fn mark_as_read(
        &self,
        credentials: &Credentials,
        provider_message_id: &str,
    ) -> Result<(), ProviderError>;

    async fn media_location(
        &self,
        credentials: &Credentials,
        media_id: &str,
    ) -> Result<MediaLocation, ProviderError>;

    async fn download(
        &self,
        credentials: &Credentials,
        url: &str,
    ) -> Result<DownloadedMedia, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessageRef>,
}

#[derive(Debug, Deserialize)]
struct SentMessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MediaMetadata {
    #[serde(default)]
    url: String,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Largest attachment WhatsApp accepts (documents, 100 MB).
pub const MAX_MEDIA_BYTES: usize = 100 * 1024 * 1024;

/// Appends each segment to the base path, percent-encoded, so an id can
/// never reshape the request path or add a query.
fn endpoint(base_url: &Url, segments: &[&str]) -> Result<Url, ProviderError> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| ProviderError::Request(format!("{base_url} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Buffers a response body, giving up as soon as it outgrows `limit`.
async fn read_capped(mut response: reqwest::Response, limit: usize) -> Result<Bytes, ProviderError> {
    if response
        .content_length()
        .is_some_and(|declared| declared > limit as u64)
    {
        return Err(ProviderError::TooLarge(limit));
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Err(ProviderError::TooLarge(limit));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(body))
}

pub struct WhatsAppCloud {
    client: reqwest::Client,
    base_url: Url,
}

impl WhatsAppCloud {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let raw = base_url.into();
        let base_url = Url::parse(&raw)
            .map_err(|e| ProviderError::Request(format!("invalid graph api url {raw}: {e}")))?;
        endpoint(&base_url, &[])?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    async fn post_messages(
        &self,
        credentials: &Credentials,
        payload: &Value,
    ) -> Result<String, ProviderError> {
        credentials.require()?;
        let response = self
            .client
            .post(endpoint(
                &self.base_url,
                &[credentials.phone_number_id.trim(), "messages"],
            )?)
            .bearer_auth(&credentials.access_token)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body: raw_body,
            });
        }
        Ok(raw_body)
    }
}

#[async_trait]
impl Provider for WhatsAppCloud {
    async fn send(
        &self,
        credentials: &Credentials,
        to: &str,
        message: &OutboundMessage,
    ) -> Result<String, ProviderError> {
        let raw_body = self
            .post_messages(credentials, &message.to_payload(to))
            .await?;
        let parsed = serde_json::from_str::<SendResponse>(&raw_body)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| ProviderError::InvalidResponse(format!("no message id in {raw_body}")))
    }

    async fn mark_as_read(
        &self,
        credentials: &Credentials,
        provider_message_id: &str,
    ) -> Result<(), ProviderError> {
        let payload = json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": provider_message_id,
        });
        self.post_messages(credentials, &payload).await.map(|_| ())
    }

    async fn media_location(
        &self,
        credentials: &Credentials,
        media_id: &str,
    ) -> Result<MediaLocation, ProviderError> {
        if credentials.access_token.trim().is_empty() {
            return Err(ProviderError::MissingCredentials);
        }
        let response = self
            .client
            .get(endpoint(&self.base_url, &[media_id])?)
            .bearer_auth(&credentials.access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let metadata = response
            .json::<MediaMetadata>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let url = metadata.url.trim().to_string();
        if url.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "missing media url from whatsapp".to_string(),
            ));
        }
        Ok(MediaLocation {
            url,
            mime_type: metadata.mime_type,
        })
    }

    async fn download(
        &self,
        credentials: &Credentials,
        url: &str,
    ) -> Result<DownloadedMedia, ProviderError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&credentials.access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = read_capped(response, MAX_MEDIA_BYTES).await?;
        Ok(DownloadedMedia {
            bytes,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_disables_previews() {
        let payload = OutboundMessage::Text {
            body: "We'll be right with you".into(),
        }
        .to_payload("5511999990000");
        assert_eq!(payload["type"], "text");
        assert_eq!(payload["to"], "5511999990000");
        assert_eq!(payload["text"]["body"], "We'll be right with you");
        assert_eq!(payload["text"]["preview_url"], false);
    }

    #[test]
    fn template_payload_carries_body_parameters() {
        let payload = OutboundMessage::Template {
            name: "order_update".into(),
            language: "pt_BR".into(),
            params: vec!["Maria".into(), "42".into()],
        }
        .to_payload("55119");
        assert_eq!(payload["template"]["name"], "order_update");
        assert_eq!(payload["template"]["language"]["code"], "pt_BR");
        let parameters = &payload["template"]["components"][0]["parameters"];
        assert_eq!(parameters[1]["text"], "42");
    }

    #[test]
    fn media_payload_drops_caption_for_audio() {
        let audio = OutboundMessage::Media {
            kind: MediaKind::Audio,
            link: "https://cdn.example/a.ogg".into(),
            caption: Some("ignored".into()),
            filename: None,
        }
        .to_payload("55119");
        assert_eq!(audio["type"], "audio");
        assert!(audio["audio"].get("caption").is_none());

        let document = OutboundMessage::Media {
            kind: MediaKind::Document,
            link: "https://cdn.example/d.pdf".into(),
            caption: Some("contract".into()),
            filename: None,
        }
        .to_payload("55119");
        assert_eq!(document["document"]["filename"], "attachment");
        assert_eq!(document["document"]["caption"], "contract");
    }

    #[test]
    fn ids_are_confined_to_one_path_segment() {
        let base = Url::parse("https://graph.facebook.com/v21.0/").unwrap();
        let media = endpoint(&base, &["12/../me?fields=x#y"]).unwrap();
        assert_eq!(
            media.as_str(),
            "https://graph.facebook.com/v21.0/12%2F..%2Fme%3Ffields=x%23y"
        );
        assert_eq!(media.query(), None);

        let messages = endpoint(&base, &["PN1", "messages"]).unwrap();
        assert_eq!(messages.as_str(), "https://graph.facebook.com/v21.0/PN1/messages");
    }

    #[test]
    fn unusable_base_url_is_rejected_up_front() {
        assert!(WhatsAppCloud::new("not a url", Duration::from_secs(1)).is_err());
        assert!(WhatsAppCloud::new("mailto:ops@example.com", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn oversized_media_is_refused() {
        let response = |len: usize| reqwest::Response::from(axum::http::Response::new(vec![7u8; len]));

        let err = read_capped(response(16), 8).await.unwrap_err();
        assert!(matches!(err, ProviderError::TooLarge(8)));

        let body = read_capped(response(8), 8).await.unwrap();
        assert_eq!(body.len(), 8);
    }

    #[tokio::test]
    async fn send_requires_credentials() {
        let cloud = WhatsAppCloud::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let credentials = Credentials {
            access_token: String::new(),
            phone_number_id: "PN1".into(),
        };
        let err = cloud
            .send(&credentials, "55119", &OutboundMessage::Text { body: "hi".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MissingCredentials));
    }
}
