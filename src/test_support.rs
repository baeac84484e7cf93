//! Fakes shared by the unit tests: a recording provider, an in-memory object
//! store and data fixtures.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use axum::body::Bytes;

use crate::error::{MediaError, ProviderError};
use crate::media::{MediaFetcher, ObjectStore};
use crate::provider::{Credentials, DownloadedMedia, MediaLocation, OutboundMessage, Provider};
use crate::store::MemoryStore;
use crate::types::{now_iso, Agent, AgentRole, AgentStatus, Organization, Queue};

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub to: String,
    pub message: OutboundMessage,
}

#[derive(Default)]
pub struct FakeProvider {
    sent: Mutex<Vec<SentMessage>>,
    read_receipts: Mutex<Vec<String>>,
    media: Mutex<HashMap<String, (String, Bytes)>>,
    fail_sends: Mutex<Option<ProviderError>>,
    counter: AtomicUsize,
}

impl FakeProvider {
    pub fn put_media(&self, media_id: &str, mime_type: &str, bytes: &[u8]) {
        self.media.lock().unwrap().insert(
            media_id.to_string(),
            (mime_type.to_string(), Bytes::copy_from_slice(bytes)),
        );
    }

    /// Every following send is rejected with a 400 carrying `body`.
    pub fn fail_sends_with(&self, body: &str) {
        *self.fail_sends.lock().unwrap() = Some(ProviderError::Api {
            status: 400,
            body: body.to_string(),
        });
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn read_receipts(&self) -> Vec<String> {
        self.read_receipts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn send(
        &self,
        _credentials: &Credentials,
        to: &str,
        message: &OutboundMessage,
    ) -> Result<String, ProviderError> {
        self.sent.lock().unwrap().push(SentMessage {
            to: to.to_string(),
            message: message.clone(),
        });
        if let Some(ProviderError::Api { status, body }) = &*self.fail_sends.lock().unwrap() {
            return Err(ProviderError::Api {
                status: *status,
                body: body.clone(),
            });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("wamid.out.{n}"))
    }

    async fn mark_as_read(
        &self,
        _credentials: &Credentials,
        provider_message_id: &str,
    ) -> Result<(), ProviderError> {
        self.read_receipts
            .lock()
            .unwrap()
            .push(provider_message_id.to_string());
        Ok(())
    }

    async fn media_location(
        &self,
        _credentials: &Credentials,
        media_id: &str,
    ) -> Result<MediaLocation, ProviderError> {
        let media = self.media.lock().unwrap();
        let Some((mime_type, _)) = media.get(media_id) else {
            return Err(ProviderError::Api {
                status: 404,
                body: format!("unknown media {media_id}"),
            });
        };
        Ok(MediaLocation {
            url: format!("fake://media/{media_id}"),
            mime_type: Some(mime_type.clone()),
        })
    }

    async fn download(
        &self,
        _credentials: &Credentials,
        url: &str,
    ) -> Result<DownloadedMedia, ProviderError> {
        let media_id = url.trim_start_matches("fake://media/");
        let media = self.media.lock().unwrap();
        let (mime_type, bytes) = media.get(media_id).ok_or_else(|| ProviderError::Api {
            status: 404,
            body: format!("unknown media url {url}"),
        })?;
        Ok(DownloadedMedia {
            bytes: bytes.clone(),
            content_type: Some(mime_type.clone()),
        })
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryObjectStore {
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        conversation_id: &str,
        file_name: &str,
        bytes: Bytes,
    ) -> Result<String, MediaError> {
        let key = format!("{conversation_id}/{file_name}");
        self.objects.lock().unwrap().insert(key.clone(), bytes);
        Ok(format!("memory://{key}"))
    }

    async fn get(&self, conversation_id: &str, file_name: &str) -> Result<Option<Bytes>, MediaError> {
        let key = format!("{conversation_id}/{file_name}");
        Ok(self.objects.lock().unwrap().get(&key).cloned())
    }
}

pub fn organization(id: &str, phone_number_id: &str) -> Organization {
    Organization {
        id: id.to_string(),
        name: "Acme".to_string(),
        phone_number_id: phone_number_id.to_string(),
        access_token: "token".to_string(),
        auto_reply_message: None,
        sla_minutes: None,
        utc_offset_minutes: 0,
        mark_messages_read: true,
        created_at: now_iso(),
        updated_at: now_iso(),
    }
}

pub fn agent(id: &str, organization_id: &str, status: AgentStatus) -> Agent {
    Agent {
        id: id.to_string(),
        organization_id: organization_id.to_string(),
        name: format!("Agent {id}"),
        email: format!("{id}@example.com"),
        role: AgentRole::Agent,
        status,
        queue: Queue::Both,
        max_concurrent_chats: 5,
        created_at: now_iso(),
        updated_at: now_iso(),
    }
}

/// Everything a pipeline or router test needs, wired together.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub objects: Arc<MemoryObjectStore>,
}

impl Harness {
    pub async fn new(organization: Organization) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.put_organization(organization).await;
        Self {
            store,
            provider: Arc::new(FakeProvider::default()),
            objects: Arc::new(MemoryObjectStore::default()),
        }
    }

    pub fn media(&self) -> MediaFetcher {
        MediaFetcher::new(self.provider.clone(), self.objects.clone())
    }
}
