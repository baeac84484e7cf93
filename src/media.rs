use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use axum::body::Bytes;
use chrono::Utc;

use crate::error::MediaError;
use crate::provider::{Credentials, Provider};

/// Durable storage for downloaded media, addressed by `{conversation_id}/{file_name}`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes the object and returns its stable public URL.
    async fn put(
        &self,
        conversation_id: &str,
        file_name: &str,
        bytes: Bytes,
    ) -> Result<String, MediaError>;

    async fn get(&self, conversation_id: &str, file_name: &str) -> Result<Option<Bytes>, MediaError>;
}

pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf, public_base_url: impl Into<String>) -> Self {
        Self {
            root,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn object_path(&self, conversation_id: &str, file_name: &str) -> Result<PathBuf, MediaError> {
        if !is_safe_path_segment(conversation_id) || !is_safe_path_segment(file_name) {
            return Err(MediaError::Storage(format!(
                "unsafe object path {conversation_id}/{file_name}"
            )));
        }
        Ok(self.root.join(conversation_id).join(file_name))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        conversation_id: &str,
        file_name: &str,
        bytes: Bytes,
    ) -> Result<String, MediaError> {
        let path = self.object_path(conversation_id, file_name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MediaError::Storage(e.to_string()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| MediaError::Storage(e.to_string()))?;
        Ok(format!(
            "{}/api/media/{conversation_id}/{file_name}",
            self.public_base_url
        ))
    }

    async fn get(&self, conversation_id: &str, file_name: &str) -> Result<Option<Bytes>, MediaError> {
        let path = self.object_path(conversation_id, file_name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(MediaError::Storage(err.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMedia {
    pub url: String,
    pub mime_type: String,
}

/// Exchanges a provider media id for bytes and re-hosts them.
#[derive(Clone)]
pub struct MediaFetcher {
    provider: Arc<dyn Provider>,
    objects: Arc<dyn ObjectStore>,
}

impl MediaFetcher {
    pub fn new(provider: Arc<dyn Provider>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { provider, objects }
    }

    pub async fn materialize(
        &self,
        media_id: &str,
        credentials: &Credentials,
        conversation_id: &str,
    ) -> Result<StoredMedia, MediaError> {
        let location = self.provider.media_location(credentials, media_id).await?;
        let downloaded = self.provider.download(credentials, &location.url).await?;
        let mime_type = location
            .mime_type
            .or(downloaded.content_type)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let file_name = format!(
            "{}-{}.{}",
            Utc::now().timestamp_millis(),
            sanitize_segment(media_id),
            extension_from_mime(&mime_type)
        );
        let url = self
            .objects
            .put(conversation_id, &file_name, downloaded.bytes)
            .await?;
        Ok(StoredMedia { url, mime_type })
    }
}

pub fn extension_from_mime(mime: &str) -> &'static str {
    let mt = mime
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match mt.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/ogg" => "ogg",
        "audio/aac" => "aac",
        "audio/amr" => "amr",
        "audio/mp4" => "m4a",
        "audio/wav" => "wav",
        "video/mp4" => "mp4",
        "video/3gpp" => "3gp",
        "video/quicktime" => "mov",
        "application/pdf" => "pdf",
        "application/json" => "json",
        "text/plain" => "txt",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        _ => "bin",
    }
}

pub fn content_type_from_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "aac" => "audio/aac",
        "amr" => "audio/amr",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "3gp" => "video/3gpp",
        "mov" => "video/quicktime",
        "pdf" => "application/pdf",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

pub fn is_safe_path_segment(value: &str) -> bool {
    !value.is_empty()
        && !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn sanitize_segment(value: &str) -> String {
    let cleaned = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>();
    if cleaned.is_empty() {
        "media".to_string()
    } else {
        cleaned
    }
}
