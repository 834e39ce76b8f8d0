//! Lifetime of the local preview for media attached to the post being composed.
//!
//! A [`PreviewHandle`] owns one revocable preview resource. It is not `Clone`
//! and releases the resource when dropped, so a handle is released exactly once.
//! [`MediaResourceManager`] keeps at most one handle and always releases the
//! current one before creating its replacement.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use shared::{domain::PendingMedia, protocol::MediaRecord};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MediaFile {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Allocates and revokes preview resources (object URLs, temp files, ...).
pub trait PreviewBackend: Send + Sync {
    fn create(&self, file: &MediaFile) -> anyhow::Result<String>;
    fn revoke(&self, url: &str);
}

pub struct PreviewHandle {
    url: String,
    backend: Arc<dyn PreviewBackend>,
}

impl PreviewHandle {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        debug!(url = %self.url, "media: releasing preview");
        self.backend.revoke(&self.url);
    }
}

/// In-memory `blob:` URL table, the default preview backend.
#[derive(Default)]
pub struct ObjectUrlRegistry {
    entries: Mutex<HashMap<String, Arc<[u8]>>>,
}

impl ObjectUrlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, url: &str) -> Option<Arc<[u8]>> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(url).cloned())
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}

impl PreviewBackend for ObjectUrlRegistry {
    fn create(&self, file: &MediaFile) -> anyhow::Result<String> {
        let url = format!("blob:{}", Uuid::new_v4());
        self.entries
            .lock()
            .map_err(|_| anyhow!("object url registry is poisoned"))?
            .insert(url.clone(), Arc::from(file.bytes.as_slice()));
        Ok(url)
    }

    fn revoke(&self, url: &str) {
        let removed = self
            .entries
            .lock()
            .map(|mut entries| entries.remove(url).is_some())
            .unwrap_or(false);
        if !removed {
            warn!(url, "media: revoked an unknown preview url");
        }
    }
}

struct ActiveMedia {
    file_id: String,
    media_type: String,
    preview: Option<PreviewHandle>,
}

pub struct MediaResourceManager {
    backend: Arc<dyn PreviewBackend>,
    active: Option<ActiveMedia>,
}

impl MediaResourceManager {
    pub fn new(backend: Arc<dyn PreviewBackend>) -> Self {
        Self {
            backend,
            active: None,
        }
    }

    pub fn pending(&self) -> Option<PendingMedia> {
        self.active.as_ref().map(|active| PendingMedia {
            file_id: active.file_id.clone(),
            media_type: active.media_type.clone(),
            preview_url: active
                .preview
                .as_ref()
                .map(|preview| preview.url().to_string()),
        })
    }

    /// Releases the active preview and forgets the media. Returns whether
    /// anything was pending.
    pub fn clear(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                debug!(file_id = %active.file_id, "media: cleared pending media");
                drop(active.preview);
                true
            }
            None => false,
        }
    }

    /// Clears only if `file_id` is still the pending media.
    pub fn clear_if(&mut self, file_id: &str) -> bool {
        match &self.active {
            Some(active) if active.file_id == file_id => self.clear(),
            _ => false,
        }
    }

    /// Stores freshly uploaded media with a local preview of `file`.
    pub fn install_upload(
        &mut self,
        file: &MediaFile,
        file_id: String,
        media_type: String,
    ) -> anyhow::Result<PendingMedia> {
        self.clear();
        let url = self.backend.create(file)?;
        self.active = Some(ActiveMedia {
            file_id,
            media_type,
            preview: Some(PreviewHandle {
                url,
                backend: Arc::clone(&self.backend),
            }),
        });
        self.pending()
            .ok_or_else(|| anyhow!("pending media vanished after install"))
    }

    /// Replaces pending media with what the server reports. Server-side media
    /// has no local preview.
    pub fn replace_from_server(&mut self, record: Option<MediaRecord>) {
        self.clear();
        let Some(MediaRecord {
            file_id: Some(file_id),
            media_type,
        }) = record
        else {
            return;
        };
        self.active = Some(ActiveMedia {
            file_id,
            media_type: media_type.unwrap_or_default(),
            preview: None,
        });
    }
}

impl Drop for MediaResourceManager {
    fn drop(&mut self) {
        self.clear();
    }
}
