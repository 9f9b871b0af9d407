//! Filesystem storage for uploaded receipts

use crate::identity::Identity;
use crate::runtime::{AttachmentStore, BackendError};
use crate::state_machine::Attachment;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;

const DEFAULT_EXTENSION: &str = "jpg";

/// Saves each attachment as `<root>/<owner>/<timestamp>-<uuid>.<ext>`
pub struct FsAttachmentStore {
    root: PathBuf,
}

impl FsAttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_name(media_type: &str) -> String {
        let ext = mime_guess::get_mime_extensions_str(media_type)
            .and_then(|exts| {
                exts.iter()
                    .find(|ext| **ext == DEFAULT_EXTENSION)
                    .or_else(|| exts.first())
            })
            .copied()
            .unwrap_or(DEFAULT_EXTENSION);
        format!(
            "{}-{}.{ext}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            uuid::Uuid::new_v4()
        )
    }
}

#[async_trait]
impl AttachmentStore for FsAttachmentStore {
    async fn save(&self, attachment: &Attachment, owner: Identity) -> Result<String, BackendError> {
        let dir = self.root.join(owner.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BackendError::Unavailable(format!("create {}: {e}", dir.display())))?;

        let path = dir.join(Self::file_name(&attachment.media_type));
        tokio::fs::write(&path, &attachment.data)
            .await
            .map_err(|e| BackendError::Unavailable(format!("write {}: {e}", path.display())))?;

        tracing::debug!(%owner, path = %path.display(), bytes = attachment.data.len(), "Saved attachment");
        Ok(path.to_string_lossy().into_owned())
    }

    async fn discard(&self, path: &str) -> Result<(), BackendError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::Unavailable(format!("remove {path}: {e}"))),
        }
    }
}
