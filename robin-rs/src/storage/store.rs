//! On-disk delivery of received messages.
//!
//! Each accepted body lands under `<base>/<domain>/<local>/` with a
//! date-stamped name carrying the session UID. Writes go through a tmp
//! file and an atomic rename.

use crate::error::{Result, RobinError};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

pub struct MessageStore {
    base_path: PathBuf,
}

impl MessageStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Stores a message body, deriving the directory from the recipient
    /// mailbox and the filename from today's date plus the session UID.
    pub async fn store(&self, recipient: &str, session_uid: u64, data: &[u8]) -> Result<PathBuf> {
        let (local, domain) = split_mailbox(recipient);
        let dir = self
            .base_path
            .join(sanitize_component(&domain))
            .join(sanitize_component(&local));

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| RobinError::Storage(format!("Failed to create {:?}: {}", dir, e)))?;

        let filename = format!("{}.{}.eml", Utc::now().format("%Y%m%d"), session_uid);
        let tmp_path = dir.join(format!("{}.tmp", filename));
        let final_path = dir.join(&filename);

        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &final_path).await?;

        info!("Stored message for {} as {}", recipient, final_path.display());
        Ok(final_path)
    }

    /// Renames a stored message to the name the sender requested via
    /// `X-Robin-Filename`. The new name is confined to the message's own
    /// directory; an existing target is overwritten.
    pub async fn rename(&self, stored: &Path, requested: &str) -> Result<PathBuf> {
        let dir = stored
            .parent()
            .ok_or_else(|| RobinError::Storage("Stored path has no parent".to_string()))?;
        let target = dir.join(sanitize_component(requested));

        fs::rename(stored, &target).await?;
        info!("Renamed {} to {}", stored.display(), target.display());
        Ok(target)
    }
}

fn split_mailbox(recipient: &str) -> (String, String) {
    match recipient.split_once('@') {
        Some((local, domain)) if !domain.is_empty() => (local.to_string(), domain.to_string()),
        _ => (recipient.to_string(), "unknown".to_string()),
    }
}

/// Keeps a name usable as a single path component.
fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    if cleaned == ".." || cleaned == "." || cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
