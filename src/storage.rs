//! Transcript persistence.
//!
//! One record per session, written once when the session stops. The
//! store is a seam: production deployments wire a database-backed
//! implementation, the default writes JSON files under the platform
//! data dir.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::Transcript;

#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn save(&self, transcript: &Transcript) -> Result<()>;
}

/// Filesystem store: `<dir>/transcripts/<timestamp>-<id>.json`.
pub struct FsTranscriptStore {
    dir: PathBuf,
}

impl FsTranscriptStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn default_store() -> Result<Self> {
        Ok(Self::new(crate::config::data_dir()?.join("transcripts")))
    }
}

#[async_trait]
impl TranscriptStore for FsTranscriptStore {
    async fn save(&self, transcript: &Transcript) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("Failed to create transcript directory")?;
        let name = format!(
            "{}-{}.json",
            transcript.timestamp.format("%Y%m%dT%H%M%S"),
            Uuid::new_v4()
        );
        let path = self.dir.join(name);
        let contents =
            serde_json::to_vec_pretty(transcript).context("Failed to serialize transcript")?;
        tokio::fs::write(&path, contents)
            .await
            .context("Failed to write transcript file")?;
        info!(path = %path.display(), messages = transcript.messages.len(), "transcript saved");
        Ok(())
    }
}

/// A store that drops everything; used when persistence is disabled.
pub struct NullTranscriptStore;

#[async_trait]
impl TranscriptStore for NullTranscriptStore {
    async fn save(&self, transcript: &Transcript) -> Result<()> {
        debug!(
            messages = transcript.messages.len(),
            "transcript persistence disabled, dropping"
        );
        Ok(())
    }
}
