//! The inbound-track seam.
//!
//! The detector consumes audio through this trait so the core can run
//! against the WebRTC transport in production and scripted sources in
//! tests.

use async_trait::async_trait;
use thiserror::Error;

use crate::audio::AudioFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackError {
    /// The remote side stopped sending; the track will yield no more
    /// frames.
    #[error("track ended")]
    Ended,

    #[error("transport failure: {0}")]
    Transport(#[source] anyhow::Error),
}

/// A live source of decoded PCM frames.
#[async_trait]
pub trait AudioSource: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn is_live(&self) -> bool {
        true
    }

    /// Receive the next frame, in strict arrival order.
    async fn recv(&self) -> Result<AudioFrame, TrackError>;
}

/// Tidy repr of a source for log lines.
pub fn source_str(source: &dyn AudioSource) -> String {
    format!(
        "{}:{}:{}",
        if source.is_live() { "live" } else { "ended" },
        source.kind().as_str(),
        source.id()
    )
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn scripted_source_yields_then_ends() {
        let src = ScriptedSource::new(vec![silent_frame(), tone_frame(100)]);
        assert_eq!(src.recv().await.unwrap().energy(), 0.0);
        assert!(src.recv().await.unwrap().energy() > 0.0);
        assert!(matches!(src.recv().await, Err(TrackError::Ended)));
    }

    #[test]
    fn source_str_shape() {
        let src = ScriptedSource::new(vec![]);
        assert_eq!(source_str(&src), "live:audio:scripted");
    }
}
