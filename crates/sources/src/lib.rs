use std::time::Duration;

use async_trait::async_trait;
use nowplaying_bridge_core::RawPlaybackEvent;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no media session backend is available on this platform")]
    Unavailable,
    #[error("media session is not connected")]
    NotConnected,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait MediaSessionSource: Send {
    fn name(&self) -> &'static str;
    async fn subscribe(
        &mut self,
        events: mpsc::Sender<RawPlaybackEvent>,
    ) -> Result<(), SourceError>;
    async fn unsubscribe(&mut self) -> Result<(), SourceError>;
    async fn now_playing(&mut self) -> Result<Option<RawPlaybackEvent>, SourceError>;
    async fn play(&mut self) -> Result<(), SourceError>;
    async fn pause(&mut self) -> Result<(), SourceError>;
    async fn next_track(&mut self) -> Result<(), SourceError>;
    async fn previous_track(&mut self) -> Result<(), SourceError>;
    async fn seek_to(&mut self, position_secs: f64) -> Result<(), SourceError>;
    async fn set_volume(&mut self, level: u8) -> Result<(), SourceError>;
}

pub fn detect_source(
    priority: &[String],
    poll: Duration,
) -> Result<Box<dyn MediaSessionSource>, SourceError> {
    for item in priority {
        let source = match item.as_str() {
            "apple_music" => platform::apple_music_source(poll),
            "windows" => platform::windows_source(),
            "mpris" => platform::mpris_source(poll),
            other => {
                warn!(source = other, "unknown media session source in config");
                None
            }
        };
        if let Some(source) = source {
            return Ok(source);
        }
    }
    Err(SourceError::Unavailable)
}

// Progress moves on every poll and must not count as a change.
pub fn change_signature(event: &RawPlaybackEvent) -> RawPlaybackEvent {
    RawPlaybackEvent {
        track_progress: None,
        ..event.clone()
    }
}

mod platform {
    use super::MediaSessionSource;
    use std::time::Duration;

    #[cfg(target_os = "linux")]
    pub fn mpris_source(poll: Duration) -> Option<Box<dyn MediaSessionSource>> {
        Some(Box::new(crate::mpris::MprisSource::new(poll)))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn mpris_source(_poll: Duration) -> Option<Box<dyn MediaSessionSource>> {
        None
    }

    #[cfg(target_os = "macos")]
    pub fn apple_music_source(poll: Duration) -> Option<Box<dyn MediaSessionSource>> {
        Some(Box::new(crate::macos::AppleMusicSource::new(poll)))
    }

    #[cfg(not(target_os = "macos"))]
    pub fn apple_music_source(_poll: Duration) -> Option<Box<dyn MediaSessionSource>> {
        None
    }

    #[cfg(target_os = "windows")]
    pub fn windows_source() -> Option<Box<dyn MediaSessionSource>> {
        Some(Box::new(crate::windows::WindowsSessionSource::new()))
    }

    #[cfg(not(target_os = "windows"))]
    pub fn windows_source() -> Option<Box<dyn MediaSessionSource>> {
        None
    }
}

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "linux")]
mod mpris;
#[cfg(target_os = "windows")]
mod windows;
