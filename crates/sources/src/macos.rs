use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use nowplaying_bridge_core::{ArtistField, RawPlaybackEvent, RawRepeatState};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{change_signature, MediaSessionSource, SourceError};

const JXA_NOW_PLAYING: &str = r#"(() => {
  const music = Application('Music');
  if (!music.running()) {
    return JSON.stringify({ state: 'stopped' });
  }
  try {
    const state = music.playerState();
    if (state !== 'playing' && state !== 'paused') {
      return JSON.stringify({ state: 'stopped' });
    }
    const track = music.currentTrack;
    return JSON.stringify({
      state: state,
      title: track.name(),
      artist: track.artist(),
      album: track.album(),
      duration: track.duration(),
      position: music.playerPosition(),
      volume: music.soundVolume(),
      shuffle: music.shuffleEnabled(),
      repeat: music.songRepeat(),
    });
  } catch (e) {
    return JSON.stringify({ state: 'stopped', error: String(e) });
  }
})();
"#;

#[derive(Debug, Deserialize)]
struct JxaResult {
    state: String,
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    duration: Option<f64>,
    position: Option<f64>,
    volume: Option<f64>,
    shuffle: Option<bool>,
    repeat: Option<String>,
    error: Option<String>,
}

pub struct AppleMusicSource {
    poll: Duration,
    watcher: Option<JoinHandle<()>>,
}

impl AppleMusicSource {
    pub fn new(poll: Duration) -> Self {
        Self {
            poll,
            watcher: None,
        }
    }
}

#[async_trait]
impl MediaSessionSource for AppleMusicSource {
    fn name(&self) -> &'static str {
        "apple_music"
    }

    async fn subscribe(
        &mut self,
        events: mpsc::Sender<RawPlaybackEvent>,
    ) -> Result<(), SourceError> {
        if self.watcher.is_some() {
            return Ok(());
        }
        let poll = self.poll;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            let mut last: Option<RawPlaybackEvent> = None;
            loop {
                ticker.tick().await;
                let event = match query_state().await {
                    Ok(Some(event)) => event,
                    Ok(None) => {
                        last = None;
                        continue;
                    }
                    Err(err) => {
                        debug!(error = %err, "Apple Music state read failed");
                        continue;
                    }
                };
                let signature = change_signature(&event);
                if last.as_ref() == Some(&signature) {
                    continue;
                }
                last = Some(signature);
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });
        self.watcher = Some(handle);
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), SourceError> {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        Ok(())
    }

    async fn now_playing(&mut self) -> Result<Option<RawPlaybackEvent>, SourceError> {
        Ok(query_state().await?)
    }

    async fn play(&mut self) -> Result<(), SourceError> {
        run_applescript("tell application \"Music\" to play").await
    }

    async fn pause(&mut self) -> Result<(), SourceError> {
        run_applescript("tell application \"Music\" to pause").await
    }

    async fn next_track(&mut self) -> Result<(), SourceError> {
        run_applescript("tell application \"Music\" to next track").await
    }

    async fn previous_track(&mut self) -> Result<(), SourceError> {
        run_applescript("tell application \"Music\" to previous track").await
    }

    async fn seek_to(&mut self, position_secs: f64) -> Result<(), SourceError> {
        let script =
            format!("tell application \"Music\" to set player position to {position_secs:.3}");
        run_applescript(&script).await
    }

    async fn set_volume(&mut self, level: u8) -> Result<(), SourceError> {
        let script = format!(
            "tell application \"Music\" to set sound volume to {}",
            level.min(100)
        );
        run_applescript(&script).await
    }
}

async fn query_state() -> Result<Option<RawPlaybackEvent>> {
    let output = Command::new("osascript")
        .arg("-l")
        .arg("JavaScript")
        .arg("-e")
        .arg(JXA_NOW_PLAYING)
        .output()
        .await
        .context("failed to run osascript for Apple Music")?;

    if !output.status.success() {
        return Err(anyhow!(
            "osascript failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    let stdout = String::from_utf8(output.stdout).context("invalid UTF-8 from osascript")?;
    let parsed: JxaResult =
        serde_json::from_str(stdout.trim()).context("invalid JSON from Apple Music query")?;

    if let Some(err) = parsed.error {
        return Err(anyhow!("Apple Music query failed: {err}"));
    }
    if parsed.state != "playing" && parsed.state != "paused" {
        return Ok(None);
    }

    Ok(Some(RawPlaybackEvent {
        is_playing: parsed.state == "playing",
        volume: parsed.volume.map(|v| v.clamp(0.0, 100.0).round() as u8),
        shuffle_state: parsed.shuffle,
        repeat_state: parsed.repeat.as_deref().and_then(repeat_from_song_repeat),
        track_name: parsed.title,
        artist: parsed.artist.map(ArtistField::One),
        album: parsed.album,
        track_duration: parsed.duration,
        track_progress: parsed.position,
        can_change_volume: Some(true),
        can_skip: Some(true),
        thumbnail: None,
    }))
}

fn repeat_from_song_repeat(value: &str) -> Option<RawRepeatState> {
    match value {
        "off" => Some(RawRepeatState::Off),
        "all" => Some(RawRepeatState::All),
        "one" => Some(RawRepeatState::Track),
        _ => None,
    }
}

async fn run_applescript(script: &str) -> Result<(), SourceError> {
    let output = Command::new("osascript")
        .arg("-e")
        .arg(script)
        .output()
        .await
        .context("failed to run osascript for Apple Music")?;

    if !output.status.success() {
        return Err(SourceError::Backend(anyhow!(
            "osascript failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}
