use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use nowplaying_bridge_core::{ArtistField, RawPlaybackEvent, RawRepeatState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Str};
use zbus::{Connection, Proxy};

use crate::{change_signature, MediaSessionSource, SourceError};

const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";
const PLAYER_PATH: &str = "/org/mpris/MediaPlayer2";
const PLAYER_INTERFACE: &str = "org.mpris.MediaPlayer2.Player";

pub struct MprisSource {
    poll: Duration,
    conn: Option<Connection>,
    watcher: Option<JoinHandle<()>>,
}

impl MprisSource {
    pub fn new(poll: Duration) -> Self {
        Self {
            poll,
            conn: None,
            watcher: None,
        }
    }

    fn connection(&self) -> Result<&Connection, SourceError> {
        self.conn.as_ref().ok_or(SourceError::NotConnected)
    }

    async fn active_proxy(&self) -> Result<Proxy<'static>, SourceError> {
        let conn = self.connection()?;
        player_proxy(conn).await?.ok_or(SourceError::NotConnected)
    }

    async fn call_simple(&self, method: &str) -> Result<(), SourceError> {
        let proxy = self.active_proxy().await?;
        proxy
            .call::<_, _, ()>(method, &())
            .await
            .with_context(|| format!("mpris {method} call failed"))?;
        Ok(())
    }
}

#[async_trait]
impl MediaSessionSource for MprisSource {
    fn name(&self) -> &'static str {
        "mpris"
    }

    async fn subscribe(
        &mut self,
        events: mpsc::Sender<RawPlaybackEvent>,
    ) -> Result<(), SourceError> {
        if self.watcher.is_some() {
            return Ok(());
        }
        let conn = Connection::session()
            .await
            .context("failed to connect DBus session")?;

        let watcher_conn = conn.clone();
        let poll = self.poll;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            let mut last: Option<RawPlaybackEvent> = None;
            loop {
                ticker.tick().await;
                let event = match snapshot_event(&watcher_conn).await {
                    Ok(Some(event)) => event,
                    Ok(None) => {
                        last = None;
                        continue;
                    }
                    Err(err) => {
                        debug!(error = %err, "mpris state read failed");
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

        self.conn = Some(conn);
        self.watcher = Some(handle);
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), SourceError> {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.conn = None;
        Ok(())
    }

    async fn now_playing(&mut self) -> Result<Option<RawPlaybackEvent>, SourceError> {
        let conn = self.connection()?;
        Ok(snapshot_event(conn).await?)
    }

    async fn play(&mut self) -> Result<(), SourceError> {
        self.call_simple("Play").await
    }

    async fn pause(&mut self) -> Result<(), SourceError> {
        self.call_simple("Pause").await
    }

    async fn next_track(&mut self) -> Result<(), SourceError> {
        self.call_simple("Next").await
    }

    async fn previous_track(&mut self) -> Result<(), SourceError> {
        self.call_simple("Previous").await
    }

    async fn seek_to(&mut self, position_secs: f64) -> Result<(), SourceError> {
        let proxy = self.active_proxy().await?;
        let metadata: HashMap<String, OwnedValue> = proxy
            .get_property("Metadata")
            .await
            .context("mpris Metadata read failed")?;
        let track_id = metadata
            .get("mpris:trackid")
            .and_then(ov_to_object_path)
            .ok_or_else(|| SourceError::Backend(anyhow!("mpris session reports no track id")))?;

        let position_us = (position_secs * 1_000_000.0) as i64;
        proxy
            .call::<_, _, ()>("SetPosition", &(track_id, position_us))
            .await
            .context("mpris SetPosition call failed")?;
        Ok(())
    }

    async fn set_volume(&mut self, level: u8) -> Result<(), SourceError> {
        let proxy = self.active_proxy().await?;
        let volume = f64::from(level.min(100)) / 100.0;
        proxy
            .set_property("Volume", volume)
            .await
            .context("mpris Volume write failed")?;
        Ok(())
    }
}

async fn find_player(conn: &Connection) -> Result<Option<String>> {
    let proxy = Proxy::new(
        conn,
        "org.freedesktop.DBus",
        "/org/freedesktop/DBus",
        "org.freedesktop.DBus",
    )
    .await?;

    let names: Vec<String> = proxy.call("ListNames", &()).await?;
    let mut players: Vec<String> = names
        .into_iter()
        .filter(|n| n.starts_with(MPRIS_PREFIX))
        .collect();
    players.sort();
    Ok(players.into_iter().next())
}

async fn player_proxy(conn: &Connection) -> Result<Option<Proxy<'static>>> {
    let player = match find_player(conn).await? {
        Some(player) => player,
        None => return Ok(None),
    };
    let proxy = Proxy::new_owned(conn.clone(), player, PLAYER_PATH, PLAYER_INTERFACE).await?;
    Ok(Some(proxy))
}

async fn snapshot_event(conn: &Connection) -> Result<Option<RawPlaybackEvent>> {
    let proxy = match player_proxy(conn).await? {
        Some(proxy) => proxy,
        None => return Ok(None),
    };

    let status: String = proxy.get_property("PlaybackStatus").await?;
    if status == "Stopped" {
        return Ok(None);
    }

    let metadata: HashMap<String, OwnedValue> = proxy.get_property("Metadata").await?;

    let title = metadata.get("xesam:title").and_then(ov_to_string);
    let artists = metadata.get("xesam:artist").and_then(ov_to_string_list);
    let album = metadata.get("xesam:album").and_then(ov_to_string);
    let length_us = metadata.get("mpris:length").and_then(ov_to_i64);
    let art_url = metadata.get("mpris:artUrl").and_then(ov_to_string);

    let position_us: i64 = proxy.get_property("Position").await.unwrap_or(0);
    let volume: f64 = proxy.get_property("Volume").await.unwrap_or(1.0);
    let shuffle: Option<bool> = proxy.get_property("Shuffle").await.ok();
    let loop_status: Option<String> = proxy.get_property("LoopStatus").await.ok();
    let can_control: bool = proxy.get_property("CanControl").await.unwrap_or(false);
    let can_go_next: bool = proxy.get_property("CanGoNext").await.unwrap_or(false);

    Ok(Some(RawPlaybackEvent {
        is_playing: status == "Playing",
        volume: Some(volume_percent(volume)),
        shuffle_state: shuffle,
        repeat_state: loop_status.as_deref().and_then(repeat_from_loop_status),
        track_name: title,
        artist: artists.map(ArtistField::Many),
        album,
        track_duration: length_us.map(|us| us as f64 / 1_000_000.0),
        track_progress: (position_us > 0).then(|| position_us as f64 / 1_000_000.0),
        can_change_volume: Some(can_control),
        can_skip: Some(can_go_next),
        thumbnail: art_url,
    }))
}

fn volume_percent(volume: f64) -> u8 {
    (volume.clamp(0.0, 1.0) * 100.0).round() as u8
}

fn repeat_from_loop_status(status: &str) -> Option<RawRepeatState> {
    match status {
        "None" => Some(RawRepeatState::Off),
        "Playlist" => Some(RawRepeatState::All),
        "Track" => Some(RawRepeatState::Track),
        _ => None,
    }
}

fn ov_to_string(v: &OwnedValue) -> Option<String> {
    let owned = v.try_clone().ok()?;
    if let Ok(s) = String::try_from(owned.try_clone().ok()?) {
        return Some(s);
    }
    if let Ok(s) = Str::try_from(owned) {
        return Some(s.to_string());
    }
    None
}

fn ov_to_string_list(v: &OwnedValue) -> Option<Vec<String>> {
    let owned = v.try_clone().ok()?;
    Vec::<String>::try_from(owned).ok()
}

fn ov_to_i64(v: &OwnedValue) -> Option<i64> {
    if let Ok(i) = <i64>::try_from(v) {
        return Some(i);
    }
    if let Ok(u) = <u64>::try_from(v) {
        return Some(u as i64);
    }
    None
}

fn ov_to_object_path(v: &OwnedValue) -> Option<OwnedObjectPath> {
    let owned = v.try_clone().ok()?;
    OwnedObjectPath::try_from(owned).ok()
}
