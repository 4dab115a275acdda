use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use nowplaying_bridge_core::{ArtistField, RawPlaybackEvent, RawRepeatState};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use windows::Foundation::TypedEventHandler;
use windows::Media::Control::{
    GlobalSystemMediaTransportControlsSession, GlobalSystemMediaTransportControlsSessionManager,
    GlobalSystemMediaTransportControlsSessionMediaProperties,
    GlobalSystemMediaTransportControlsSessionPlaybackStatus,
};
use windows::Media::MediaPlaybackAutoRepeatMode;
use windows::Storage::Streams::{DataReader, IRandomAccessStreamReference, InputStreamOptions};

use crate::{change_signature, MediaSessionSource, SourceError};

const TICKS_PER_SECOND: f64 = 10_000_000.0;

pub struct WindowsSessionSource {
    subscription: Option<Subscription>,
}

struct Subscription {
    shutdown: oneshot::Sender<()>,
    reader: JoinHandle<()>,
}

impl WindowsSessionSource {
    pub fn new() -> Self {
        Self { subscription: None }
    }
}

impl Default for WindowsSessionSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSessionSource for WindowsSessionSource {
    fn name(&self) -> &'static str {
        "windows"
    }

    async fn subscribe(
        &mut self,
        events: mpsc::Sender<RawPlaybackEvent>,
    ) -> Result<(), SourceError> {
        if self.subscription.is_some() {
            return Ok(());
        }

        let manager = request_manager()?;
        let (notify_tx, notify_rx) = mpsc::channel::<()>(8);
        let manager_token = {
            let notify = notify_tx.clone();
            manager
                .CurrentSessionChanged(&TypedEventHandler::new(move |_, _| {
                    let _ = notify.try_send(());
                    Ok(())
                }))
                .map_err(win_err)?
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let reader = tokio::spawn(run_reader(
            manager,
            manager_token,
            notify_tx,
            notify_rx,
            shutdown_rx,
            events,
        ));

        self.subscription = Some(Subscription {
            shutdown: shutdown_tx,
            reader,
        });
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), SourceError> {
        if let Some(subscription) = self.subscription.take() {
            let _ = subscription.shutdown.send(());
            if let Err(err) = subscription.reader.await {
                debug!(error = %err, "media session reader task ended abnormally");
            }
        }
        Ok(())
    }

    async fn now_playing(&mut self) -> Result<Option<RawPlaybackEvent>, SourceError> {
        let manager = request_manager()?;
        Ok(read_state(&manager)?)
    }

    async fn play(&mut self) -> Result<(), SourceError> {
        let session = current_session()?;
        let accepted = session.TryPlayAsync().map_err(win_err)?.get().map_err(win_err)?;
        ensure_accepted("play", accepted)
    }

    async fn pause(&mut self) -> Result<(), SourceError> {
        let session = current_session()?;
        let accepted = session
            .TryPauseAsync()
            .map_err(win_err)?
            .get()
            .map_err(win_err)?;
        ensure_accepted("pause", accepted)
    }

    async fn next_track(&mut self) -> Result<(), SourceError> {
        let session = current_session()?;
        let accepted = session
            .TrySkipNextAsync()
            .map_err(win_err)?
            .get()
            .map_err(win_err)?;
        ensure_accepted("next", accepted)
    }

    async fn previous_track(&mut self) -> Result<(), SourceError> {
        let session = current_session()?;
        let accepted = session
            .TrySkipPreviousAsync()
            .map_err(win_err)?
            .get()
            .map_err(win_err)?;
        ensure_accepted("previous", accepted)
    }

    async fn seek_to(&mut self, position_secs: f64) -> Result<(), SourceError> {
        let session = current_session()?;
        let ticks = (position_secs * TICKS_PER_SECOND) as i64;
        let accepted = session
            .TryChangePlaybackPositionAsync(ticks)
            .map_err(win_err)?
            .get()
            .map_err(win_err)?;
        ensure_accepted("seek", accepted)
    }

    async fn set_volume(&mut self, _level: u8) -> Result<(), SourceError> {
        Err(SourceError::Backend(anyhow!(
            "the Windows media session does not expose volume control"
        )))
    }
}

async fn run_reader(
    manager: GlobalSystemMediaTransportControlsSessionManager,
    manager_token: i64,
    notify_tx: mpsc::Sender<()>,
    mut notify_rx: mpsc::Receiver<()>,
    mut shutdown: oneshot::Receiver<()>,
    events: mpsc::Sender<RawPlaybackEvent>,
) {
    let mut handlers: Option<SessionHandlers> = None;
    let mut last: Option<RawPlaybackEvent> = None;

    // Sessions that existed before we subscribed never fire a change event,
    // so read once up front.
    sync_session(&manager, &notify_tx, &mut handlers);
    push_state(&manager, &mut last, &events).await;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            notified = notify_rx.recv() => {
                if notified.is_none() {
                    break;
                }
                // Collapse bursts; one read covers them all.
                while notify_rx.try_recv().is_ok() {}
                sync_session(&manager, &notify_tx, &mut handlers);
                push_state(&manager, &mut last, &events).await;
            }
        }
    }

    if let Some(handlers) = handlers.take() {
        detach_session(&handlers);
    }
    let _ = manager.RemoveCurrentSessionChanged(manager_token);
}

struct SessionHandlers {
    session: GlobalSystemMediaTransportControlsSession,
    tokens: (i64, i64, i64),
}

fn sync_session(
    manager: &GlobalSystemMediaTransportControlsSessionManager,
    notify: &mpsc::Sender<()>,
    handlers: &mut Option<SessionHandlers>,
) {
    let current = manager.GetCurrentSession().ok();
    let current_id = current.as_ref().map(session_id);
    let previous_id = handlers.as_ref().map(|h| session_id(&h.session));
    if current_id == previous_id {
        return;
    }

    if let Some(old) = handlers.take() {
        detach_session(&old);
    }
    if let Some(session) = current {
        match attach_session(&session, notify) {
            Ok(tokens) => *handlers = Some(SessionHandlers { session, tokens }),
            Err(err) => warn!(error = %err, "failed to attach media session handlers"),
        }
    }
}

fn session_id(session: &GlobalSystemMediaTransportControlsSession) -> String {
    session
        .SourceAppUserModelId()
        .map(|id| id.to_string_lossy())
        .unwrap_or_default()
}

fn attach_session(
    session: &GlobalSystemMediaTransportControlsSession,
    notify: &mpsc::Sender<()>,
) -> windows::core::Result<(i64, i64, i64)> {
    let tx_media = notify.clone();
    let tx_playback = notify.clone();
    let tx_timeline = notify.clone();
    Ok((
        session.MediaPropertiesChanged(&TypedEventHandler::new(move |_, _| {
            let _ = tx_media.try_send(());
            Ok(())
        }))?,
        session.PlaybackInfoChanged(&TypedEventHandler::new(move |_, _| {
            let _ = tx_playback.try_send(());
            Ok(())
        }))?,
        session.TimelinePropertiesChanged(&TypedEventHandler::new(move |_, _| {
            let _ = tx_timeline.try_send(());
            Ok(())
        }))?,
    ))
}

fn detach_session(handlers: &SessionHandlers) {
    let _ = handlers
        .session
        .RemoveMediaPropertiesChanged(handlers.tokens.0);
    let _ = handlers.session.RemovePlaybackInfoChanged(handlers.tokens.1);
    let _ = handlers
        .session
        .RemoveTimelinePropertiesChanged(handlers.tokens.2);
}

async fn push_state(
    manager: &GlobalSystemMediaTransportControlsSessionManager,
    last: &mut Option<RawPlaybackEvent>,
    events: &mpsc::Sender<RawPlaybackEvent>,
) {
    let event = match read_state(manager) {
        Ok(Some(event)) => event,
        Ok(None) => {
            *last = None;
            return;
        }
        Err(err) => {
            debug!(error = %err, "media session read failed");
            return;
        }
    };

    let signature = change_signature(&event);
    if last.as_ref() == Some(&signature) {
        return;
    }
    *last = Some(signature);
    let _ = events.send(event).await;
}

fn request_manager() -> Result<GlobalSystemMediaTransportControlsSessionManager, SourceError> {
    GlobalSystemMediaTransportControlsSessionManager::RequestAsync()
        .and_then(|op| op.get())
        .map_err(|err| SourceError::Backend(anyhow!("GSMTC manager unavailable: {err}")))
}

fn current_session() -> Result<GlobalSystemMediaTransportControlsSession, SourceError> {
    let manager = request_manager()?;
    manager
        .GetCurrentSession()
        .map_err(|_| SourceError::NotConnected)
}

fn read_state(
    manager: &GlobalSystemMediaTransportControlsSessionManager,
) -> Result<Option<RawPlaybackEvent>> {
    let session = match manager.GetCurrentSession() {
        Ok(session) => session,
        Err(_) => return Ok(None),
    };
    build_event(&session).map(Some)
}

fn build_event(session: &GlobalSystemMediaTransportControlsSession) -> Result<RawPlaybackEvent> {
    let props = session.TryGetMediaPropertiesAsync()?.get()?;
    let playback = session.GetPlaybackInfo()?;
    let timeline = session.GetTimelineProperties()?;
    let controls = playback.Controls()?;

    let title = props.Title()?.to_string_lossy();
    let artist = props.Artist()?.to_string_lossy();
    let album = props.AlbumTitle()?.to_string_lossy();

    let status = playback.PlaybackStatus()?;
    let is_playing = status == GlobalSystemMediaTransportControlsSessionPlaybackStatus::Playing;

    let shuffle = playback.IsShuffleActive().and_then(|r| r.Value()).ok();
    let repeat = playback
        .AutoRepeatMode()
        .and_then(|r| r.Value())
        .ok()
        .map(|mode| match mode {
            MediaPlaybackAutoRepeatMode::List => RawRepeatState::All,
            MediaPlaybackAutoRepeatMode::Track => RawRepeatState::Track,
            _ => RawRepeatState::Off,
        });

    // Timeline values stay in raw 100 ns ticks; the tracker normalizes.
    let duration_100ns = timeline.EndTime()?.Duration - timeline.StartTime()?.Duration;
    let position_100ns = timeline.Position()?.Duration;

    let thumbnail = match load_thumbnail(&props) {
        Ok(thumbnail) => thumbnail,
        Err(err) => {
            debug!(error = %err, "thumbnail stream read failed");
            None
        }
    };

    Ok(RawPlaybackEvent {
        is_playing,
        volume: None,
        shuffle_state: shuffle,
        repeat_state: repeat,
        track_name: (!title.is_empty()).then_some(title),
        artist: (!artist.is_empty()).then(|| ArtistField::One(artist)),
        album: (!album.is_empty()).then_some(album),
        track_duration: (duration_100ns > 0).then_some(duration_100ns as f64),
        track_progress: (position_100ns > 0).then_some(position_100ns as f64),
        can_change_volume: Some(false),
        can_skip: Some(controls.IsNextEnabled()?),
        thumbnail,
    })
}

fn load_thumbnail(
    props: &GlobalSystemMediaTransportControlsSessionMediaProperties,
) -> windows::core::Result<Option<String>> {
    let reference: IRandomAccessStreamReference = match props.Thumbnail() {
        Ok(reference) => reference,
        Err(_) => return Ok(None),
    };

    let stream = reference.OpenReadAsync()?.get()?;
    let mime = stream.ContentType()?.to_string_lossy();
    let input_stream = stream.GetInputStreamAt(0)?;
    let reader = DataReader::CreateDataReader(&input_stream)?;
    reader.SetInputStreamOptions(InputStreamOptions::Partial)?;

    let mut buffer = Vec::new();
    const CHUNK: u32 = 64 * 1024;
    loop {
        let loaded = reader.LoadAsync(CHUNK)?.get()?;
        if loaded == 0 {
            break;
        }
        let mut chunk = vec![0u8; loaded as usize];
        reader.ReadBytes(&mut chunk)?;
        buffer.extend_from_slice(&chunk);
        if loaded < CHUNK {
            break;
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }
    let mime = if mime.is_empty() {
        "image/jpeg".to_string()
    } else {
        mime
    };
    Ok(Some(format!(
        "data:{mime};base64,{}",
        STANDARD.encode(&buffer)
    )))
}

fn win_err(err: windows::core::Error) -> SourceError {
    SourceError::Backend(anyhow::Error::new(err))
}

fn ensure_accepted(command: &str, accepted: bool) -> Result<(), SourceError> {
    if accepted {
        Ok(())
    } else {
        Err(SourceError::Backend(anyhow!(
            "{command} was rejected by the media session"
        )))
    }
}
