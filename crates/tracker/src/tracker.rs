use std::sync::Arc;

use nowplaying_bridge_artwork::ArtworkResolver;
use nowplaying_bridge_core::{NormalizedSnapshot, RawPlaybackEvent, TrackPosition};
use nowplaying_bridge_sources::{MediaSessionSource, SourceError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::{ProgressClock, TICK_INTERVAL};
use crate::normalize::{identity_key, normalize};

const EVENT_BUFFER: usize = 32;
const MESSAGE_BUFFER: usize = 32;
const ARTWORK_BUFFER: usize = 8;
const SNAPSHOT_BUFFER: usize = 64;
const TICK_STEP_MS: u64 = TICK_INTERVAL.as_millis() as u64;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("media session source unavailable")]
    SourceUnavailable(#[source] SourceError),
}

enum TrackerMsg {
    Command(Command),
    Query(oneshot::Sender<Option<NormalizedSnapshot>>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Play,
    Pause,
    NextTrack,
    PreviousTrack,
    SeekTo { position_ms: u64 },
    SetVolume { level: u8 },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::NextTrack => "next",
            Self::PreviousTrack => "previous",
            Self::SeekTo { .. } => "seek",
            Self::SetVolume { .. } => "set_volume",
        }
    }
}

#[derive(Debug)]
pub struct PlaybackTracker {
    messages: mpsc::Sender<TrackerMsg>,
    snapshots: Option<broadcast::Sender<NormalizedSnapshot>>,
    actor: Option<JoinHandle<()>>,
}

impl PlaybackTracker {
    pub async fn setup(
        mut source: Box<dyn MediaSessionSource>,
        resolver: Arc<dyn ArtworkResolver>,
    ) -> Result<Self, TrackerError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        source
            .subscribe(events_tx)
            .await
            .map_err(TrackerError::SourceUnavailable)?;

        let initial = match source.now_playing().await {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "cold-start state query failed");
                None
            }
        };

        let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_BUFFER);
        let (snapshots_tx, _) = broadcast::channel(SNAPSHOT_BUFFER);
        // Both ends of the artwork channel live inside the actor, so the
        // handle's message channel is the only thing keeping it alive.
        let (artwork_tx, artwork_rx) = mpsc::channel(ARTWORK_BUFFER);

        let task = TrackerTask {
            source,
            resolver,
            events: events_rx,
            events_open: true,
            messages: messages_rx,
            artwork_tx,
            artwork_rx,
            snapshots: snapshots_tx.clone(),
            current: None,
            clock: ProgressClock::new(),
        };
        let actor = tokio::spawn(task.run(initial));

        Ok(Self {
            messages: messages_tx,
            snapshots: Some(snapshots_tx),
            actor: Some(actor),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NormalizedSnapshot> {
        match &self.snapshots {
            Some(snapshots) => snapshots.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub async fn current_snapshot(&self) -> Option<NormalizedSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .messages
            .send(TrackerMsg::Query(reply_tx))
            .await
            .is_err()
        {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    pub async fn play(&self) {
        self.send_command(Command::Play).await;
    }

    pub async fn pause(&self) {
        self.send_command(Command::Pause).await;
    }

    pub async fn next_track(&self) {
        self.send_command(Command::NextTrack).await;
    }

    pub async fn previous_track(&self) {
        self.send_command(Command::PreviousTrack).await;
    }

    pub async fn seek_to(&self, position_ms: u64) {
        self.send_command(Command::SeekTo { position_ms }).await;
    }

    pub async fn set_volume(&self, level: u8) {
        self.send_command(Command::SetVolume { level }).await;
    }

    async fn send_command(&self, command: Command) {
        // A closed channel means no actor; the command is dropped, not an error.
        let _ = self.messages.send(TrackerMsg::Command(command)).await;
    }

    pub async fn cleanup(&mut self) {
        self.snapshots = None;
        let _ = self.messages.send(TrackerMsg::Shutdown).await;
        if let Some(actor) = self.actor.take() {
            if let Err(err) = actor.await {
                debug!(error = %err, "tracker actor ended abnormally");
            }
        }
    }
}

struct CurrentPlayback {
    event: RawPlaybackEvent,
    key: String,
    position: TrackPosition,
    thumbnail: Option<Vec<u8>>,
}

struct TrackerTask {
    source: Box<dyn MediaSessionSource>,
    resolver: Arc<dyn ArtworkResolver>,
    events: mpsc::Receiver<RawPlaybackEvent>,
    events_open: bool,
    messages: mpsc::Receiver<TrackerMsg>,
    artwork_tx: mpsc::Sender<(String, Option<Vec<u8>>)>,
    artwork_rx: mpsc::Receiver<(String, Option<Vec<u8>>)>,
    snapshots: broadcast::Sender<NormalizedSnapshot>,
    current: Option<CurrentPlayback>,
    clock: ProgressClock,
}

impl TrackerTask {
    async fn run(mut self, initial: Option<RawPlaybackEvent>) {
        if let Some(event) = initial {
            self.on_source_event(event);
        }

        loop {
            tokio::select! {
                event = self.events.recv(), if self.events_open => match event {
                    Some(event) => self.on_source_event(event),
                    None => self.events_open = false,
                },
                message = self.messages.recv() => match message {
                    Some(TrackerMsg::Command(command)) => self.on_command(command).await,
                    Some(TrackerMsg::Query(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(TrackerMsg::Shutdown) | None => break,
                },
                result = self.artwork_rx.recv() => {
                    if let Some((key, bytes)) = result {
                        self.on_artwork(key, bytes);
                    }
                }
                _ = self.clock.tick() => self.on_tick(),
            }
        }

        self.clock.stop();
        if let Err(err) = self.source.unsubscribe().await {
            warn!(error = %err, "media session unsubscribe failed");
        }
    }

    fn on_source_event(&mut self, event: RawPlaybackEvent) {
        let Some(snapshot) = normalize(&event, None) else {
            debug!("dropping media event without a track name");
            return;
        };
        let key = identity_key(&event);
        let playing = event.is_playing;

        let identity_changed = self
            .current
            .as_ref()
            .map_or(true, |current| current.key != key);
        let thumbnail = if identity_changed {
            None
        } else {
            self.current.take().and_then(|current| current.thumbnail)
        };

        self.current = Some(CurrentPlayback {
            event,
            key: key.clone(),
            position: snapshot.track.duration,
            thumbnail,
        });

        // Emission for a new identity waits for the artwork result.
        if identity_changed {
            self.spawn_artwork_fetch(key);
        } else {
            self.emit();
        }

        // Restarting keeps the next tick a full second behind the source position.
        if playing {
            self.clock.start();
        } else {
            self.clock.stop();
        }
    }

    fn spawn_artwork_fetch(&self, key: String) {
        let reference = self
            .current
            .as_ref()
            .and_then(|current| current.event.thumbnail.clone());
        let resolver = Arc::clone(&self.resolver);
        let results = self.artwork_tx.clone();
        tokio::spawn(async move {
            let bytes = resolver.resolve(reference.as_deref()).await;
            let _ = results.send((key, bytes)).await;
        });
    }

    fn on_artwork(&mut self, key: String, bytes: Option<Vec<u8>>) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        if current.key != key {
            debug!("discarding artwork for a superseded track");
            return;
        }
        current.thumbnail = bytes;
        self.emit();
    }

    fn on_tick(&mut self) {
        match self.current.as_mut() {
            Some(current) if current.event.is_playing => {
                current.position.advance(TICK_STEP_MS);
                self.emit();
            }
            _ => self.clock.stop(),
        }
    }

    async fn on_command(&mut self, command: Command) {
        let result = match command {
            Command::Play => self.source.play().await,
            Command::Pause => self.source.pause().await,
            Command::NextTrack => self.source.next_track().await,
            Command::PreviousTrack => self.source.previous_track().await,
            Command::SeekTo { position_ms } => {
                self.source.seek_to(position_ms as f64 / 1_000.0).await
            }
            Command::SetVolume { level } => self.source.set_volume(level).await,
        };
        if let Err(err) = result {
            warn!(command = command.name(), error = %err, "media session command failed");
            return;
        }

        // Local mutations only after the native call succeeds; the next
        // source event corrects any divergence.
        match command {
            Command::Play => {
                if let Some(current) = self.current.as_mut() {
                    current.event.is_playing = true;
                    self.clock.start();
                    self.emit();
                }
            }
            Command::Pause => {
                if let Some(current) = self.current.as_mut() {
                    current.event.is_playing = false;
                }
                self.clock.stop();
                self.emit();
            }
            Command::SeekTo { position_ms } => {
                if let Some(current) = self.current.as_mut() {
                    current.position.current_ms = position_ms;
                    current.position.clamp_to_total();
                    self.emit();
                }
            }
            Command::NextTrack | Command::PreviousTrack | Command::SetVolume { .. } => {}
        }
    }

    fn snapshot(&self) -> Option<NormalizedSnapshot> {
        let current = self.current.as_ref()?;
        let mut snapshot = normalize(&current.event, current.thumbnail.as_deref())?;
        snapshot.track.duration = current.position;
        Some(snapshot)
    }

    fn emit(&self) {
        if let Some(snapshot) = self.snapshot() {
            let _ = self.snapshots.send(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nowplaying_bridge_core::ArtistField;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct SourceProbe {
        calls: Arc<Mutex<Vec<String>>>,
        events: Arc<Mutex<Option<mpsc::Sender<RawPlaybackEvent>>>>,
    }

    impl SourceProbe {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn push(&self, event: RawPlaybackEvent) {
            let sender = self
                .events
                .lock()
                .unwrap()
                .clone()
                .expect("source was never subscribed");
            sender.send(event).await.expect("event channel closed");
        }
    }

    struct MockSource {
        probe: SourceProbe,
        initial: Option<RawPlaybackEvent>,
        fail_commands: bool,
    }

    impl MockSource {
        fn create(
            initial: Option<RawPlaybackEvent>,
            fail_commands: bool,
        ) -> (Box<Self>, SourceProbe) {
            let probe = SourceProbe::default();
            let source = Box::new(Self {
                probe: probe.clone(),
                initial,
                fail_commands,
            });
            (source, probe)
        }

        fn record(&self, call: impl Into<String>) -> Result<(), SourceError> {
            self.probe.calls.lock().unwrap().push(call.into());
            if self.fail_commands {
                Err(SourceError::Backend(anyhow::anyhow!("command refused")))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl MediaSessionSource for MockSource {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn subscribe(
            &mut self,
            events: mpsc::Sender<RawPlaybackEvent>,
        ) -> Result<(), SourceError> {
            *self.probe.events.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn unsubscribe(&mut self) -> Result<(), SourceError> {
            self.probe.calls.lock().unwrap().push("unsubscribe".into());
            Ok(())
        }

        async fn now_playing(&mut self) -> Result<Option<RawPlaybackEvent>, SourceError> {
            Ok(self.initial.take())
        }

        async fn play(&mut self) -> Result<(), SourceError> {
            self.record("play")
        }

        async fn pause(&mut self) -> Result<(), SourceError> {
            self.record("pause")
        }

        async fn next_track(&mut self) -> Result<(), SourceError> {
            self.record("next")
        }

        async fn previous_track(&mut self) -> Result<(), SourceError> {
            self.record("previous")
        }

        async fn seek_to(&mut self, position_secs: f64) -> Result<(), SourceError> {
            self.record(format!("seek:{position_secs}"))
        }

        async fn set_volume(&mut self, level: u8) -> Result<(), SourceError> {
            self.record(format!("volume:{level}"))
        }
    }

    struct UnavailableSource;

    #[async_trait]
    impl MediaSessionSource for UnavailableSource {
        fn name(&self) -> &'static str {
            "unavailable"
        }

        async fn subscribe(
            &mut self,
            _events: mpsc::Sender<RawPlaybackEvent>,
        ) -> Result<(), SourceError> {
            Err(SourceError::Unavailable)
        }

        async fn unsubscribe(&mut self) -> Result<(), SourceError> {
            Ok(())
        }

        async fn now_playing(&mut self) -> Result<Option<RawPlaybackEvent>, SourceError> {
            Ok(None)
        }

        async fn play(&mut self) -> Result<(), SourceError> {
            Ok(())
        }

        async fn pause(&mut self) -> Result<(), SourceError> {
            Ok(())
        }

        async fn next_track(&mut self) -> Result<(), SourceError> {
            Ok(())
        }

        async fn previous_track(&mut self) -> Result<(), SourceError> {
            Ok(())
        }

        async fn seek_to(&mut self, _position_secs: f64) -> Result<(), SourceError> {
            Ok(())
        }

        async fn set_volume(&mut self, _level: u8) -> Result<(), SourceError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockResolver {
        delays: HashMap<String, Duration>,
        failures: HashSet<String>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ArtworkResolver for MockResolver {
        async fn resolve(&self, reference: Option<&str>) -> Option<Vec<u8>> {
            let reference = reference?;
            self.seen.lock().unwrap().push(reference.to_string());
            if let Some(delay) = self.delays.get(reference) {
                tokio::time::sleep(*delay).await;
            }
            if self.failures.contains(reference) {
                return None;
            }
            Some(reference.as_bytes().to_vec())
        }
    }

    fn plain_resolver() -> Arc<MockResolver> {
        Arc::new(MockResolver::default())
    }

    fn playing_event(name: &str, progress_secs: f64) -> RawPlaybackEvent {
        RawPlaybackEvent {
            is_playing: true,
            track_name: Some(name.to_string()),
            artist: Some(ArtistField::One("Artist".to_string())),
            album: Some("Album".to_string()),
            track_duration: Some(200.0),
            track_progress: Some(progress_secs),
            can_skip: Some(true),
            ..RawPlaybackEvent::default()
        }
    }

    fn paused_event(name: &str, progress_secs: f64) -> RawPlaybackEvent {
        RawPlaybackEvent {
            is_playing: false,
            ..playing_event(name, progress_secs)
        }
    }

    async fn next_snapshot(
        snapshots: &mut broadcast::Receiver<NormalizedSnapshot>,
    ) -> NormalizedSnapshot {
        timeout(Duration::from_secs(5), snapshots.recv())
            .await
            .expect("timed out waiting for a snapshot")
            .expect("snapshot channel closed")
    }

    async fn assert_no_snapshot(
        snapshots: &mut broadcast::Receiver<NormalizedSnapshot>,
        window: Duration,
    ) {
        let result = timeout(window, snapshots.recv()).await;
        assert!(result.is_err(), "unexpected snapshot: {result:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_publishes_existing_state() {
        let (source, _probe) = MockSource::create(Some(playing_event("Song", 50.0)), false);
        let mut tracker = PlaybackTracker::setup(source, plain_resolver())
            .await
            .unwrap();
        let mut snapshots = tracker.subscribe();

        let snapshot = next_snapshot(&mut snapshots).await;
        assert_eq!(snapshot.track.name, "Song");
        assert_eq!(snapshot.track.duration.current_ms, 50_000);
        assert_eq!(snapshot.track.duration.total_ms, 200_000);
        assert!(snapshot.is_playing);

        let pulled = tracker.current_snapshot().await;
        assert_eq!(pulled.map(|s| s.track.name), Some("Song".to_string()));

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn clock_interpolates_between_source_events() {
        let (source, probe) = MockSource::create(None, false);
        let mut tracker = PlaybackTracker::setup(source, plain_resolver())
            .await
            .unwrap();
        let mut snapshots = tracker.subscribe();

        probe.push(playing_event("Song", 50.0)).await;
        assert_eq!(next_snapshot(&mut snapshots).await.track.duration.current_ms, 50_000);
        for expected in [51_000, 52_000, 53_000] {
            let snapshot = next_snapshot(&mut snapshots).await;
            assert_eq!(snapshot.track.duration.current_ms, expected);
            assert_eq!(snapshot.track.duration.total_ms, 200_000);
        }

        // Fresh source state supersedes the interpolated position.
        probe.push(playing_event("Song", 170.0)).await;
        assert_eq!(next_snapshot(&mut snapshots).await.track.duration.current_ms, 170_000);
        assert_eq!(next_snapshot(&mut snapshots).await.track.duration.current_ms, 171_000);

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_clamp_at_the_track_end() {
        let (source, probe) = MockSource::create(None, false);
        let mut tracker = PlaybackTracker::setup(source, plain_resolver())
            .await
            .unwrap();
        let mut snapshots = tracker.subscribe();

        let mut event = playing_event("Short", 3.0);
        event.track_duration = Some(5.0);
        probe.push(event).await;

        for expected in [3_000, 4_000, 5_000, 5_000, 5_000] {
            assert_eq!(
                next_snapshot(&mut snapshots).await.track.duration.current_ms,
                expected
            );
        }

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_applies_optimistically_and_stops_the_clock() {
        let (source, probe) = MockSource::create(None, false);
        let mut tracker = PlaybackTracker::setup(source, plain_resolver())
            .await
            .unwrap();
        let mut snapshots = tracker.subscribe();

        probe.push(playing_event("Song", 50.0)).await;
        assert!(next_snapshot(&mut snapshots).await.is_playing);

        tracker.pause().await;
        let snapshot = next_snapshot(&mut snapshots).await;
        assert!(!snapshot.is_playing);
        assert_eq!(snapshot.track.duration.current_ms, 50_000);

        assert!(probe.calls().contains(&"pause".to_string()));
        assert_no_snapshot(&mut snapshots, Duration::from_millis(3_500)).await;

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn play_resumes_the_clock_on_a_paused_track() {
        let (source, probe) = MockSource::create(None, false);
        let mut tracker = PlaybackTracker::setup(source, plain_resolver())
            .await
            .unwrap();
        let mut snapshots = tracker.subscribe();

        probe.push(paused_event("Song", 50.0)).await;
        assert!(!next_snapshot(&mut snapshots).await.is_playing);

        tracker.play().await;
        let snapshot = next_snapshot(&mut snapshots).await;
        assert!(snapshot.is_playing);
        assert_eq!(snapshot.track.duration.current_ms, 50_000);
        assert_eq!(next_snapshot(&mut snapshots).await.track.duration.current_ms, 51_000);

        assert!(probe.calls().contains(&"play".to_string()));

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commands_leave_state_untouched() {
        let (source, probe) = MockSource::create(None, true);
        let mut tracker = PlaybackTracker::setup(source, plain_resolver())
            .await
            .unwrap();
        let mut snapshots = tracker.subscribe();

        probe.push(paused_event("Song", 50.0)).await;
        assert!(!next_snapshot(&mut snapshots).await.is_playing);

        tracker.play().await;
        assert_no_snapshot(&mut snapshots, Duration::from_millis(3_500)).await;

        assert!(probe.calls().contains(&"play".to_string()));
        let pulled = tracker.current_snapshot().await.unwrap();
        assert!(!pulled.is_playing);

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn seek_converts_to_seconds_and_emits_clamped() {
        let (source, probe) = MockSource::create(None, false);
        let mut tracker = PlaybackTracker::setup(source, plain_resolver())
            .await
            .unwrap();
        let mut snapshots = tracker.subscribe();

        probe.push(playing_event("Song", 50.0)).await;
        assert_eq!(next_snapshot(&mut snapshots).await.track.duration.current_ms, 50_000);

        tracker.seek_to(120_000).await;
        assert_eq!(next_snapshot(&mut snapshots).await.track.duration.current_ms, 120_000);

        tracker.seek_to(500_000).await;
        assert_eq!(next_snapshot(&mut snapshots).await.track.duration.current_ms, 200_000);

        let calls = probe.calls();
        assert!(calls.contains(&"seek:120".to_string()));
        assert!(calls.contains(&"seek:500".to_string()));

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn skip_and_volume_forward_without_local_mutation() {
        let (source, probe) = MockSource::create(None, false);
        let mut tracker = PlaybackTracker::setup(source, plain_resolver())
            .await
            .unwrap();
        let mut snapshots = tracker.subscribe();

        probe.push(paused_event("Song", 50.0)).await;
        next_snapshot(&mut snapshots).await;

        tracker.next_track().await;
        tracker.set_volume(30).await;
        assert_no_snapshot(&mut snapshots, Duration::from_millis(3_500)).await;

        assert_eq!(
            probe.calls(),
            vec!["next".to_string(), "volume:30".to_string()]
        );

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn nameless_events_are_dropped_silently() {
        let (source, probe) = MockSource::create(None, false);
        let mut tracker = PlaybackTracker::setup(source, plain_resolver())
            .await
            .unwrap();
        let mut snapshots = tracker.subscribe();

        probe.push(paused_event("Song", 50.0)).await;
        next_snapshot(&mut snapshots).await;

        let mut nameless = playing_event("ignored", 0.0);
        nameless.track_name = None;
        probe.push(nameless).await;
        let mut empty = playing_event("", 0.0);
        empty.track_name = Some(String::new());
        probe.push(empty).await;

        assert_no_snapshot(&mut snapshots, Duration::from_millis(3_500)).await;

        let pulled = tracker.current_snapshot().await.unwrap();
        assert_eq!(pulled.track.name, "Song");
        assert!(!pulled.is_playing);

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn artwork_is_fetched_once_per_track_identity() {
        let (source, probe) = MockSource::create(None, false);
        let resolver = plain_resolver();
        let seen = Arc::clone(&resolver.seen);
        let mut tracker = PlaybackTracker::setup(source, resolver).await.unwrap();
        let mut snapshots = tracker.subscribe();

        let mut event = paused_event("Song", 50.0);
        event.thumbnail = Some("https://cdn.example/cover.png".to_string());
        probe.push(event.clone()).await;

        let first = next_snapshot(&mut snapshots).await;
        assert!(first.track.thumbnail_base64.is_some());
        assert!(first.track.cover_art_data_uri.starts_with("data:"));

        event.track_progress = Some(60.0);
        probe.push(event).await;
        let second = next_snapshot(&mut snapshots).await;
        assert_eq!(second.track.duration.current_ms, 60_000);
        assert_eq!(second.track.thumbnail_base64, first.track.thumbnail_base64);

        assert_eq!(
            seen.lock().unwrap().clone(),
            vec!["https://cdn.example/cover.png".to_string()]
        );

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn identical_events_emit_identical_snapshots() {
        let (source, probe) = MockSource::create(None, false);
        let resolver = plain_resolver();
        let seen = Arc::clone(&resolver.seen);
        let mut tracker = PlaybackTracker::setup(source, resolver).await.unwrap();
        let mut snapshots = tracker.subscribe();

        let mut event = paused_event("Song", 50.0);
        event.thumbnail = Some("art".to_string());
        probe.push(event.clone()).await;
        let first = next_snapshot(&mut snapshots).await;

        probe.push(event).await;
        let second = next_snapshot(&mut snapshots).await;

        assert_eq!(second.track, first.track);
        assert_eq!(seen.lock().unwrap().len(), 1);

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_artwork_still_emits_the_snapshot() {
        let (source, probe) = MockSource::create(None, false);
        let resolver = Arc::new(MockResolver {
            failures: HashSet::from(["bad-ref".to_string()]),
            ..Default::default()
        });
        let mut tracker = PlaybackTracker::setup(source, resolver).await.unwrap();
        let mut snapshots = tracker.subscribe();

        let mut event = paused_event("Song", 50.0);
        event.thumbnail = Some("bad-ref".to_string());
        probe.push(event).await;

        let snapshot = next_snapshot(&mut snapshots).await;
        assert_eq!(snapshot.track.name, "Song");
        assert!(snapshot.track.thumbnail_base64.is_none());
        assert!(snapshot.track.cover_art_data_uri.is_empty());

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_artwork_never_overwrites_a_newer_track() {
        let (source, probe) = MockSource::create(None, false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let resolver = Arc::new(MockResolver {
            delays: HashMap::from([("art-a".to_string(), Duration::from_secs(5))]),
            seen: Arc::clone(&seen),
            ..Default::default()
        });
        let mut tracker = PlaybackTracker::setup(source, resolver).await.unwrap();
        let mut snapshots = tracker.subscribe();

        let mut first = playing_event("First", 10.0);
        first.thumbnail = Some("art-a".to_string());
        probe.push(first).await;
        let mut second = paused_event("Second", 0.0);
        second.thumbnail = Some("art-b".to_string());
        probe.push(second).await;

        // Only the newer track is ever published, with its own artwork.
        let snapshot = next_snapshot(&mut snapshots).await;
        assert_eq!(snapshot.track.name, "Second");
        assert_eq!(
            snapshot.track.thumbnail_base64.as_deref(),
            Some(nowplaying_bridge_artwork::to_base64(b"art-b").as_str())
        );

        // The delayed fetch for the superseded track resolves inside this
        // window and must be discarded without an emission.
        assert_no_snapshot(&mut snapshots, Duration::from_secs(8)).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&"art-a".to_string()));
        assert!(seen.contains(&"art-b".to_string()));

        tracker.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_is_idempotent_and_detaches_everything() {
        let (source, probe) = MockSource::create(Some(paused_event("Song", 50.0)), false);
        let mut tracker = PlaybackTracker::setup(source, plain_resolver())
            .await
            .unwrap();
        let mut snapshots = tracker.subscribe();
        next_snapshot(&mut snapshots).await;

        tracker.cleanup().await;
        tracker.cleanup().await;

        tracker.play().await;
        assert!(tracker.current_snapshot().await.is_none());
        assert!(matches!(
            snapshots.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(
            tracker.subscribe().recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        assert_eq!(probe.calls(), vec!["unsubscribe".to_string()]);
    }

    #[tokio::test]
    async fn setup_surfaces_source_unavailability() {
        let err = PlaybackTracker::setup(Box::new(UnavailableSource), plain_resolver())
            .await
            .expect_err("setup must fail without a usable source");
        assert!(matches!(
            err,
            TrackerError::SourceUnavailable(SourceError::Unavailable)
        ));
    }
}
