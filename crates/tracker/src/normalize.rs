use nowplaying_bridge_core::{
    NormalizedSnapshot, RawPlaybackEvent, RawRepeatState, RepeatMode, SupportedAction, TrackInfo,
    TrackPosition,
};

const SECONDS_UPPER_BOUND: f64 = 3_600.0;
const TICKS_PER_SECOND: f64 = 10_000_000.0;

// Applied once per raw value; interpolated positions are never re-classified.
pub fn raw_to_ms(value: f64) -> u64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    let seconds = if value > SECONDS_UPPER_BOUND {
        value / TICKS_PER_SECOND
    } else {
        value
    };
    (seconds * 1_000.0).round() as u64
}

pub fn normalize(
    event: &RawPlaybackEvent,
    thumbnail: Option<&[u8]>,
) -> Option<NormalizedSnapshot> {
    let name = event.track_name.as_deref().filter(|name| !name.is_empty())?;

    let mut duration = TrackPosition {
        current_ms: event.track_progress.map(raw_to_ms).unwrap_or(0),
        total_ms: event.track_duration.map(raw_to_ms).unwrap_or(0),
    };
    duration.clamp_to_total();

    let artists = event
        .artist
        .as_ref()
        .map(|artist| artist.to_list())
        .unwrap_or_default();

    let repeat = match event.repeat_state {
        Some(RawRepeatState::All) => RepeatMode::On,
        Some(RawRepeatState::Track) => RepeatMode::One,
        _ => RepeatMode::Off,
    };

    let mut supported_actions = vec![SupportedAction::Play, SupportedAction::Pause];
    if event.can_change_volume.unwrap_or(false) {
        supported_actions.push(SupportedAction::Volume);
    }
    if event.can_skip.unwrap_or(false) {
        supported_actions.extend([
            SupportedAction::Next,
            SupportedAction::Previous,
            SupportedAction::Seek,
        ]);
    }

    Some(NormalizedSnapshot {
        is_playing: event.is_playing,
        volume: event.volume,
        shuffle: event.shuffle_state.unwrap_or(false),
        repeat,
        track: TrackInfo {
            name: name.to_string(),
            artists,
            album: event.album.clone().unwrap_or_default(),
            duration,
            thumbnail_base64: thumbnail.map(nowplaying_bridge_artwork::to_base64),
            cover_art_data_uri: thumbnail
                .map(nowplaying_bridge_artwork::to_data_uri)
                .unwrap_or_default(),
        },
        supported_actions,
    })
}

pub fn identity_key(event: &RawPlaybackEvent) -> String {
    let artists = event
        .artist
        .as_ref()
        .map(|artist| artist.to_list().join(","))
        .unwrap_or_default();
    format!(
        "{}:{}:{}",
        event.track_name.as_deref().unwrap_or(""),
        event.album.as_deref().unwrap_or(""),
        artists
    )
}
