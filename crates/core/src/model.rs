use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RawPlaybackEvent {
    pub is_playing: bool,
    pub volume: Option<u8>,
    pub shuffle_state: Option<bool>,
    pub repeat_state: Option<RawRepeatState>,
    pub track_name: Option<String>,
    pub artist: Option<ArtistField>,
    pub album: Option<String>,
    // Seconds or 100 ns ticks depending on the binding; the tracker decides.
    pub track_duration: Option<f64>,
    pub track_progress: Option<f64>,
    pub can_change_volume: Option<bool>,
    pub can_skip: Option<bool>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ArtistField {
    One(String),
    Many(Vec<String>),
}

impl ArtistField {
    pub fn to_list(&self) -> Vec<String> {
        match self {
            ArtistField::One(name) => vec![name.clone()],
            ArtistField::Many(names) => names.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RawRepeatState {
    Off,
    All,
    Track,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedSnapshot {
    pub is_playing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub track: TrackInfo,
    pub supported_actions: Vec<SupportedAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub name: String,
    pub artists: Vec<String>,
    pub album: String,
    pub duration: TrackPosition,
    pub thumbnail_base64: Option<String>,
    pub cover_art_data_uri: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrackPosition {
    pub current_ms: u64,
    pub total_ms: u64,
}

impl TrackPosition {
    pub fn advance(&mut self, step_ms: u64) {
        self.current_ms = self.current_ms.saturating_add(step_ms);
        self.clamp_to_total();
    }

    pub fn clamp_to_total(&mut self) {
        if self.total_ms > 0 && self.current_ms > self.total_ms {
            self.current_ms = self.total_ms;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    On,
    One,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SupportedAction {
    Play,
    Pause,
    Volume,
    Next,
    Previous,
    Seek,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_accepts_artist_string_or_list() {
        let single: RawPlaybackEvent =
            serde_json::from_str(r#"{"isPlaying":true,"trackName":"Song","artist":"Solo"}"#)
                .unwrap();
        assert_eq!(
            single.artist.as_ref().map(ArtistField::to_list),
            Some(vec!["Solo".to_string()])
        );

        let many: RawPlaybackEvent = serde_json::from_str(
            r#"{"isPlaying":false,"trackName":"Song","artist":["A","B"],"repeatState":"track"}"#,
        )
        .unwrap();
        assert_eq!(
            many.artist.as_ref().map(ArtistField::to_list),
            Some(vec!["A".to_string(), "B".to_string()])
        );
        assert_eq!(many.repeat_state, Some(RawRepeatState::Track));
    }

    #[test]
    fn raw_event_tolerates_missing_fields() {
        let event: RawPlaybackEvent = serde_json::from_str(r#"{"isPlaying":true}"#).unwrap();
        assert!(event.track_name.is_none());
        assert!(event.volume.is_none());
        assert!(event.thumbnail.is_none());
    }

    #[test]
    fn unrecognized_repeat_state_folds_to_unknown() {
        let event: RawPlaybackEvent =
            serde_json::from_str(r#"{"isPlaying":true,"repeatState":"shuffle-all"}"#).unwrap();
        assert_eq!(event.repeat_state, Some(RawRepeatState::Unknown));
    }

    #[test]
    fn snapshot_serializes_camel_case_and_omits_absent_volume() {
        let snapshot = NormalizedSnapshot {
            is_playing: true,
            volume: None,
            shuffle: false,
            repeat: RepeatMode::Off,
            track: TrackInfo {
                name: "Song".to_string(),
                artists: vec!["A".to_string()],
                album: String::new(),
                duration: TrackPosition {
                    current_ms: 1_000,
                    total_ms: 2_000,
                },
                thumbnail_base64: None,
                cover_art_data_uri: String::new(),
            },
            supported_actions: vec![SupportedAction::Play, SupportedAction::Pause],
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"isPlaying\":true"));
        assert!(json.contains("\"currentMs\":1000"));
        assert!(json.contains("\"thumbnailBase64\":null"));
        assert!(json.contains("\"supportedActions\":[\"play\",\"pause\"]"));
        assert!(!json.contains("volume"));
    }

    #[test]
    fn position_advance_clamps_to_known_total() {
        let mut position = TrackPosition {
            current_ms: 4_500,
            total_ms: 5_000,
        };
        position.advance(1_000);
        assert_eq!(position.current_ms, 5_000);

        let mut unbounded = TrackPosition {
            current_ms: 4_500,
            total_ms: 0,
        };
        unbounded.advance(1_000);
        assert_eq!(unbounded.current_ms, 5_500);
    }
}
