pub mod config;
pub mod model;

pub use config::{AppConfig, ConfigIntervals};
pub use model::{
    ArtistField, NormalizedSnapshot, RawPlaybackEvent, RawRepeatState, RepeatMode,
    SupportedAction, TrackInfo, TrackPosition,
};
