mod clock;
mod normalize;
mod tracker;

pub use normalize::{identity_key, normalize, raw_to_ms};
pub use tracker::{PlaybackTracker, TrackerError};
