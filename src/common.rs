/// Track/transport time in seconds.
pub type Seconds = f64;

/// A data revision identifier.
pub type VersionId = u64;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Hysteresis applied when deriving a note's pitch-row span from its bend
/// curve, so a microbend does not claim an extra pitch row. See `event::Note`.
pub const PITCH_SLOP_SEMITONES: f32 = 0.1;
