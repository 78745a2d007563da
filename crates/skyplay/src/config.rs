use std::path::PathBuf;
use std::time::Duration;

pub use skyplayer_core::PlayerConfig;

#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub path: PathBuf,
    pub player: PlayerConfig,
    /// Linear gain applied to both channels, `0.0..=1.0`.
    pub volume: f32,
    /// Seek here once playback has started.
    pub seek_ms: Option<u64>,
    /// Zero disables periodic status lines.
    pub status_interval: Duration,
    /// Decoded audio buffered ahead of the output.
    pub decode_buffer_seconds: f32,
}
