use std::time::Duration;

use crate::buffer_queue::AudioOutType;
use crate::engine::SeekMode;

/// Event queue sizing.
#[derive(Clone, Debug)]
pub struct MailboxConfig {
    /// Maximum queued events; `put` fails beyond this.
    pub capacity: usize,
    /// How long the worker sleeps between checks when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Audio output engine tuning.
#[derive(Clone, Debug)]
pub struct AudioOutConfig {
    /// Which hardware sink to drive.
    pub output: AudioOutType,
    /// Output device substring (CPAL only). `None` selects the default device.
    pub device: Option<String>,
    /// Number of slots kept in flight to the hardware queue.
    pub buffer_count: usize,
    /// Target duration of one slot in milliseconds.
    pub buffer_ms: u32,
    /// Upper bound on waiting for a completion signal when every slot is outstanding.
    pub completion_timeout: Duration,
    /// Request real-time scheduling for the engine thread.
    pub realtime: bool,
}

impl Default for AudioOutConfig {
    fn default() -> Self {
        Self {
            output: AudioOutType::Cpal,
            device: None,
            buffer_count: 4,
            buffer_ms: 10,
            completion_timeout: Duration::from_secs(1),
            realtime: true,
        }
    }
}

/// Top-level player configuration.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    pub mailbox: MailboxConfig,
    pub audio: AudioOutConfig,
    /// Start playback as soon as the engine reports it is prepared.
    pub auto_start_on_prepare: bool,
    /// Seek precision requested from the engine by `seek_to`.
    pub seek_mode: SeekMode,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            mailbox: MailboxConfig::default(),
            audio: AudioOutConfig::default(),
            auto_start_on_prepare: false,
            seek_mode: SeekMode::Accurate,
        }
    }
}
