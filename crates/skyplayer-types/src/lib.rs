//! Value types shared between the playback core and host applications.
//!
//! Everything here is plain data: lifecycle states, host-facing event categories,
//! the info-code table carried by [`MediaEventType::Info`] events and the status
//! snapshot a host can poll at any time.

use serde::{Deserialize, Serialize};

/// Player lifecycle phase.
///
/// The integer codes are stable and are what hosts receive as the second argument of
/// an [`info::PLAYBACK_STATE_CHANGED`] event.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    #[default]
    Idle,
    Initialized,
    Preparing,
    Prepared,
    Started,
    Paused,
    Completed,
    Stopped,
    Error,
    /// Terminal state after `release`.
    End,
}

impl PlayerState {
    /// Stable integer code for this state.
    pub fn code(self) -> i32 {
        match self {
            PlayerState::Idle => 0,
            PlayerState::Initialized => 1,
            PlayerState::Preparing => 2,
            PlayerState::Prepared => 3,
            PlayerState::Started => 4,
            PlayerState::Paused => 5,
            PlayerState::Completed => 6,
            PlayerState::Stopped => 7,
            PlayerState::Error => 8,
            PlayerState::End => 9,
        }
    }

    /// Inverse of [`PlayerState::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        let state = match code {
            0 => PlayerState::Idle,
            1 => PlayerState::Initialized,
            2 => PlayerState::Preparing,
            3 => PlayerState::Prepared,
            4 => PlayerState::Started,
            5 => PlayerState::Paused,
            6 => PlayerState::Completed,
            7 => PlayerState::Stopped,
            8 => PlayerState::Error,
            9 => PlayerState::End,
            _ => return None,
        };
        Some(state)
    }

    /// Lowercase label used in logs and status output.
    pub fn as_str(self) -> &'static str {
        match self {
            PlayerState::Idle => "idle",
            PlayerState::Initialized => "initialized",
            PlayerState::Preparing => "preparing",
            PlayerState::Prepared => "prepared",
            PlayerState::Started => "started",
            PlayerState::Paused => "paused",
            PlayerState::Completed => "completed",
            PlayerState::Stopped => "stopped",
            PlayerState::Error => "error",
            PlayerState::End => "end",
        }
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-facing event category.
///
/// Internal event kinds are folded into these categories before delivery; see
/// [`info`] for the detail codes carried by `Info` and `Error` events.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaEventType {
    Prepared,
    PlaybackComplete,
    /// `arg1` = buffered percent or bytes, `arg2` = engine specific.
    BufferingUpdate,
    SeekComplete,
    /// `arg1` = width, `arg2` = height.
    VideoSizeChanged,
    /// `arg1`/`arg2` = engine error codes.
    Error,
    /// `arg1` = one of the [`info`] codes.
    Info,
    /// `arg1` = numerator, `arg2` = denominator.
    VideoSarChanged,
}

impl MediaEventType {
    /// Integer code understood by existing host bindings.
    pub fn code(self) -> i32 {
        match self {
            MediaEventType::Prepared => 1,
            MediaEventType::PlaybackComplete => 2,
            MediaEventType::BufferingUpdate => 3,
            MediaEventType::SeekComplete => 4,
            MediaEventType::VideoSizeChanged => 5,
            MediaEventType::Error => 100,
            MediaEventType::Info => 200,
            MediaEventType::VideoSarChanged => 10001,
        }
    }
}

/// Detail codes carried in `arg1` of [`MediaEventType::Info`] events.
pub mod info {
    pub const VIDEO_RENDERING_START: i32 = 3;
    pub const BUFFERING_START: i32 = 701;
    pub const BUFFERING_END: i32 = 702;
    pub const VIDEO_ROTATION_CHANGED: i32 = 10001;
    pub const AUDIO_RENDERING_START: i32 = 10002;
    pub const AUDIO_DECODED_START: i32 = 10003;
    pub const VIDEO_DECODED_START: i32 = 10004;
    pub const OPEN_INPUT: i32 = 10005;
    pub const FIND_STREAM_INFO: i32 = 10006;
    pub const COMPONENT_OPEN: i32 = 10007;
    /// Also used as `arg1` of an `Error` event when a decoder component fails to open.
    pub const COMPONENT_OPEN_ERR: i32 = 10008;
    pub const VIDEO_SEEK_RENDERING_START: i32 = 10009;
    pub const AUDIO_SEEK_RENDERING_START: i32 = 10010;
    pub const ACCURATE_SEEK_COMPLETE: i32 = 10100;
    /// `arg2` carries the new [`PlayerState`](crate::PlayerState) code.
    pub const PLAYBACK_STATE_CHANGED: i32 = 10200;
}

/// Codes carried in `arg1` of [`MediaEventType::Error`] events raised by the player.
///
/// Engines may post their own codes; these are the ones the core itself uses.
pub mod error {
    pub const UNKNOWN: i32 = 1;
    pub const IO: i32 = -1004;
    pub const MALFORMED: i32 = -1007;
    pub const UNSUPPORTED: i32 = -1010;
}

/// One event as delivered to the host.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaEvent {
    pub kind: MediaEventType,
    pub arg1: i32,
    pub arg2: i32,
}

/// Audio format negotiated with the output device.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioFormatInfo {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    pub channels: u16,
    /// Sample encoding label (`u8`, `s16`, `f32`).
    pub sample_format: String,
    /// Bytes in one hardware slot.
    pub bytes_per_buffer: usize,
    /// Total bytes across all slots.
    pub buffer_capacity: usize,
}

/// Point-in-time view of a player, suitable for printing or serving as JSON.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerStatus {
    pub state: PlayerState,
    /// Data source as passed to `set_data_source`.
    pub data_source: Option<String>,
    /// `true` while the lifecycle reports playing (prepared or started).
    pub playing: bool,
    /// Current position in milliseconds.
    pub position_ms: Option<u64>,
    /// Total duration in milliseconds.
    pub duration_ms: Option<u64>,
    pub video_width: Option<u32>,
    pub video_height: Option<u32>,
    /// Present while an audio output is open.
    pub audio: Option<AudioFormatInfo>,
    /// Set when playback completes; cleared by the next seek or prepare.
    pub restart_pending: bool,
    /// Events queued in the mailbox and not yet handled.
    pub pending_events: usize,
}
