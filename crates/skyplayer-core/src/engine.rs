//! Boundary between the player and a decode engine.
//!
//! The player drives a [`MediaEngine`] through [`MediaSession`] and hands each session an
//! [`EngineBridge`]. The bridge is the only way back into the player: it posts events to
//! the mailbox and forwards audio and video output to the handlers. It holds a weak
//! reference, so every call after release is a harmless no-op.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::audio_out::{AudioCallback, AudioSpec};
use crate::messages::{MSG_VIDEO_RENDERING_START, Message};
use crate::player::PlayerShared;
use crate::video::VideoFrame;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SeekMode {
    /// Decode forward from the preceding key frame up to the exact target.
    #[default]
    Accurate,
    /// Resume from the nearest key frame.
    Keyframe,
}

/// Opens media sources. One engine serves every prepare of a player.
pub trait MediaEngine: Send + Sync {
    /// Open `source` and return a session that starts paused.
    ///
    /// Called with the player's state lock held: the engine may use `bridge` from inside
    /// `open`, but must not call back into the player's control methods.
    fn open(&self, source: &str, bridge: EngineBridge) -> Result<Box<dyn MediaSession>>;
}

/// An opened source.
pub trait MediaSession: Send {
    fn toggle_pause(&mut self);

    fn is_paused(&self) -> bool;

    /// Request a seek. Completion is reported with `MSG_SEEK_COMPLETE`.
    fn seek(&mut self, position: Duration, mode: SeekMode);

    /// Playback position, if known.
    fn current_position(&self) -> Option<Duration>;

    fn duration(&self) -> Option<Duration>;

    /// Stop decoding and release engine resources. Called at most once.
    fn close(&mut self);
}

#[derive(Clone)]
pub struct EngineBridge {
    player: Weak<PlayerShared>,
}

impl EngineBridge {
    pub(crate) fn new(player: &Arc<PlayerShared>) -> Self {
        Self {
            player: Arc::downgrade(player),
        }
    }

    /// A bridge attached to nothing. Every call fails.
    pub fn detached() -> Self {
        Self { player: Weak::new() }
    }

    pub fn is_attached(&self) -> bool {
        self.player.strong_count() > 0
    }

    /// Post `what` to the player's mailbox.
    pub fn post(&self, what: i32, arg1: i32, arg2: i32) -> bool {
        self.post_message(Message::with_args(what, arg1, arg2))
    }

    pub fn post_message(&self, msg: Message) -> bool {
        match self.player.upgrade() {
            Some(p) => p.mailbox.put(msg),
            None => false,
        }
    }

    /// Render one frame on the current surface.
    ///
    /// The first frame rendered after each prepare posts `MSG_VIDEO_RENDERING_START`.
    pub fn display_image(&self, frame: &VideoFrame) -> bool {
        let Some(p) = self.player.upgrade() else {
            return false;
        };
        if !p.video.display_image(frame) {
            return false;
        }
        if !p.first_frame_rendered.swap(true, Ordering::AcqRel) {
            p.mailbox.put(Message::new(MSG_VIDEO_RENDERING_START));
        }
        true
    }

    /// Open the audio output. The returned spec is what the engine must produce.
    pub fn open_audio(&self, desired: &AudioSpec, callback: AudioCallback) -> Result<AudioSpec> {
        let p = self
            .player
            .upgrade()
            .ok_or_else(|| anyhow!("player released"))?;
        p.audio.open_audio(desired, callback)
    }

    pub fn pause_audio(&self, on: bool) -> bool {
        self.player.upgrade().is_some_and(|p| p.audio.pause_audio(on))
    }

    pub fn flush_audio(&self) -> bool {
        self.player.upgrade().is_some_and(|p| p.audio.flush_audio())
    }

    pub fn set_volume(&self, left: f32, right: f32) -> bool {
        self.player
            .upgrade()
            .is_some_and(|p| p.audio.set_volume(left, right))
    }

    pub fn close_audio(&self) -> bool {
        self.player.upgrade().is_some_and(|p| p.audio.close_audio())
    }
}
