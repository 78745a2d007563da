//! Audio output facade owned by the player.
//!
//! Holds at most one [`BufferedAudioOut`] and serializes open/pause/flush/close against
//! each other. Every call made without an open output is a no-op that reports `false`.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use skyplayer_types::AudioFormatInfo;

use crate::audio_out::{AudioCallback, AudioSpec, BufferedAudioOut};
use crate::buffer_queue::BufferQueue;
use crate::config::AudioOutConfig;

pub struct AudioOutHandler {
    config: AudioOutConfig,
    inner: Mutex<AudioOutState>,
}

struct AudioOutState {
    out: Option<BufferedAudioOut>,
    /// Last requested linear volume, re-applied to every new output.
    volume: (f32, f32),
}

impl AudioOutHandler {
    pub fn new(config: AudioOutConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(AudioOutState {
                out: None,
                volume: (1.0, 1.0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AudioOutState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new output on the configured sink, closing any previous one first.
    pub fn open_audio(&self, desired: &AudioSpec, callback: AudioCallback) -> Result<AudioSpec> {
        let config = self.config.clone();
        self.open_with(desired, callback, move |spec| {
            crate::buffer_queue::create_buffer_queue(spec, &config)
        })
    }

    /// [`open_audio`](Self::open_audio) with a caller-provided sink.
    pub fn open_with<F>(
        &self,
        desired: &AudioSpec,
        callback: AudioCallback,
        make_queue: F,
    ) -> Result<AudioSpec>
    where
        F: FnOnce(&AudioSpec) -> Result<Box<dyn BufferQueue>>,
    {
        // Engine threads are joined without the handler lock held.
        let previous = self.lock().out.take();
        if let Some(mut previous) = previous {
            tracing::warn!("open_audio with an output already open; closing it");
            previous.close();
        }

        let mut out = BufferedAudioOut::new(self.config.clone());
        let obtained = out.open_with(desired, callback, make_queue)?;

        let mut g = self.lock();
        let (left, right) = g.volume;
        if (left, right) != (1.0, 1.0) {
            out.set_volume(left, right);
        }
        let raced = g.out.replace(out);
        drop(g);
        if let Some(mut raced) = raced {
            raced.close();
        }
        Ok(obtained)
    }

    pub fn pause_audio(&self, on: bool) -> bool {
        match self.lock().out.as_ref() {
            Some(out) => {
                out.pause(on);
                true
            }
            None => false,
        }
    }

    pub fn flush_audio(&self) -> bool {
        match self.lock().out.as_ref() {
            Some(out) => {
                out.flush();
                true
            }
            None => false,
        }
    }

    /// Remember the volume and forward it to the open output, if any.
    pub fn set_volume(&self, left: f32, right: f32) -> bool {
        let mut g = self.lock();
        g.volume = (left, right);
        match g.out.as_ref() {
            Some(out) => {
                out.set_volume(left, right);
                true
            }
            None => false,
        }
    }

    pub fn volume(&self) -> (f32, f32) {
        self.lock().volume
    }

    pub fn is_open(&self) -> bool {
        self.lock().out.as_ref().is_some_and(BufferedAudioOut::is_open)
    }

    /// Snapshot of the open output's negotiated format.
    pub fn format_info(&self) -> Option<AudioFormatInfo> {
        let g = self.lock();
        let spec = g.out.as_ref()?.obtained()?;
        Some(AudioFormatInfo {
            sample_rate: spec.freq,
            channels: spec.channels,
            sample_format: spec.format.as_str().to_string(),
            bytes_per_buffer: spec.bytes_per_buffer,
            buffer_capacity: spec.buffer_capacity,
        })
    }

    /// Close and drop the output. Returns `false` if nothing was open.
    pub fn close_audio(&self) -> bool {
        let out = self.lock().out.take();
        match out {
            Some(mut out) => {
                out.close();
                true
            }
            None => false,
        }
    }

    /// Release everything. Idempotent.
    pub fn cleanup(&self) {
        if self.close_audio() {
            tracing::info!("audio output handler cleaned up");
        }
    }
}
