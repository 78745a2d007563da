//! Hardware buffer-queue abstraction.
//!
//! The audio engine never talks to a device API directly. It drives a [`BufferQueue`]:
//! a FIFO of filled byte buffers that the sink plays in order, signalling a
//! [`CompletionCallback`] each time one buffer has been consumed.
//!
//! Implementations:
//! - [`NullBufferQueue`]: consumes buffers in real time on a timer thread (headless use)
//! - [`CpalBufferQueue`](crate::cpal_queue::CpalBufferQueue): plays through a CPAL stream

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::audio_out::AudioSpec;
use crate::config::AudioOutConfig;
use crate::cpal_queue::CpalBufferQueue;

/// Fired on a sink-owned thread after a buffer has been played.
///
/// Must only wake the engine; it must not touch engine buffers.
pub type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

/// Transport state of the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Paused,
    Playing,
}

/// A device-side queue of audio buffers.
///
/// Implementations must invoke the completion callback without holding any lock
/// that `enqueue`/`queued`/`clear` also take.
pub trait BufferQueue: Send {
    /// Install the completion callback, replacing any previous one.
    fn register_callback(&mut self, callback: CompletionCallback) -> Result<()>;

    /// Number of buffers enqueued and not yet consumed.
    fn queued(&self) -> Result<usize>;

    /// Append one buffer. The bytes are copied.
    fn enqueue(&mut self, data: &[u8]) -> Result<()>;

    /// Drop every pending buffer without changing the play state.
    fn clear(&mut self) -> Result<()>;

    fn set_play_state(&mut self, state: PlayState) -> Result<()>;

    fn play_state(&self) -> PlayState;

    /// Attenuation in millibels (`0` = unity, [`i16::MIN`] = silent).
    fn set_volume_level(&mut self, millibel: i16) -> Result<()>;
}

/// Which sink an audio output should drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AudioOutType {
    /// The platform output device via CPAL.
    #[default]
    Cpal,
    /// Discards audio at real-time pace.
    Null,
}

impl AudioOutType {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioOutType::Cpal => "cpal",
            AudioOutType::Null => "null",
        }
    }
}

impl FromStr for AudioOutType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpal" | "device" => Ok(AudioOutType::Cpal),
            "null" | "none" => Ok(AudioOutType::Null),
            other => Err(anyhow!("unknown audio output type: {other}")),
        }
    }
}

/// Build the sink selected by `config.output` for the negotiated `spec`.
pub fn create_buffer_queue(
    spec: &AudioSpec,
    config: &AudioOutConfig,
) -> Result<Box<dyn BufferQueue>> {
    match config.output {
        AudioOutType::Null => Ok(Box::new(NullBufferQueue::new(spec.bytes_per_second())?)),
        AudioOutType::Cpal => Ok(Box::new(CpalBufferQueue::open(
            spec,
            config.device.as_deref(),
        )?)),
    }
}

/// Sink that "plays" buffers by waiting out their duration on a timer thread.
pub struct NullBufferQueue {
    shared: Arc<NullShared>,
    timer: Option<JoinHandle<()>>,
}

struct NullShared {
    state: Mutex<NullState>,
    cv: Condvar,
    bytes_per_second: u64,
}

struct NullState {
    pending: VecDeque<usize>,
    play: PlayState,
    callback: Option<CompletionCallback>,
    /// Bumped by `clear` so an in-flight wait does not consume a discarded buffer.
    generation: u64,
    consumed_bytes: u64,
    volume_mb: i16,
    shutdown: bool,
}

impl NullBufferQueue {
    pub fn new(bytes_per_second: u64) -> Result<Self> {
        if bytes_per_second == 0 {
            return Err(anyhow!("null sink needs a non-zero byte rate"));
        }
        let shared = Arc::new(NullShared {
            state: Mutex::new(NullState {
                pending: VecDeque::new(),
                play: PlayState::Stopped,
                callback: None,
                generation: 0,
                consumed_bytes: 0,
                volume_mb: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
            bytes_per_second,
        });
        let shared_timer = shared.clone();
        let timer = thread::Builder::new()
            .name("null-sink".to_string())
            .spawn(move || null_timer_loop(&shared_timer))?;
        Ok(Self {
            shared,
            timer: Some(timer),
        })
    }

    /// Total bytes consumed so far.
    pub fn consumed_bytes(&self) -> u64 {
        self.shared.lock().consumed_bytes
    }

    pub fn volume_level(&self) -> i16 {
        self.shared.lock().volume_mb
    }
}

impl NullShared {
    fn lock(&self) -> MutexGuard<'_, NullState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn play_time(&self, len: usize) -> Duration {
        let nanos = (len as u128 * 1_000_000_000) / self.bytes_per_second as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

fn null_timer_loop(shared: &NullShared) {
    let mut g = shared.lock();
    loop {
        if g.shutdown {
            return;
        }
        let next = match g.play {
            PlayState::Playing => g.pending.front().copied(),
            _ => None,
        };
        let Some(len) = next else {
            g = shared.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            continue;
        };

        let generation = g.generation;
        let (guard, timeout) = shared
            .cv
            .wait_timeout_while(g, shared.play_time(len), |s| {
                !s.shutdown && s.play == PlayState::Playing && s.generation == generation
            })
            .unwrap_or_else(PoisonError::into_inner);
        g = guard;
        if !timeout.timed_out() {
            continue;
        }

        g.pending.pop_front();
        g.consumed_bytes += len as u64;
        let callback = g.callback.clone();
        drop(g);
        if let Some(cb) = callback {
            cb();
        }
        g = shared.lock();
    }
}

impl BufferQueue for NullBufferQueue {
    fn register_callback(&mut self, callback: CompletionCallback) -> Result<()> {
        self.shared.lock().callback = Some(callback);
        Ok(())
    }

    fn queued(&self) -> Result<usize> {
        Ok(self.shared.lock().pending.len())
    }

    fn enqueue(&mut self, data: &[u8]) -> Result<()> {
        let mut g = self.shared.lock();
        if g.shutdown {
            return Err(anyhow!("null sink is shut down"));
        }
        g.pending.push_back(data.len());
        drop(g);
        self.shared.cv.notify_all();
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let mut g = self.shared.lock();
        g.pending.clear();
        g.generation = g.generation.wrapping_add(1);
        drop(g);
        self.shared.cv.notify_all();
        Ok(())
    }

    fn set_play_state(&mut self, state: PlayState) -> Result<()> {
        self.shared.lock().play = state;
        self.shared.cv.notify_all();
        Ok(())
    }

    fn play_state(&self) -> PlayState {
        self.shared.lock().play
    }

    fn set_volume_level(&mut self, millibel: i16) -> Result<()> {
        self.shared.lock().volume_mb = millibel;
        Ok(())
    }
}

impl Drop for NullBufferQueue {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.cv.notify_all();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}
