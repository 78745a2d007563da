//! Bounded PCM byte FIFO between the decode thread and the audio producer callback.
//!
//! - the decoder pushes little-endian S16 bytes and blocks while the FIFO is full
//! - the audio engine pops without blocking and pads the rest of its buffer with silence
//! - `flush()` drops everything queued and interrupts a blocked push, so a seek never
//!   waits behind stale audio
//!
//! The FIFO also tracks the playback position as bytes handed to the audio engine since
//! the last [`PcmFifo::set_position`].

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub struct PcmFifo {
    inner: Mutex<FifoInner>,
    cv: Condvar,
    capacity: usize,
    bytes_per_second: u64,
}

struct FifoInner {
    queue: VecDeque<u8>,
    /// Bumped by every flush; a push that started under an older generation gives up.
    generation: u64,
    /// Producer reached end of stream.
    eos: bool,
    shutdown: bool,
    position_bytes: u64,
}

/// Outcome of [`PcmFifo::pop_into`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Popped {
    pub bytes: usize,
    pub generation: u64,
}

/// Size the FIFO for `seconds` of audio, in whole frames.
pub fn calc_capacity_bytes(bytes_per_second: u64, bytes_per_frame: usize, seconds: f32) -> usize {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        1.0
    };
    let frame = bytes_per_frame.max(1);
    let bytes = (bytes_per_second as f32 * secs).ceil() as usize;
    (bytes / frame).max(1) * frame
}

impl PcmFifo {
    pub fn new(capacity: usize, bytes_per_second: u64) -> Self {
        Self {
            inner: Mutex::new(FifoInner {
                queue: VecDeque::with_capacity(capacity),
                generation: 0,
                eos: false,
                shutdown: false,
                position_bytes: 0,
            }),
            cv: Condvar::new(),
            capacity: capacity.max(1),
            bytes_per_second: bytes_per_second.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FifoInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Append `data`, blocking while full.
    ///
    /// Returns `false` if the FIFO was flushed or shut down before everything fit; the
    /// rest of `data` is dropped.
    pub fn push_blocking(&self, data: &[u8]) -> bool {
        let mut g = self.lock();
        let generation = g.generation;
        let mut offset = 0;
        while offset < data.len() {
            while g.queue.len() >= self.capacity && !g.shutdown && g.generation == generation {
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            }
            if g.shutdown || g.generation != generation {
                return false;
            }
            let room = self.capacity - g.queue.len();
            let take = room.min(data.len() - offset);
            g.queue.extend(&data[offset..offset + take]);
            offset += take;
        }
        true
    }

    /// Fill `out` from the FIFO, padding with `silence`. Never blocks on the producer.
    pub fn pop_into(&self, out: &mut [u8], silence: u8) -> Popped {
        let mut g = self.lock();
        let n = g.queue.len().min(out.len());
        for (dst, src) in out[..n].iter_mut().zip(g.queue.drain(..n)) {
            *dst = src;
        }
        g.position_bytes += n as u64;
        let generation = g.generation;
        drop(g);
        out[n..].fill(silence);
        if n > 0 {
            self.cv.notify_all();
        }
        Popped {
            bytes: n,
            generation,
        }
    }

    /// Drop queued audio and interrupt a blocked producer.
    pub fn flush(&self) -> usize {
        let mut g = self.lock();
        let dropped = g.queue.len();
        g.queue.clear();
        g.generation += 1;
        g.eos = false;
        drop(g);
        self.cv.notify_all();
        dropped
    }

    pub fn set_eos(&self) {
        self.lock().eos = true;
        self.cv.notify_all();
    }

    /// End of stream reached and every byte handed to the audio engine.
    pub fn is_drained(&self) -> bool {
        let g = self.lock();
        g.eos && g.queue.is_empty()
    }

    /// Wake and refuse every producer from now on. Idempotent.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.cv.notify_all();
    }

    pub fn set_position(&self, position: Duration) {
        let bytes = position.as_micros() * u128::from(self.bytes_per_second) / 1_000_000;
        self.lock().position_bytes = u64::try_from(bytes).unwrap_or(u64::MAX);
    }

    pub fn position(&self) -> Duration {
        let bytes = self.lock().position_bytes;
        Duration::from_micros(
            u64::try_from(u128::from(bytes) * 1_000_000 / u128::from(self.bytes_per_second))
                .unwrap_or(u64::MAX),
        )
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
