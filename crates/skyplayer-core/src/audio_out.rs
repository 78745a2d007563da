//! Multi-buffered audio output engine.
//!
//! Bridges a pull-style hardware sink ([`BufferQueue`]) to a push-style producer
//! callback. A dedicated thread owns an arena of `N` equal slots and keeps the sink fed:
//!
//! 1. a pending flush clears the sink (play state untouched) and restarts at slot 0
//! 2. while paused the sink is paused and the thread sleeps without a timeout
//! 3. a pending volume change is applied
//! 4. with fewer than `N` buffers queued, the next slot is filled (silence first, then
//!    the producer) and enqueued
//! 5. otherwise the thread waits for a completion signal, bounded by a timeout
//!
//! Only the engine thread touches the sink after `open`. Callers just flip flags.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::buffer_queue::{BufferQueue, PlayState, create_buffer_queue};
use crate::config::AudioOutConfig;

/// Producer callback: overwrite the slot with the next samples.
///
/// The slot is pre-filled with the format's silence byte, so a producer with nothing
/// to play may simply return.
pub type AudioCallback = Box<dyn FnMut(&mut [u8]) + Send>;

/// Sink volume used for "muted".
pub const MILLIBEL_MIN: i16 = i16::MIN;

/// Linear gains at or below this are treated as silence.
const GAIN_EPSILON: f32 = 0.01;

/// Pause after a failed enqueue before trying again.
const ENQUEUE_BACKOFF: Duration = Duration::from_millis(10);

/// Interleaved PCM sample encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    /// Signed 16-bit little endian.
    S16,
    /// 32-bit float little endian.
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::F32 => 4,
        }
    }

    /// Byte value that decodes to silence.
    pub fn silence(self) -> u8 {
        match self {
            SampleFormat::U8 => 0x80,
            SampleFormat::S16 | SampleFormat::F32 => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16 => "s16",
            SampleFormat::F32 => "f32",
        }
    }
}

/// Requested or obtained stream format.
///
/// `silence`, `bytes_per_buffer` and `buffer_capacity` are outputs filled in by
/// [`BufferedAudioOut::open`]; their values in a desired spec are ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioSpec {
    pub freq: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub silence: u8,
    pub bytes_per_buffer: usize,
    pub buffer_capacity: usize,
}

impl AudioSpec {
    pub fn new(freq: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            freq,
            channels,
            format,
            silence: format.silence(),
            bytes_per_buffer: 0,
            buffer_capacity: 0,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_frame() as u64 * self.freq as u64
    }
}

/// Slot layout derived from a format and a per-buffer duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferGeometry {
    pub bytes_per_frame: usize,
    pub frames_per_buffer: usize,
    pub bytes_per_buffer: usize,
    pub buffer_count: usize,
    /// `buffer_count * bytes_per_buffer`.
    pub capacity: usize,
}

impl BufferGeometry {
    pub fn compute(spec: &AudioSpec, buffer_ms: u32, buffer_count: usize) -> Result<Self> {
        if spec.freq == 0 {
            bail!("sample rate must be non-zero");
        }
        if buffer_count == 0 {
            bail!("at least one audio buffer is required");
        }
        let bytes_per_frame = spec.bytes_per_frame();
        let frames_per_buffer =
            ((spec.freq as u64 * buffer_ms.max(1) as u64) / 1000).max(1) as usize;
        let bytes_per_buffer = bytes_per_frame * frames_per_buffer;
        Ok(Self {
            bytes_per_frame,
            frames_per_buffer,
            bytes_per_buffer,
            buffer_count,
            capacity: bytes_per_buffer * buffer_count,
        })
    }
}

/// Map a linear gain to sink millibels.
pub fn gain_to_millibel(gain: f32) -> i16 {
    if !gain.is_finite() || gain <= GAIN_EPSILON {
        return MILLIBEL_MIN;
    }
    let mb = 2000.0 * gain.log10();
    mb.round().clamp(MILLIBEL_MIN as f32, i16::MAX as f32) as i16
}

/// Single-control sinks get the average of both channel levels.
pub fn stereo_to_millibel(left: f32, right: f32) -> i16 {
    let sum = i32::from(gain_to_millibel(left)) + i32::from(gain_to_millibel(right));
    (sum / 2) as i16
}

struct EngineShared {
    flags: Mutex<EngineFlags>,
    wakeup: Condvar,
}

struct EngineFlags {
    paused: bool,
    need_flush: bool,
    need_volume_change: bool,
    stop_requested: bool,
    left_volume: f32,
    right_volume: f32,
    /// Incremented by every completion signal.
    completions: u64,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            flags: Mutex::new(EngineFlags {
                paused: true,
                need_flush: false,
                need_volume_change: false,
                stop_requested: false,
                left_volume: 1.0,
                right_volume: 1.0,
                completions: 0,
            }),
            wakeup: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut EngineFlags)) {
        let mut g = self.lock();
        f(&mut g);
        drop(g);
        self.wakeup.notify_all();
    }

    /// Completion path: bump the counter under the lock so the wake-up cannot be lost.
    fn signal_completion(&self) {
        self.lock().completions += 1;
        self.wakeup.notify_all();
    }
}

/// Audio output engine. See the module docs for the fill loop.
pub struct BufferedAudioOut {
    config: AudioOutConfig,
    shared: Arc<EngineShared>,
    thread: Option<JoinHandle<()>>,
    obtained: Option<AudioSpec>,
    geometry: Option<BufferGeometry>,
}

impl BufferedAudioOut {
    pub fn new(config: AudioOutConfig) -> Self {
        Self {
            config,
            shared: Arc::new(EngineShared::new()),
            thread: None,
            obtained: None,
            geometry: None,
        }
    }

    /// Open the configured sink and start the engine thread (paused).
    pub fn open(&mut self, desired: &AudioSpec, callback: AudioCallback) -> Result<AudioSpec> {
        let config = self.config.clone();
        self.open_with(desired, callback, |spec| create_buffer_queue(spec, &config))
    }

    /// Like [`open`](Self::open) but with a caller-provided sink.
    ///
    /// The factory only runs after the format has been validated, so a rejected format
    /// never allocates a sink.
    pub fn open_with<F>(
        &mut self,
        desired: &AudioSpec,
        callback: AudioCallback,
        make_queue: F,
    ) -> Result<AudioSpec>
    where
        F: FnOnce(&AudioSpec) -> Result<Box<dyn BufferQueue>>,
    {
        if self.thread.is_some() {
            bail!("audio output already open");
        }
        if !matches!(desired.channels, 1 | 2) {
            bail!("unsupported channel count: {}", desired.channels);
        }
        let geometry =
            BufferGeometry::compute(desired, self.config.buffer_ms, self.config.buffer_count)?;

        let mut obtained = desired.clone();
        obtained.silence = desired.format.silence();
        obtained.bytes_per_buffer = geometry.bytes_per_buffer;
        obtained.buffer_capacity = geometry.capacity;

        let mut queue = make_queue(&obtained).context("create audio buffer queue")?;

        // Fresh flags for this session; an earlier close leaves `stop_requested` set.
        let shared = Arc::new(EngineShared::new());
        let weak = Arc::downgrade(&shared);
        queue.register_callback(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.signal_completion();
            }
        }))?;

        let arena = vec![obtained.silence; geometry.capacity];
        for slot in arena.chunks_exact(geometry.bytes_per_buffer) {
            queue.enqueue(slot).context("prime audio buffer queue")?;
        }

        let engine = Engine {
            shared: shared.clone(),
            queue,
            arena,
            geometry,
            silence: obtained.silence,
            callback,
            completion_timeout: self.config.completion_timeout,
            realtime: self.config.realtime,
        };
        let thread = thread::Builder::new()
            .name("audio-out".to_string())
            .spawn(move || engine.run())
            .map_err(|e| anyhow!("spawn audio engine thread: {e}"))?;

        tracing::info!(
            rate_hz = obtained.freq,
            channels = obtained.channels,
            format = obtained.format.as_str(),
            bytes_per_buffer = geometry.bytes_per_buffer,
            buffers = geometry.buffer_count,
            "audio output opened"
        );

        self.shared = shared;
        self.thread = Some(thread);
        self.obtained = Some(obtained.clone());
        self.geometry = Some(geometry);
        Ok(obtained)
    }

    /// Pause or resume. Only the engine thread changes the sink's play state.
    pub fn pause(&self, on: bool) {
        self.shared.update(|f| f.paused = on);
    }

    /// Request an asynchronous flush of everything queued to the sink.
    pub fn flush(&self) {
        self.shared.update(|f| f.need_flush = true);
    }

    /// Set linear per-channel gain (`1.0` = unity). Applied by the engine thread.
    pub fn set_volume(&self, left: f32, right: f32) {
        self.shared.update(|f| {
            f.left_volume = left;
            f.right_volume = right;
            f.need_volume_change = true;
        });
    }

    /// Stop the engine thread and release the sink. Idempotent; safe without `open`.
    pub fn close(&mut self) {
        self.shared.update(|f| f.stop_requested = true);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("audio engine thread panicked");
            }
            tracing::info!("audio output closed");
        }
        self.obtained = None;
        self.geometry = None;
    }

    pub fn is_open(&self) -> bool {
        self.thread.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub fn obtained(&self) -> Option<&AudioSpec> {
        self.obtained.as_ref()
    }

    pub fn geometry(&self) -> Option<BufferGeometry> {
        self.geometry
    }

    /// Worst-case delay between producing a sample and hearing it.
    pub fn latency(&self) -> Duration {
        match &self.obtained {
            Some(spec) if spec.bytes_per_second() > 0 => Duration::from_secs_f64(
                spec.buffer_capacity as f64 / spec.bytes_per_second() as f64,
            ),
            _ => Duration::ZERO,
        }
    }
}

impl Drop for BufferedAudioOut {
    fn drop(&mut self) {
        self.close();
    }
}

struct Engine {
    shared: Arc<EngineShared>,
    queue: Box<dyn BufferQueue>,
    arena: Vec<u8>,
    geometry: BufferGeometry,
    silence: u8,
    callback: AudioCallback,
    completion_timeout: Duration,
    realtime: bool,
}

impl Engine {
    fn run(mut self) {
        if self.realtime {
            promote_current_thread();
        }
        let n = self.geometry.buffer_count;
        let len = self.geometry.bytes_per_buffer;
        let mut next = 0usize;

        loop {
            let g = self.shared.lock();
            if g.stop_requested {
                break;
            }

            if g.need_flush {
                drop(g);
                if let Err(e) = self.queue.clear() {
                    tracing::warn!("audio flush failed: {e:#}");
                }
                next = 0;
                self.shared.lock().need_flush = false;
                tracing::debug!("audio queue flushed");
                continue;
            }

            if g.paused {
                drop(g);
                self.set_play_state(PlayState::Paused);
                let g = self
                    .shared
                    .wakeup
                    .wait_while(self.shared.lock(), |f| {
                        f.paused && !f.stop_requested && !f.need_flush
                    })
                    .unwrap_or_else(PoisonError::into_inner);
                if g.stop_requested || g.paused {
                    continue;
                }
                drop(g);
                self.set_play_state(PlayState::Playing);
                continue;
            }

            if g.need_volume_change {
                let level = stereo_to_millibel(g.left_volume, g.right_volume);
                drop(g);
                if let Err(e) = self.queue.set_volume_level(level) {
                    tracing::warn!(level, "audio volume change failed: {e:#}");
                }
                self.shared.lock().need_volume_change = false;
                continue;
            }

            let seen = g.completions;
            drop(g);

            let queued = match self.queue.queued() {
                Ok(q) => q,
                Err(e) => {
                    tracing::warn!("audio queue state unavailable: {e:#}");
                    n
                }
            };

            if queued < n {
                let slot = &mut self.arena[next * len..(next + 1) * len];
                slot.fill(self.silence);
                (self.callback)(slot);
                match self.queue.enqueue(slot) {
                    Ok(()) => next = (next + 1) % n,
                    Err(e) => {
                        tracing::warn!(slot = next, "audio enqueue failed: {e:#}");
                        self.wait_for_signal(seen, ENQUEUE_BACKOFF);
                    }
                }
            } else {
                self.wait_for_signal(seen, self.completion_timeout);
            }
        }

        self.set_play_state(PlayState::Stopped);
        if let Err(e) = self.queue.clear() {
            tracing::warn!("audio queue clear on shutdown failed: {e:#}");
        }
        tracing::debug!("audio engine thread exited");
    }

    /// Wait for a completion after `seen`, any control flag, or `timeout`.
    fn wait_for_signal(&self, seen: u64, timeout: Duration) {
        let _ = self
            .shared
            .wakeup
            .wait_timeout_while(self.shared.lock(), timeout, |f| {
                f.completions == seen
                    && !f.stop_requested
                    && !f.need_flush
                    && !f.paused
                    && !f.need_volume_change
            })
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn set_play_state(&mut self, state: PlayState) {
        if self.queue.play_state() == state {
            return;
        }
        if let Err(e) = self.queue.set_play_state(state) {
            tracing::warn!(?state, "audio play state change failed: {e:#}");
        }
    }
}

/// Ask for `SCHED_FIFO` on the calling thread. Failure (no privilege) is not an error.
#[cfg(unix)]
fn promote_current_thread() {
    // SAFETY: `pthread_self` is always valid for the calling thread and `param` is
    // fully initialised before being passed by reference.
    unsafe {
        let thread = libc::pthread_self();
        let mut policy: libc::c_int = 0;
        let mut param: libc::sched_param = std::mem::zeroed();
        if libc::pthread_getschedparam(thread, &mut policy, &mut param) != 0 {
            return;
        }
        param.sched_priority = libc::sched_get_priority_max(libc::SCHED_FIFO).min(63);
        let rc = libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &param);
        if rc == 0 {
            tracing::debug!(priority = param.sched_priority, "audio thread promoted to SCHED_FIFO");
        } else {
            tracing::debug!(rc, "audio thread keeps default scheduling");
        }
    }
}

#[cfg(not(unix))]
fn promote_current_thread() {
    tracing::debug!("real-time scheduling not supported on this platform");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer_queue::CompletionCallback;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
    use std::time::Instant;

    /// Sink that records everything and only completes buffers when told to.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub pending: VecDeque<Vec<u8>>,
        pub played: Vec<Vec<u8>>,
        pub enqueued: usize,
        pub play_state: Option<PlayState>,
        pub play_states: Vec<PlayState>,
        pub volume: Option<i16>,
        pub clears: usize,
        pub callback: Option<CompletionCallback>,
    }

    pub(crate) struct RecordingQueue(pub Arc<Mutex<RecordingSink>>);

    impl RecordingQueue {
        pub(crate) fn new() -> (Self, Arc<Mutex<RecordingSink>>) {
            let sink = Arc::new(Mutex::new(RecordingSink::default()));
            (Self(sink.clone()), sink)
        }
    }

    /// Consume the oldest buffer and fire the completion callback (outside the lock).
    pub(crate) fn complete_one(sink: &Arc<Mutex<RecordingSink>>) -> Option<Vec<u8>> {
        let (buf, cb) = {
            let mut s = sink.lock().unwrap();
            let buf = s.pending.pop_front()?;
            s.played.push(buf.clone());
            (buf, s.callback.clone())
        };
        if let Some(cb) = cb {
            cb();
        }
        Some(buf)
    }

    impl BufferQueue for RecordingQueue {
        fn register_callback(&mut self, callback: CompletionCallback) -> Result<()> {
            self.0.lock().unwrap().callback = Some(callback);
            Ok(())
        }
        fn queued(&self) -> Result<usize> {
            Ok(self.0.lock().unwrap().pending.len())
        }
        fn enqueue(&mut self, data: &[u8]) -> Result<()> {
            let mut s = self.0.lock().unwrap();
            s.pending.push_back(data.to_vec());
            s.enqueued += 1;
            Ok(())
        }
        fn clear(&mut self) -> Result<()> {
            let mut s = self.0.lock().unwrap();
            s.pending.clear();
            s.clears += 1;
            Ok(())
        }
        fn set_play_state(&mut self, state: PlayState) -> Result<()> {
            let mut s = self.0.lock().unwrap();
            s.play_state = Some(state);
            s.play_states.push(state);
            Ok(())
        }
        fn play_state(&self) -> PlayState {
            self.0.lock().unwrap().play_state.unwrap_or(PlayState::Stopped)
        }
        fn set_volume_level(&mut self, millibel: i16) -> Result<()> {
            self.0.lock().unwrap().volume = Some(millibel);
            Ok(())
        }
    }

    pub(crate) fn test_config() -> AudioOutConfig {
        AudioOutConfig {
            realtime: false,
            completion_timeout: Duration::from_millis(200),
            ..AudioOutConfig::default()
        }
    }

    pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn open_recording(
        out: &mut BufferedAudioOut,
        spec: &AudioSpec,
        callback: AudioCallback,
    ) -> (Result<AudioSpec>, Arc<Mutex<RecordingSink>>) {
        let (queue, sink) = RecordingQueue::new();
        let res = out.open_with(spec, callback, move |_| {
            Ok(Box::new(queue) as Box<dyn BufferQueue>)
        });
        (res, sink)
    }

    #[test]
    fn geometry_for_cd_stereo() {
        let spec = AudioSpec::new(44_100, 2, SampleFormat::S16);
        let g = BufferGeometry::compute(&spec, 10, 4).unwrap();
        assert_eq!(g.bytes_per_frame, 4);
        assert_eq!(g.frames_per_buffer, 441);
        assert_eq!(g.bytes_per_buffer, 1764);
        assert_eq!(g.capacity, 4 * 1764);
    }

    #[test]
    fn gain_mapping_is_logarithmic() {
        assert_eq!(gain_to_millibel(1.0), 0);
        assert_eq!(gain_to_millibel(0.1), -2000);
        assert_eq!(gain_to_millibel(0.01), MILLIBEL_MIN);
        assert_eq!(gain_to_millibel(0.0), MILLIBEL_MIN);
        assert_eq!(gain_to_millibel(f32::NAN), MILLIBEL_MIN);
    }

    #[test]
    fn stereo_level_averages_channel_millibels() {
        assert_eq!(stereo_to_millibel(0.1, 0.1), -2000);
        assert_eq!(stereo_to_millibel(1.0, 0.1), -1000);
        assert_eq!(stereo_to_millibel(1.0, 0.0), -16384);
        assert_eq!(stereo_to_millibel(0.0, 0.0), MILLIBEL_MIN);
    }

    #[test]
    fn open_echoes_format_and_primes_every_slot() {
        let mut out = BufferedAudioOut::new(test_config());
        let spec = AudioSpec::new(44_100, 2, SampleFormat::S16);
        let (res, sink) = open_recording(&mut out, &spec, Box::new(|_buf: &mut [u8]| {}));
        let obtained = res.unwrap();

        assert_eq!(obtained.freq, 44_100);
        assert_eq!(obtained.channels, 2);
        assert_eq!(obtained.bytes_per_buffer, 1764);
        assert_eq!(obtained.buffer_capacity, 4 * 1764);
        assert_eq!(out.geometry().map(|g| g.capacity), Some(4 * 1764));

        let s = sink.lock().unwrap();
        assert_eq!(s.pending.len(), 4);
        assert!(s.pending.iter().all(|b| b.len() == 1764 && b.iter().all(|&x| x == 0)));
        drop(s);
        assert!(out.is_open());
        assert!(out.is_paused());
        out.close();
    }

    #[test]
    fn unsupported_channels_fail_without_creating_a_sink() {
        for channels in [0u16, 3, 6] {
            let mut out = BufferedAudioOut::new(test_config());
            let created = AtomicBool::new(false);
            let spec = AudioSpec::new(48_000, channels, SampleFormat::S16);
            let res = out.open_with(&spec, Box::new(|_buf: &mut [u8]| {}), |_| {
                created.store(true, Ordering::SeqCst);
                let (queue, _sink) = RecordingQueue::new();
                Ok(Box::new(queue) as Box<dyn BufferQueue>)
            });
            assert!(res.is_err());
            assert!(!created.load(Ordering::SeqCst));
            assert!(!out.is_open());
        }
    }

    #[test]
    fn open_twice_fails() {
        let mut out = BufferedAudioOut::new(test_config());
        let spec = AudioSpec::new(8_000, 1, SampleFormat::U8);
        let (res, _sink) = open_recording(&mut out, &spec, Box::new(|_buf: &mut [u8]| {}));
        res.unwrap();
        let (again, _sink2) = open_recording(&mut out, &spec, Box::new(|_buf: &mut [u8]| {}));
        assert!(again.is_err());
    }

    #[test]
    fn resume_refills_completed_slots_from_producer() {
        let mut out = BufferedAudioOut::new(test_config());
        let spec = AudioSpec::new(8_000, 1, SampleFormat::U8);
        let (res, sink) = open_recording(
            &mut out,
            &spec,
            Box::new(|buf: &mut [u8]| buf.fill(7)),
        );
        res.unwrap();

        out.pause(false);
        assert!(wait_until(|| sink.lock().unwrap().play_state == Some(PlayState::Playing)));

        complete_one(&sink).unwrap();
        complete_one(&sink).unwrap();
        assert!(wait_until(|| sink.lock().unwrap().enqueued == 6));

        let s = sink.lock().unwrap();
        assert_eq!(s.pending.len(), 4);
        assert!(s.pending.iter().rev().take(2).all(|b| b.iter().all(|&x| x == 7)));
        assert!(s.pending.iter().take(2).all(|b| b.iter().all(|&x| x == 0x80)));
    }

    #[test]
    fn pause_parks_engine_without_producing() {
        let mut out = BufferedAudioOut::new(test_config());
        let spec = AudioSpec::new(8_000, 2, SampleFormat::S16);
        let (res, sink) = open_recording(&mut out, &spec, Box::new(|_buf: &mut [u8]| {}));
        res.unwrap();
        assert!(wait_until(|| sink.lock().unwrap().play_state == Some(PlayState::Paused)));

        complete_one(&sink).unwrap();
        thread::sleep(Duration::from_millis(50));
        let s = sink.lock().unwrap();
        assert_eq!(s.enqueued, 4);
        assert_eq!(s.pending.len(), 3);
    }

    #[test]
    fn flush_never_replays_stale_audio() {
        let generation = Arc::new(AtomicU8::new(1));
        let producer_gen = generation.clone();
        let mut out = BufferedAudioOut::new(test_config());
        let spec = AudioSpec::new(8_000, 1, SampleFormat::U8);
        let (res, sink) = open_recording(
            &mut out,
            &spec,
            Box::new(move |buf: &mut [u8]| buf.fill(producer_gen.load(Ordering::SeqCst))),
        );
        res.unwrap();
        out.pause(false);

        complete_one(&sink).unwrap();
        assert!(wait_until(|| sink.lock().unwrap().enqueued == 5));

        generation.store(2, Ordering::SeqCst);
        out.flush();
        assert!(wait_until(|| sink.lock().unwrap().clears == 1));
        assert!(wait_until(|| sink.lock().unwrap().pending.len() == 4));

        let s = sink.lock().unwrap();
        assert!(s.pending.iter().all(|b| b.iter().all(|&x| x == 2)));
        assert_eq!(s.play_state, Some(PlayState::Playing));
    }

    #[test]
    fn volume_change_reaches_sink() {
        let mut out = BufferedAudioOut::new(test_config());
        let spec = AudioSpec::new(8_000, 2, SampleFormat::F32);
        let (res, sink) = open_recording(&mut out, &spec, Box::new(|_buf: &mut [u8]| {}));
        res.unwrap();
        out.pause(false);
        out.set_volume(0.1, 0.1);
        assert!(wait_until(|| sink.lock().unwrap().volume == Some(-2000)));
    }

    #[test]
    fn close_stops_and_clears_sink() {
        let mut out = BufferedAudioOut::new(test_config());
        let spec = AudioSpec::new(8_000, 2, SampleFormat::S16);
        let (res, sink) = open_recording(&mut out, &spec, Box::new(|_buf: &mut [u8]| {}));
        res.unwrap();
        out.close();
        out.close();

        let s = sink.lock().unwrap();
        assert_eq!(s.play_state, Some(PlayState::Stopped));
        assert!(s.pending.is_empty());
        drop(s);
        assert!(!out.is_open());
        assert!(out.obtained().is_none());
    }

    #[test]
    fn close_without_open_is_noop() {
        let mut out = BufferedAudioOut::new(test_config());
        out.close();
        out.pause(false);
        out.flush();
        assert!(!out.is_open());
    }

    #[test]
    fn lost_completion_is_recovered_by_timeout() {
        let mut out = BufferedAudioOut::new(AudioOutConfig {
            completion_timeout: Duration::from_millis(20),
            ..test_config()
        });
        let spec = AudioSpec::new(8_000, 1, SampleFormat::U8);
        let (res, sink) = open_recording(&mut out, &spec, Box::new(|_buf: &mut [u8]| {}));
        res.unwrap();
        out.pause(false);

        // Consume a buffer without signalling.
        sink.lock().unwrap().pending.pop_front();
        assert!(wait_until(|| sink.lock().unwrap().enqueued == 5));
    }

    #[test]
    fn reopen_after_close_works() {
        let mut out = BufferedAudioOut::new(test_config());
        let spec = AudioSpec::new(8_000, 1, SampleFormat::U8);
        let (res, _sink) = open_recording(&mut out, &spec, Box::new(|_buf: &mut [u8]| {}));
        res.unwrap();
        out.close();
        let (res, sink) = open_recording(&mut out, &spec, Box::new(|_buf: &mut [u8]| {}));
        res.unwrap();
        assert_eq!(sink.lock().unwrap().pending.len(), 4);
        assert!(out.latency() > Duration::ZERO);
    }
}
