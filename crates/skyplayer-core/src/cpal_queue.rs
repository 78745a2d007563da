//! [`BufferQueue`] backed by a CPAL output stream.
//!
//! CPAL streams are not `Send` on every platform, so the stream lives on a small keeper
//! thread for its whole life. The keeper reports readiness over a channel and drops the
//! stream when told to shut down.
//!
//! The stream callback:
//! - drains enqueued buffers in order, signalling one completion per finished buffer
//! - maps mono/stereo sources onto the device channel layout
//! - converts the sample rate by linear interpolation when the device cannot run at the
//!   requested rate
//! - applies the sink volume
//!
//! Completion callbacks run after the state lock has been released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Sender, bounded};

use crate::audio_out::{AudioSpec, MILLIBEL_MIN, SampleFormat};
use crate::buffer_queue::{BufferQueue, CompletionCallback, PlayState};
use crate::device;

/// Output stream details reported by the keeper thread.
#[derive(Clone, Debug)]
pub struct DeviceStream {
    pub device: String,
    pub rate: u32,
    pub channels: u16,
    pub sample_format: cpal::SampleFormat,
}

pub struct CpalBufferQueue {
    shared: Arc<Mutex<RenderState>>,
    source_format: SampleFormat,
    shutdown_tx: Option<Sender<()>>,
    keeper: Option<JoinHandle<()>>,
}

/// Everything the stream callback needs, behind one lock.
struct RenderState {
    pending: VecDeque<Vec<f32>>,
    /// Read position in frames within `pending.front()`.
    pos: f64,
    /// Source frames consumed per device frame.
    step: f64,
    src_channels: usize,
    play: PlayState,
    gain: f32,
    callback: Option<CompletionCallback>,
    scratch: Vec<f32>,
}

impl CpalBufferQueue {
    /// Open `device_needle` (or the default device) for `spec` and start the stream.
    pub fn open(spec: &AudioSpec, device_needle: Option<&str>) -> Result<Self> {
        let shared = Arc::new(Mutex::new(RenderState::new(spec.channels as usize)));
        let (ready_tx, ready_rx) = bounded::<Result<DeviceStream>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let source = spec.clone();
        let needle = device_needle.map(str::to_string);
        let shared_keeper = shared.clone();
        let keeper = thread::Builder::new()
            .name("cpal-stream".to_string())
            .spawn(move || {
                let stream = match start_stream(&source, needle.as_deref(), &shared_keeper) {
                    Ok((stream, info)) => {
                        let _ = ready_tx.send(Ok(info));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .context("spawn cpal stream thread")?;

        let stream = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = keeper.join();
                return Err(e);
            }
            Err(_) => {
                let _ = keeper.join();
                return Err(anyhow!("cpal stream thread exited before reporting"));
            }
        };

        tracing::info!(
            device = %stream.device,
            output_rate_hz = stream.rate,
            output_channels = stream.channels,
            sample_format = ?stream.sample_format,
            "cpal output stream started"
        );

        Ok(Self {
            shared,
            source_format: spec.format,
            shutdown_tx: Some(shutdown_tx),
            keeper: Some(keeper),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RenderState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn start_stream(
    spec: &AudioSpec,
    needle: Option<&str>,
    shared: &Arc<Mutex<RenderState>>,
) -> Result<(cpal::Stream, DeviceStream)> {
    let host = cpal::default_host();
    let device = device::pick_device(&host, needle)?;
    let config = device::pick_output_config(&device, spec.freq, spec.channels)?;
    let stream_config: cpal::StreamConfig = config.clone().into();

    {
        let mut st = shared.lock().unwrap_or_else(PoisonError::into_inner);
        st.step = spec.freq as f64 / stream_config.sample_rate.max(1) as f64;
    }

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, shared),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, shared),
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, shared),
        cpal::SampleFormat::U8 => build_stream::<u8>(&device, &stream_config, shared),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }?;
    stream.play().context("start cpal stream")?;

    let info = DeviceStream {
        device: device
            .description()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        rate: stream_config.sample_rate,
        channels: stream_config.channels,
        sample_format: config.sample_format(),
    };
    Ok((stream, info))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<Mutex<RenderState>>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let state_cb = shared.clone();
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let (completed, callback) = {
                let mut st = state_cb.lock().unwrap_or_else(PoisonError::into_inner);
                let mut scratch = std::mem::take(&mut st.scratch);
                scratch.clear();
                scratch.resize(data.len(), 0.0);
                let completed = st.render(&mut scratch, channels_out);
                for (dst, src) in data.iter_mut().zip(scratch.iter()) {
                    *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
                }
                st.scratch = scratch;
                (completed, st.callback.clone())
            };
            if let Some(cb) = callback {
                for _ in 0..completed {
                    cb();
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

impl RenderState {
    fn new(src_channels: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            pos: 0.0,
            step: 1.0,
            src_channels: src_channels.max(1),
            play: PlayState::Stopped,
            gain: 1.0,
            callback: None,
            scratch: Vec::new(),
        }
    }

    /// Fill `out` (interleaved, `channels_out` wide). Returns buffers finished.
    fn render(&mut self, out: &mut [f32], channels_out: usize) -> usize {
        if self.play != PlayState::Playing || channels_out == 0 {
            out.fill(0.0);
            return 0;
        }

        let mut completed = 0;
        for frame in out.chunks_mut(channels_out) {
            if !self.advance_to_readable(&mut completed) {
                frame.fill(0.0);
                continue;
            }
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = self.sample_at(ch, channels_out) * self.gain;
            }
            self.pos += self.step;
        }
        self.advance_to_readable(&mut completed);
        completed
    }

    /// Pop finished buffers until the read position is inside the front one.
    fn advance_to_readable(&mut self, completed: &mut usize) -> bool {
        loop {
            let Some(front) = self.pending.front() else {
                self.pos = 0.0;
                return false;
            };
            let frames = (front.len() / self.src_channels) as f64;
            if self.pos < frames {
                return true;
            }
            self.pos -= frames;
            self.pending.pop_front();
            *completed += 1;
        }
    }

    /// Interpolated, channel-mapped sample for output channel `dst_ch`.
    fn sample_at(&self, dst_ch: usize, dst_channels: usize) -> f32 {
        let Some(buf) = self.pending.front() else {
            return 0.0;
        };
        let frames = buf.len() / self.src_channels;
        let i0 = self.pos.floor() as usize;
        let i1 = (i0 + 1).min(frames.saturating_sub(1));
        let t = (self.pos - i0 as f64) as f32;
        let a = map_channel(buf, i0, self.src_channels, dst_ch, dst_channels);
        let b = map_channel(buf, i1, self.src_channels, dst_ch, dst_channels);
        a + (b - a) * t
    }
}

/// Read one output sample from source frame `frame`, applying a simple channel mapping.
///
/// Mapping rules:
/// - mono → any: duplicate channel 0
/// - stereo → mono: average L/R
/// - stereo → stereo or wider: L/R pass-through, extra channels silent
fn map_channel(src: &[f32], frame: usize, src_channels: usize, dst_ch: usize, dst_channels: usize) -> f32 {
    let base = frame * src_channels;
    let get = |ch: usize| src.get(base + ch).copied().unwrap_or(0.0);
    match (src_channels, dst_channels) {
        (1, _) => get(0),
        (2, 1) => 0.5 * (get(0) + get(1)),
        (2, _) if dst_ch < 2 => get(dst_ch),
        _ => 0.0,
    }
}

/// Decode little-endian PCM bytes to `f32` in `[-1.0, 1.0]`.
fn decode_pcm(data: &[u8], format: SampleFormat) -> Vec<f32> {
    match format {
        SampleFormat::U8 => data.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
        SampleFormat::S16 => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
            .collect(),
        SampleFormat::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    }
}

/// Inverse of the engine's logarithmic volume mapping.
fn millibel_to_gain(millibel: i16) -> f32 {
    if millibel == MILLIBEL_MIN {
        return 0.0;
    }
    10f32.powf(millibel as f32 / 2000.0)
}

impl BufferQueue for CpalBufferQueue {
    fn register_callback(&mut self, callback: CompletionCallback) -> Result<()> {
        self.lock().callback = Some(callback);
        Ok(())
    }

    fn queued(&self) -> Result<usize> {
        Ok(self.lock().pending.len())
    }

    fn enqueue(&mut self, data: &[u8]) -> Result<()> {
        let format = self.source_format;
        let samples = decode_pcm(data, format);
        self.lock().pending.push_back(samples);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let mut st = self.lock();
        st.pending.clear();
        st.pos = 0.0;
        Ok(())
    }

    fn set_play_state(&mut self, state: PlayState) -> Result<()> {
        self.lock().play = state;
        Ok(())
    }

    fn play_state(&self) -> PlayState {
        self.lock().play
    }

    fn set_volume_level(&mut self, millibel: i16) -> Result<()> {
        self.lock().gain = millibel_to_gain(millibel);
        Ok(())
    }
}

impl Drop for CpalBufferQueue {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(keeper) = self.keeper.take() {
            if keeper.join().is_err() {
                tracing::warn!("cpal stream thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing(src_channels: usize, step: f64) -> RenderState {
        let mut st = RenderState::new(src_channels);
        st.play = PlayState::Playing;
        st.step = step;
        st
    }

    #[test]
    fn decode_pcm_formats() {
        assert_eq!(decode_pcm(&[128, 0, 255], SampleFormat::U8)[0], 0.0);
        assert_eq!(decode_pcm(&[0, 0x80], SampleFormat::S16), vec![-1.0]);
        assert_eq!(decode_pcm(&0.5f32.to_le_bytes(), SampleFormat::F32), vec![0.5]);
        assert!(decode_pcm(&[1], SampleFormat::S16).is_empty());
    }

    #[test]
    fn millibel_gain_roundtrip() {
        assert_eq!(millibel_to_gain(0), 1.0);
        assert!((millibel_to_gain(-2000) - 0.1).abs() < 1e-6);
        assert_eq!(millibel_to_gain(MILLIBEL_MIN), 0.0);
    }

    #[test]
    fn render_outputs_silence_unless_playing() {
        let mut st = RenderState::new(2);
        st.pending.push_back(vec![0.5; 8]);
        let mut out = vec![1.0; 8];
        assert_eq!(st.render(&mut out, 2), 0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(st.pending.len(), 1);
    }

    #[test]
    fn render_counts_completed_buffers() {
        let mut st = playing(2, 1.0);
        st.pending.push_back(vec![0.1, 0.2, 0.3, 0.4]);
        st.pending.push_back(vec![0.5, 0.6]);
        let mut out = vec![0.0; 8];
        assert_eq!(st.render(&mut out, 2), 2);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.0, 0.0]);
        assert!(st.pending.is_empty());
    }

    #[test]
    fn render_duplicates_mono_and_applies_gain() {
        let mut st = playing(1, 1.0);
        st.gain = 0.5;
        st.pending.push_back(vec![0.8, -0.8]);
        let mut out = vec![0.0; 4];
        st.render(&mut out, 2);
        assert_eq!(out, vec![0.4, 0.4, -0.4, -0.4]);
    }

    #[test]
    fn render_interpolates_when_rates_differ() {
        let mut st = playing(1, 0.5);
        st.pending.push_back(vec![0.0, 1.0]);
        let mut out = vec![0.0; 3];
        assert_eq!(st.render(&mut out, 1), 0);
        assert_eq!(out, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn map_channel_downmixes_stereo() {
        let src = [0.2, 0.4];
        assert!((map_channel(&src, 0, 2, 0, 1) - 0.3).abs() < 1e-6);
        assert_eq!(map_channel(&src, 0, 2, 1, 2), 0.4);
        assert_eq!(map_channel(&src, 0, 2, 3, 6), 0.0);
    }
}
