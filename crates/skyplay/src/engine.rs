//! Audio-only [`MediaEngine`] built on Symphonia.
//!
//! `open` probes the file, opens the codec and the audio output, then hands decoding to a
//! background thread:
//! - decoded packets are converted to interleaved S16 (at most two channels) and pushed
//!   into a bounded [`PcmFifo`]
//! - the audio producer callback drains the FIFO on the audio engine thread
//! - seeks and shutdown are requested through [`DecodeControl`] and picked up between
//!   packets
//!
//! Completion is reported once the decoder has hit end of stream and the audio engine has
//! taken every queued byte.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use skyplayer_core::audio_out::{AudioCallback, AudioSpec, SampleFormat};
use skyplayer_core::messages::*;
use skyplayer_core::{EngineBridge, MediaEngine, MediaSession, SeekMode};
use skyplayer_types::error;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::pcm::{PcmFifo, calc_capacity_bytes};

/// How often an idle decoder (end of stream) checks for drain, seek or close.
const IDLE_POLL: Duration = Duration::from_millis(20);

pub struct SymphoniaEngine {
    buffer_seconds: f32,
}

impl SymphoniaEngine {
    /// `buffer_seconds` sizes the PCM FIFO between decoder and audio output.
    pub fn new(buffer_seconds: f32) -> Self {
        Self { buffer_seconds }
    }
}

impl MediaEngine for SymphoniaEngine {
    fn open(&self, source: &str, bridge: EngineBridge) -> Result<Box<dyn MediaSession>> {
        let path = Path::new(source);
        bridge.post(MSG_OPEN_INPUT, 0, 0);
        let file = File::open(path).with_context(|| format!("open {source}"))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .with_context(|| format!("probe {source}"))?;
        let format = probed.format;
        bridge.post(MSG_FIND_STREAM_INFO, 0, 0);

        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("No default audio track"))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let channels = codec_params
            .channels
            .ok_or_else(|| anyhow!("Unknown channels"))?
            .count();
        let rate = codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("Unknown sample rate"))?;

        let decoder =
            match symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default()) {
                Ok(d) => d,
                Err(e) => {
                    bridge.post(MSG_COMPONENT_OPEN_ERR, 0, 0);
                    return Err(e).context("open decoder");
                }
            };
        bridge.post(MSG_COMPONENT_OPEN, 0, 0);
        tracing::info!(
            codec = codec_name_from_params(&codec_params).unwrap_or("unknown"),
            rate_hz = rate,
            channels,
            "source opened"
        );

        let out_channels = channels.min(2);
        let desired = AudioSpec::new(rate, out_channels as u16, SampleFormat::S16);
        let fifo = Arc::new(PcmFifo::new(
            calc_capacity_bytes(
                desired.bytes_per_second(),
                desired.bytes_per_frame(),
                self.buffer_seconds,
            ),
            desired.bytes_per_second(),
        ));
        let obtained = bridge.open_audio(
            &desired,
            producer_callback(fifo.clone(), bridge.clone(), desired.silence),
        )?;
        if obtained.format != SampleFormat::S16 || obtained.channels != desired.channels {
            bridge.close_audio();
            bail!(
                "audio output negotiated {} x{}, decoder produces s16 x{}",
                obtained.format.as_str(),
                obtained.channels,
                desired.channels
            );
        }

        let ctl = Arc::new(DecodeControl::default());
        let worker = DecodeWorker {
            format,
            decoder,
            track_id,
            rate,
            time_base: codec_params.time_base,
            fifo: fifo.clone(),
            ctl: ctl.clone(),
            bridge: bridge.clone(),
            skip_frames: 0,
            decoded_any: false,
        };
        let spawned = thread::Builder::new()
            .name("decoder".to_string())
            .spawn(move || worker.run());
        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                bridge.close_audio();
                return Err(e).context("spawn decoder thread");
            }
        };

        bridge.post(MSG_PREPARED, 0, 0);
        Ok(Box::new(SymphoniaSession {
            bridge,
            fifo,
            ctl,
            worker: Some(handle),
            paused: true,
            duration: duration_from_codec_params(&codec_params),
        }))
    }
}

struct SymphoniaSession {
    bridge: EngineBridge,
    fifo: Arc<PcmFifo>,
    ctl: Arc<DecodeControl>,
    worker: Option<JoinHandle<()>>,
    paused: bool,
    duration: Option<Duration>,
}

impl MediaSession for SymphoniaSession {
    fn toggle_pause(&mut self) {
        self.paused = !self.paused;
        self.bridge.pause_audio(self.paused);
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn seek(&mut self, position: Duration, mode: SeekMode) {
        self.ctl.request_seek(position, mode);
        // Unblock a decoder waiting on a full FIFO.
        self.fifo.flush();
    }

    fn current_position(&self) -> Option<Duration> {
        Some(self.fifo.position())
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.ctl.close();
        self.fifo.shutdown();
        if worker.join().is_err() {
            tracing::error!("decoder thread panicked");
        }
        self.bridge.close_audio();
    }
}

impl Drop for SymphoniaSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drains the FIFO on the audio engine thread and announces the first audible buffer
/// after open and after every seek.
fn producer_callback(fifo: Arc<PcmFifo>, bridge: EngineBridge, silence: u8) -> AudioCallback {
    let mut announced: Option<u64> = None;
    Box::new(move |buf: &mut [u8]| {
        let popped = fifo.pop_into(buf, silence);
        if popped.bytes == 0 {
            return;
        }
        match announced {
            None => {
                bridge.post(MSG_AUDIO_RENDERING_START, 0, 0);
            }
            Some(generation) if generation != popped.generation => {
                bridge.post(MSG_AUDIO_SEEK_RENDERING_START, 0, 0);
            }
            Some(_) => {}
        }
        announced = Some(popped.generation);
    })
}

#[derive(Debug, PartialEq)]
enum Request {
    None,
    Seek(Duration, SeekMode),
    Close,
}

#[derive(Default)]
struct DecodeControl {
    state: Mutex<ControlState>,
    cv: Condvar,
}

#[derive(Default)]
struct ControlState {
    seek: Option<(Duration, SeekMode)>,
    closing: bool,
}

impl DecodeControl {
    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace any seek that has not been picked up yet.
    fn request_seek(&self, position: Duration, mode: SeekMode) {
        self.lock().seek = Some((position, mode));
        self.cv.notify_all();
    }

    fn close(&self) {
        self.lock().closing = true;
        self.cv.notify_all();
    }

    /// Take the pending request. With `wait`, sleep up to that long for one to arrive.
    fn next_request(&self, wait: Option<Duration>) -> Request {
        let mut g = self.lock();
        if let Some(timeout) = wait {
            g = self
                .cv
                .wait_timeout_while(g, timeout, |s| !s.closing && s.seek.is_none())
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if g.closing {
            Request::Close
        } else if let Some((position, mode)) = g.seek.take() {
            Request::Seek(position, mode)
        } else {
            Request::None
        }
    }
}

struct DecodeWorker {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    rate: u32,
    time_base: Option<TimeBase>,
    fifo: Arc<PcmFifo>,
    ctl: Arc<DecodeControl>,
    bridge: EngineBridge,
    /// Frames still to drop after an accurate seek landed on an earlier key frame.
    skip_frames: u64,
    decoded_any: bool,
}

impl DecodeWorker {
    fn run(mut self) {
        let mut eos = false;
        let mut completed = false;
        loop {
            match self.ctl.next_request(eos.then_some(IDLE_POLL)) {
                Request::Close => break,
                Request::Seek(position, mode) => {
                    self.seek(position, mode);
                    eos = false;
                    completed = false;
                    continue;
                }
                Request::None => {}
            }

            if eos {
                if !completed && self.fifo.is_drained() {
                    completed = true;
                    tracing::info!("playback drained");
                    self.bridge.post(MSG_COMPLETED, 0, 0);
                }
                continue;
            }

            match self.decode_next() {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("end of stream");
                    eos = true;
                    self.fifo.set_eos();
                }
                Err(e) => {
                    tracing::error!("decoder thread error: {e:#}");
                    self.bridge.post(MSG_ERROR, error::MALFORMED, 0);
                    break;
                }
            }
        }
        tracing::debug!("decoder thread exited");
    }

    /// Decode one packet into the FIFO. `Ok(false)` at end of stream.
    fn decode_next(&mut self) -> Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    tracing::warn!("track list changed; stopping");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::warn!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if decoded.frames() == 0 {
                continue;
            }
            let spec = *decoded.spec();
            let mut sample_buf = SampleBuffer::<i16>::new(decoded.frames() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);

            let channels = spec.channels.count().max(1);
            let mut samples = sample_buf.samples();
            if self.skip_frames > 0 {
                let frames = (samples.len() / channels) as u64;
                let skip = self.skip_frames.min(frames);
                self.skip_frames -= skip;
                samples = &samples[skip as usize * channels..];
                if samples.is_empty() {
                    continue;
                }
            }

            if !self.decoded_any {
                self.decoded_any = true;
                self.bridge.post(MSG_AUDIO_DECODED_START, 0, 0);
            }
            // A `false` here means a seek or close interrupted the push; the next
            // request check handles it.
            self.fifo.push_blocking(&fold_to_s16le(samples, channels));
            return Ok(true);
        }
    }

    fn seek(&mut self, position: Duration, mode: SeekMode) {
        let dropped = self.fifo.flush();
        self.bridge.flush_audio();
        tracing::debug!(target_ms = position.as_millis() as u64, dropped, ?mode, "seek");

        let time = Time::new(position.as_secs(), f64::from(position.subsec_nanos()) / 1e9);
        let symphonia_mode = match mode {
            SeekMode::Accurate => symphonia::core::formats::SeekMode::Accurate,
            SeekMode::Keyframe => symphonia::core::formats::SeekMode::Coarse,
        };
        let seeked = self.format.seek(
            symphonia_mode,
            SeekTo::Time {
                time,
                track_id: Some(self.track_id),
            },
        );
        let reached = match seeked {
            Ok(seeked) => {
                self.decoder.reset();
                let ts = match mode {
                    SeekMode::Accurate => {
                        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
                        seeked.required_ts
                    }
                    SeekMode::Keyframe => {
                        self.skip_frames = 0;
                        seeked.actual_ts
                    }
                };
                let reached = ts_to_duration(ts, self.time_base, self.rate);
                self.fifo.set_position(reached);
                reached
            }
            Err(e) => {
                tracing::warn!("seek failed: {e}");
                self.fifo.position()
            }
        };

        let ms = i32::try_from(reached.as_millis()).unwrap_or(i32::MAX);
        self.bridge.post(MSG_SEEK_COMPLETE, ms, 0);
        if mode == SeekMode::Accurate {
            self.bridge.post(MSG_ACCURATE_SEEK_COMPLETE, ms, 0);
        }
    }
}

/// Interleaved S16 to little-endian bytes, keeping the front pair of wider layouts.
fn fold_to_s16le(samples: &[i16], channels: usize) -> Vec<u8> {
    match channels {
        0 => Vec::new(),
        1 | 2 => samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .flat_map(i16::to_le_bytes)
            .collect(),
    }
}

fn ts_to_duration(ts: u64, time_base: Option<TimeBase>, rate: u32) -> Duration {
    match time_base {
        Some(tb) => {
            let t = tb.calc_time(ts);
            Duration::from_secs(t.seconds) + Duration::from_secs_f64(t.frac)
        }
        None if rate > 0 => Duration::from_micros(ts.saturating_mul(1_000_000) / u64::from(rate)),
        None => Duration::ZERO,
    }
}

/// Best-effort duration from codec metadata.
fn duration_from_codec_params(codec_params: &CodecParameters) -> Option<Duration> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate?;
    if rate == 0 {
        return None;
    }
    Some(ts_to_duration(frames, codec_params.time_base, rate))
}

/// Best-effort codec label for logs.
fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    /// Write a 16-bit PCM WAV of `millis` of a quiet square wave.
    pub(crate) fn write_test_wav(name: &str, rate: u32, channels: u16, millis: u32) -> PathBuf {
        let path = std::env::temp_dir().join(format!("skyplay-{}-{name}.wav", std::process::id()));
        let frames = rate as usize * millis as usize / 1000;
        let data_len = (frames * channels as usize * 2) as u32;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * u32::from(channels) * 2).to_le_bytes());
        bytes.extend_from_slice(&(channels * 2).to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames {
            let s: i16 = if (i / 50) % 2 == 0 { 1000 } else { -1000 };
            for _ in 0..channels {
                bytes.extend_from_slice(&s.to_le_bytes());
            }
        }
        let mut f = File::create(&path).unwrap();
        f.write_all(&bytes).unwrap();
        path
    }

    #[test]
    fn fold_keeps_mono_and_stereo() {
        assert_eq!(fold_to_s16le(&[1, -1], 1), vec![1, 0, 0xff, 0xff]);
        assert_eq!(fold_to_s16le(&[1, 2], 2), vec![1, 0, 2, 0]);
    }

    #[test]
    fn fold_takes_front_pair_of_surround() {
        let frame = [1i16, 2, 3, 4, 5, 6];
        assert_eq!(fold_to_s16le(&frame, 6), vec![1, 0, 2, 0]);
        assert!(fold_to_s16le(&frame, 0).is_empty());
    }

    #[test]
    fn ts_to_duration_uses_rate_without_time_base() {
        assert_eq!(ts_to_duration(48_000, None, 48_000), Duration::from_secs(1));
        assert_eq!(ts_to_duration(22_050, None, 44_100), Duration::from_millis(500));
        assert_eq!(ts_to_duration(100, None, 0), Duration::ZERO);
    }

    #[test]
    fn duration_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_from_codec_params(&params).is_none());
    }

    #[test]
    fn duration_from_codec_params_computes() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        assert_eq!(duration_from_codec_params(&params), Some(Duration::from_secs(2)));
    }

    #[test]
    fn codec_name_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = symphonia::core::codecs::CODEC_TYPE_FLAC;
        assert_eq!(codec_name_from_params(&params), Some("FLAC"));
        assert!(codec_name_from_params(&CodecParameters::new()).is_none());
    }

    #[test]
    fn close_wins_over_pending_seek() {
        let ctl = DecodeControl::default();
        ctl.request_seek(Duration::from_secs(1), SeekMode::Accurate);
        ctl.request_seek(Duration::from_secs(2), SeekMode::Keyframe);
        assert_eq!(
            ctl.next_request(None),
            Request::Seek(Duration::from_secs(2), SeekMode::Keyframe)
        );
        assert_eq!(ctl.next_request(None), Request::None);
        ctl.request_seek(Duration::from_secs(3), SeekMode::Accurate);
        ctl.close();
        assert_eq!(ctl.next_request(Some(Duration::from_millis(1))), Request::Close);
    }

    #[test]
    fn open_missing_file_fails() {
        let engine = SymphoniaEngine::new(0.5);
        let res = engine.open("/nonexistent/skyplay/clip.flac", EngineBridge::detached());
        assert!(res.is_err());
    }

    #[test]
    fn open_without_player_fails_at_audio() {
        let path = write_test_wav("detached", 8_000, 1, 100);
        let engine = SymphoniaEngine::new(0.5);
        let res = engine.open(path.to_str().unwrap(), EngineBridge::detached());
        assert!(res.is_err());
        let _ = std::fs::remove_file(path);
    }
}
