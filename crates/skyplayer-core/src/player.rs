//! The player: lifecycle state machine, control surface and event dispatch.
//!
//! Control calls run on the host's thread, engine events arrive on decode threads, and
//! both meet in the mailbox. The mailbox worker translates engine events into state
//! changes and host notifications in [`PlayerShared::handle_message`].
//!
//! Lock order: player state, then mailbox / audio / video. The player lock is never held
//! while a listener runs or while the mailbox worker is joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Result, bail};
use skyplayer_types::{MediaEvent, MediaEventType, PlayerState, PlayerStatus, error, info};

use crate::audio::AudioOutHandler;
use crate::config::PlayerConfig;
use crate::engine::{EngineBridge, MediaEngine, MediaSession};
use crate::mailbox::Mailbox;
use crate::messages::*;
use crate::state::Lifecycle;
use crate::video::{RenderSurface, VideoOutHandler};

/// Receives host-facing events on the mailbox worker thread.
///
/// The player keeps only a weak reference. Events raised after the listener is dropped
/// are logged and discarded.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: MediaEvent, payload: Option<&Payload>) -> Result<()>;
}

pub struct MediaPlayer {
    shared: Arc<PlayerShared>,
}

pub(crate) struct PlayerShared {
    config: PlayerConfig,
    engine: Arc<dyn MediaEngine>,
    pub(crate) mailbox: Mailbox,
    pub(crate) video: VideoOutHandler,
    pub(crate) audio: AudioOutHandler,
    pub(crate) first_frame_rendered: AtomicBool,
    released: AtomicBool,
    inner: Mutex<PlayerInner>,
    listener: Mutex<Option<Weak<dyn EventListener>>>,
}

struct PlayerInner {
    lifecycle: Lifecycle,
    data_source: Option<String>,
    session: Option<Box<dyn MediaSession>>,
    /// Set by completion and reported in the status; cleared by seek or prepare.
    restart: bool,
    seek_pending: bool,
    video_size: (u32, u32),
}

impl MediaPlayer {
    pub fn new(config: PlayerConfig, engine: Arc<dyn MediaEngine>) -> Self {
        let shared = PlayerShared {
            mailbox: Mailbox::with_config(&config.mailbox),
            audio: AudioOutHandler::new(config.audio.clone()),
            video: VideoOutHandler::new(),
            config,
            engine,
            first_frame_rendered: AtomicBool::new(false),
            released: AtomicBool::new(false),
            inner: Mutex::new(PlayerInner {
                lifecycle: Lifecycle::new(),
                data_source: None,
                session: None,
                restart: false,
                seek_pending: false,
                video_size: (0, 0),
            }),
            listener: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn set_listener(&self, listener: Weak<dyn EventListener>) {
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Attach or detach the video drawing target.
    pub fn set_video_surface(&self, surface: Option<Box<dyn RenderSurface>>) {
        self.shared.video.set_surface(surface);
    }

    /// Record the media path. Allowed in Idle and Initialized.
    pub fn set_data_source(&self, path: &str) -> Result<()> {
        if path.trim().is_empty() {
            bail!("empty data source");
        }
        let mut g = self.shared.lock();
        if !g.lifecycle.can_set_source() {
            bail!("set_data_source not allowed in state {}", g.lifecycle.state());
        }
        tracing::info!(source = %path, "data source set");
        g.data_source = Some(path.to_string());
        self.shared.set_state(&mut g, PlayerState::Initialized);
        Ok(())
    }

    /// Open the data source and start the event worker.
    ///
    /// Errors only when preparing is not allowed right now. An engine failure moves the
    /// player to Error and is reported to the listener instead.
    pub fn prepare_async(&self) -> Result<()> {
        let shared = &self.shared;
        let mut g = shared.lock();
        if !g.lifecycle.can_prepare() {
            bail!("prepare_async not allowed in state {}", g.lifecycle.state());
        }
        let Some(source) = g.data_source.clone() else {
            bail!("prepare_async without a data source");
        };

        shared.set_state(&mut g, PlayerState::Preparing);
        g.restart = false;
        g.seek_pending = false;
        shared.first_frame_rendered.store(false, Ordering::Release);

        match shared.engine.open(&source, EngineBridge::new(shared)) {
            Ok(session) => {
                g.session = Some(session);
                shared.set_state(&mut g, PlayerState::Prepared);
            }
            Err(e) => {
                tracing::error!(source = %source, "engine open failed: {e:#}");
                shared.mailbox.put(Message::with_args(MSG_ERROR, error::IO, 0));
            }
        }
        drop(g);

        shared.start_worker();
        Ok(())
    }

    pub fn start(&self) {
        self.shared.start();
    }

    pub fn pause(&self) {
        self.shared.pause();
    }

    pub fn seek_to(&self, msec: i64) {
        self.shared.seek_to(msec);
    }

    /// Stop playback and close the session. A stopped player can be prepared again.
    pub fn stop(&self) {
        let session = {
            let mut g = self.shared.lock();
            if !g.lifecycle.can_stop() {
                tracing::debug!(state = %g.lifecycle.state(), "stop ignored");
                return;
            }
            g.seek_pending = false;
            self.shared.set_state(&mut g, PlayerState::Stopped);
            g.session.take()
        };
        self.shared.close_session(session);
    }

    /// Drop the session and the data source and return to Idle.
    pub fn reset(&self) {
        let session = {
            let mut g = self.shared.lock();
            if g.lifecycle.is_released() {
                return;
            }
            let dropped = self.shared.mailbox.remove(MSG_ANY);
            if dropped > 0 {
                tracing::debug!(dropped, "pending events discarded by reset");
            }
            g.data_source = None;
            g.restart = false;
            g.seek_pending = false;
            g.video_size = (0, 0);
            self.shared.set_state(&mut g, PlayerState::Idle);
            g.session.take()
        };
        self.shared.close_session(session);
    }

    /// Tear everything down. Idempotent; also run on drop.
    pub fn release(&self) {
        let shared = &self.shared;
        if shared.released.swap(true, Ordering::AcqRel) {
            return;
        }
        // Worker first, so no handler runs against a half-released player.
        shared.mailbox.abort();
        shared.mailbox.destroy();

        let session = {
            let mut g = shared.lock();
            g.lifecycle.transition(PlayerState::End);
            g.data_source = None;
            g.session.take()
        };
        shared.close_session(session);
        shared.video.release_resources();
        shared.audio.cleanup();
        tracing::info!("player released");
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().lifecycle.is_playing()
    }

    pub fn state(&self) -> PlayerState {
        self.shared.lock().lifecycle.state()
    }

    /// Playback position in milliseconds, 0 when unknown.
    pub fn current_position(&self) -> u64 {
        let g = self.shared.lock();
        g.session
            .as_ref()
            .and_then(|s| s.current_position())
            .map_or(0, duration_ms)
    }

    /// Media duration in milliseconds, 0 when unknown.
    pub fn duration(&self) -> u64 {
        let g = self.shared.lock();
        g.session
            .as_ref()
            .and_then(|s| s.duration())
            .map_or(0, duration_ms)
    }

    /// Set the output volume; kept across audio re-opens.
    pub fn set_volume(&self, left: f32, right: f32) {
        let left = left.clamp(0.0, 1.0);
        let right = right.clamp(0.0, 1.0);
        if !self.shared.audio.set_volume(left, right) {
            tracing::debug!(left, right, "volume stored; no audio output open");
        }
    }

    /// Inject an event, e.g. `MSG_REQ_PAUSE` from a thread that must not block.
    pub fn post_message(&self, msg: Message) -> bool {
        self.shared.mailbox.put(msg)
    }

    pub fn status(&self) -> PlayerStatus {
        let (state, data_source, restart, position, duration, (width, height)) = {
            let g = self.shared.lock();
            let session = g.session.as_ref();
            (
                g.lifecycle.state(),
                g.data_source.clone(),
                g.restart,
                session.and_then(|s| s.current_position()),
                session.and_then(|s| s.duration()),
                g.video_size,
            )
        };
        PlayerStatus {
            playing: matches!(state, PlayerState::Prepared | PlayerState::Started),
            state,
            data_source,
            position_ms: position.map(duration_ms),
            duration_ms: duration.map(duration_ms),
            video_width: (width > 0).then_some(width),
            video_height: (height > 0).then_some(height),
            audio: self.shared.audio.format_info(),
            restart_pending: restart,
            pending_events: self.shared.mailbox.len(),
        }
    }
}

impl Drop for MediaPlayer {
    fn drop(&mut self) {
        self.release();
    }
}

impl PlayerShared {
    fn lock(&self) -> MutexGuard<'_, PlayerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition and queue the matching state-changed event.
    fn set_state(&self, g: &mut PlayerInner, next: PlayerState) {
        if g.lifecycle.transition(next)
            && !self
                .mailbox
                .put(Message::with_args(MSG_PLAYBACK_STATE_CHANGED, next.code(), 0))
        {
            tracing::warn!(state = %next, "mailbox full, state change dropped");
        }
    }

    fn start_worker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handler = Box::new(move |msg: &Message| match weak.upgrade() {
            Some(player) => player.handle_message(msg),
            None => Ok(()),
        });
        if self.mailbox.start(handler) {
            tracing::debug!("event worker started");
        }
    }

    fn close_session(&self, session: Option<Box<dyn MediaSession>>) {
        if let Some(mut session) = session {
            session.close();
        }
        self.audio.close_audio();
    }

    fn start(&self) {
        let mut g = self.lock();
        if !g.lifecycle.can_start() {
            tracing::debug!(state = %g.lifecycle.state(), "start ignored");
            return;
        }
        if let Some(session) = g.session.as_mut() {
            if session.is_paused() {
                session.toggle_pause();
            }
        }
        self.set_state(&mut g, PlayerState::Started);
    }

    fn pause(&self) {
        let mut g = self.lock();
        if !g.lifecycle.can_pause() {
            tracing::debug!(state = %g.lifecycle.state(), "pause ignored");
            return;
        }
        if let Some(session) = g.session.as_mut() {
            if !session.is_paused() {
                session.toggle_pause();
            }
        }
        self.set_state(&mut g, PlayerState::Paused);
    }

    fn seek_to(&self, msec: i64) {
        let mut g = self.lock();
        if !g.lifecycle.can_seek() {
            tracing::debug!(state = %g.lifecycle.state(), msec, "seek ignored");
            return;
        }
        // A newer target supersedes queued requests.
        self.mailbox.remove(MSG_REQ_SEEK);
        let target = Duration::from_millis(msec.max(0).unsigned_abs());
        g.restart = false;
        g.seek_pending = true;
        if let Some(session) = g.session.as_mut() {
            tracing::debug!(msec, "seek");
            session.seek(target, self.config.seek_mode);
        }
    }

    /// Mailbox worker entry point.
    fn handle_message(&self, msg: &Message) -> Result<()> {
        match msg.what {
            MSG_FLUSH => {}
            MSG_ERROR => {
                self.set_state(&mut self.lock(), PlayerState::Error);
                self.notify(MediaEventType::Error, msg.arg1, msg.arg2, msg);
            }
            MSG_PREPARED => {
                {
                    let mut g = self.lock();
                    match g.lifecycle.state() {
                        PlayerState::Preparing | PlayerState::Prepared => {
                            self.set_state(&mut g, PlayerState::Prepared);
                        }
                        other => {
                            tracing::debug!(state = %other, "late prepared ignored");
                            return Ok(());
                        }
                    }
                }
                self.notify(MediaEventType::Prepared, 0, 0, msg);
                if self.config.auto_start_on_prepare {
                    self.start();
                }
            }
            MSG_COMPLETED => {
                let completed = {
                    let mut g = self.lock();
                    if g.lifecycle.can_complete() {
                        g.restart = true;
                        self.set_state(&mut g, PlayerState::Completed);
                        true
                    } else {
                        false
                    }
                };
                if completed {
                    self.notify(MediaEventType::PlaybackComplete, 0, 0, msg);
                } else {
                    tracing::debug!("completion ignored");
                }
            }
            MSG_VIDEO_SIZE_CHANGED => {
                self.lock().video_size = (msg.arg1.max(0) as u32, msg.arg2.max(0) as u32);
                self.notify(MediaEventType::VideoSizeChanged, msg.arg1, msg.arg2, msg);
            }
            MSG_SAR_CHANGED => {
                self.notify(MediaEventType::VideoSarChanged, msg.arg1, msg.arg2, msg);
            }
            MSG_BUFFERING_UPDATE => {
                self.notify(MediaEventType::BufferingUpdate, msg.arg1, msg.arg2, msg);
            }
            MSG_SEEK_COMPLETE => {
                self.lock().seek_pending = false;
                self.notify(MediaEventType::SeekComplete, msg.arg1, msg.arg2, msg);
            }
            MSG_COMPONENT_OPEN_ERR => {
                self.notify(MediaEventType::Error, info::COMPONENT_OPEN_ERR, msg.arg1, msg);
            }
            MSG_PLAYBACK_STATE_CHANGED => {
                self.notify(MediaEventType::Info, info::PLAYBACK_STATE_CHANGED, msg.arg1, msg);
            }
            MSG_REQ_START => self.start(),
            MSG_REQ_PAUSE => self.pause(),
            MSG_REQ_SEEK => self.seek_to(i64::from(msg.arg1)),
            MSG_BUFFERING_BYTES_UPDATE
            | MSG_BUFFERING_TIME_UPDATE
            | MSG_TIMED_TEXT
            | MSG_GET_IMG_STATE
            | MSG_VIDEO_DECODER_OPEN => {
                tracing::trace!(kind = message_name(msg.what), arg1 = msg.arg1, "engine event");
            }
            what => match info_code(what) {
                Some(code) => self.notify(MediaEventType::Info, code, msg.arg1, msg),
                None => tracing::warn!(what, "unknown message"),
            },
        }
        Ok(())
    }

    /// Deliver one event to the listener, if it is still alive.
    fn notify(&self, kind: MediaEventType, arg1: i32, arg2: i32, msg: &Message) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        let event = MediaEvent { kind, arg1, arg2 };
        let Some(listener) = listener else {
            tracing::debug!(?event, "no listener");
            return;
        };
        if let Err(e) = listener.on_event(event, msg.obj.as_ref()) {
            tracing::warn!(?event, "event delivery failed: {e:#}");
        }
    }
}

/// Engine events that reach the host as `Info(code, arg1)`.
fn info_code(what: i32) -> Option<i32> {
    let code = match what {
        MSG_VIDEO_RENDERING_START => info::VIDEO_RENDERING_START,
        MSG_AUDIO_RENDERING_START => info::AUDIO_RENDERING_START,
        MSG_VIDEO_ROTATION_CHANGED => info::VIDEO_ROTATION_CHANGED,
        MSG_AUDIO_DECODED_START => info::AUDIO_DECODED_START,
        MSG_VIDEO_DECODED_START => info::VIDEO_DECODED_START,
        MSG_OPEN_INPUT => info::OPEN_INPUT,
        MSG_FIND_STREAM_INFO => info::FIND_STREAM_INFO,
        MSG_COMPONENT_OPEN => info::COMPONENT_OPEN,
        MSG_VIDEO_SEEK_RENDERING_START => info::VIDEO_SEEK_RENDERING_START,
        MSG_AUDIO_SEEK_RENDERING_START => info::AUDIO_SEEK_RENDERING_START,
        MSG_BUFFERING_START => info::BUFFERING_START,
        MSG_BUFFERING_END => info::BUFFERING_END,
        MSG_ACCURATE_SEEK_COMPLETE => info::ACCURATE_SEEK_COMPLETE,
        _ => return None,
    };
    Some(code)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
