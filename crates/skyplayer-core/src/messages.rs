//! Event vocabulary carried by the [`Mailbox`](crate::mailbox::Mailbox).
//!
//! Kinds are plain integers so that decode engines written against the historical
//! numbering keep working. Ranges:
//! - `0..=999`: engine status (prepared, completed, buffering, seek, ...)
//! - `10001..`: decoder internals
//! - `20001..`: control requests looped back through the mailbox

use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub const MSG_FLUSH: i32 = 0;
pub const MSG_ERROR: i32 = 100;
pub const MSG_PREPARED: i32 = 200;
pub const MSG_COMPLETED: i32 = 300;
/// `arg1` = width, `arg2` = height.
pub const MSG_VIDEO_SIZE_CHANGED: i32 = 400;
/// `arg1` = numerator, `arg2` = denominator.
pub const MSG_SAR_CHANGED: i32 = 401;
pub const MSG_VIDEO_RENDERING_START: i32 = 402;
pub const MSG_AUDIO_RENDERING_START: i32 = 403;
/// `arg1` = degrees.
pub const MSG_VIDEO_ROTATION_CHANGED: i32 = 404;
pub const MSG_AUDIO_DECODED_START: i32 = 405;
pub const MSG_VIDEO_DECODED_START: i32 = 406;
pub const MSG_OPEN_INPUT: i32 = 407;
pub const MSG_FIND_STREAM_INFO: i32 = 408;
pub const MSG_COMPONENT_OPEN: i32 = 409;
pub const MSG_COMPONENT_OPEN_ERR: i32 = 410;
pub const MSG_VIDEO_SEEK_RENDERING_START: i32 = 411;
pub const MSG_AUDIO_SEEK_RENDERING_START: i32 = 412;

pub const MSG_BUFFERING_START: i32 = 500;
pub const MSG_BUFFERING_END: i32 = 501;
/// `arg1` = buffered percent, `arg2` = engine specific.
pub const MSG_BUFFERING_UPDATE: i32 = 502;
pub const MSG_BUFFERING_BYTES_UPDATE: i32 = 503;
pub const MSG_BUFFERING_TIME_UPDATE: i32 = 504;

pub const MSG_SEEK_COMPLETE: i32 = 600;
/// `arg1` = new lifecycle state code.
pub const MSG_PLAYBACK_STATE_CHANGED: i32 = 700;
pub const MSG_TIMED_TEXT: i32 = 800;
/// `arg1` = position reached, in milliseconds.
pub const MSG_ACCURATE_SEEK_COMPLETE: i32 = 900;
pub const MSG_GET_IMG_STATE: i32 = 1000;

pub const MSG_VIDEO_DECODER_OPEN: i32 = 10001;

pub const MSG_REQ_START: i32 = 20001;
pub const MSG_REQ_PAUSE: i32 = 20002;
/// `arg1` = target position in milliseconds.
pub const MSG_REQ_SEEK: i32 = 20003;

/// Wildcard accepted by [`Mailbox::remove`](crate::mailbox::Mailbox::remove).
pub const MSG_ANY: i32 = -1;

/// Opaque attachment. The mailbox clones the handle but never looks inside.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// One control/status event.
#[derive(Clone, Default)]
pub struct Message {
    pub what: i32,
    pub arg1: i32,
    pub arg2: i32,
    pub obj: Option<Payload>,
}

impl Message {
    pub fn new(what: i32) -> Self {
        Self {
            what,
            ..Self::default()
        }
    }

    pub fn with_args(what: i32, arg1: i32, arg2: i32) -> Self {
        Self {
            what,
            arg1,
            arg2,
            obj: None,
        }
    }

    pub fn with_payload(mut self, obj: Payload) -> Self {
        self.obj = Some(obj);
        self
    }

    /// Borrow the payload as `T` if it has that type.
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.obj.as_deref().and_then(|o| o.downcast_ref::<T>())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("what", &message_name(self.what))
            .field("arg1", &self.arg1)
            .field("arg2", &self.arg2)
            .field("obj", &self.obj.is_some())
            .finish()
    }
}

/// Stable label for logs.
pub fn message_name(what: i32) -> &'static str {
    match what {
        MSG_FLUSH => "flush",
        MSG_ERROR => "error",
        MSG_PREPARED => "prepared",
        MSG_COMPLETED => "completed",
        MSG_VIDEO_SIZE_CHANGED => "video_size_changed",
        MSG_SAR_CHANGED => "sar_changed",
        MSG_VIDEO_RENDERING_START => "video_rendering_start",
        MSG_AUDIO_RENDERING_START => "audio_rendering_start",
        MSG_VIDEO_ROTATION_CHANGED => "video_rotation_changed",
        MSG_AUDIO_DECODED_START => "audio_decoded_start",
        MSG_VIDEO_DECODED_START => "video_decoded_start",
        MSG_OPEN_INPUT => "open_input",
        MSG_FIND_STREAM_INFO => "find_stream_info",
        MSG_COMPONENT_OPEN => "component_open",
        MSG_COMPONENT_OPEN_ERR => "component_open_err",
        MSG_VIDEO_SEEK_RENDERING_START => "video_seek_rendering_start",
        MSG_AUDIO_SEEK_RENDERING_START => "audio_seek_rendering_start",
        MSG_BUFFERING_START => "buffering_start",
        MSG_BUFFERING_END => "buffering_end",
        MSG_BUFFERING_UPDATE => "buffering_update",
        MSG_BUFFERING_BYTES_UPDATE => "buffering_bytes_update",
        MSG_BUFFERING_TIME_UPDATE => "buffering_time_update",
        MSG_SEEK_COMPLETE => "seek_complete",
        MSG_PLAYBACK_STATE_CHANGED => "playback_state_changed",
        MSG_TIMED_TEXT => "timed_text",
        MSG_ACCURATE_SEEK_COMPLETE => "accurate_seek_complete",
        MSG_GET_IMG_STATE => "get_img_state",
        MSG_VIDEO_DECODER_OPEN => "video_decoder_open",
        MSG_REQ_START => "req_start",
        MSG_REQ_PAUSE => "req_pause",
        MSG_REQ_SEEK => "req_seek",
        MSG_ANY => "any",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_downcasts_to_original_type() {
        let msg = Message::new(MSG_TIMED_TEXT).with_payload(Arc::new(String::from("hello")));
        assert_eq!(msg.payload::<String>().map(String::as_str), Some("hello"));
        assert!(msg.payload::<u32>().is_none());
    }

    #[test]
    fn clone_shares_payload() {
        let obj: Payload = Arc::new(7u32);
        let msg = Message::with_args(MSG_ERROR, 1, 2).with_payload(obj.clone());
        let copy = msg.clone();
        assert_eq!(copy.arg1, 1);
        assert_eq!(copy.arg2, 2);
        assert_eq!(Arc::strong_count(&obj), 3);
    }

    #[test]
    fn debug_uses_message_name() {
        let text = format!("{:?}", Message::new(MSG_PREPARED));
        assert!(text.contains("prepared"));
        assert_eq!(message_name(123_456), "unknown");
    }
}
