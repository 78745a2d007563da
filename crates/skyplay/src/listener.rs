//! Event fan-in and console output for the CLI host.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use skyplayer_core::EventListener;
use skyplayer_core::messages::Payload;
use skyplayer_types::{MediaEvent, MediaEventType, PlayerState, PlayerStatus, info};

/// Forwards every player event into a channel drained by the main thread.
pub struct ChannelListener {
    tx: Sender<MediaEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, Receiver<MediaEvent>) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: MediaEvent, _payload: Option<&Payload>) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("event receiver dropped"))
    }
}

/// One JSON line on stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputLine {
    Event(MediaEvent),
    Status(PlayerStatus),
}

impl OutputLine {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Short human label for logs.
pub fn describe(event: &MediaEvent) -> String {
    match event.kind {
        MediaEventType::Info if event.arg1 == info::PLAYBACK_STATE_CHANGED => {
            match PlayerState::from_code(event.arg2) {
                Some(state) => format!("state -> {state}"),
                None => format!("state -> #{}", event.arg2),
            }
        }
        MediaEventType::Info => format!("info {} ({})", event.arg1, event.arg2),
        MediaEventType::Error => format!("error {} ({})", event.arg1, event.arg2),
        MediaEventType::VideoSizeChanged => format!("video size {}x{}", event.arg1, event.arg2),
        kind => format!("{kind:?}").to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_forwards_until_receiver_dropped() {
        let (listener, rx) = ChannelListener::new();
        let event = MediaEvent {
            kind: MediaEventType::Prepared,
            arg1: 0,
            arg2: 0,
        };
        listener.on_event(event, None).unwrap();
        assert_eq!(rx.try_recv().unwrap(), event);
        drop(rx);
        assert!(listener.on_event(event, None).is_err());
    }

    #[test]
    fn output_lines_are_tagged() {
        let line = OutputLine::Event(MediaEvent {
            kind: MediaEventType::SeekComplete,
            arg1: 1500,
            arg2: 0,
        });
        let json = line.to_json().unwrap();
        assert!(json.starts_with("{\"type\":\"event\""));
        assert!(json.contains("\"arg1\":1500"));

        let status = OutputLine::Status(PlayerStatus::default());
        assert!(status.to_json().unwrap().contains("\"type\":\"status\""));
    }

    #[test]
    fn describe_names_state_changes() {
        let e = MediaEvent {
            kind: MediaEventType::Info,
            arg1: info::PLAYBACK_STATE_CHANGED,
            arg2: PlayerState::Started.code(),
        };
        assert_eq!(describe(&e), "state -> started");
        let e = MediaEvent {
            kind: MediaEventType::PlaybackComplete,
            arg1: 0,
            arg2: 0,
        };
        assert_eq!(describe(&e), "playbackcomplete");
    }
}
