//! CLI runtime helpers.
//!
//! Provides logging setup, device enumeration and local playback through the player.

use std::sync::{Arc, OnceLock};

use anyhow::{Result, anyhow, bail};
use crossbeam_channel::{Receiver, never, select, tick};
use skyplayer_core::{EventListener, MediaPlayer, device};
use skyplayer_types::{MediaEvent, MediaEventType};
use tracing_subscriber::EnvFilter;

use crate::config::PlayConfig;
use crate::engine::SymphoniaEngine;
use crate::listener::{ChannelListener, OutputLine, describe};

/// Install the global tracing subscriber. Later calls are no-ops.
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,skyplay=info,skyplayer_core=info")
            }))
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for d in device::list_devices(&host)? {
        println!(
            "{} {}  ({}-{} Hz, up to {} ch)",
            if d.is_default { "*" } else { " " },
            d.name,
            d.min_rate,
            d.max_rate,
            d.max_channels
        );
    }
    Ok(())
}

/// Play one local file until it completes, fails, or `stop` fires.
pub fn run_play(config: PlayConfig, stop: Receiver<()>) -> Result<()> {
    let source = config
        .path
        .to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {:?}", config.path))?
        .to_string();

    let engine = Arc::new(SymphoniaEngine::new(config.decode_buffer_seconds));
    let player = MediaPlayer::new(config.player.clone(), engine);
    let (listener, events) = ChannelListener::new();
    let listener: Arc<dyn EventListener> = listener;
    player.set_listener(Arc::downgrade(&listener));
    player.set_volume(config.volume, config.volume);

    player.set_data_source(&source)?;
    player.prepare_async()?;
    let outcome = drive(&player, &events, &stop, &config);
    player.release();
    outcome
}

fn drive(
    player: &MediaPlayer,
    events: &Receiver<MediaEvent>,
    stop: &Receiver<()>,
    config: &PlayConfig,
) -> Result<()> {
    let ticker = if config.status_interval.is_zero() {
        never()
    } else {
        tick(config.status_interval)
    };
    let mut pending_seek = config.seek_ms;

    loop {
        select! {
            recv(events) -> event => {
                let event = event?;
                tracing::debug!(event = %describe(&event), "player event");
                println!("{}", OutputLine::Event(event).to_json()?);
                match event.kind {
                    MediaEventType::Prepared => {
                        player.start();
                        if let Some(ms) = pending_seek.take() {
                            player.seek_to(i64::try_from(ms).unwrap_or(i64::MAX));
                        }
                    }
                    MediaEventType::PlaybackComplete => {
                        tracing::info!("playback complete");
                        return Ok(());
                    }
                    MediaEventType::Error => {
                        bail!("playback failed ({}, {})", event.arg1, event.arg2);
                    }
                    _ => {}
                }
            }
            recv(ticker) -> _ => {
                println!("{}", OutputLine::Status(player.status()).to_json()?);
            }
            recv(stop) -> _ => {
                tracing::info!("interrupted");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::write_test_wav;
    use skyplayer_core::buffer_queue::AudioOutType;
    use skyplayer_core::{AudioOutConfig, MailboxConfig, PlayerConfig};
    use std::path::PathBuf;
    use std::time::Duration;

    fn null_config(path: PathBuf) -> PlayConfig {
        PlayConfig {
            path,
            player: PlayerConfig {
                mailbox: MailboxConfig {
                    capacity: 1000,
                    poll_interval: Duration::from_millis(10),
                },
                audio: AudioOutConfig {
                    output: AudioOutType::Null,
                    realtime: false,
                    ..AudioOutConfig::default()
                },
                ..PlayerConfig::default()
            },
            volume: 0.5,
            seek_ms: None,
            status_interval: Duration::from_millis(50),
            decode_buffer_seconds: 0.5,
        }
    }

    /// Run on a helper thread so a hang fails the test instead of stalling it.
    fn run_with_deadline(config: PlayConfig) -> Result<()> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            let (_stop_tx, stop_rx) = crossbeam_channel::bounded(1);
            let _ = done_tx.send(run_play(config, stop_rx));
        });
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("playback did not finish")
    }

    #[test]
    fn plays_wav_to_completion_on_null_output() {
        let path = write_test_wav("complete", 8_000, 1, 300);
        let res = run_with_deadline(null_config(path.clone()));
        let _ = std::fs::remove_file(path);
        res.unwrap();
    }

    #[test]
    fn seek_then_complete() {
        let path = write_test_wav("seek", 8_000, 2, 600);
        let mut config = null_config(path.clone());
        config.seek_ms = Some(400);
        let res = run_with_deadline(config);
        let _ = std::fs::remove_file(path);
        res.unwrap();
    }

    #[test]
    fn missing_file_reports_error() {
        let config = null_config(PathBuf::from("/nonexistent/skyplay/missing.wav"));
        assert!(run_with_deadline(config).is_err());
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
