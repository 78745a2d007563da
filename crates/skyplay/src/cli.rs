use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use skyplayer_core::buffer_queue::AudioOutType;
use skyplayer_core::{AudioOutConfig, MailboxConfig, PlayerConfig};

use crate::config::PlayConfig;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "skyplay", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Audio sink: `cpal` (sound card) or `null` (discard at real-time pace)
    #[arg(long, default_value = "cpal")]
    pub output: AudioOutType,

    /// Number of hardware buffers kept in flight
    #[arg(long, default_value_t = 4)]
    pub buffers: usize,

    /// Duration of one hardware buffer in milliseconds
    #[arg(long, default_value_t = 10)]
    pub buffer_ms: u32,

    /// Maximum queued player events
    #[arg(long, default_value_t = 1000)]
    pub mailbox_capacity: usize,

    /// Output volume, 0.0 to 1.0
    #[arg(long, default_value_t = 1.0)]
    pub volume: f32,

    /// Seek to this position (milliseconds) once playback starts
    #[arg(long)]
    pub seek_ms: Option<u64>,

    /// Print a JSON status line this often; 0 disables
    #[arg(long, default_value_t = 1000)]
    pub status_interval_ms: u64,

    /// Decoded audio buffered ahead of the output, in seconds
    #[arg(long, default_value_t = 1.0)]
    pub buffer_seconds: f32,

    /// Do not request real-time scheduling for the audio thread
    #[arg(long)]
    pub no_realtime: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Play a local audio file
    Play {
        /// Path to audio file
        path: PathBuf,
    },
}

impl Args {
    pub fn player_config(&self) -> PlayerConfig {
        PlayerConfig {
            mailbox: MailboxConfig {
                capacity: self.mailbox_capacity,
                ..MailboxConfig::default()
            },
            audio: AudioOutConfig {
                output: self.output,
                device: normalize_device_name(self.device.clone()),
                buffer_count: self.buffers,
                buffer_ms: self.buffer_ms,
                realtime: !self.no_realtime,
                ..AudioOutConfig::default()
            },
            ..PlayerConfig::default()
        }
    }

    pub fn play_config(&self, path: PathBuf) -> PlayConfig {
        PlayConfig {
            path,
            player: self.player_config(),
            volume: self.volume.clamp(0.0, 1.0),
            seek_ms: self.seek_ms,
            status_interval: Duration::from_millis(self.status_interval_ms),
            decode_buffer_seconds: self.buffer_seconds,
        }
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_device_name_trims_and_drops_empty() {
        assert_eq!(normalize_device_name(None), None);
        assert_eq!(normalize_device_name(Some("  ".to_string())), None);
        assert_eq!(
            normalize_device_name(Some("  USB DAC ".to_string())),
            Some("USB DAC".to_string())
        );
    }

    #[test]
    fn defaults_map_onto_player_config() {
        let args = Args::try_parse_from(["skyplay", "play", "song.flac"]).unwrap();
        let Some(Command::Play { path }) = args.cmd.clone() else {
            panic!("expected play");
        };
        let cfg = args.play_config(path);
        assert_eq!(cfg.path, PathBuf::from("song.flac"));
        assert_eq!(cfg.player.audio.output, AudioOutType::Cpal);
        assert_eq!(cfg.player.audio.buffer_count, 4);
        assert_eq!(cfg.player.mailbox.capacity, 1000);
        assert!(cfg.player.audio.realtime);
        assert_eq!(cfg.status_interval, Duration::from_secs(1));
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "skyplay",
            "--output",
            "null",
            "--buffers",
            "8",
            "--buffer-ms",
            "20",
            "--volume",
            "3.0",
            "--no-realtime",
            "--device",
            " dac ",
            "play",
            "a.wav",
        ])
        .unwrap();
        let cfg = args.play_config(PathBuf::from("a.wav"));
        assert_eq!(cfg.player.audio.output, AudioOutType::Null);
        assert_eq!(cfg.player.audio.buffer_count, 8);
        assert_eq!(cfg.player.audio.buffer_ms, 20);
        assert_eq!(cfg.player.audio.device.as_deref(), Some("dac"));
        assert!(!cfg.player.audio.realtime);
        assert_eq!(cfg.volume, 1.0);
    }

    #[test]
    fn unknown_output_is_rejected() {
        assert!(Args::try_parse_from(["skyplay", "--output", "alsa", "play", "a.wav"]).is_err());
    }
}
