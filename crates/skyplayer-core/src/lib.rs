pub mod audio;
pub mod audio_out;
pub mod buffer_queue;
pub mod config;
pub mod cpal_queue;
pub mod device;
pub mod engine;
pub mod mailbox;
pub mod messages;
pub mod player;
pub mod state;
pub mod video;

pub use config::{AudioOutConfig, MailboxConfig, PlayerConfig};
pub use engine::{EngineBridge, MediaEngine, MediaSession, SeekMode};
pub use player::{EventListener, MediaPlayer};
