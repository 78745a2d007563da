//! skyplay: play a local audio file through the skyplayer core.
//!
//! The file is decoded by Symphonia, handed to the player's audio output engine and
//! played on a CPAL device (or the null sink). Player events and periodic status
//! snapshots are printed to stdout as JSON lines; logs go to stderr.

use anyhow::{Result, bail};
use clap::Parser;
use skyplay::cli::{Args, Command};
use skyplay::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    runtime::init_tracing();

    if args.list_devices {
        return runtime::list_devices();
    }

    let Some(Command::Play { path }) = args.cmd.clone() else {
        bail!("nothing to play; try `skyplay play <path>`");
    };

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    // Held here so a failed handler install does not read as an interrupt.
    let _stop_keepalive = stop_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }

    runtime::run_play(args.play_config(path), stop_rx)
}
