pub mod cli;
pub mod config;
pub mod engine;
pub mod listener;
pub mod pcm;
pub mod runtime;
