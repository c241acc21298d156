//! mtnet echo server
//!
//! Accepts TCP connections, gives every connection its own handler thread,
//! and echoes each newline-delimited frame back to the sender.

pub mod config;
pub mod echo;

pub use config::Config;
pub use echo::{EchoFactory, EchoHandler, EchoStats};
