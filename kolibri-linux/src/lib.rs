//! Kolibri peer link for Linux: control session, file transfer reactor and the console
//! daemon's building blocks.

pub mod config;
pub mod controller;
pub mod events;
pub mod file;
pub mod handler;
pub mod mux;

pub use config::Config;
pub use controller::{ControlError, Controller};
pub use events::{ChannelSink, Event};
pub use file::{DiskFile, LocalFile};
pub use handler::{Outcome, ReceiveHandler, SendHandler, TransferError};
pub use mux::{MuxConfig, Stopping, TransferMux};
