//! Room, identity, power-level and media synchronization between a remote chat
//! platform and Matrix.
//!
//! A platform listener owns the remote connection. It builds a [`BridgeCore`],
//! wraps it in an [`EventDispatcher`] and dispatches every [`RemoteEvent`] it
//! observes. The `matrix-bridge-core` binary only checks the configuration,
//! migrates the store and registers the bridge bot.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod matrix;
pub mod media;
pub mod parsers;
pub mod utils;

pub use bridge::{BridgeCore, EventDispatcher, EventOutcome, RemoteEvent};
pub use error::BridgeError;
