//! UI end of the bridge, broadcast listener, CLI
//!
//! This crate provides:
//! - [`BridgeClient`], which calls worker services and receives their
//!   broadcasts over any byte stream
//! - [`BroadcastListener`], typed fan-out of broadcasts that can drive a
//!   [`PendingTracker`](calbridge_core::PendingTracker)
//! - the `calbridge` command-line interface

pub mod bridge;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod listener;
pub mod secret;

pub use bridge::{BridgeClient, BridgeConfig, Broadcasts};
pub use cli::Cli;
pub use config::ClientConfig;
pub use error::{BridgeError, ClientError, ClientResult};
pub use listener::{BroadcastListener, ListenerError, ListenerSpec, SubscriptionId};
