//! CalDAV implementation of [`RemoteClient`](crate::RemoteClient).

mod auth;
mod client;
mod config;
pub mod xml;

pub use auth::{Authenticator, Challenge, DigestChallenge};
pub use client::CalDavClient;
pub use config::CalDavConfig;
