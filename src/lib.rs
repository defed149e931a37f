//! LibriSync core
//!
//! Audible sign-in (OAuth2 + PKCE bound to a device serial), activation
//! bytes, library sync into a local SQLite catalog, asset download and
//! AAX to M4B decryption.
//!
//! Hosts normally go through [`bridge::Bridge`]. The modules below are
//! usable directly from async Rust.

pub mod error;
pub mod config;
pub mod logging;

pub mod api;
pub mod crypto;
pub mod storage;
pub mod download;
pub mod file;

pub mod bridge;

pub use error::{LibriSyncError, Result};
pub use config::CoreConfig;
pub use bridge::{Bridge, Envelope};
