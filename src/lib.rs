//! Parcel: end-to-end encrypted group chat.
//!
//! A relay daemon (`parceld`) fans ciphertext out among a bounded set of
//! peers; clients (`parcel`) hold the keys. Every connection gets a private
//! *control key* from a two-party X25519 exchange, and the whole group
//! re-derives a shared *session key* on every join and leave through an
//! N-party contribution ring the daemon can route but never read.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod commands;
pub mod crypto;
pub mod daemon;
pub mod kex;
pub mod wire;

pub use crypto::SecretKey;
pub use daemon::{Daemon, DaemonConfig};
pub use wire::{WireError, DATA_LEN_MAX};
