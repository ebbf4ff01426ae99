//! Tokenshare Server Library
//!
//! Self-hosted file sharing: a sender creates a token-addressed share,
//! uploads files to it in chunks and finalizes it; the recipient gets a link
//! that works until the share expires.
//!
//! The main server binary is in main.rs.
//!
//! # Modules
//!
//! - `share`: share lifecycle (registry, chunk assembly, downloads, reaper)
//! - `storage`: byte storage backends and the retry wrapper
//! - `notify`: recipient notification (Mailjet, log)
//! - `db`: SQLite persistence of share records
//! - `routes`: HTTP API

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod notify;
pub mod routes;
pub mod share;
pub mod state;
pub mod storage;
