//! Finsync Server Library
//!
//! Pairs mobile devices with a desktop finance store and keeps their records
//! in sync over WebSocket. The server binary is in main.rs.
//!
//! # Modules
//!
//! - `db`: SQLite schema and record persistence
//! - `sync`: pairing tokens, device registry, protocol and reconciliation
//! - `routes`: local HTTP control plane

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod sync;
