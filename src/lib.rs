#![forbid(unsafe_code)]

//! `game-warden` — game-server watchdog core.
//!
//! Supervises one long-running game-server process: keeps it alive,
//! rolls newer builds in without downtime, and survives restarts of the
//! daemon itself through a durable reattach record.

pub mod config;
pub mod control;
pub mod errors;
pub mod hooks;
pub mod models;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod topic;
pub mod watchdog;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
