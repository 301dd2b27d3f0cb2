//! `SQLite` persistence for the durable reattach record.

pub mod db;
pub mod reattach_store;
