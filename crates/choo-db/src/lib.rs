//! SQLite-backed journal for choo: runs, units, and events.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
