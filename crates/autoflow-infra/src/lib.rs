//! Infrastructure layer for Autoflow.
//!
//! Contains implementations of the ports defined in `autoflow-core`: SQLite
//! storage for every repository trait, a SQLite-backed distributed lock, and
//! the `config.toml` loader.

pub mod config;
pub mod sqlite;
