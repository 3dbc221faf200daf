//! Shared domain types for Autoflow.
//!
//! This crate contains the data model used across the engine: the authored
//! step tree, the compiled task graph, persisted Dags and their versions,
//! run-time instances, the append-only event log, and the engine config.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod cursor;
pub mod dag;
pub mod error;
pub mod event;
pub mod instance;
pub mod operator;
pub mod step;
pub mod task;
