//! Business logic and repository trait definitions for Autoflow.
//!
//! This crate defines the "ports" (repository traits, distributed lock,
//! action registry) that the infrastructure layer implements. It depends
//! only on `autoflow-types` -- never on `autoflow-infra` or any database/IO
//! crate.

pub mod action;
pub mod error;
pub mod repository;
pub mod service;
pub mod sync;
pub mod workflow;
