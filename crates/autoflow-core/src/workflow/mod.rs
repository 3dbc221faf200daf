//! Workflow engine core.
//!
//! - `definition` -- step tree parsing from JSON or YAML
//! - `compiler` -- step tree to task graph
//! - `cycle` -- self-trigger rules and cross-workflow reference cycles
//! - `expression` -- `{{...}}` parameter resolution
//! - `precheck` -- condition operators and skip/block decisions
//! - `expand` -- iteration-qualified ids and loop scopes
//! - `executor` -- reference executor over compiled tasks
//! - `lifecycle` -- cancel and retry
//! - `resume` -- re-injecting results into blocked tasks
//! - `materializer` -- task result views by event or graph replay
//! - `cache` -- TTL cache for materialized views

pub mod cache;
pub mod compiler;
pub mod cycle;
pub mod definition;
pub mod executor;
pub mod expand;
pub mod expression;
pub mod lifecycle;
pub mod materializer;
pub mod precheck;
pub mod resume;
