//! Business logic services (use cases).
//!
//! Services orchestrate repository calls, compilation, and the instance
//! lifecycle. They depend on traits (ports) -- never on concrete
//! infrastructure implementations.

pub mod workflow;
