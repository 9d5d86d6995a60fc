//! Excalibur Saga - Stateful workflow orchestration
//!
//! Long-running workflows are modeled as sagas: persisted state machines
//! identified by a correlation key, executed step by step with
//! compensations on failure and timeouts delivered as messages.
//!
//! - [`correlation`]: resolve a correlation key from an arbitrary message
//! - [`state`]: the persisted instance model and timeout rows
//! - [`store`]: the persistence contract and the in-memory reference
//! - [`coordinator`]: step graph execution with compensation
//! - [`timeout`]: the polling delivery service
//! - [`bridge`]: routes reconstructed timeouts back into the pipeline
//!
//! # Architectural Invariants
//!
//! 1. `version` strictly increases on every persisted change
//! 2. Step failures are outcomes, not panics
//! 3. A compensation failure never aborts the compensation walk
//! 4. Timeouts deliver in non-decreasing due order per saga, exactly once

pub mod bridge;
pub mod coordinator;
pub mod correlation;
pub mod state;
pub mod store;
pub mod timeout;

pub use bridge::*;
pub use coordinator::*;
pub use correlation::*;
pub use state::*;
pub use store::*;
pub use timeout::*;
