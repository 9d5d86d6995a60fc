//! Excalibur Dispatch - Middleware pipeline and handler invocation
//!
//! The dispatch core resolves handlers for typed messages and runs them
//! through a configurable middleware pipeline:
//!
//! - Middleware declare applicability (kinds, exclusions, required
//!   features) and a stage; the evaluator filters them per dispatch
//! - The invoker orders the filtered chain (stage, then registration
//!   order) and executes it, ending at the resolved handler
//! - Five handler shapes: action, streaming document, stream consumer,
//!   stream transform, and progress
//!
//! # Architectural Invariants
//!
//! 1. Middleware execution order is deterministic per request
//! 2. A short-circuiting middleware prevents later middleware and the
//!    handler from running; already-entered middleware see the result
//! 3. Streaming consumers bound their producers, no unbounded buffering
//! 4. Cancellation is observable at entry to each middleware and at every
//!    yield point of a streaming handler

pub mod applicability;
pub mod dispatcher;
pub mod handler;
pub mod middleware;
pub mod pipeline;
pub mod progress;
pub mod streaming;

pub use applicability::*;
pub use dispatcher::*;
pub use handler::*;
pub use middleware::*;
pub use pipeline::*;
pub use progress::*;
pub use streaming::*;
