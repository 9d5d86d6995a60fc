//! Excalibur Types - Canonical domain types for the dispatch runtime
//!
//! This crate contains all foundational types for Excalibur with zero
//! dependencies on other excalibur crates. It defines the complete type
//! system for:
//!
//! - Identity types (MessageId, SagaId, TenantId, etc.)
//! - The message envelope and its erased view handed to middleware
//! - Message kinds and the type-name classification convention
//! - Feature tags that gate middleware applicability
//! - The message context and its capability bag
//! - Dispatch results and the shared error taxonomy
//! - The clock abstraction used wherever trusted time is required
//!
//! # Architectural Invariants
//!
//! 1. Envelopes are immutable once constructed; the pipeline borrows them
//!    without mutation
//! 2. The context is mutable only via typed setters before dispatch and
//!    read-only inside the pipeline
//! 3. Failure is explicit: every fallible operation returns a
//!    [`DispatchError`] with a stable error code

pub mod clock;
pub mod context;
pub mod error;
pub mod features;
pub mod identity;
pub mod message;
pub mod result;

pub use clock::*;
pub use context::*;
pub use error::*;
pub use features::*;
pub use identity::*;
pub use message::*;
pub use result::*;

/// Version of the Excalibur types schema
pub const TYPES_VERSION: &str = "0.1.0";
