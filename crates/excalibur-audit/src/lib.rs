//! Excalibur Audit - Tamper-evident audit journal
//!
//! Compliance sidecar for the dispatch runtime. The journal is
//! append-only and cryptographically verifiable:
//!
//! - Every event commits to the previous event's hash, forming a
//!   per-tenant hash chain over a canonical encoding
//! - Appends are serialized per tenant; cross-tenant writes proceed
//!   concurrently
//! - Reads go through an RBAC wrapper that filters by role and emits
//!   meta-audit records
//!
//! # Architectural Invariants
//!
//! 1. Events cannot be modified or deleted after insertion
//! 2. `event_hash(n) = SHA-256(canonical(event_n) || event_hash(n-1))`
//! 3. Hash comparison during verification is constant-time
//! 4. Meta-audit failures never block the primary read

pub mod event;
pub mod journal;
pub mod query;
pub mod rbac;

pub use event::*;
pub use journal::*;
pub use query::*;
pub use rbac::*;
