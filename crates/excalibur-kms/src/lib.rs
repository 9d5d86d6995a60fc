//! Excalibur KMS - Envelope-encryption key management
//!
//! Long-term data protection for the dispatch runtime:
//!
//! - Key families with versioned lifecycle (Active → DecryptOnly →
//!   PendingDestruction → Destroyed, Suspended as a temporary detour)
//! - Atomic rotation: readers see the old key or the new key, never a
//!   partial state
//! - AES-256-GCM envelope encryption with the `EXCR` at-rest framing
//! - Split-knowledge escrow with threshold recovery tokens
//! - Policy-driven migration of data onto current keys
//!
//! # Architectural Invariants
//!
//! 1. Key material NEVER leaves the provider
//! 2. At most one Active version per key family
//! 3. Only Active versions encrypt; Active and DecryptOnly decrypt
//! 4. `is_field_encrypted(x)` iff `x` starts with the 4-byte EXCR magic

pub mod config;
pub mod envelope;
pub mod escrow;
pub mod key;
pub mod migration;
pub mod provider;

pub use config::*;
pub use envelope::*;
pub use escrow::*;
pub use key::*;
pub use migration::*;
pub use provider::*;
