//! Excalibur Export - SIEM delivery for the audit journal
//!
//! Drains audit events to an external HEC-style collector:
//!
//! - Single and batched export with per-event results
//! - Transient/permanent classification by status code
//! - Exponential backoff retries for transient failures only
//! - Endpoint health probing
//!
//! The wire is behind [`HecTransport`]; production uses the reqwest
//! implementation, tests script responses in memory. The pump drains
//! the journal asynchronously so audit writes never wait on the SIEM.

pub mod config;
pub mod exporter;
pub mod pump;

pub use config::*;
pub use exporter::*;
pub use pump::*;
