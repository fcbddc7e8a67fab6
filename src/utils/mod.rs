//! # Utilities Module
//!
//! ## Role
//! Cross-cutting helpers that don't belong in domain-specific modules.
//!
//! ## Sub-modules
//! - `threading`: Rayon thread pool configuration
//! - `telemetry`: Progress counters and heartbeat reporting

pub mod telemetry;
pub mod threading;
