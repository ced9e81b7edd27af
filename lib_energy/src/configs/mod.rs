//! # Configuration Modules
//!
//! Typed policy configuration for the ingestion engine. The binary owns the
//! layered loading (defaults, file, environment, flags); this module owns what
//! the values mean.

/// Window, delta, decoding, and recovery policies.
pub mod config_ingest;

pub use config_ingest::*;
