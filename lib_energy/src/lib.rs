//! # lib_energy
//!
//! Shared library for the energy ingestion service. It turns a feed of
//! cumulative energy-counter readings, published per gateway over MQTT, into
//! consumption deltas written to PostgreSQL.
//!
//! Modules are gated by cargo features so that small tools can pull in only
//! what they need:
//!
//! - **`configs`**: policy values (window size, delta mode, decoding
//!   strictness, recovery strategy) and their parsing.
//! - **`core`**: the engine itself. Topic resolution, the windowed delta
//!   engine, the ingestion dispatcher, the liveness watchdog and the traits
//!   at which external collaborators plug in.
//! - **`connections`**: the PostgreSQL persistence gateway.
//! - **`ingestors`**: the MQTT transport adapter.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "ingestors")]
pub mod ingestors;
