//! Mediaferry - binary media pipeline
//!
//! Progressive container loading, ranged HTTP interception, a single-flight
//! task queue and a frame cache worker built on the palette codec.
//! The library crate exposes the core functionality for integration testing.

pub mod config;
pub mod queue;
pub mod server;
pub mod streaming;
pub mod worker;
