//! Tracing setup for hosts embedding the weft engine.
//!
//! The engine itself only emits `tracing` spans and events; installing a
//! subscriber is left to the host, which can use [`tracing_setup`].

pub mod tracing_setup;
