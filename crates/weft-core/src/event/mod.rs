//! Event bus for run lifecycle events.
//!
//! Provides an `EventBus` that distributes `RunEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel. The bus doubles as a
//! `RunObserver`, so it can be handed straight to `RunOptions`.

pub mod bus;

pub use bus::EventBus;
