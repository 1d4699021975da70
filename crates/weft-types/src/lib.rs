//! Shared domain types for weft.
//!
//! Workflow definitions, step kinds, validation reports, execution plans,
//! run events, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, schemars.

pub mod config;
pub mod event;
pub mod workflow;
