//! Workflow validation, planning, and execution for weft.
//!
//! Depends only on `weft-types` for shared domain types. Tool steps reach the
//! outside world exclusively through the `ToolExecutor` trait.

pub mod config;
pub mod event;
pub mod workflow;
