//! Top-level command handlers for the stage and run entry points.
pub mod run;
pub mod stage;
