#![deny(clippy::or_fun_call)]
#![deny(clippy::bool_to_int_with_if)]

//! Cloud Foundry staging and run lifecycle engine for container images.

pub mod buildpack;
pub mod cfenv;
pub mod cli;
pub mod commands;
pub mod error;
pub mod exec;
pub mod git;
pub mod logging;
pub mod manifest;
pub mod staging;
pub mod supervisor;
