//! # vcache-cli
//!
//! Library side of the `vcache` command-line client.

pub mod commands;
pub mod local;

pub use commands::{Options, Runner};
