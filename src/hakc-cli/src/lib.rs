//! hakc CLI library module.
//!
//! Argument parsing and command handlers live here so they can be tested
//! without spawning the binary.

pub mod cli;
