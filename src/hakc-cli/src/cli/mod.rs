//! CLI argument parsing and command dispatch.
//!
//! - `args` - Command-line argument structures
//! - `handlers` - Run and check execution, summary output

pub mod args;
pub mod handlers;

pub use args::{Cli, LogLevel};
pub use handlers::{exit_code_for, run_cli};
