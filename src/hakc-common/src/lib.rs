//! Common utilities shared across hakc crates.

pub mod dirs;
pub mod file_locking;
pub mod http_client;
pub mod path_consistency;
pub mod timeout;

pub use dirs::{AppDirs, get_app_dirs};
pub use file_locking::{FileLockError, FileLockResult, LockInfo, MarkerLock, atomic_write};
pub use http_client::{USER_AGENT, create_client_builder, create_client_with_timeout};
pub use path_consistency::{find_entry_case_insensitive, is_inside};
