//! HTTP client factory for the release feed and artifact downloads.
//!
//! All clients include a User-Agent (GitHub rejects requests without one),
//! tcp_nodelay and a bounded read timeout.

use reqwest::Client;
use std::time::Duration;

/// User-Agent string for all HTTP requests
pub const USER_AGENT: &str = concat!("hakc/", env!("CARGO_PKG_VERSION"));

/// Connection pool idle timeout so DNS gets re-resolved periodically.
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Creates an HTTP client with a custom overall timeout.
pub fn create_client_with_timeout(timeout: Duration) -> Result<Client, String> {
    // Caps stalls when Content-Length doesn't match the delivered body.
    let read_timeout = timeout.min(Duration::from_secs(60));

    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .read_timeout(read_timeout)
        .tcp_nodelay(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {e}"))
}

/// Creates an HTTP client builder with standard configuration and no overall
/// timeout, for streamed downloads whose deadline is enforced by the caller.
pub fn create_client_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .user_agent(USER_AGENT)
        .read_timeout(Duration::from_secs(60))
        .tcp_nodelay(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(4)
}
