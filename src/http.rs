//! Shared HTTP client factory.
//!
//! Catalog fetches, model downloads and the inference worker each get a
//! client with a timeout suited to the call.

use reqwest::Client;
use std::time::Duration;

/// Timeout for small JSON calls such as the model index.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for model downloads, which can be hundreds of megabytes.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Timeout for inference worker calls. Per-request deadlines are enforced
/// separately by the router; this only bounds a stuck connection.
pub const WORKER_TIMEOUT: Duration = Duration::from_secs(300);

/// Create a new HTTP client with the default timeout.
pub fn create_client() -> reqwest::Result<Client> {
    create_client_with_timeout(DEFAULT_TIMEOUT)
}

/// Create a new HTTP client with a custom timeout.
pub fn create_client_with_timeout(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
}
