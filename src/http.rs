use reqwest::Client;
use std::time::Duration;

/// Shared outbound client. Falls back to reqwest defaults if the builder
/// rejects the configuration.
pub fn build_client(timeout: Duration, connect_timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .gzip(true)
        .user_agent(concat!("metafield-api-rs/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}
