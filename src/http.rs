use crate::config;
use reqwest::Client;
use std::time::Duration;

/// Shared outbound client. Every vendor call goes through a bounded timeout;
/// 30s matches what the marketplace APIs tolerate on large order pages.
pub fn build_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(*config::HTTP_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(*config::HTTP_CONNECT_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| Client::new())
}
