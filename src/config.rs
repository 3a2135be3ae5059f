use once_cell::sync::Lazy;
use std::env;

fn parsed_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

pub static DATABASE_URL: Lazy<String> =
    Lazy::new(|| env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://data.db".to_string()));

pub static PORT: Lazy<u16> = Lazy::new(|| parsed_or("PORT", 8001));

/// Request bodies above this are rejected before a handler runs.
pub static REQUEST_MAX_BYTES: Lazy<usize> =
    Lazy::new(|| parsed_or("REQUEST_MAX_BYTES", 256 * 1024));

/// When set, `/metrics` requires a matching `X-Metrics-Key` header.
pub static METRICS_KEY: Lazy<Option<String>> = Lazy::new(|| env::var("METRICS_KEY").ok());

pub static HTTP_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| parsed_or("HTTP_TIMEOUT_SECS", 30));

pub static HTTP_CONNECT_TIMEOUT_SECS: Lazy<u64> =
    Lazy::new(|| parsed_or("HTTP_CONNECT_TIMEOUT_SECS", 10));
