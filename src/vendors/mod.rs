pub mod emag;
pub mod etsy;
pub mod oblio;
pub mod trendyol;

use crate::models::NormalizedOrder;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Per-page fetch failure taxonomy. `Auth` is logged apart from the rest so a
/// bad credential is distinguishable from a vendor outage; none of these abort
/// a refresh — the paginator treats a failing status filter as exhausted.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{vendor} rejected the stored credentials (HTTP {status})")]
    Auth { vendor: &'static str, status: u16 },
    #[error("{vendor} request failed (HTTP {status})")]
    Http { vendor: &'static str, status: u16 },
    #[error("{vendor} API reported an error: {detail}")]
    Vendor { vendor: &'static str, detail: String },
    #[error("{vendor} request failed: {detail}")]
    Network { vendor: &'static str, detail: String },
    #[error("{vendor} returned an unreadable payload: {detail}")]
    Decode { vendor: &'static str, detail: String },
}

impl FetchError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::Auth { .. })
    }

    pub(crate) fn from_status(vendor: &'static str, status: reqwest::StatusCode) -> Self {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            FetchError::Auth {
                vendor,
                status: status.as_u16(),
            }
        } else {
            FetchError::Http {
                vendor,
                status: status.as_u16(),
            }
        }
    }
}

/// Vendor-native status selector for one fetch request. eMAG takes all of its
/// numeric codes in a single request; Trendyol and Etsy want one named status
/// per request.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusFilter {
    Codes(Vec<i64>),
    Named(String),
}

impl fmt::Display for StatusFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusFilter::Codes(codes) => {
                let joined: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
                write!(f, "{}", joined.join(","))
            }
            StatusFilter::Named(name) => write!(f, "{name}"),
        }
    }
}

/// One page of normalized vendor orders plus pagination hints.
#[derive(Debug)]
pub struct FetchPage {
    pub orders: Vec<NormalizedOrder>,
    pub has_more: bool,
    pub total_count: u64,
}

/// Marketplace adapter: fetches one page of raw orders for a status filter
/// and projects them into the canonical order shape. Raw vendor documents
/// never leave the adapter.
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn vendor(&self) -> &'static str;

    /// Status filters to sweep, in order. One entry per request.
    fn status_filters(&self) -> Vec<StatusFilter>;

    /// `page` is a zero-based logical cursor; adapters map it onto their
    /// native pagination (1-based pages, 0-based pages, or offsets).
    async fn fetch_page(&self, filter: &StatusFilter, page: u32) -> Result<FetchPage, FetchError>;
}

/// Vendor-native → canonical status vocabulary. A native value without a
/// mapping passes through verbatim; translation never fails.
pub struct StatusTable(&'static [(&'static str, &'static str)]);

impl StatusTable {
    pub const fn new(pairs: &'static [(&'static str, &'static str)]) -> Self {
        Self(pairs)
    }

    pub fn translate(&self, native: &str) -> String {
        self.0
            .iter()
            .find(|(from, _)| *from == native)
            .map(|(_, to)| (*to).to_string())
            .unwrap_or_else(|| native.to_string())
    }
}

// Projection helpers: vendor payloads stay loosely typed (`serde_json::Value`)
// up to the adapter boundary, and field names vary between records, so every
// extraction runs a fallback chain.

pub(crate) fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match value.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

pub(crate) fn i64_field(value: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        match value.get(key) {
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_i64() {
                    return Some(v);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn f64_field(value: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match value.get(key) {
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_f64() {
                    return Some(v);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_table_translates_and_falls_back_verbatim() {
        static TABLE: StatusTable = StatusTable::new(&[("Created", "new"), ("Picking", "processing")]);
        assert_eq!(TABLE.translate("Created"), "new");
        assert_eq!(TABLE.translate("Picking"), "processing");
        // unmapped native values are preserved, never dropped or replaced
        assert_eq!(TABLE.translate("ReturnRequested"), "ReturnRequested");
    }

    #[test]
    fn field_helpers_walk_fallback_chains() {
        let raw = json!({"ext_part_number": "ABC-1", "quantity": 2, "sale_price": "19.50"});
        assert_eq!(
            str_field(&raw, &["part_number", "ext_part_number"]),
            Some("ABC-1".to_string())
        );
        assert_eq!(str_field(&raw, &["missing"]), None);
        assert_eq!(i64_field(&raw, &["quantity"]), Some(2));
        assert_eq!(f64_field(&raw, &["sale_price"]), Some(19.50));
        assert_eq!(f64_field(&raw, &["price", "sale_price"]), Some(19.50));
    }

    #[test]
    fn status_filter_display() {
        assert_eq!(StatusFilter::Codes(vec![1, 2, 3]).to_string(), "1,2,3");
        assert_eq!(StatusFilter::Named("Created".into()).to_string(), "Created");
    }
}
