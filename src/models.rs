use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Marketplace (or stock source) a credential belongs to. The integer tags
/// match the ids stored in the `credentials.platform` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Emag,
    Trendyol,
    Oblio,
    Etsy,
}

impl Platform {
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Platform::Emag),
            2 => Some(Platform::Trendyol),
            3 => Some(Platform::Oblio),
            4 => Some(Platform::Etsy),
            _ => None,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Platform::Emag => 1,
            Platform::Trendyol => 2,
            Platform::Oblio => 3,
            Platform::Etsy => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Emag => "emag",
            Platform::Trendyol => "trendyol",
            Platform::Oblio => "oblio",
            Platform::Etsy => "etsy",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Emag => "eMAG",
            Platform::Trendyol => "Trendyol",
            Platform::Oblio => "Oblio (Stocuri)",
            Platform::Etsy => "Etsy",
        }
    }
}

/// Stored vendor credential, resolved from the `credentials` table before any
/// sync work starts. The secret never serializes into API responses.
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    pub id: i64,
    pub user_id: i64,
    pub account_label: String,
    pub platform: Platform,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub vendor_code: String,
    pub last_sync: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: String,
    pub name: String,
    pub qty: i64,
    pub price: f64,
}

/// Adapter output: one vendor order projected into the canonical shape.
/// Transient — only the reconciler turns these into stored rows.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedOrder {
    pub platform_order_id: String,
    pub status: String,
    pub order_type: i64,
    pub vendor_code: String,
    pub created_at: Option<String>,
    pub items: Vec<OrderItem>,
}

/// Persisted order row as served to the dashboard. `id` is the composite
/// `platform_order_id + "-" + credential_id` uniqueness key.
#[derive(Debug, Clone, Serialize)]
pub struct StoredOrder {
    pub id: String,
    pub user_id: i64,
    pub credential_id: i64,
    pub platform_order_id: String,
    pub status: String,
    pub order_type: i64,
    pub vendor_code: String,
    pub created_at: Option<String>,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Named allow-list deciding which canonical statuses count as "active".
/// The set has shifted as marketplaces were added, so it is explicit
/// configuration (env `ACTIVE_STATUSES`), not a per-call literal.
#[derive(Debug, Clone)]
pub struct ActiveStatusSet {
    statuses: HashSet<String>,
}

const DEFAULT_ACTIVE_STATUSES: &[&str] = &[
    "new",
    "in progress",
    "prepared",
    "processing",
    "invoiced",
    "payment processing",
    "payment review",
];

impl ActiveStatusSet {
    pub fn from_env() -> Self {
        match std::env::var("ACTIVE_STATUSES") {
            Ok(raw) if !raw.trim().is_empty() => Self::from_list(raw.split(',')),
            _ => Self::default(),
        }
    }

    pub fn from_list<'a>(statuses: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            statuses: statuses
                .into_iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_active(&self, status: &str) -> bool {
        self.statuses.contains(&status.trim().to_lowercase())
    }
}

impl Default for ActiveStatusSet {
    fn default() -> Self {
        Self::from_list(DEFAULT_ACTIVE_STATUSES.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_ids_round_trip() {
        for platform in [
            Platform::Emag,
            Platform::Trendyol,
            Platform::Oblio,
            Platform::Etsy,
        ] {
            assert_eq!(Platform::from_id(platform.id()), Some(platform));
        }
        assert_eq!(Platform::from_id(0), None);
        assert_eq!(Platform::from_id(99), None);
    }

    #[test]
    fn active_set_matches_case_insensitively() {
        let set = ActiveStatusSet::default();
        assert!(set.is_active("new"));
        assert!(set.is_active("New"));
        assert!(set.is_active("IN PROGRESS"));
        assert!(!set.is_active("shipped"));
        assert!(!set.is_active("delivered"));
    }

    #[test]
    fn active_set_from_custom_list() {
        let set = ActiveStatusSet::from_list(["New", " shipped ", ""]);
        assert!(set.is_active("shipped"));
        assert!(set.is_active("new"));
        assert!(!set.is_active("invoiced"));
    }
}
