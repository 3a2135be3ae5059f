use super::{FetchError, FetchPage, StatusFilter, StatusTable, VendorAdapter, f64_field, i64_field, str_field};
use crate::http::build_client;
use crate::models::{Credential, NormalizedOrder, OrderItem};
use async_trait::async_trait;
use chrono::{Local, TimeZone};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

const VENDOR: &str = "trendyol";
const BASE_URL: &str = "https://apigw.trendyol.com";
const PAGE_SIZE: u32 = 200;

static STATUS_TABLE: StatusTable = StatusTable::new(&[
    ("Awaiting", "awaiting"),
    ("Created", "new"),
    ("Picking", "processing"),
    ("Invoiced", "invoiced"),
    ("Shipped", "shipped"),
    ("Delivered", "delivered"),
    ("UnDelivered", "undelivered"),
    ("Cancelled", "cancelled"),
    ("Returned", "returned"),
    ("AtCollectionPoint", "at collection point"),
    ("UnPacked", "unpacked"),
    ("UnSupplied", "unsupplied"),
]);

pub struct TrendyolAdapter {
    http: Client,
    supplier_id: String,
    api_key: String,
    api_secret: String,
    account_label: String,
}

impl TrendyolAdapter {
    pub fn new(credential: &Credential) -> Self {
        // Some accounts were entered with the supplier id in client_id only.
        let supplier_id = if credential.vendor_code.is_empty() {
            credential.client_id.clone()
        } else {
            credential.vendor_code.clone()
        };
        Self {
            http: build_client(),
            supplier_id,
            api_key: credential.client_id.clone(),
            api_secret: credential.client_secret.clone(),
            account_label: credential.account_label.clone(),
        }
    }

    fn project_order(&self, raw: &Value) -> NormalizedOrder {
        let native_status = str_field(raw, &["status"]).unwrap_or_else(|| "unknown".to_string());
        let country = storefront_country(raw, &self.account_label);
        let items = raw
            .get("lines")
            .and_then(Value::as_array)
            .map(|lines| lines.iter().map(project_line).collect())
            .unwrap_or_default();
        NormalizedOrder {
            platform_order_id: str_field(raw, &["orderNumber"]).unwrap_or_default(),
            status: STATUS_TABLE.translate(&native_status),
            order_type: 3,
            vendor_code: format!("trendyol_{country}"),
            created_at: i64_field(raw, &["orderDate"]).and_then(format_millis),
            items,
        }
    }
}

fn project_line(raw: &Value) -> OrderItem {
    OrderItem {
        sku: str_field(raw, &["merchantSku", "sku"]).unwrap_or_else(|| "N/A".to_string()),
        name: str_field(raw, &["productName"]).unwrap_or_else(|| "Unknown Product".to_string()),
        qty: i64_field(raw, &["quantity"]).unwrap_or(0),
        price: f64_field(raw, &["price"]).unwrap_or(0.0),
    }
}

/// Storefront country for sub-vendor tagging ("trendyol_ro" vs "trendyol_gr").
/// Precedence: address country codes on the order, then the storefront code,
/// then a substring of the account label. Defaults to Romania.
fn storefront_country(raw: &Value, account_label: &str) -> &'static str {
    for key in ["shipmentAddress", "invoiceAddress", "address"] {
        if let Some(code) = raw
            .get(key)
            .and_then(|addr| addr.get("countryCode"))
            .and_then(Value::as_str)
            && let Some(country) = normalize_country(code)
        {
            return country;
        }
    }
    if let Some(code) = raw.get("storeFrontCode").and_then(Value::as_str)
        && let Some(country) = normalize_country(code)
    {
        return country;
    }
    let label = account_label.to_uppercase();
    if label.contains("GR") || label.contains("GREECE") || label.contains("GRECIA") {
        return "gr";
    }
    "ro"
}

fn normalize_country(code: &str) -> Option<&'static str> {
    match code.to_uppercase().as_str() {
        "GR" | "GREECE" | "GRECIA" => Some("gr"),
        "RO" | "ROMANIA" | "ROMÂNIA" => Some("ro"),
        _ => None,
    }
}

/// Order dates arrive as epoch milliseconds; the dashboard renders local time.
/// An unparseable value is preserved as raw digits rather than dropped.
fn format_millis(millis: i64) -> Option<String> {
    match Local.timestamp_millis_opt(millis).single() {
        Some(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        None => Some(millis.to_string()),
    }
}

#[async_trait]
impl VendorAdapter for TrendyolAdapter {
    fn vendor(&self) -> &'static str {
        VENDOR
    }

    // The orders endpoint accepts exactly one status per request, so each
    // active status is swept separately; the deduplicator collapses orders
    // that show up under more than one of them.
    fn status_filters(&self) -> Vec<StatusFilter> {
        vec![
            StatusFilter::Named("Created".to_string()),
            StatusFilter::Named("Picking".to_string()),
            StatusFilter::Named("Invoiced".to_string()),
        ]
    }

    async fn fetch_page(&self, filter: &StatusFilter, page: u32) -> Result<FetchPage, FetchError> {
        let status_name = filter.to_string();
        let url = format!(
            "{BASE_URL}/integration/order/sellers/{}/orders",
            self.supplier_id
        );
        let response = self
            .http
            .get(url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .header("User-Agent", format!("{} - SelfIntegration", self.supplier_id))
            .query(&[
                ("status", status_name.as_str()),
                ("page", &page.to_string()),
                ("size", &PAGE_SIZE.to_string()),
                ("orderByField", "PackageLastModifiedDate"),
                ("orderByDirection", "DESC"),
            ])
            .send()
            .await
            .map_err(|err| FetchError::Network {
                vendor: VENDOR,
                detail: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(VENDOR, status));
        }

        let body: Value = response.json().await.map_err(|err| FetchError::Decode {
            vendor: VENDOR,
            detail: err.to_string(),
        })?;

        let content = body
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total_pages = i64_field(&body, &["totalPages"]).unwrap_or(0).max(0) as u64;
        let total_count = i64_field(&body, &["totalElements"]).unwrap_or(0).max(0) as u64;
        debug!(
            target = "marketsync.trendyol",
            status = %status_name,
            page = page + 1,
            total_pages,
            total_count,
            fetched = content.len(),
            "fetched order page"
        );

        let orders = content.iter().map(|raw| self.project_order(raw)).collect();
        Ok(FetchPage {
            orders,
            has_more: u64::from(page) + 1 < total_pages,
            total_count,
        })
    }
}
