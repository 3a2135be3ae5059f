use super::{FetchError, FetchPage, StatusFilter, StatusTable, VendorAdapter, f64_field, i64_field, str_field};
use crate::http::build_client;
use crate::models::{Credential, NormalizedOrder, OrderItem};
use async_trait::async_trait;
use chrono::{Local, TimeZone};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

const VENDOR: &str = "etsy";
const BASE_URL: &str = "https://openapi.etsy.com/v3/application";
const PAGE_SIZE: u32 = 100;

static STATUS_TABLE: StatusTable = StatusTable::new(&[
    ("open", "new"),
    ("payment_processing", "payment processing"),
    ("payment_review", "payment review"),
    ("completed", "completed"),
    ("canceled", "canceled"),
    ("refunded", "refunded"),
]);

/// Etsy shop receipts. client_id carries the app keystring, client_secret the
/// OAuth access token (minted by the seller out of band), vendor_code the
/// numeric shop id.
pub struct EtsyAdapter {
    http: Client,
    api_key: String,
    access_token: String,
    shop_id: String,
    vendor_code: String,
}

impl EtsyAdapter {
    pub fn new(credential: &Credential) -> Self {
        Self {
            http: build_client(),
            api_key: credential.client_id.clone(),
            access_token: credential.client_secret.clone(),
            shop_id: credential.vendor_code.clone(),
            vendor_code: credential.vendor_code.clone(),
        }
    }

    fn project_receipt(&self, raw: &Value) -> NormalizedOrder {
        let native_status = str_field(raw, &["status"]).unwrap_or_else(|| "unknown".to_string());
        let items = raw
            .get("transactions")
            .and_then(Value::as_array)
            .map(|txs| txs.iter().map(project_transaction).collect())
            .unwrap_or_default();
        NormalizedOrder {
            platform_order_id: str_field(raw, &["receipt_id"]).unwrap_or_default(),
            status: STATUS_TABLE.translate(&native_status.to_lowercase()),
            order_type: 3,
            vendor_code: self.vendor_code.clone(),
            created_at: i64_field(raw, &["create_timestamp", "created_timestamp"])
                .and_then(format_epoch),
            items,
        }
    }
}

fn project_transaction(raw: &Value) -> OrderItem {
    // Money comes as {amount, divisor} pairs.
    let price = raw
        .get("price")
        .map(|p| {
            let amount = f64_field(p, &["amount"]).unwrap_or(0.0);
            let divisor = f64_field(p, &["divisor"]).filter(|d| *d > 0.0).unwrap_or(1.0);
            amount / divisor
        })
        .unwrap_or(0.0);
    OrderItem {
        sku: str_field(raw, &["sku"]).unwrap_or_else(|| "N/A".to_string()),
        name: str_field(raw, &["title"]).unwrap_or_else(|| "Unknown Product".to_string()),
        qty: i64_field(raw, &["quantity"]).unwrap_or(0),
        price,
    }
}

fn format_epoch(secs: i64) -> Option<String> {
    match Local.timestamp_opt(secs, 0).single() {
        Some(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        None => Some(secs.to_string()),
    }
}

#[async_trait]
impl VendorAdapter for EtsyAdapter {
    fn vendor(&self) -> &'static str {
        VENDOR
    }

    fn status_filters(&self) -> Vec<StatusFilter> {
        vec![
            StatusFilter::Named("open".to_string()),
            StatusFilter::Named("payment_processing".to_string()),
            StatusFilter::Named("payment_review".to_string()),
        ]
    }

    async fn fetch_page(&self, filter: &StatusFilter, page: u32) -> Result<FetchPage, FetchError> {
        let status_name = filter.to_string();
        let offset = u64::from(page) * u64::from(PAGE_SIZE);
        let url = format!("{BASE_URL}/shops/{}/receipts", self.shop_id);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .header("x-api-key", &self.api_key)
            .query(&[
                ("status", status_name.as_str()),
                ("limit", &PAGE_SIZE.to_string()),
                ("offset", &offset.to_string()),
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

        let results = body
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total_count = i64_field(&body, &["count"]).unwrap_or(results.len() as i64).max(0) as u64;
        debug!(
            target = "marketsync.etsy",
            status = %status_name,
            offset,
            total_count,
            fetched = results.len(),
            "fetched receipt page"
        );

        let has_more = offset + (results.len() as u64) < total_count && !results.is_empty();
        let orders = results.iter().map(|raw| self.project_receipt(raw)).collect();
        Ok(FetchPage {
            orders,
            has_more,
            total_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use serde_json::json;

    fn credential() -> Credential {
        Credential {
            id: 9,
            user_id: 1,
            account_label: "Etsy shop".to_string(),
            platform: Platform::Etsy,
            client_id: "keystring".to_string(),
            client_secret: "oauth-token".to_string(),
            vendor_code: "31415926".to_string(),
            last_sync: None,
        }
    }

    #[test]
    fn projects_receipt_with_divisor_price() {
        let adapter = EtsyAdapter::new(&credential());
        let raw = json!({
            "receipt_id": 2_000_001,
            "status": "payment_processing",
            "create_timestamp": 1_743_500_000,
            "transactions": [
                {"sku": "ETS-1", "title": "Mug", "quantity": 2, "price": {"amount": 1250, "divisor": 100}},
                {"title": "Print", "quantity": 1}
            ]
        });
        let order = adapter.project_receipt(&raw);
        assert_eq!(order.platform_order_id, "2000001");
        assert_eq!(order.status, "payment processing");
        assert_eq!(order.vendor_code, "31415926");
        assert!(order.created_at.is_some());
        assert_eq!(order.items[0].price, 12.5);
        assert_eq!(order.items[1].sku, "N/A");
        assert_eq!(order.items[1].price, 0.0);
    }

    #[test]
    fn open_receipts_map_to_new() {
        let adapter = EtsyAdapter::new(&credential());
        let order = adapter.project_receipt(&json!({"receipt_id": 1, "status": "Open"}));
        assert_eq!(order.status, "new");
    }

    #[test]
    fn unknown_receipt_status_passes_through() {
        let adapter = EtsyAdapter::new(&credential());
        let order = adapter.project_receipt(&json!({"receipt_id": 1, "status": "in_dispute"}));
        assert_eq!(order.status, "in_dispute");
    }

    #[test]
    fn zero_divisor_does_not_blow_up() {
        let item = project_transaction(&json!({
            "sku": "X", "quantity": 1,
            "price": {"amount": 500, "divisor": 0}
        }));
        assert_eq!(item.price, 500.0);
    }
}
