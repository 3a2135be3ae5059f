use super::{FetchError, FetchPage, StatusFilter, StatusTable, VendorAdapter, f64_field, i64_field, str_field};
use crate::http::build_client;
use crate::models::{Credential, NormalizedOrder, OrderItem};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

const VENDOR: &str = "emag";
const PAGE_SIZE: u32 = 100;

const ENDPOINT_RO: &str = "https://marketplace-api.emag.ro/api-3/order/read";
const ENDPOINT_HU: &str = "https://marketplace-api.emag.hu/api-3/order/read";
const ENDPOINT_BG: &str = "https://marketplace-api.emag.bg/api-3/order/read";

static STATUS_TABLE: StatusTable = StatusTable::new(&[
    ("0", "canceled"),
    ("1", "new"),
    ("2", "in progress"),
    ("3", "prepared"),
    ("4", "finalized"),
    ("5", "returned"),
]);

/// eMAG runs a separate marketplace API per country; the account label is the
/// only place a credential records which one it belongs to.
pub fn regional_endpoint(account_label: &str) -> &'static str {
    let label = account_label.to_uppercase();
    if label.contains("HUNGARY") || label.contains("UNGARIA") || label.contains("HU") {
        ENDPOINT_HU
    } else if label.contains("BULGARIA") || label.contains("BG") {
        ENDPOINT_BG
    } else {
        ENDPOINT_RO
    }
}

pub struct EmagAdapter {
    http: Client,
    auth_header: String,
    vendor_code: String,
    endpoint: &'static str,
}

fn basic_auth_header(username: &str, password: &str) -> String {
    let raw = format!("{username}:{password}");
    format!("Basic {}", BASE64.encode(raw))
}

impl EmagAdapter {
    pub fn new(credential: &Credential) -> Self {
        Self {
            http: build_client(),
            auth_header: basic_auth_header(&credential.client_id, &credential.client_secret),
            vendor_code: credential.vendor_code.clone(),
            endpoint: regional_endpoint(&credential.account_label),
        }
    }

    fn project_order(&self, raw: &Value) -> NormalizedOrder {
        let status = match i64_field(raw, &["status"]) {
            Some(code) => STATUS_TABLE.translate(&code.to_string()),
            None => "unknown".to_string(),
        };
        let items = raw
            .get("products")
            .and_then(Value::as_array)
            .map(|products| products.iter().map(project_item).collect())
            .unwrap_or_default();
        NormalizedOrder {
            platform_order_id: str_field(raw, &["id"]).unwrap_or_default(),
            status,
            order_type: i64_field(raw, &["type"]).unwrap_or(3),
            vendor_code: self.vendor_code.clone(),
            created_at: str_field(raw, &["date", "created"]),
            items,
        }
    }
}

fn project_item(raw: &Value) -> OrderItem {
    OrderItem {
        sku: str_field(raw, &["part_number", "ext_part_number"])
            .unwrap_or_else(|| "N/A".to_string()),
        name: str_field(raw, &["name", "product_name"])
            .unwrap_or_else(|| "Unknown Product".to_string()),
        qty: i64_field(raw, &["quantity"]).unwrap_or(0),
        price: f64_field(raw, &["sale_price"]).unwrap_or(0.0),
    }
}

#[async_trait]
impl VendorAdapter for EmagAdapter {
    fn vendor(&self) -> &'static str {
        VENDOR
    }

    // One combined request covers every active status code.
    fn status_filters(&self) -> Vec<StatusFilter> {
        vec![StatusFilter::Codes(vec![1, 2, 3])]
    }

    async fn fetch_page(&self, filter: &StatusFilter, page: u32) -> Result<FetchPage, FetchError> {
        let codes = match filter {
            StatusFilter::Codes(codes) => codes.clone(),
            StatusFilter::Named(name) => {
                return Err(FetchError::Vendor {
                    vendor: VENDOR,
                    detail: format!("named status filter '{name}' is not valid for eMAG"),
                });
            }
        };
        let payload = json!({
            "data": {
                "itemsPerPage": PAGE_SIZE,
                "currentPage": page + 1,
                "status": codes,
            }
        });

        let response = self
            .http
            .post(self.endpoint)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .json(&payload)
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

        if body.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            let detail = body
                .get("messages")
                .map(|m| m.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(FetchError::Vendor {
                vendor: VENDOR,
                detail,
            });
        }

        let results = body
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total_pages = i64_field(&body, &["totalPages"]).unwrap_or(1).max(1) as u64;
        let total_count = i64_field(&body, &["totalCount"]).unwrap_or(results.len() as i64) as u64;
        debug!(
            target = "marketsync.emag",
            page = page + 1,
            total_pages,
            total_count,
            fetched = results.len(),
            "fetched order page"
        );

        let orders = results.iter().map(|raw| self.project_order(raw)).collect();
        Ok(FetchPage {
            orders,
            has_more: u64::from(page) + 1 < total_pages,
            total_count,
        })
    }
}
