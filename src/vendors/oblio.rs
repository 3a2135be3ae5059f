use super::f64_field;
use crate::http::build_client;
use crate::models::Credential;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const BASE_URL: &str = "https://www.oblio.eu/api";
const PAGE_SIZE: usize = 250;

#[derive(Debug, Error)]
pub enum OblioError {
    #[error("oblio token request failed: {0}")]
    Auth(String),
    #[error("oblio request failed: {0}")]
    Network(String),
    #[error("oblio returned an unreadable payload: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StockEntry {
    pub code: String,
    pub name: String,
    pub stock: f64,
    pub unit: String,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Oblio stock source. The credential fields are repurposed: vendor_code
/// holds the company CIF, client_id the account email, client_secret the API
/// token. Access tokens are cached until shortly before expiry.
pub struct OblioClient {
    http: Client,
    cif: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl OblioClient {
    pub fn new(credential: &Credential) -> Self {
        Self {
            http: build_client(),
            cif: credential.vendor_code.clone(),
            client_id: credential.client_id.clone(),
            client_secret: credential.client_secret.clone(),
            token: Mutex::new(None),
        }
    }

    async fn ensure_token(&self) -> Result<String, OblioError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref()
            && Instant::now() < cached.expires_at
        {
            return Ok(cached.access_token.clone());
        }

        let response = self
            .http
            .post(format!("{BASE_URL}/authorize/token"))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|err| OblioError::Auth(err.to_string()))?;
        if !response.status().is_success() {
            return Err(OblioError::Auth(format!("HTTP {}", response.status())));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| OblioError::Decode(err.to_string()))?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| OblioError::Decode("missing access_token".to_string()))?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(3600);
        // 60s buffer so a token never expires mid-request
        *guard = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(60)),
        });
        debug!(target = "marketsync.oblio", expires_in, "obtained access token");
        Ok(access_token)
    }

    /// Fetch per-product stock for the company, offset-paginated 250 a page.
    /// When `product_codes` is non-empty the result is restricted to those.
    pub async fn fetch_products_stock(
        &self,
        product_codes: &[String],
    ) -> Result<HashMap<String, StockEntry>, OblioError> {
        let token = self.ensure_token().await?;
        let mut all_products: Vec<Value> = Vec::new();
        let mut offset = 0usize;

        loop {
            let response = self
                .http
                .get(format!("{BASE_URL}/nomenclature/products"))
                .bearer_auth(&token)
                .query(&[("cif", self.cif.as_str()), ("offset", &offset.to_string())])
                .send()
                .await
                .map_err(|err| OblioError::Network(err.to_string()))?;
            if !response.status().is_success() {
                warn!(
                    target = "marketsync.oblio",
                    status = response.status().as_u16(),
                    offset,
                    "product page request failed, stopping pagination"
                );
                break;
            }
            let body: Value = response
                .json()
                .await
                .map_err(|err| OblioError::Decode(err.to_string()))?;
            let products = body
                .get("data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if products.is_empty() {
                break;
            }
            let fetched = products.len();
            all_products.extend(products);
            debug!(target = "marketsync.oblio", fetched, offset, "fetched product page");
            if fetched < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }

        let mut stock = collect_stock(all_products.iter());
        if !product_codes.is_empty() {
            stock.retain(|code, _| product_codes.iter().any(|wanted| wanted == code));
        }
        Ok(stock)
    }
}

/// Aggregate stock per product code. Duplicate codes add up rather than
/// overwrite, and array-shaped stock sums across all warehouses.
fn collect_stock<'a>(products: impl Iterator<Item = &'a Value>) -> HashMap<String, StockEntry> {
    let mut stock: HashMap<String, StockEntry> = HashMap::new();
    for product in products {
        let Some(code) = product.get("code").and_then(Value::as_str).filter(|c| !c.is_empty())
        else {
            continue;
        };
        let quantity = product_stock(product);
        match stock.get_mut(code) {
            Some(entry) => entry.stock += quantity,
            None => {
                stock.insert(
                    code.to_string(),
                    StockEntry {
                        code: code.to_string(),
                        name: product
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        stock: quantity,
                        unit: product
                            .get("measuringUnit")
                            .and_then(Value::as_str)
                            .unwrap_or("buc")
                            .to_string(),
                    },
                );
            }
        }
    }
    stock
}

fn product_stock(product: &Value) -> f64 {
    match product.get("stock") {
        Some(Value::Array(warehouses)) => warehouses
            .iter()
            .map(|w| f64_field(w, &["quantity", "stockQuantity"]).unwrap_or(0.0))
            .sum(),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => f64_field(product, &["stockQuantity", "quantity"]).unwrap_or(0.0),
    }
}
