use crate::models::{Credential, NormalizedOrder, Platform};
use crate::store::{Store, StoreError};
use crate::vendors::emag::EmagAdapter;
use crate::vendors::etsy::EtsyAdapter;
use crate::vendors::trendyol::TrendyolAdapter;
use crate::vendors::{FetchError, VendorAdapter};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Hard bound on pages per status filter. Not a real pagination limit — it
/// exists so a vendor that keeps reporting more pages cannot spin a refresh
/// forever.
pub const MAX_PAGES: u32 = 100;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("platform '{0}' has no order feed to refresh")]
    UnsupportedPlatform(&'static str),
    #[error(transparent)]
    Reconcile(#[from] StoreError),
}

#[derive(Debug)]
pub struct SyncOutcome {
    pub orders_fetched: usize,
    /// True when at least one vendor page failed and was degraded to an empty
    /// result. The refresh still succeeded, but the snapshot may under-report.
    pub degraded: bool,
}

/// Orchestrates a refresh: adapter → paginator → deduplicator → reconciler.
/// Refreshes for the same credential are serialized through a per-credential
/// lock held across fetch and reconcile; different credentials run freely.
#[derive(Clone, Default)]
pub struct SyncEngine {
    locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn refresh(
        &self,
        store: &Store,
        credential: &Credential,
    ) -> Result<SyncOutcome, SyncError> {
        let adapter: Box<dyn VendorAdapter> = match credential.platform {
            Platform::Emag => Box::new(EmagAdapter::new(credential)),
            Platform::Trendyol => Box::new(TrendyolAdapter::new(credential)),
            Platform::Etsy => Box::new(EtsyAdapter::new(credential)),
            Platform::Oblio => return Err(SyncError::UnsupportedPlatform("oblio")),
        };
        self.refresh_with(store, credential, adapter.as_ref()).await
    }

    pub(crate) async fn refresh_with(
        &self,
        store: &Store,
        credential: &Credential,
        adapter: &dyn VendorAdapter,
    ) -> Result<SyncOutcome, SyncError> {
        let lock = self.credential_lock(credential.id).await;
        let _guard = lock.lock().await;

        let started = Instant::now();
        let (fetched, degraded) = fetch_all(adapter).await;
        let orders = dedupe(fetched);
        let result = store.reconcile_orders(credential, &orders).await?;
        crate::metrics::sync_elapsed(adapter.vendor(), started.elapsed().as_millis());
        info!(
            target = "marketsync.sync",
            vendor = adapter.vendor(),
            credential_id = credential.id,
            orders_fetched = result.count,
            degraded,
            "refresh complete"
        );
        Ok(SyncOutcome {
            orders_fetched: result.count,
            degraded,
        })
    }

    async fn credential_lock(&self, credential_id: i64) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().await;
        guard
            .entry(credential_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Paginator: sweep every status filter of the adapter to exhaustion,
/// accumulating normalized orders. Any page error degrades that filter to
/// "exhausted" and flags the result — a single vendor hiccup must never abort
/// the refresh or block other statuses.
pub(crate) async fn fetch_all(adapter: &dyn VendorAdapter) -> (Vec<NormalizedOrder>, bool) {
    let mut all = Vec::new();
    let mut degraded = false;

    for filter in adapter.status_filters() {
        let mut page: u32 = 0;
        loop {
            match adapter.fetch_page(&filter, page).await {
                Ok(fetched) => {
                    if fetched.orders.is_empty() {
                        break;
                    }
                    all.extend(fetched.orders);
                    if !fetched.has_more {
                        break;
                    }
                    page += 1;
                    if page >= MAX_PAGES {
                        warn!(
                            target = "marketsync.sync",
                            vendor = adapter.vendor(),
                            filter = %filter,
                            "page safety cap reached, stopping this filter"
                        );
                        break;
                    }
                }
                Err(err) if err.is_auth() => {
                    // Bad credential, not an outage. Never retried.
                    warn!(
                        target = "marketsync.sync",
                        vendor = adapter.vendor(),
                        filter = %filter,
                        "authentication rejected: {err}"
                    );
                    degraded = true;
                    break;
                }
                Err(err) => {
                    warn!(
                        target = "marketsync.sync",
                        vendor = adapter.vendor(),
                        filter = %filter,
                        page,
                        "fetch failed, treating filter as exhausted: {err}"
                    );
                    degraded = true;
                    break;
                }
            }
        }
    }

    (all, degraded)
}

/// Collapse repeated order ids within one fetch batch, keep-first and stable.
/// Trendyol's per-status sweep can return the same order under two statuses.
pub(crate) fn dedupe(orders: Vec<NormalizedOrder>) -> Vec<NormalizedOrder> {
    let mut seen = HashSet::with_capacity(orders.len());
    orders
        .into_iter()
        .filter(|order| seen.insert(order.platform_order_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActiveStatusSet, OrderItem};
    use crate::vendors::{FetchPage, StatusFilter};
    use async_trait::async_trait;

    fn order(id: &str, status: &str) -> NormalizedOrder {
        NormalizedOrder {
            platform_order_id: id.to_string(),
            status: status.to_string(),
            order_type: 3,
            vendor_code: "VND".to_string(),
            created_at: Some("2025-04-01 10:00:00".to_string()),
            items: vec![OrderItem {
                sku: "SKU".to_string(),
                name: "Widget".to_string(),
                qty: 1,
                price: 10.0,
            }],
        }
    }

    enum Scripted {
        Page { ids: Vec<&'static str>, has_more: bool },
        AuthError,
        HttpError,
        EndlessPage,
    }

    struct MockAdapter {
        filters: Vec<StatusFilter>,
        // keyed by (filter display, page)
        responses: HashMap<(String, u32), Scripted>,
    }

    impl MockAdapter {
        fn new(filters: &[&str]) -> Self {
            Self {
                filters: filters
                    .iter()
                    .map(|f| StatusFilter::Named((*f).to_string()))
                    .collect(),
                responses: HashMap::new(),
            }
        }

        fn script(mut self, filter: &str, page: u32, response: Scripted) -> Self {
            self.responses.insert((filter.to_string(), page), response);
            self
        }
    }

    #[async_trait]
    impl VendorAdapter for MockAdapter {
        fn vendor(&self) -> &'static str {
            "mock"
        }

        fn status_filters(&self) -> Vec<StatusFilter> {
            self.filters.clone()
        }

        async fn fetch_page(
            &self,
            filter: &StatusFilter,
            page: u32,
        ) -> Result<FetchPage, FetchError> {
            match self.responses.get(&(filter.to_string(), page)) {
                Some(Scripted::Page { ids, has_more }) => Ok(FetchPage {
                    orders: ids.iter().map(|id| order(id, "new")).collect(),
                    has_more: *has_more,
                    total_count: ids.len() as u64,
                }),
                Some(Scripted::AuthError) => Err(FetchError::Auth {
                    vendor: "mock",
                    status: 401,
                }),
                Some(Scripted::HttpError) => Err(FetchError::Http {
                    vendor: "mock",
                    status: 502,
                }),
                Some(Scripted::EndlessPage) => Ok(FetchPage {
                    orders: vec![order(&format!("e-{page}"), "new")],
                    has_more: true,
                    total_count: u64::MAX,
                }),
                None => Ok(FetchPage {
                    orders: Vec::new(),
                    has_more: false,
                    total_count: 0,
                }),
            }
        }
    }

    async fn memory_store_with_credential(platform: Platform) -> (Store, Credential) {
        let store = Store::connect("sqlite::memory:").await.expect("store");
        let user_id = store
            .create_user("seller@example.com", "hash", "Seller")
            .await
            .expect("user");
        let credential = store
            .insert_credential(user_id, "Main", platform, "cid", "sec", "VND")
            .await
            .expect("credential");
        (store, credential)
    }

    #[tokio::test]
    async fn paginator_accumulates_across_pages() {
        let adapter = MockAdapter::new(&["Created"])
            .script("Created", 0, Scripted::Page { ids: vec!["1", "2"], has_more: true })
            .script("Created", 1, Scripted::Page { ids: vec!["3"], has_more: false });
        let (orders, degraded) = fetch_all(&adapter).await;
        assert!(!degraded);
        let ids: Vec<&str> = orders.iter().map(|o| o.platform_order_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn paginator_stops_on_empty_page() {
        // vendor claims another page but returns nothing
        let adapter = MockAdapter::new(&["Created"])
            .script("Created", 0, Scripted::Page { ids: vec!["1"], has_more: true });
        let (orders, degraded) = fetch_all(&adapter).await;
        assert!(!degraded);
        assert_eq!(orders.len(), 1);
    }

    #[tokio::test]
    async fn paginator_hits_safety_cap_on_endless_vendor() {
        let mut adapter = MockAdapter::new(&["Created"]);
        for page in 0..(MAX_PAGES + 10) {
            adapter = adapter.script("Created", page, Scripted::EndlessPage);
        }
        let (orders, degraded) = fetch_all(&adapter).await;
        assert!(!degraded);
        assert_eq!(orders.len(), MAX_PAGES as usize);
    }

    #[tokio::test]
    async fn failing_filter_does_not_block_the_next_one() {
        let adapter = MockAdapter::new(&["Created", "Picking"])
            .script("Created", 0, Scripted::HttpError)
            .script("Picking", 0, Scripted::Page { ids: vec!["9"], has_more: false });
        let (orders, degraded) = fetch_all(&adapter).await;
        assert!(degraded);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].platform_order_id, "9");
    }

    #[tokio::test]
    async fn auth_failure_degrades_to_empty() {
        let adapter = MockAdapter::new(&["Created"]).script("Created", 0, Scripted::AuthError);
        let (orders, degraded) = fetch_all(&adapter).await;
        assert!(degraded);
        assert!(orders.is_empty());
    }

    #[test]
    fn dedupe_keeps_first_and_preserves_order() {
        let orders = vec![
            order("500", "new"),
            order("501", "new"),
            order("500", "processing"),
        ];
        let deduped = dedupe(orders);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].platform_order_id, "500");
        assert_eq!(deduped[0].status, "new"); // first occurrence wins
        assert_eq!(deduped[1].platform_order_id, "501");
    }

    #[tokio::test]
    async fn refresh_stores_composite_ids_then_prunes_missing() {
        let (store, credential) = memory_store_with_credential(Platform::Emag).await;
        let engine = SyncEngine::new();

        let adapter = MockAdapter::new(&["1,2,3"])
            .script("1,2,3", 0, Scripted::Page { ids: vec!["100", "101"], has_more: false });
        let outcome = engine
            .refresh_with(&store, &credential, &adapter)
            .await
            .expect("first refresh");
        assert_eq!(outcome.orders_fetched, 2);
        assert!(!outcome.degraded);

        let allowed = ActiveStatusSet::default();
        let active = store
            .list_active_orders(credential.user_id, Some(credential.id), &allowed)
            .await
            .expect("list");
        let mut ids: Vec<&str> = active.iter().map(|o| o.id.as_str()).collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                format!("100-{}", credential.id).as_str(),
                format!("101-{}", credential.id).as_str()
            ]
        );

        let adapter = MockAdapter::new(&["1,2,3"])
            .script("1,2,3", 0, Scripted::Page { ids: vec!["100"], has_more: false });
        engine
            .refresh_with(&store, &credential, &adapter)
            .await
            .expect("second refresh");
        let active = store
            .list_active_orders(credential.user_id, Some(credential.id), &allowed)
            .await
            .expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, format!("100-{}", credential.id));
    }

    #[tokio::test]
    async fn order_seen_under_two_statuses_stores_one_row() {
        let (store, credential) = memory_store_with_credential(Platform::Trendyol).await;
        let engine = SyncEngine::new();

        let adapter = MockAdapter::new(&["Created", "Picking"])
            .script("Created", 0, Scripted::Page { ids: vec!["500"], has_more: false })
            .script("Picking", 0, Scripted::Page { ids: vec!["500"], has_more: false });
        let outcome = engine
            .refresh_with(&store, &credential, &adapter)
            .await
            .expect("refresh");
        assert_eq!(outcome.orders_fetched, 1);

        let active = store
            .list_active_orders(credential.user_id, Some(credential.id), &ActiveStatusSet::default())
            .await
            .expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].platform_order_id, "500");
    }

    #[tokio::test]
    async fn degraded_empty_fetch_still_wipes_snapshot() {
        // Documented policy: zero fetched orders clears the credential's rows
        // even when the fetch itself failed; the outcome flags the degradation.
        let (store, credential) = memory_store_with_credential(Platform::Emag).await;
        let engine = SyncEngine::new();

        let seed = MockAdapter::new(&["1,2,3"])
            .script("1,2,3", 0, Scripted::Page { ids: vec!["100"], has_more: false });
        engine.refresh_with(&store, &credential, &seed).await.expect("seed");

        let failing = MockAdapter::new(&["1,2,3"]).script("1,2,3", 0, Scripted::HttpError);
        let outcome = engine
            .refresh_with(&store, &credential, &failing)
            .await
            .expect("degraded refresh");
        assert!(outcome.degraded);
        assert_eq!(outcome.orders_fetched, 0);

        let active = store
            .list_active_orders(credential.user_id, Some(credential.id), &ActiveStatusSet::default())
            .await
            .expect("list");
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn refresh_rejects_stock_only_platform() {
        let (store, credential) = memory_store_with_credential(Platform::Oblio).await;
        let engine = SyncEngine::new();
        let err = engine
            .refresh(&store, &credential)
            .await
            .expect_err("oblio has no order feed");
        assert!(matches!(err, SyncError::UnsupportedPlatform("oblio")));
    }
}
