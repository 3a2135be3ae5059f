use crate::models::{ActiveStatusSet, Credential, NormalizedOrder, OrderItem, Platform, StoredOrder};
use chrono::Local;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("could not serialize order items: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("credential {0} references unknown platform id {1}")]
    UnknownPlatform(i64, i64),
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow)]
struct CredentialRow {
    id: i64,
    user_id: i64,
    account_label: String,
    platform: i64,
    client_id: String,
    client_secret: String,
    vendor_code: String,
    last_sync: Option<String>,
}

impl CredentialRow {
    fn into_credential(self) -> Result<Credential, StoreError> {
        let platform = Platform::from_id(self.platform)
            .ok_or(StoreError::UnknownPlatform(self.id, self.platform))?;
        Ok(Credential {
            id: self.id,
            user_id: self.user_id,
            account_label: self.account_label,
            platform,
            client_id: self.client_id,
            client_secret: self.client_secret,
            vendor_code: self.vendor_code,
            last_sync: self.last_sync,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct OrderRow {
    id: String,
    user_id: i64,
    credential_id: i64,
    platform_order_id: String,
    status: Option<String>,
    order_type: Option<i64>,
    vendor_code: Option<String>,
    created_at: Option<String>,
    items: Option<String>,
}

impl OrderRow {
    fn into_stored(self) -> StoredOrder {
        // A row with undecodable items is kept with an empty list, not dropped.
        let items: Vec<OrderItem> = self
            .items
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        StoredOrder {
            id: self.id,
            user_id: self.user_id,
            credential_id: self.credential_id,
            platform_order_id: self.platform_order_id,
            status: self.status.unwrap_or_default(),
            order_type: self.order_type.unwrap_or(3),
            vendor_code: self.vendor_code.unwrap_or_default(),
            created_at: self.created_at,
            items,
        }
    }
}

/// Outcome of one reconcile pass for a credential.
#[derive(Debug)]
pub struct SyncResult {
    pub count: usize,
    pub touched_ids: Vec<String>,
}

/// Handle to the SQLite-backed order/credential/user store. Cheap to clone;
/// passed explicitly into the sync engine and the API handlers.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options: SqliteConnectOptions = url.parse::<SqliteConnectOptions>()?.create_if_missing(true);
        // Single connection: one seller, dozens of orders. This also makes the
        // whole store a single logical writer, which the reconcile transaction
        // relies on, and keeps `sqlite::memory:` coherent in tests.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                account_label TEXT NOT NULL,
                platform INTEGER NOT NULL,
                client_id TEXT NOT NULL,
                client_secret TEXT NOT NULL,
                vendor_code TEXT NOT NULL,
                last_sync TEXT,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                credential_id INTEGER NOT NULL,
                platform_order_id TEXT NOT NULL,
                status TEXT,
                order_type INTEGER,
                vendor_code TEXT,
                created_at TEXT,
                items TEXT,
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (credential_id) REFERENCES credentials(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- users ----

    pub async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        name: &str,
    ) -> Result<i64, StoreError> {
        let now = Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        let result = sqlx::query(
            "INSERT INTO users (email, password_hash, name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(email)
        .bind(password_hash)
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn user_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    // ---- credentials ----

    pub async fn insert_credential(
        &self,
        user_id: i64,
        account_label: &str,
        platform: Platform,
        client_id: &str,
        client_secret: &str,
        vendor_code: &str,
    ) -> Result<Credential, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO credentials (user_id, account_label, platform, client_id, client_secret, vendor_code, last_sync)
            VALUES (?, ?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(user_id)
        .bind(account_label)
        .bind(platform.id())
        .bind(client_id)
        .bind(client_secret)
        .bind(vendor_code)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        self.credential_for_user(id, user_id)
            .await?
            .ok_or(StoreError::Sqlx(sqlx::Error::RowNotFound))
    }

    pub async fn credentials_for_user(&self, user_id: i64) -> Result<Vec<Credential>, StoreError> {
        let rows = sqlx::query_as::<_, CredentialRow>(
            "SELECT * FROM credentials WHERE user_id = ? ORDER BY id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CredentialRow::into_credential).collect()
    }

    pub async fn credential_for_user(
        &self,
        id: i64,
        user_id: i64,
    ) -> Result<Option<Credential>, StoreError> {
        let row = sqlx::query_as::<_, CredentialRow>(
            "SELECT * FROM credentials WHERE id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CredentialRow::into_credential).transpose()
    }

    /// Partial update: `None` fields keep their stored value.
    pub async fn update_credential(
        &self,
        id: i64,
        user_id: i64,
        account_label: Option<&str>,
        platform: Option<Platform>,
        client_id: Option<&str>,
        client_secret: Option<&str>,
        vendor_code: Option<&str>,
    ) -> Result<Option<Credential>, StoreError> {
        sqlx::query(
            r#"
            UPDATE credentials SET
                account_label = COALESCE(?, account_label),
                platform = COALESCE(?, platform),
                client_id = COALESCE(?, client_id),
                client_secret = COALESCE(?, client_secret),
                vendor_code = COALESCE(?, vendor_code)
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(account_label)
        .bind(platform.map(|p| p.id()))
        .bind(client_id)
        .bind(client_secret)
        .bind(vendor_code)
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        self.credential_for_user(id, user_id).await
    }

    /// First credential of the given platform for a user, if any. Used to
    /// locate the Oblio stock credential.
    pub async fn credential_for_platform(
        &self,
        user_id: i64,
        platform: Platform,
    ) -> Result<Option<Credential>, StoreError> {
        let row = sqlx::query_as::<_, CredentialRow>(
            "SELECT * FROM credentials WHERE user_id = ? AND platform = ? ORDER BY id ASC LIMIT 1",
        )
        .bind(user_id)
        .bind(platform.id())
        .fetch_optional(&self.pool)
        .await?;
        row.map(CredentialRow::into_credential).transpose()
    }

    /// Deleting a credential also drops its stored orders; they are
    /// unreachable without it.
    pub async fn delete_credential(&self, id: i64, user_id: i64) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM orders WHERE credential_id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM credentials WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- orders ----

    /// Reconcile the fetched batch against the stored snapshot for one
    /// credential: upsert by composite id, prune rows absent from the batch,
    /// stamp `last_sync`. One transaction — callers never observe a state with
    /// new rows inserted but stale ones still present, or vice versa.
    ///
    /// An empty batch deletes every stored order for the credential: zero
    /// fetched orders means "nothing is active anymore", not "fetch failed"
    /// (the sync engine reports fetch degradation separately).
    pub async fn reconcile_orders(
        &self,
        credential: &Credential,
        orders: &[NormalizedOrder],
    ) -> Result<SyncResult, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut new_ids: HashSet<String> = HashSet::with_capacity(orders.len());
        for order in orders {
            let id = format!("{}-{}", order.platform_order_id, credential.id);
            let items_json = serde_json::to_string(&order.items)?;
            sqlx::query(
                r#"
                INSERT INTO orders (id, user_id, credential_id, platform_order_id, status, order_type, vendor_code, created_at, items)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    platform_order_id = excluded.platform_order_id,
                    status = excluded.status,
                    order_type = excluded.order_type,
                    vendor_code = excluded.vendor_code,
                    created_at = excluded.created_at,
                    items = excluded.items
                "#,
            )
            .bind(&id)
            .bind(credential.user_id)
            .bind(credential.id)
            .bind(&order.platform_order_id)
            .bind(&order.status)
            .bind(order.order_type)
            .bind(&order.vendor_code)
            .bind(&order.created_at)
            .bind(items_json)
            .execute(&mut *tx)
            .await?;
            new_ids.insert(id);
        }

        if new_ids.is_empty() {
            debug!(
                target = "marketsync.store",
                credential_id = credential.id,
                "empty fetch, clearing stored orders"
            );
            sqlx::query("DELETE FROM orders WHERE user_id = ? AND credential_id = ?")
                .bind(credential.user_id)
                .bind(credential.id)
                .execute(&mut *tx)
                .await?;
        } else {
            let existing: Vec<String> =
                sqlx::query_scalar("SELECT id FROM orders WHERE user_id = ? AND credential_id = ?")
                    .bind(credential.user_id)
                    .bind(credential.id)
                    .fetch_all(&mut *tx)
                    .await?;
            let stale: Vec<&String> = existing.iter().filter(|id| !new_ids.contains(*id)).collect();
            if !stale.is_empty() {
                info!(
                    target = "marketsync.store",
                    credential_id = credential.id,
                    stale = stale.len(),
                    "pruning orders absent from latest fetch"
                );
                for id in stale {
                    sqlx::query(
                        "DELETE FROM orders WHERE id = ? AND user_id = ? AND credential_id = ?",
                    )
                    .bind(id)
                    .bind(credential.user_id)
                    .bind(credential.id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        let now = Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        sqlx::query("UPDATE credentials SET last_sync = ? WHERE id = ? AND user_id = ?")
            .bind(now)
            .bind(credential.id)
            .bind(credential.user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let mut touched_ids: Vec<String> = new_ids.into_iter().collect();
        touched_ids.sort();
        Ok(SyncResult {
            count: orders.len(),
            touched_ids,
        })
    }

    /// Active-order query backing `GET /orders`: newest first, optionally
    /// scoped to one credential, filtered through the status allow-list.
    pub async fn list_active_orders(
        &self,
        user_id: i64,
        credential_id: Option<i64>,
        allowed: &ActiveStatusSet,
    ) -> Result<Vec<StoredOrder>, StoreError> {
        let rows = match credential_id {
            Some(cred_id) => {
                sqlx::query_as::<_, OrderRow>(
                    "SELECT * FROM orders WHERE user_id = ? AND credential_id = ? ORDER BY created_at DESC",
                )
                .bind(user_id)
                .bind(cred_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, OrderRow>(
                    "SELECT * FROM orders WHERE user_id = ? ORDER BY created_at DESC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let total = rows.len();
        let active: Vec<StoredOrder> = rows
            .into_iter()
            .map(OrderRow::into_stored)
            .filter(|order| allowed.is_active(&order.status))
            .collect();
        debug!(
            target = "marketsync.store",
            user_id,
            total,
            active = active.len(),
            "served active order list"
        );
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderItem;

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:").await.expect("store")
    }

    async fn seeded_credential(store: &Store, platform: Platform) -> Credential {
        let user_id = store
            .create_user("seller@example.com", "hash", "Seller")
            .await
            .expect("user");
        store
            .insert_credential(user_id, "Main account", platform, "cid", "secret", "VND")
            .await
            .expect("credential")
    }

    fn order(id: &str, status: &str) -> NormalizedOrder {
        NormalizedOrder {
            platform_order_id: id.to_string(),
            status: status.to_string(),
            order_type: 3,
            vendor_code: "VND".to_string(),
            created_at: Some("2025-04-01 10:00:00".to_string()),
            items: vec![OrderItem {
                sku: "SKU-1".to_string(),
                name: "Widget".to_string(),
                qty: 1,
                price: 19.99,
            }],
        }
    }

    #[tokio::test]
    async fn reconcile_replaces_previous_snapshot() {
        let store = memory_store().await;
        let cred = seeded_credential(&store, Platform::Emag).await;

        let first = vec![order("100", "new"), order("101", "new")];
        store.reconcile_orders(&cred, &first).await.expect("first");

        let second = vec![order("100", "in progress")];
        let result = store.reconcile_orders(&cred, &second).await.expect("second");
        assert_eq!(result.count, 1);

        let active = store
            .list_active_orders(cred.user_id, None, &ActiveStatusSet::default())
            .await
            .expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, format!("100-{}", cred.id));
        assert_eq!(active[0].status, "in progress");
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let store = memory_store().await;
        let cred = seeded_credential(&store, Platform::Emag).await;
        let batch = vec![order("100", "new"), order("101", "prepared")];

        store.reconcile_orders(&cred, &batch).await.expect("first");
        let result = store.reconcile_orders(&cred, &batch).await.expect("second");
        assert_eq!(result.count, 2);
        assert_eq!(
            result.touched_ids,
            vec![format!("100-{}", cred.id), format!("101-{}", cred.id)]
        );

        let active = store
            .list_active_orders(cred.user_id, Some(cred.id), &ActiveStatusSet::default())
            .await
            .expect("list");
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn empty_fetch_deletes_everything_for_credential() {
        let store = memory_store().await;
        let cred = seeded_credential(&store, Platform::Trendyol).await;
        store
            .reconcile_orders(&cred, &[order("500", "new")])
            .await
            .expect("seed");

        store.reconcile_orders(&cred, &[]).await.expect("empty");
        let active = store
            .list_active_orders(cred.user_id, Some(cred.id), &ActiveStatusSet::default())
            .await
            .expect("list");
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn reconcile_stamps_last_sync() {
        let store = memory_store().await;
        let cred = seeded_credential(&store, Platform::Emag).await;
        assert!(cred.last_sync.is_none());

        store.reconcile_orders(&cred, &[order("1", "new")]).await.expect("sync");
        let reloaded = store
            .credential_for_user(cred.id, cred.user_id)
            .await
            .expect("load")
            .expect("present");
        assert!(reloaded.last_sync.is_some());
    }

    #[tokio::test]
    async fn reconcile_scopes_to_one_credential() {
        let store = memory_store().await;
        let user_id = store
            .create_user("seller@example.com", "hash", "Seller")
            .await
            .expect("user");
        let a = store
            .insert_credential(user_id, "A", Platform::Emag, "cid", "sec", "V1")
            .await
            .expect("a");
        let b = store
            .insert_credential(user_id, "B", Platform::Trendyol, "cid", "sec", "V2")
            .await
            .expect("b");

        store.reconcile_orders(&a, &[order("100", "new")]).await.expect("a sync");
        store.reconcile_orders(&b, &[order("100", "new")]).await.expect("b sync");

        // wiping credential B must leave credential A's snapshot intact
        store.reconcile_orders(&b, &[]).await.expect("b wipe");
        let remaining = store
            .list_active_orders(user_id, None, &ActiveStatusSet::default())
            .await
            .expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].credential_id, a.id);
    }

    #[tokio::test]
    async fn active_filter_is_case_insensitive_and_excludes_non_active() {
        let store = memory_store().await;
        let cred = seeded_credential(&store, Platform::Trendyol).await;
        let batch = vec![order("1", "New"), order("2", "shipped"), order("3", "Invoiced")];
        store.reconcile_orders(&cred, &batch).await.expect("sync");

        let active = store
            .list_active_orders(cred.user_id, Some(cred.id), &ActiveStatusSet::default())
            .await
            .expect("list");
        let mut ids: Vec<&str> = active.iter().map(|o| o.platform_order_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn undecodable_items_keep_row_with_empty_list() {
        let store = memory_store().await;
        let cred = seeded_credential(&store, Platform::Emag).await;
        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, credential_id, platform_order_id, status, order_type, vendor_code, created_at, items)
            VALUES (?, ?, ?, '77', 'new', 3, 'VND', '2025-04-01', 'not json')
            "#,
        )
        .bind(format!("77-{}", cred.id))
        .bind(cred.user_id)
        .bind(cred.id)
        .execute(&store.pool)
        .await
        .expect("raw insert");

        let active = store
            .list_active_orders(cred.user_id, Some(cred.id), &ActiveStatusSet::default())
            .await
            .expect("list");
        assert_eq!(active.len(), 1);
        assert!(active[0].items.is_empty());
    }

    #[tokio::test]
    async fn credential_crud_round_trip() {
        let store = memory_store().await;
        let user_id = store
            .create_user("seller@example.com", "hash", "Seller")
            .await
            .expect("user");
        let cred = store
            .insert_credential(user_id, "Shop RO", Platform::Emag, "cid", "sec", "V1")
            .await
            .expect("insert");

        let updated = store
            .update_credential(cred.id, user_id, Some("Shop HU"), None, None, None, None)
            .await
            .expect("update")
            .expect("present");
        assert_eq!(updated.account_label, "Shop HU");
        assert_eq!(updated.client_id, "cid");

        store
            .reconcile_orders(&updated, &[order("42", "new")])
            .await
            .expect("seed order");
        assert!(store.delete_credential(cred.id, user_id).await.expect("delete"));
        assert!(!store.delete_credential(cred.id, user_id).await.expect("gone"));
        let orphans = store
            .list_active_orders(user_id, Some(cred.id), &ActiveStatusSet::default())
            .await
            .expect("orders");
        assert!(orphans.is_empty());
        assert!(store
            .credential_for_user(cred.id, user_id)
            .await
            .expect("load")
            .is_none());
    }
}
