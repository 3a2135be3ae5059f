mod config;
mod http;
mod metrics;
mod models;
mod security;
mod store;
mod sync;
mod vendors;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ActiveStatusSet, ApiError, Credential, Platform, StoredOrder};
use security::{AuthContext, AuthState, require_user_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{Store, StoreError};
use sync::{SyncEngine, SyncError};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use vendors::oblio::OblioClient;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "marketsync.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let store = Store::connect(&config::DATABASE_URL).await?;
    info!(target = "marketsync.api", "store ready at {}", *config::DATABASE_URL);

    let auth_state = AuthState::new(store.clone());
    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let state = AppState {
        store,
        engine: SyncEngine::new(),
        active: ActiveStatusSet::from_env(),
        openapi: Arc::new(openapi),
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/platforms", get(list_platforms))
        .route("/credentials", post(create_credential).get(list_credentials))
        .route(
            "/credentials/{id}",
            put(update_credential).delete(delete_credential),
        )
        .route("/orders", get(list_orders))
        .route("/orders/refresh", post(refresh_orders))
        .route("/oblio/stock", post(oblio_stock))
        .route_layer(middleware::from_fn_with_state(auth_state, require_user_auth));

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(*config::REQUEST_MAX_BYTES));

    let addr: SocketAddr = ([0, 0, 0, 0], *config::PORT).into();
    info!(target = "marketsync.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: Store,
    engine: SyncEngine,
    active: ActiveStatusSet,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({"message": "Marketplace Admin API"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "marketsync-api-rs",
    }))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Some(secret) = config::METRICS_KEY.as_deref() {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

async fn openapi_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json((*state.openapi).clone())
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Marketplace Admin API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

// -------- auth --------

#[derive(Debug, Deserialize)]
struct SignupRequest {
    email: String,
    password: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    user_id: i64,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

async fn signup(
    State(state): State<AppState>,
    Json(payload): Json<SignupRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    crate::metrics::inc_requests("/auth/signup");
    let email = payload.email.trim();
    let name = payload.name.trim();
    if email.is_empty() || payload.password.is_empty() || name.is_empty() {
        return Err(AppError::BadRequest(
            "Email, password, and name are required".into(),
        ));
    }
    if payload.password.len() < 6 {
        return Err(AppError::BadRequest(
            "Password must be at least 6 characters".into(),
        ));
    }
    if state.store.user_by_email(email).await?.is_some() {
        return Err(AppError::Conflict("Email already registered"));
    }

    let password_hash = security::hash_password(&payload.password)
        .map_err(|err| AppError::Internal(format!("password hashing failed: {err}")))?;
    let user_id = state.store.create_user(email, &password_hash, name).await?;
    info!(target = "marketsync.api", user_id, "account created");

    Ok(Json(TokenResponse {
        access_token: security::issue_token(user_id),
        token_type: "bearer",
        user_id,
        name: name.to_string(),
        message: Some("Account created successfully"),
    }))
}

async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    crate::metrics::inc_requests("/auth/login");
    let user = state
        .store
        .user_by_email(payload.email.trim())
        .await?
        .ok_or(AppError::Unauthorized("Invalid credentials"))?;
    if !security::verify_password(&payload.password, &user.password_hash) {
        return Err(AppError::Unauthorized("Invalid password"));
    }

    Ok(Json(TokenResponse {
        access_token: security::issue_token(user.id),
        token_type: "bearer",
        user_id: user.id,
        name: user.name,
        message: None,
    }))
}

async fn logout() -> Json<serde_json::Value> {
    Json(json!({"message": "Logged out"}))
}

// -------- platforms --------

async fn list_platforms(Extension(_context): Extension<AuthContext>) -> Json<serde_json::Value> {
    let platforms: Vec<serde_json::Value> = [
        Platform::Emag,
        Platform::Trendyol,
        Platform::Oblio,
        Platform::Etsy,
    ]
    .iter()
    .map(|p| {
        json!({
            "id": p.id(),
            "name": p.as_str(),
            "display_name": p.display_name(),
            "is_active": true,
        })
    })
    .collect();
    Json(serde_json::Value::Array(platforms))
}

// -------- credentials --------

#[derive(Debug, Deserialize)]
struct CreateCredentialRequest {
    account_label: String,
    platform_id: i64,
    client_id: String,
    client_secret: String,
    vendor_code: String,
}

#[derive(Debug, Deserialize)]
struct UpdateCredentialRequest {
    #[serde(default)]
    account_label: Option<String>,
    #[serde(default)]
    platform_id: Option<i64>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    vendor_code: Option<String>,
}

fn clean(value: &str) -> String {
    value.trim().to_string()
}

async fn create_credential(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<CreateCredentialRequest>,
) -> Result<Json<Credential>, AppError> {
    crate::metrics::inc_requests("/credentials");
    let account_label = clean(&payload.account_label);
    let client_id = clean(&payload.client_id);
    let client_secret = clean(&payload.client_secret);
    let vendor_code = clean(&payload.vendor_code);

    if account_label.is_empty() {
        return Err(AppError::BadRequest(
            "account_label and platform_id are required".into(),
        ));
    }
    let platform = Platform::from_id(payload.platform_id)
        .ok_or_else(|| AppError::BadRequest("Invalid platform_id".into()))?;
    if vendor_code.is_empty() {
        return Err(AppError::BadRequest("vendor_code is required".into()));
    }
    if client_id.is_empty() {
        return Err(AppError::BadRequest("client_id is required".into()));
    }
    if client_secret.is_empty() {
        return Err(AppError::BadRequest("client_secret is required".into()));
    }

    let credential = state
        .store
        .insert_credential(
            context.user_id,
            &account_label,
            platform,
            &client_id,
            &client_secret,
            &vendor_code,
        )
        .await?;
    Ok(Json(credential))
}

async fn list_credentials(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<Vec<Credential>>, AppError> {
    let credentials = state.store.credentials_for_user(context.user_id).await?;
    Ok(Json(credentials))
}

async fn update_credential(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateCredentialRequest>,
) -> Result<Json<Credential>, AppError> {
    if state
        .store
        .credential_for_user(id, context.user_id)
        .await?
        .is_none()
    {
        return Err(AppError::NotFound("Credential not found"));
    }

    let platform = match payload.platform_id {
        Some(raw) => Some(
            Platform::from_id(raw)
                .ok_or_else(|| AppError::BadRequest("Invalid platform_id".into()))?,
        ),
        None => None,
    };
    let account_label = payload.account_label.as_deref().map(clean);
    let client_id = payload.client_id.as_deref().map(clean);
    let client_secret = payload.client_secret.as_deref().map(clean);
    let vendor_code = payload.vendor_code.as_deref().map(clean);
    if matches!(&vendor_code, Some(v) if v.is_empty()) {
        return Err(AppError::BadRequest("vendor_code is required".into()));
    }
    if matches!(&client_id, Some(v) if v.is_empty()) {
        return Err(AppError::BadRequest("client_id is required".into()));
    }
    if matches!(&client_secret, Some(v) if v.is_empty()) {
        return Err(AppError::BadRequest("client_secret is required".into()));
    }

    let credential = state
        .store
        .update_credential(
            id,
            context.user_id,
            account_label.as_deref(),
            platform,
            client_id.as_deref(),
            client_secret.as_deref(),
            vendor_code.as_deref(),
        )
        .await?
        .ok_or(AppError::NotFound("Credential not found"))?;
    Ok(Json(credential))
}

async fn delete_credential(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.store.delete_credential(id, context.user_id).await? {
        Ok(Json(json!({"message": "Deleted"})))
    } else {
        Err(AppError::NotFound("Credential not found"))
    }
}

// -------- orders --------

#[derive(Debug, Deserialize)]
struct OrdersQuery {
    #[serde(default)]
    credential_id: Option<i64>,
}

/// Active orders for the dashboard, newest first.
///
/// - Method: `GET`
/// - Path: `/orders?credential_id=`
/// - Auth: bearer token
async fn list_orders(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<Vec<StoredOrder>>, AppError> {
    crate::metrics::inc_requests("/orders");
    let orders = state
        .store
        .list_active_orders(context.user_id, query.credential_id, &state.active)
        .await?;
    Ok(Json(orders))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    credential_id: i64,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    orders_fetched: usize,
    degraded: bool,
    message: &'static str,
}

/// Pull the latest active orders from the vendor and reconcile them into the
/// stored snapshot for one credential.
///
/// - Method: `POST`
/// - Path: `/orders/refresh`
/// - Body: `{"credential_id": <id>}`
async fn refresh_orders(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, AppError> {
    crate::metrics::inc_requests("/orders/refresh");
    let credential = state
        .store
        .credential_for_user(payload.credential_id, context.user_id)
        .await?
        .ok_or(AppError::NotFound("Credential not found"))?;
    info!(
        target = "marketsync.api",
        credential_id = credential.id,
        platform = credential.platform.as_str(),
        "refresh requested"
    );

    let outcome = state.engine.refresh(&state.store, &credential).await?;
    Ok(Json(RefreshResponse {
        orders_fetched: outcome.orders_fetched,
        degraded: outcome.degraded,
        message: "Refresh complete",
    }))
}

// -------- oblio stock --------

#[derive(Debug, Deserialize)]
struct StockRequest {
    #[serde(default)]
    product_codes: Vec<String>,
}

async fn oblio_stock(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<StockRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/oblio/stock");
    if payload.product_codes.is_empty() {
        return Ok(Json(json!({"stock": {}})));
    }

    let Some(credential) = state
        .store
        .credential_for_platform(context.user_id, Platform::Oblio)
        .await?
    else {
        warn!(
            target = "marketsync.api",
            user_id = context.user_id,
            "stock requested without an Oblio credential"
        );
        return Ok(Json(
            json!({"stock": {}, "error": "No Oblio credentials configured"}),
        ));
    };

    let client = OblioClient::new(&credential);
    match client.fetch_products_stock(&payload.product_codes).await {
        Ok(stock) => Ok(Json(json!({"stock": stock}))),
        Err(err) => {
            warn!(target = "marketsync.api", "oblio stock lookup failed: {err}");
            Ok(Json(json!({"stock": {}, "error": err.to_string()})))
        }
    }
}

// -------- errors --------

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Unauthorized(&'static str),
    NotFound(&'static str),
    Conflict(&'static str),
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        AppError::Internal(value.to_string())
    }
}

impl From<SyncError> for AppError {
    fn from(value: SyncError) -> Self {
        match value {
            SyncError::UnsupportedPlatform(_) => AppError::BadRequest(value.to_string()),
            SyncError::Reconcile(err) => AppError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "bad_request", detail),
            AppError::Unauthorized(detail) => {
                (StatusCode::UNAUTHORIZED, "unauthorized", detail.to_string())
            }
            AppError::NotFound(detail) => (StatusCode::NOT_FOUND, "not_found", detail.to_string()),
            AppError::Conflict(detail) => (StatusCode::CONFLICT, "conflict", detail.to_string()),
            AppError::Internal(detail) => {
                error!(target = "marketsync.api", "internal error: {detail}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    detail,
                )
            }
        };
        let payload = ApiError {
            error: error.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}
