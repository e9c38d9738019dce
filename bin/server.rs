// Widget Entitlements - Web Server
// REST API over the content gate, purchase flow and entitlement cache

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use widget_entitlements::{
    logging, AppConfig, Database, EntitlementServices, Event, PaymentError, PaymentRecord,
    PaymentStatus, PremiumContent, PurchaseReceipt, UnlockState, VERSION,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    services: Arc<EntitlementServices>,
    db: Arc<Database>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn reply<T: Serialize>(status: StatusCode, body: ApiResponse<T>) -> Response {
    (status, Json(body)).into_response()
}

fn internal_error(context: &str, e: anyhow::Error) -> Response {
    error!(error = %e, "{}", context);
    reply::<()>(StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::err(context))
}

fn payment_error_status(e: PaymentError) -> StatusCode {
    match e {
        PaymentError::Cancelled | PaymentError::Pending => StatusCode::ACCEPTED,
        PaymentError::ProductNotFound => StatusCode::NOT_FOUND,
        PaymentError::NotAuthorized => StatusCode::FORBIDDEN,
        PaymentError::NetworkError => StatusCode::SERVICE_UNAVAILABLE,
        PaymentError::VerificationFailed => StatusCode::UNPROCESSABLE_ENTITY,
        PaymentError::PurchaseFailed | PaymentError::RestoreFailed | PaymentError::Unknown => {
            StatusCode::BAD_GATEWAY
        }
    }
}

fn payment_error(e: PaymentError) -> Response {
    let message = e.user_message().unwrap_or(e.code()).to_string();
    reply::<()>(payment_error_status(e), ApiResponse::err(message))
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Catalog entry with ownership
#[derive(Serialize)]
struct CatalogEntry {
    #[serde(flatten)]
    content: PremiumContent,
    owned: bool,
}

/// GET /api/content/:content_id
#[derive(Serialize)]
struct ContentResponse {
    content_id: String,
    premium: bool,
    state: UnlockState,
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    payment_status: PaymentStatus,
    purchased_items: usize,
    premium_content: usize,
}

#[derive(Serialize)]
struct HistoryResponse {
    product_id: String,
    payments: Vec<PaymentRecord>,
    events: Vec<Event>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/catalog - Premium content with ownership flags
async fn get_catalog(State(state): State<AppState>) -> impl IntoResponse {
    let services = &state.services;
    let entries: Vec<CatalogEntry> = services
        .catalog
        .premium_contents()
        .into_iter()
        .map(|content| CatalogEntry {
            owned: services.cache.is_purchased(&content.product_id),
            content: content.clone(),
        })
        .collect();

    Json(ApiResponse::ok(entries))
}

/// GET /api/content/:content_id - Locked or unlocked
async fn get_content(
    State(state): State<AppState>,
    Path(content_id): Path<String>,
) -> impl IntoResponse {
    let content_id = decode(&content_id);
    let services = &state.services;

    let response = ContentResponse {
        premium: services.gate.is_premium(&content_id),
        state: services.gate.unlock_state(&content_id).await,
        content_id,
    };

    Json(ApiResponse::ok(response))
}

/// POST /api/content/:content_id/purchase
async fn purchase_content(
    State(state): State<AppState>,
    Path(content_id): Path<String>,
) -> Response {
    let content_id = decode(&content_id);

    let Some(item) = state.services.gate.to_purchasable_item(&content_id) else {
        return reply::<PurchaseReceipt>(
            StatusCode::BAD_REQUEST,
            ApiResponse::err(format!("{} is free content", content_id)),
        );
    };

    match state.services.purchases.purchase(&item).await {
        Ok(receipt) => reply(StatusCode::OK, ApiResponse::ok(receipt)),
        Err(e) => payment_error(e),
    }
}

/// POST /api/restore
async fn restore_purchases(State(state): State<AppState>) -> Response {
    match state.services.purchases.restore().await {
        Ok(restored) => reply(StatusCode::OK, ApiResponse::ok(restored)),
        Err(e) => payment_error(e),
    }
}

/// GET /api/entitlements - Locally recorded purchases
async fn get_entitlements(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok(state.services.cache.purchased_items()))
}

/// DELETE /api/entitlements/:product_id - Local revoke (no store effect)
async fn revoke_entitlement(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
) -> Response {
    let product_id = decode(&product_id);

    match state.services.cache.remove(&product_id) {
        Ok(true) => {
            let event = Event::new(
                "entitlement_removed",
                "product",
                &product_id,
                serde_json::json!({ "source": "api" }),
                "api",
            );
            if let Err(e) = state.db.record_event(&event) {
                error!(product_id = %product_id, error = %e, "failed to record removal event");
            }
            reply(StatusCode::OK, ApiResponse::ok(product_id))
        }
        Ok(false) => reply::<String>(
            StatusCode::NOT_FOUND,
            ApiResponse::err(format!("{} is not purchased", product_id)),
        ),
        Err(e) => internal_error("Failed to remove entitlement", e),
    }
}

/// GET /api/payments/:product_id - Payment and event history
async fn get_payments(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
) -> Response {
    let product_id = decode(&product_id);

    let payments = match state.db.payments_for_product(&product_id) {
        Ok(payments) => payments,
        Err(e) => return internal_error("Failed to load payments", e),
    };
    let events = match state.db.events_for("product", &product_id) {
        Ok(events) => events,
        Err(e) => return internal_error("Failed to load events", e),
    };

    reply(
        StatusCode::OK,
        ApiResponse::ok(HistoryResponse {
            product_id,
            payments,
            events,
        }),
    )
}

/// GET /api/status - Purchase flow state
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let services = &state.services;

    Json(ApiResponse::ok(StatusResponse {
        version: VERSION,
        payment_status: services.purchases.status(),
        purchased_items: services.cache.purchased_items().len(),
        premium_content: services.catalog.len(),
    }))
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/catalog", get(get_catalog))
        .route("/content/:content_id", get(get_content))
        .route("/content/:content_id/purchase", post(purchase_content))
        .route("/restore", post(restore_purchases))
        .route("/entitlements", get(get_entitlements))
        .route("/entitlements/:product_id", delete(revoke_entitlement))
        .route("/payments/:product_id", get(get_payments))
        .route("/status", get(get_status))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    logging::init(&config.log_filter);

    println!("🌐 Widget Entitlements - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let (services, db) = EntitlementServices::from_config(&config)?;
    println!("✓ Container opened: {:?}", config.database_path);
    println!("✓ {} premium items in catalog", services.catalog.len());

    let services = Arc::new(services);
    let _listener = services.purchases.spawn_transaction_listener();

    let app = router(AppState { services, db });

    let listener = tokio::net::TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server_addr))?;

    info!(addr = %config.server_addr, "server listening");
    println!("\n🚀 Server running on http://{}", config.server_addr);
    println!("   API: http://{}/api/catalog", config.server_addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}
