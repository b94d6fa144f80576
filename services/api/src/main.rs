//! API Service - Public API for the state revenue dashboard
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /dashboard - Full dataset with display formatting and shares
//! - GET /states - Ranked state rows
//! - GET /tax-types - Category list
//!
//! The service is a read-only view over the dataset JSON the pipeline
//! writes; it is re-read per request so a pipeline re-run is picked up
//! without a restart.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    dataset_path: PathBuf,
}

// ============================================================================
// Dataset types (the pipeline's output payload)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Dataset {
    metadata: Metadata,
    tax_types: Vec<TaxType>,
    states: Vec<StateEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    year: i32,
    currency: String,
    scope: String,
    top_n: usize,
    generated_at: String,
    notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaxType {
    key: String,
    label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateEntry {
    state: String,
    population: i64,
    total_revenue: f64,
    per_capita_total: f64,
    breakdown: std::collections::BTreeMap<String, f64>,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DashboardResponse {
    metadata: Metadata,
    tax_types: Vec<TaxType>,
    total_revenue: f64,
    total_formatted: String,
    states: Vec<DashboardState>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DashboardState {
    state: String,
    population: i64,
    total_revenue: f64,
    total_formatted: String,
    per_capita_total: f64,
    share_pct: f64,
    breakdown: std::collections::BTreeMap<String, f64>,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct StatesQuery {
    limit: Option<usize>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

/// Read and parse the dataset, mapping the two failure modes to HTTP codes:
/// not generated yet (404) and unreadable/corrupt (500).
async fn load_dataset(state: &AppState) -> Result<Dataset, (StatusCode, Json<ErrorResponse>)> {
    let content = match tokio::fs::read_to_string(&state.dataset_path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: "Dataset not generated yet - run the pipeline first".to_string(),
                }),
            ));
        }
        Err(e) => {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ));
        }
    };

    serde_json::from_str(&content).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("dataset is not valid JSON: {e}"),
            }),
        )
    })
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let dataset = match load_dataset(&state).await {
        Ok(d) => d,
        Err(e) => return e.into_response(),
    };

    let total_revenue: f64 = dataset.states.iter().map(|s| s.total_revenue).sum();

    let states: Vec<DashboardState> = dataset
        .states
        .iter()
        .map(|s| {
            let share_pct = if total_revenue > 0.0 {
                (s.total_revenue / total_revenue) * 100.0
            } else {
                0.0
            };
            DashboardState {
                state: s.state.clone(),
                population: s.population,
                total_revenue: s.total_revenue,
                total_formatted: format_usd(s.total_revenue),
                per_capita_total: s.per_capita_total,
                share_pct,
                breakdown: s.breakdown.clone(),
            }
        })
        .collect();

    Json(DashboardResponse {
        metadata: dataset.metadata,
        tax_types: dataset.tax_types,
        total_revenue,
        total_formatted: format_usd(total_revenue),
        states,
    })
    .into_response()
}

async fn states_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatesQuery>,
) -> impl IntoResponse {
    let dataset = match load_dataset(&state).await {
        Ok(d) => d,
        Err(e) => return e.into_response(),
    };

    let limit = params.limit.unwrap_or(dataset.states.len());
    let states: Vec<StateEntry> = dataset.states.into_iter().take(limit).collect();

    Json(serde_json::json!({ "states": states })).into_response()
}

async fn tax_types_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let dataset = match load_dataset(&state).await {
        Ok(d) => d,
        Err(e) => return e.into_response(),
    };

    Json(serde_json::json!({ "taxTypes": dataset.tax_types })).into_response()
}

/// Format a revenue figure for display. Dataset amounts are thousands of
/// dollars, so display scaling multiplies by 1000.
fn format_usd(thousands: f64) -> String {
    let dollars = thousands * 1000.0;
    if dollars >= 1_000_000_000.0 {
        format!("${:.2} billion", dollars / 1_000_000_000.0)
    } else if dollars >= 1_000_000.0 {
        format!("${:.1} million", dollars / 1_000_000.0)
    } else {
        format!("${:.0}", dollars)
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let dataset_path =
        PathBuf::from(std::env::var("DATASET_PATH").unwrap_or_else(|_| "data/dataset.json".to_string()));
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== State Revenue API ===");
    println!("Dataset: {}", dataset_path.display());

    let state = Arc::new(AppState { dataset_path });

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/states", get(states_handler))
        .route("/tax-types", get(tax_types_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /dashboard");
    println!("  GET /states?limit=");
    println!("  GET /tax-types");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
