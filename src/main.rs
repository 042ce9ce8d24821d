//! Legal Extractor - entity-extraction service over a pattern library and
//! prompted LLM waves.

mod chunker;
mod entity_types;
mod json_repair;
mod llm;
mod model;
mod orchestrator;
mod pattern_match;
mod patterns;
mod relationships;
mod router;
mod settings;
mod size_detector;
mod throttle;
mod waves;

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use entity_types::AliasMap;
use llm::LlmClient;
use model::ExtractionResult;
use orchestrator::ExtractionOrchestrator;
use patterns::cache::CachedPatternStore;
use patterns::PatternStore;
use router::{DocumentRouter, RouteOptions, RoutingDecision};
use settings::Settings;
use size_detector::SizeDetector;
use std::collections::HashMap;
use std::sync::Arc;
use throttle::ThrottledClient;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers. Each component owns only what
/// it mutates; everything here is an explicit dependency.
#[derive(Clone)]
struct AppState {
    document_router: Arc<DocumentRouter>,
    orchestrator: Arc<ExtractionOrchestrator>,
    patterns: Arc<CachedPatternStore>,
    throttled: Arc<ThrottledClient>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "legal_extractor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;

    // Pattern library behind the TTL+LRU cache
    let aliases = AliasMap::load(&settings.entity_alias_file);
    let store = Arc::new(PatternStore::new(settings.patterns_dir.clone(), aliases));
    let report = store.load_all();
    info!(
        "Pattern library ready: {} files loaded, {} patterns, {} errors",
        report.files_loaded, report.patterns_loaded, report.errors
    );
    let patterns = Arc::new(CachedPatternStore::new(
        Arc::clone(&store),
        settings.cache_max_size,
        settings.cache_ttl,
    ));

    // LLM client stack: HTTP client wrapped by the throttled client
    let llm_client = Arc::new(
        LlmClient::new(
            settings.llm_base_url.clone(),
            settings.llm_model.clone(),
            settings.llm_timeout,
        )
        .with_max_retries(settings.llm_max_retries),
    );
    let throttled = Arc::new(ThrottledClient::new(llm_client, settings.throttle_config()));

    let document_router = Arc::new(DocumentRouter::new(
        SizeDetector::new(settings.chars_per_token),
        settings.max_context_length,
        settings.safety_margin,
        settings.force_strategy.clone(),
    ));

    let orchestrator = Arc::new(ExtractionOrchestrator::new(
        Arc::clone(&throttled) as Arc<dyn llm::ChatClient>,
        Arc::clone(&patterns),
        settings.orchestrator_config(),
    ));

    let state = AppState {
        document_router,
        orchestrator,
        patterns,
        throttled,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v2/extract", post(extract))
        .route("/api/v2/route", post(route_document))
        .route("/api/v2/patterns", get(list_patterns))
        .route("/api/v2/patterns/search", get(search_patterns))
        .route("/api/v2/patterns/entity-types", get(list_entity_types))
        .route(
            "/api/v2/patterns/entity-types/:entity_type",
            get(entity_type_info),
        )
        .route("/api/v2/patterns/entity-types-info", get(all_entity_type_info))
        .route("/api/v2/patterns/relationships", get(list_relationships))
        .route(
            "/api/v2/patterns/relationships/statistics",
            get(relationship_statistics),
        )
        .route("/api/v2/patterns/statistics", get(pattern_statistics))
        .route("/api/v2/patterns/metrics", get(load_metrics))
        .route("/api/v2/patterns/reload", post(reload_patterns))
        .route(
            "/api/v2/patterns/validate-dependencies",
            get(validate_dependencies),
        )
        .route("/api/v2/cache/stats", get(cache_stats))
        .route("/api/v2/cache/info", get(cache_info))
        .route("/api/v2/cache/clear", post(cache_clear))
        .route("/api/v2/limits", post(update_limits))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check with throttling statistics and circuit state. The wave
/// system is reported unavailable while the circuit is open.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let throttling = state.throttled.stats();
    let load = state.patterns.store().load_metrics();
    let wave_system_available = throttling.circuit_state != throttle::CircuitState::Open;

    Json(serde_json::json!({
        "status": if wave_system_available { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "wave_system_available": wave_system_available,
        "patterns_loaded": load.patterns_loaded,
        "pattern_load_errors": load.load_errors,
        "circuit_state": throttling.circuit_state,
        "throttling": throttling,
    }))
}

#[derive(serde::Deserialize)]
struct ExtractRequest {
    document_text: String,
    #[serde(default)]
    metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    options: RouteOptions,
}

/// Route a document and run the chosen extraction strategy end to end.
/// A well-formed request always produces an `ExtractionResult`; sentinel
/// routing decisions yield empty results rather than errors.
async fn extract(
    State(state): State<AppState>,
    Json(request): Json<ExtractRequest>,
) -> Json<ExtractionResult> {
    let decision = state.document_router.route(
        &request.document_text,
        request.metadata.as_ref(),
        &request.options,
    );

    let (valid, warnings) = state.document_router.validate_decision(&decision);
    if !valid {
        for warning in &warnings {
            warn!("Routing decision warning: {}", warning);
        }
    }

    let result = state
        .orchestrator
        .extract(&request.document_text, &decision)
        .await;

    Json(result)
}

/// Routing decision only; no extraction side effects.
async fn route_document(
    State(state): State<AppState>,
    Json(request): Json<ExtractRequest>,
) -> Json<RoutingDecision> {
    Json(state.document_router.route(
        &request.document_text,
        request.metadata.as_ref(),
        &request.options,
    ))
}

/// Detailed pattern listing.
async fn list_patterns(State(state): State<AppState>) -> Json<Vec<patterns::PatternDetail>> {
    Json(state.patterns.store().all_patterns_detailed())
}

#[derive(serde::Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    min_confidence: Option<f64>,
}

async fn search_patterns(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<Vec<patterns::PatternDetail>> {
    let matches = state.patterns.store().search_patterns(
        &query.q,
        query.entity_type.as_deref(),
        query.min_confidence,
    );
    Json(matches.iter().map(|p| p.detail()).collect())
}

#[derive(serde::Deserialize)]
struct EntityTypesQuery {
    #[serde(default)]
    with_examples: bool,
}

async fn list_entity_types(
    State(state): State<AppState>,
    Query(query): Query<EntityTypesQuery>,
) -> Json<Vec<String>> {
    let types = if query.with_examples {
        state.patterns.entity_types_with_examples()
    } else {
        state.patterns.entity_types()
    };
    Json((*types).clone())
}

async fn entity_type_info(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
) -> Json<patterns::EntityTypeInfo> {
    Json((*state.patterns.entity_type_info(&entity_type)).clone())
}

async fn all_entity_type_info(
    State(state): State<AppState>,
) -> Json<Vec<patterns::EntityTypeInfo>> {
    Json(state.patterns.store().all_entity_type_info())
}

async fn relationship_statistics(
    State(state): State<AppState>,
) -> Json<patterns::RelationshipStatistics> {
    Json(state.patterns.store().relationship_statistics())
}

async fn list_relationships(
    State(state): State<AppState>,
) -> Json<std::collections::BTreeMap<String, Vec<patterns::RelationshipPattern>>> {
    Json((*state.patterns.relationship_patterns()).clone())
}

async fn pattern_statistics(State(state): State<AppState>) -> Json<patterns::PatternStatistics> {
    Json(state.patterns.store().pattern_statistics())
}

async fn load_metrics(State(state): State<AppState>) -> Json<patterns::LoadMetrics> {
    Json(state.patterns.store().load_metrics())
}

/// Hash-keyed reload: unchanged files are skipped, failed files keep their
/// previous group.
async fn reload_patterns(State(state): State<AppState>) -> Json<patterns::LoadReport> {
    let report = state.patterns.store().reload();
    state.patterns.clear_cache();
    Json(report)
}

async fn validate_dependencies(
    State(state): State<AppState>,
) -> Json<HashMap<String, Vec<String>>> {
    Json(state.patterns.store().validate_dependencies())
}

async fn cache_stats(State(state): State<AppState>) -> Json<patterns::cache::CacheMetricsReport> {
    Json(state.patterns.cache().metrics())
}

async fn cache_info(State(state): State<AppState>) -> Json<patterns::cache::CacheInfoReport> {
    Json(state.patterns.cache().info())
}

async fn cache_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.patterns.clear_cache();
    Json(serde_json::json!({"cleared": true}))
}

#[derive(serde::Deserialize)]
struct UpdateLimitsRequest {
    #[serde(default)]
    max_concurrent: Option<usize>,
    #[serde(default)]
    requests_per_minute: Option<usize>,
    #[serde(default)]
    request_delay_ms: Option<u64>,
}

/// Dynamic throttling reconfiguration; responds with the updated stats.
async fn update_limits(
    State(state): State<AppState>,
    Json(request): Json<UpdateLimitsRequest>,
) -> Json<throttle::ThrottleStats> {
    state.throttled.update_limits(
        request.max_concurrent,
        request.requests_per_minute,
        request.request_delay_ms,
    );
    Json(state.throttled.stats())
}
