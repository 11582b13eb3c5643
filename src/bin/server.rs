use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use callsim::{
    eval::JudgeResponseFormat,
    rerun_specs,
    synthetic::{SyntheticDataConfig, SyntheticDataGenerator},
    AgentConfig, Evaluator, ProviderKind, ProviderRegistry, RunOptions, TestResult, TestRunner,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry = ProviderKind::ALL
        .into_iter()
        .fold(ProviderRegistry::new(), |registry, kind| {
            match std::env::var(kind.api_key_env()) {
                Ok(key) if !key.trim().is_empty() => registry.with_api_key(kind, key),
                _ => registry,
            }
        });

    let app_state = Arc::new(AppState { registry });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/rerun", post(rerun))
        .route("/api/generate", post(generate))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(8000);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

struct AppState {
    registry: ProviderRegistry,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    data: T,
    message: Option<String>,
    success: bool,
}

fn failure(status: StatusCode, message: String) -> Response {
    tracing::error!(%status, %message, "request failed");
    (
        status,
        Json(ApiResponse {
            data: (),
            message: Some(message),
            success: false,
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
struct RerunRequest {
    config: AgentConfig,
    test_results: Vec<TestResult>,
    /// Defaults to the new service model.
    #[serde(default)]
    eval_model: Option<String>,
    #[serde(default)]
    judge_provider: Option<ProviderKind>,
    /// Defaults to what the judge provider supports.
    #[serde(default)]
    judge_response_format: Option<JudgeResponseFormat>,
    #[serde(default)]
    max_turns: Option<usize>,
    #[serde(default)]
    persist: bool,
}

#[derive(Deserialize)]
struct GenerateRequest {
    service_prompt: String,
    model: String,
    num_tests: usize,
    #[serde(default)]
    provider: ProviderKind,
    #[serde(default)]
    max_concurrency: Option<usize>,
}

async fn health() -> impl IntoResponse {
    Json(ApiResponse {
        data: "ok",
        message: None,
        success: true,
    })
}

async fn rerun(State(state): State<Arc<AppState>>, Json(req): Json<RerunRequest>) -> Response {
    let specs = match rerun_specs(&req.config, &req.test_results, &state.registry) {
        Ok(specs) => specs,
        Err(e) => return failure(StatusCode::BAD_REQUEST, format!("Failed to rebuild tests: {}", e)),
    };

    let judge_provider = req.judge_provider.unwrap_or(req.config.provider);
    let judge = match state.registry.resolve(judge_provider) {
        Ok(provider) => provider,
        Err(e) => return failure(StatusCode::BAD_REQUEST, format!("Judge unavailable: {}", e)),
    };
    let eval_model = req.eval_model.unwrap_or_else(|| req.config.model().to_string());
    let response_format = req
        .judge_response_format
        .unwrap_or_else(|| JudgeResponseFormat::for_provider(judge_provider));

    let mut options = RunOptions::new().with_persist(req.persist);
    if let Some(max_turns) = req.max_turns {
        options = options.with_max_turns(max_turns);
    }

    tracing::info!(tests = specs.len(), %eval_model, "rerunning tests");
    let evaluator = Evaluator::with_llm_judge_format(judge, eval_model, response_format);
    let results = TestRunner::new(evaluator)
        .run_tests(specs, &options)
        .await;

    Json(ApiResponse {
        data: results,
        message: None,
        success: true,
    })
    .into_response()
}

async fn generate(State(state): State<Arc<AppState>>, Json(req): Json<GenerateRequest>) -> Response {
    let provider = match state.registry.resolve(req.provider) {
        Ok(provider) => provider,
        Err(e) => return failure(StatusCode::BAD_REQUEST, format!("Provider unavailable: {}", e)),
    };

    let mut config = SyntheticDataConfig::new(req.service_prompt, req.model, req.num_tests);
    if let Some(max_concurrency) = req.max_concurrency {
        config = config.with_max_concurrency(max_concurrency);
    }

    let scenarios = SyntheticDataGenerator::new(config, provider).generate().await;

    Json(ApiResponse {
        data: scenarios,
        message: None,
        success: true,
    })
    .into_response()
}
