mod catalog;
mod config;
mod extract;
mod http;
mod jobs;
mod keys;
mod llm;
mod matcher;
mod metrics;
mod models;
mod pipeline;
mod reconcile;
mod security;
mod store;
mod taxonomy;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::Settings;
use eyre::WrapErr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, BatchRunRequest, BatchRunResponse, ExtractRequest, ExtractResponse,
    GroupRunRequest, GroupRunResponse, MatchRequest, MatchResponse, ReconcileRequest,
    ReconcileResponse,
};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use taxonomy::{ResolvedSchema, TaxonomyIndex};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "metafield.api", "server crashed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let settings = Settings::from_env().wrap_err("invalid configuration")?;

    // Nothing works without a taxonomy, so a bad snapshot stops startup.
    let index = TaxonomyIndex::from_path(&settings.taxonomy_snapshot_path).wrap_err_with(|| {
        format!(
            "failed to load taxonomy snapshot {}",
            settings.taxonomy_snapshot_path.display()
        )
    })?;
    let index = Arc::new(index);

    let pipeline = Pipeline::from_settings(&settings, index);
    let (queue, _worker) = jobs::JobQueue::spawn(
        pipeline.clone(),
        settings.queue_capacity,
        settings.job_retention,
    );
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;

    let state = AppState {
        pipeline,
        queue,
        prometheus_handle,
    };
    let app = build_router(
        state,
        AuthState::from_settings(&settings.api_keys),
        settings.request_max_bytes,
    );

    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    info!(target = "metafield.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState, auth_state: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/categories/{id}/attributes", get(category_attributes))
        .nest(
            "/groups",
            Router::new()
                .route("/match", post(match_group))
                .route("/extract", post(extract_group))
                .route("/run", post(run_group)),
        )
        .route("/batches/run", post(run_batch))
        .route("/reconcile", post(reconcile))
        .nest(
            "/jobs",
            Router::new()
                .route("/groups", post(enqueue_group_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Reports the size of the loaded taxonomy alongside `status`.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let taxonomy = state.pipeline.taxonomy();
    Json(json!({
        "status": "ok",
        "service": "metafield-api-rs",
        "taxonomy": {
            "nodes": taxonomy.len(),
            "leaves": taxonomy.leaf_count(),
        },
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    let body = state.prometheus_handle.render();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
        .into_response()
}

/// Attribute definitions for a category, inherited from the nearest
/// ancestor when the category has none of its own.
async fn category_attributes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResolvedSchema>, AppError> {
    crate::metrics::inc_requests("/categories/{id}/attributes");
    Ok(Json(state.pipeline.schema_for(&id)?))
}

/// Match a product group to a leaf category.
///
/// - Method: `POST`
/// - Path: `/groups/match`
/// - Body: `MatchRequest`
/// - Response: `MatchResponse`; `cached` is true when a stored match was reused
async fn match_group(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<MatchRequest>,
) -> Result<Json<MatchResponse>, AppError> {
    crate::metrics::inc_requests("/groups/match");
    info!(
        target = "metafield.api",
        client = %context.label,
        tag = %payload.tag,
        products = payload.products.len(),
        "match requested"
    );
    Ok(Json(state.pipeline.match_group(payload).await?))
}

async fn extract_group(
    State(state): State<AppState>,
    Json(payload): Json<ExtractRequest>,
) -> Result<Json<ExtractResponse>, AppError> {
    crate::metrics::inc_requests("/groups/extract");
    Ok(Json(state.pipeline.extract(payload).await?))
}

/// Run the full group pipeline: match, resolve schema, extract, build the
/// upload payload.
///
/// - Method: `POST`
/// - Path: `/groups/run`
/// - Auth: `Authorization: Bearer <key>` or `X-Metafield-Key: <key>`
/// - Body: `GroupRunRequest`
/// - Response: `GroupRunResponse` with a per-stage transcript
async fn run_group(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<GroupRunRequest>,
) -> Result<Json<GroupRunResponse>, AppError> {
    crate::metrics::inc_requests("/groups/run");
    info!(
        target = "metafield.api",
        client = %context.label,
        key_id = %context.key_id,
        tag = %payload.tag,
        products = payload.products.len(),
        "group pipeline invoked"
    );
    Ok(Json(state.pipeline.run_group(payload, None).await?))
}

async fn run_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchRunRequest>,
) -> Json<BatchRunResponse> {
    crate::metrics::inc_requests("/batches/run");
    Json(state.pipeline.run_batch(payload).await)
}

async fn reconcile(
    State(state): State<AppState>,
    Json(payload): Json<ReconcileRequest>,
) -> Result<Json<ReconcileResponse>, AppError> {
    crate::metrics::inc_requests("/reconcile");
    Ok(Json(state.pipeline.reconcile(payload)?))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_group_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<GroupRunRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/jobs/groups");
    let id = state
        .queue
        .enqueue_group(payload, context)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    state
        .queue
        .get(uuid)
        .map(Json)
        .ok_or_else(|| AppError::Pipeline(PipelineError::not_found("jobs", "not_found")))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Unprocessable => StatusCode::UNPROCESSABLE_ENTITY,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedModel;
    use crate::pipeline::tests::{pipeline_with, tv_products};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    const KEY: &str = "secret-1";

    fn app(match_reply: &str, extract_reply: &str) -> Router {
        let pipeline = pipeline_with(
            Arc::new(ScriptedModel::replies(vec![match_reply])),
            Arc::new(ScriptedModel::replies(vec![extract_reply])),
        );
        let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone(), 4, 16);
        let state = AppState {
            pipeline,
            queue,
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        };
        build_router(state, AuthState::from_settings(&format!("test:{KEY}")), 1024 * 1024)
    }

    fn tv_app() -> Router {
        app(
            r#"{"category_id": "1", "confidence": "high"}"#,
            r#"{"display-resolution": "2160p", "screen-size": "65 in"}"#,
        )
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {KEY}"))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_with_key(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(security::KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = tv_app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["taxonomy"]["leaves"], 6);
    }

    #[tokio::test]
    async fn protected_routes_need_a_key() {
        let response = tv_app()
            .oneshot(
                Request::builder()
                    .uri("/categories/1/attributes")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = tv_app()
            .oneshot(
                Request::builder()
                    .uri("/categories/1/attributes")
                    .header(security::KEY_HEADER, "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "invalid_api_key");
    }

    #[tokio::test]
    async fn category_attributes_map_errors_to_statuses() {
        let response = tv_app().oneshot(get_with_key("/categories/1/attributes")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["attributes"][0]["key"], "display-resolution");
        assert_eq!(body["attributes"][0]["type"], "enumText");

        let response = tv_app().oneshot(get_with_key("/categories/nope/attributes")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = tv_app().oneshot(get_with_key("/categories/hg-2/attributes")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn group_run_returns_payload_and_stages() {
        let products = serde_json::to_value(tv_products(2)).unwrap();
        let response = tv_app()
            .oneshot(post("/groups/run", json!({"tag": "tv", "products": products})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["stages"].as_array().unwrap().len(), 4);
        assert_eq!(body["upload"]["products"]["tv-1"]["display-resolution"], "4K");
        assert_eq!(body["upload"]["products"]["tv-1"]["screen-size"], "65 in");
    }

    #[tokio::test]
    async fn empty_tag_is_a_bad_request() {
        let products = serde_json::to_value(tv_products(1)).unwrap();
        let response = tv_app()
            .oneshot(post("/groups/run", json!({"tag": " ", "products": products})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unmatched_group_is_unprocessable() {
        let products = serde_json::to_value(tv_products(1)).unwrap();
        let response = app(r#"{"category_id": null, "reasoning": "no fit"}"#, "{}")
            .oneshot(post("/groups/match", json!({"tag": "misc", "products": products})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await["error"], "match_category");
    }

    #[tokio::test]
    async fn reconcile_route_merges_rows() {
        let response = tv_app()
            .oneshot(post(
                "/reconcile",
                json!({
                    "rows": [{"Title": "Widget A", "Color": "Red"}],
                    "canonical": [{"id": "p1", "title": "Widget A", "attributes": {"color": "Blue", "material": "Plastic"}}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["records"][0]["attributes"], json!({"color": "Red"}));
        assert_eq!(body["upload"]["products"]["p1"], json!({"color": "Red"}));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let uri = format!("/jobs/{}", uuid::Uuid::new_v4());
        let response = tv_app().oneshot(get_with_key(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = tv_app().oneshot(get_with_key("/jobs/not-a-uuid")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
