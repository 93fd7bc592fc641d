//! Axum JSON surface over a running pipeline: health and dead-letter triage.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use grantflow_sync::{HealthStatus, Pipeline};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "grantflow-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/dead-letters", get(dead_letters_handler))
        .route("/dead-letters/{id}/replay", post(replay_handler))
        .with_state(Arc::new(state))
}

/// Serves until the pipeline is told to shut down.
pub async fn serve(pipeline: Arc<Pipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health surface listening");
    let stopped = Arc::clone(&pipeline);
    axum::serve(listener, app(AppState::new(pipeline)))
        .with_graceful_shutdown(async move { stopped.stopped().await })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.pipeline.health().await;
    let status = match snapshot.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(snapshot)).into_response()
}

async fn dead_letters_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.dead_letters().await {
        Ok(letters) => Json(letters).into_response(),
        Err(err) => server_error(err),
    }
}

async fn replay_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.pipeline.replay_dead_letter(&id).await {
        Ok(outcome) if !outcome.found() => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no dead letter for {id}")})),
        )
            .into_response(),
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("{err:#}")})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use grantflow_adapters::{NormalizeError, OpportunitySource, SearchPage, SearchQuery, SourceError};
    use grantflow_core::{DeadLetter, DeadLetterKind};
    use grantflow_storage::{
        DeadLetterStore, FetchError, FetchOutcome, FsBlobArchive, MemoryQueue, MemoryStore,
    };
    use grantflow_sync::{IngestConfig, PipelineDeps};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tokio::sync::watch;
    use tower::ServiceExt;

    /// Upstream that is down for search and knows no details.
    struct UnreachableSource;

    #[async_trait]
    impl OpportunitySource for UnreachableSource {
        fn source_id(&self) -> &'static str {
            "unreachable"
        }

        async fn search_page(
            &self,
            _query: &SearchQuery,
            _page: u32,
            _rows: u32,
        ) -> Result<SearchPage, SourceError> {
            Err(SourceError::Malformed(NormalizeError::MissingData))
        }

        async fn fetch_detail(&self, id: &str) -> Result<FetchOutcome, FetchError> {
            Err(FetchError::Permanent {
                target: format!("detail:{id}"),
                status: Some(404),
                reason: "not found".into(),
                attempts: Vec::new(),
            })
        }
    }

    fn pipeline(memory: Arc<MemoryStore>, queue: Arc<MemoryQueue>) -> Arc<Pipeline> {
        let config = IngestConfig::from_lookup(|var| match var {
            "GRANTS_API_BASE_URL" => Some("http://127.0.0.1:9".to_string()),
            "DATABASE_URL" => Some("postgres://unused".to_string()),
            _ => None,
        })
        .unwrap();
        let deps = PipelineDeps {
            source: Arc::new(UnreachableSource),
            store: memory.clone(),
            watermarks: memory.clone(),
            dead_letters: memory,
            queue,
            archive: Arc::new(FsBlobArchive::new(std::env::temp_dir().join("grantflow-web-tests"))),
        };
        let (shutdown, _) = watch::channel(false);
        Arc::new(Pipeline::new(&config, vec![SearchQuery::named("all")], deps, shutdown).unwrap())
    }

    fn letter(id: &str) -> DeadLetter {
        DeadLetter {
            id: id.into(),
            kind: DeadLetterKind::Fetch,
            reason: "permanent:404".into(),
            attempts: 1,
            last_error: "detail:1 failed permanently".into(),
            recorded_at: Utc::now(),
            detail: None,
        }
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_snapshot_as_json() {
        let memory = Arc::new(MemoryStore::new());
        memory.record(&letter("1")).await.unwrap();
        let app = app(AppState::new(pipeline(memory, Arc::new(MemoryQueue::new()))));

        let resp = app.oneshot(get("/health")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = json_body(resp).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["dead_letter_count"], 1);
        assert_eq!(body["counters"]["succeeded"], 0);
    }

    #[tokio::test]
    async fn failed_discovery_turns_health_unavailable() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()), Arc::new(MemoryQueue::new()));
        let report = pipeline.run_discovery_tick().await.unwrap().unwrap();
        assert!(!report.complete);

        let resp = app(AppState::new(pipeline)).oneshot(get("/health")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "degraded");
        assert!(body["last_discovery_error"].is_string());
    }

    #[tokio::test]
    async fn dead_letters_are_listed() {
        let memory = Arc::new(MemoryStore::new());
        memory.record(&letter("77")).await.unwrap();
        let app = app(AppState::new(pipeline(memory, Arc::new(MemoryQueue::new()))));

        let resp = app.oneshot(get("/dead-letters")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body[0]["id"], "77");
        assert_eq!(body[0]["kind"], "fetch");
        assert_eq!(body[0]["reason"], "permanent:404");
    }

    #[tokio::test]
    async fn replay_requeues_known_letters_and_404s_unknown_ones() {
        let memory = Arc::new(MemoryStore::new());
        memory.record(&letter("12")).await.unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let app = app(AppState::new(pipeline(memory.clone(), queue.clone())));
        let post = |uri: &str| {
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap()
        };

        let resp = app
            .clone()
            .oneshot(post("/dead-letters/12/replay"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["requeued"], 1);
        assert_eq!(queue.pending_bodies().await, vec!["12"]);
        assert_eq!(memory.count().await.unwrap(), 0);

        let resp = app.oneshot(post("/dead-letters/12/replay")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
