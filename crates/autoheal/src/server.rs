//! HTTP surface for the remediation service.
//!
//! Provides REST API endpoints for:
//! - Starting a run
//! - Querying run status and final results
//! - Listing and cancelling runs
//! - Health checks

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::remediation::{GitOperation, Orchestrator, RunId, RunRequest, RunResults, RunState};

/// Server state shared across handlers.
pub struct ServerState {
    pub orchestrator: Orchestrator,
}

impl ServerState {
    #[must_use]
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/run-agent", post(run_agent_handler))
        .route("/status/{run_id}", get(status_handler))
        .route("/results/{run_id}", get(results_handler))
        .route("/runs", get(list_handler))
        .route("/runs/{run_id}/cancel", post(cancel_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to start or bind to the address.
pub async fn run_server(state: Arc<ServerState>, addr: &str) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Autoheal server listening on {addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    run_id: RunId,
    status: &'static str,
}

/// Run state plus the git operations recorded so far.
#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    state: RunState,
    git_operations: Vec<GitOperation>,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    run_id: RunId,
    cancelled: bool,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn parse_run_id(raw: &str) -> Result<RunId, Response> {
    raw.parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid run id: {raw}")))
}

fn registry_error(e: &RegistryError) -> Response {
    match e {
        RegistryError::NotFound(_) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn run_agent_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<RunRequest>,
) -> Response {
    match state.orchestrator.start(request).await {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            Json(StartResponse {
                run_id,
                status: "queued",
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Rejected run request");
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

async fn status_handler(
    State(state): State<Arc<ServerState>>,
    Path(raw_id): Path<String>,
) -> Response {
    let run_id = match parse_run_id(&raw_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let run = match state.orchestrator.status(run_id).await {
        Ok(run) => run,
        Err(e) => return registry_error(&e),
    };
    let git_operations = state
        .orchestrator
        .memory(run_id)
        .await
        .map(|log| log.git_operations)
        .unwrap_or_default();

    Json(StatusResponse {
        state: run,
        git_operations,
    })
    .into_response()
}

async fn results_handler(
    State(state): State<Arc<ServerState>>,
    Path(raw_id): Path<String>,
) -> Response {
    let run_id = match parse_run_id(&raw_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.results(run_id).await {
        Ok(RunResults::Ready(results)) => Json(*results).into_response(),
        Ok(RunResults::Pending) => error_response(StatusCode::CONFLICT, "Run has not finished yet"),
        Err(e) => registry_error(&e),
    }
}

async fn list_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.orchestrator.list().await)
}

async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(raw_id): Path<String>,
) -> Response {
    let run_id = match parse_run_id(&raw_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.cancel(run_id).await {
        Ok(cancelled) => Json(CancelResponse { run_id, cancelled }).into_response(),
        Err(e) => registry_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        CiProvider, CommitRef, Diagnoser, FixContext, FixPlanner, Patch, PipelineRef,
        PipelineStatus, PullRequestDraft, RawFailure, Repository, Sandbox, TestReport,
        WorkingTree,
    };
    use crate::error::{CapabilityError, CiError, RepoError, SandboxError};
    use crate::remediation::{BugType, Capabilities, FailureRecord, OrchestratorSettings};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct StubRepo;

    #[async_trait]
    impl Repository for StubRepo {
        async fn clone_repo(&self, repo_url: &str) -> Result<WorkingTree, RepoError> {
            Ok(WorkingTree {
                path: std::env::temp_dir(),
                repo_url: repo_url.to_string(),
                base_branch: "main".into(),
            })
        }
        async fn create_branch(&self, _: &WorkingTree, _: &str) -> Result<(), RepoError> {
            Ok(())
        }
        async fn commit(&self, _: &WorkingTree, _: &str) -> Result<CommitRef, RepoError> {
            Ok(CommitRef { sha: "0".repeat(40) })
        }
        async fn push(&self, _: &WorkingTree, _: &str) -> Result<(), RepoError> {
            Ok(())
        }
        async fn open_pull_request(
            &self,
            _: &WorkingTree,
            _: &PullRequestDraft,
        ) -> Result<String, RepoError> {
            Ok("https://github.com/acme/widgets/pull/1".into())
        }
    }

    /// Passes immediately, or never returns when `hang` is set.
    struct StubSandbox {
        hang: bool,
    }

    #[async_trait]
    impl Sandbox for StubSandbox {
        async fn run_tests(&self, _: &WorkingTree) -> Result<TestReport, SandboxError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(TestReport {
                passed: true,
                ..TestReport::default()
            })
        }
    }

    struct StubCi;

    #[async_trait]
    impl CiProvider for StubCi {
        async fn query_status(&self, _: &PipelineRef) -> Result<PipelineStatus, CiError> {
            Ok(PipelineStatus::Passed)
        }
        async fn fetch_logs(&self, _: &PipelineRef) -> Result<String, CiError> {
            Ok(String::new())
        }
    }

    struct StubDiagnoser;

    #[async_trait]
    impl Diagnoser for StubDiagnoser {
        async fn classify(&self, _: &RawFailure) -> Result<BugType, CapabilityError> {
            Ok(BugType::Logic)
        }
    }

    struct StubPlanner;

    #[async_trait]
    impl FixPlanner for StubPlanner {
        async fn plan(
            &self,
            _: &FailureRecord,
            _: &FixContext,
        ) -> Result<Option<Patch>, CapabilityError> {
            Ok(None)
        }
    }

    fn app(hang: bool) -> Router {
        let caps = Capabilities {
            repository: Arc::new(StubRepo),
            ci: Arc::new(StubCi),
            sandbox: Arc::new(StubSandbox { hang }),
            diagnoser: Arc::new(StubDiagnoser),
            planner: Arc::new(StubPlanner),
        };
        let orchestrator = Orchestrator::new(caps, OrchestratorSettings::default());
        build_router(Arc::new(ServerState::new(orchestrator)))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn run_request() -> serde_json::Value {
        json!({
            "repo_url": "https://github.com/acme/widgets",
            "team_name": "Rift",
            "leader_name": "Ada"
        })
    }

    async fn start(app: &Router) -> String {
        let (status, body) = call(app, "POST", "/run-agent", Some(run_request())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        body["run_id"].as_str().unwrap().to_string()
    }

    async fn wait_for_results(app: &Router, run_id: &str) -> serde_json::Value {
        for _ in 0..200 {
            let (status, body) = call(app, "GET", &format!("/results/{run_id}"), None).await;
            if status == StatusCode::OK {
                return body;
            }
            assert_eq!(status, StatusCode::CONFLICT);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} did not finish");
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(false), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_rejects_invalid_request() {
        let mut request = run_request();
        request["team_name"] = json!("  ");
        let (status, body) = call(&app(false), "POST", "/run-agent", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("team_name"));
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let app = app(false);
        let run_id = start(&app).await;

        let results = wait_for_results(&app, &run_id).await;
        assert_eq!(results["status"], "completed");
        assert_eq!(results["branch"], "RIFT_ADA_AI_Fix");
        assert_eq!(results["final_ci_status"], "PASSED");

        let (status, body) = call(&app, "GET", &format!("/status/{run_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert!(body["current_step"].is_null());
        assert_eq!(body["git_operations"].as_array().unwrap().len(), 4);

        let (status, body) = call(&app, "GET", "/runs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "POST", &format!("/runs/{run_id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], false);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let app = app(false);
        let unknown = RunId::new();
        let (status, _) = call(&app, "GET", &format!("/results/{unknown}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", &format!("/status/{unknown}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/status/not-a-run", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pending_then_cancelled() {
        let app = app(true);
        let run_id = start(&app).await;

        let (status, _) = call(&app, "GET", &format!("/results/{run_id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&app, "POST", &format!("/runs/{run_id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], true);

        let results = wait_for_results(&app, &run_id).await;
        assert_eq!(results["status"], "failed");
        assert_eq!(results["message"], "cancelled");
    }
}
