use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde::Deserialize;
use tokio_stream::StreamExt;

use forgeline_common::HumanDecision;

use super::JobManager;
use crate::errors::JobError;
use crate::orchestrator::RunOptions;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub jobs: Arc<JobManager>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    pub project: PathBuf,
    #[serde(default)]
    pub resume: bool,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub after: Option<u64>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let message = err.to_string();
        match err {
            JobError::NotFound { .. } => ApiError::NotFound(message),
            JobError::InvalidProject { .. } => ApiError::BadRequest(message),
            JobError::AlreadyTerminal { .. }
            | JobError::NotAwaitingDecision { .. }
            | JobError::ProjectBusy { .. } => ApiError::Conflict(message),
            JobError::Other(e) => ApiError::Internal(format!("{:#}", e)),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", get(list_jobs).post(submit_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/events", get(stream_events))
        .route("/api/jobs/{id}/events/log", get(event_log))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/phases/{phase}/decision", post(submit_decision))
        .route("/health", get(health_check))
}

/// Resume point for an event stream. `Last-Event-ID` wins over `?after=`.
fn resume_after(headers: &HeaderMap, query: &EventsQuery) -> u64 {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or(query.after)
        .unwrap_or(0)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_jobs(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.jobs.list())
}

async fn submit_job(
    State(state): State<SharedState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .jobs
        .submit(&req.project, RunOptions { resume: req.resume })?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.jobs.status(&id)?))
}

async fn event_log(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let after = resume_after(&headers, &query);
    Ok(Json(state.jobs.events_since(&id, after)?))
}

async fn stream_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let after = resume_after(&headers, &query);
    let events = state.jobs.subscribe(&id, after)?.map(|event| {
        Event::default()
            .id(event.seq.to_string())
            .event(event.event.name())
            .json_data(&event)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.jobs.cancel(&id)?))
}

async fn submit_decision(
    State(state): State<SharedState>,
    Path((id, phase)): Path<(String, String)>,
    Json(decision): Json<HumanDecision>,
) -> Result<impl IntoResponse, ApiError> {
    if phase.contains('/') || phase.contains("..") {
        return Err(ApiError::BadRequest(format!("Invalid phase id: {}", phase)));
    }
    let path = state.jobs.decide(&id, &phase, &decision)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "decision": path })),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{ScriptedLauncher, phase_script, wait_terminal};
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use forgeline_common::{JobEvent, JobRecord, JobStatus};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        jobs: Arc<JobManager>,
        _jobs_dir: TempDir,
        project: TempDir,
    }

    impl TestApp {
        fn new(pause: Duration) -> Self {
            let jobs_dir = tempfile::tempdir().unwrap();
            let jobs = Arc::new(JobManager::new(
                jobs_dir.path(),
                Arc::new(ScriptedLauncher {
                    events: phase_script("design"),
                    pause,
                }),
                Duration::from_secs(3600),
            ));
            Self {
                jobs,
                _jobs_dir: jobs_dir,
                project: tempfile::tempdir().unwrap(),
            }
        }

        fn router(&self) -> Router {
            api_router().with_state(Arc::new(AppState {
                jobs: self.jobs.clone(),
            }))
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, json: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = TestApp::new(Duration::ZERO);
        let response = app.router().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_submit_then_status_and_log() {
        let app = TestApp::new(Duration::ZERO);
        let response = app
            .router()
            .oneshot(post_json(
                "/api/jobs",
                serde_json::json!({ "project": app.project.path() }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let record: JobRecord = body_json(response.into_body()).await;
        wait_terminal(&app.jobs, &record.id).await;

        let response = app
            .router()
            .oneshot(get(&format!("/api/jobs/{}", record.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status: JobRecord = body_json(response.into_body()).await;
        assert_eq!(status.status, JobStatus::Completed);

        let response = app
            .router()
            .oneshot(get(&format!("/api/jobs/{}/events/log?after=2", record.id)))
            .await
            .unwrap();
        let events: Vec<JobEvent> = body_json(response.into_body()).await;
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4]);

        let response = app.router().oneshot(get("/api/jobs")).await.unwrap();
        let all: Vec<JobRecord> = body_json(response.into_body()).await;
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_sse_stream_honours_last_event_id() {
        let app = TestApp::new(Duration::ZERO);
        let record = app
            .jobs
            .submit(app.project.path(), RunOptions::default())
            .unwrap();
        wait_terminal(&app.jobs, &record.id).await;

        let request = Request::builder()
            .uri(format!("/api/jobs/{}/events", record.id))
            .header("last-event-id", "2")
            .body(Body::empty())
            .unwrap();
        let response = app.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("event: phase_complete"));
        assert!(text.contains("event: project_complete"));
        assert!(text.contains("id: 4"));
        assert!(!text.contains("event: phase_start"));
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let app = TestApp::new(Duration::ZERO);
        let response = app.router().oneshot(get("/api/jobs/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = app
            .router()
            .oneshot(get("/api/jobs/missing/events"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_missing_project_is_400() {
        let app = TestApp::new(Duration::ZERO);
        let response = app
            .router()
            .oneshot(post_json(
                "/api/jobs",
                serde_json::json!({ "project": "/definitely/not/here" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_second_submit_on_busy_project_is_409() {
        let app = TestApp::new(Duration::from_millis(200));
        let submit = || {
            post_json(
                "/api/jobs",
                serde_json::json!({ "project": app.project.path() }),
            )
        };
        let response = app.router().oneshot(submit()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let first: JobRecord = body_json(response.into_body()).await;

        let response = app.router().oneshot(submit()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains(&first.id));
        assert_eq!(app.jobs.list().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_then_finished_job() {
        let app = TestApp::new(Duration::from_millis(500));
        let record = app
            .jobs
            .submit(app.project.path(), RunOptions::default())
            .unwrap();

        let uri = format!("/api/jobs/{}/cancel", record.id);
        let response = app
            .router()
            .oneshot(post_json(&uri, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cancelled: JobRecord = body_json(response.into_body()).await;
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let response = app
            .router()
            .oneshot(post_json(&uri, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_decision_requires_pending_request() {
        let app = TestApp::new(Duration::ZERO);
        let record = app
            .jobs
            .submit(app.project.path(), RunOptions::default())
            .unwrap();
        let uri = format!("/api/jobs/{}/phases/design/decision", record.id);
        let decision = serde_json::json!({ "decision": "resume-with-option", "option": 1 });

        let response = app
            .router()
            .oneshot(post_json(&uri, decision.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let escalation = app
            .project
            .path()
            .canonicalize()
            .unwrap()
            .join(".forgeline/phases/design/escalation");
        std::fs::create_dir_all(&escalation).unwrap();
        std::fs::write(escalation.join("human-request.yaml"), "phase_id: design\n").unwrap();

        let response = app.router().oneshot(post_json(&uri, decision)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let written = std::fs::read_to_string(escalation.join("human-decision.yaml")).unwrap();
        let parsed: HumanDecision = serde_yaml::from_str(&written).unwrap();
        assert_eq!(parsed, HumanDecision::ResumeWithOption { option: 1 });
    }
}
