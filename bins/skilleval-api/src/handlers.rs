// HTTP route handlers for the SkillEval API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use skilleval_common::submit::{self, CancelOutcome};
use skilleval_common::types::TestCase;
use skilleval_common::SubmitError;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::metrics::{self, CANCELLATIONS, SUBMISSIONS};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub skill_version_id: String,
    pub test_cases: Vec<TestCase>,
    pub skill_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: String,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// POST /evaluations - Queue a test suite for a skill version
pub async fn submit_evaluation(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitRequest>,
) -> Response {
    let result = submit::queue_evaluation(
        state.queue.as_ref(),
        &payload.skill_version_id,
        payload.test_cases,
        &payload.skill_path,
    )
    .await;

    match result {
        Ok(job_id) => {
            SUBMISSIONS.with_label_values(&["queued"]).inc();
            (
                StatusCode::CREATED,
                Json(SubmitResponse {
                    job_id: job_id.to_string(),
                }),
            )
                .into_response()
        }
        Err(SubmitError::Validation(e)) => {
            SUBMISSIONS.with_label_values(&["rejected"]).inc();
            warn!(
                skill_version_id = %payload.skill_version_id,
                error = %e,
                "Rejected evaluation request"
            );
            error_body(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(SubmitError::Store(e)) => {
            SUBMISSIONS.with_label_values(&["error"]).inc();
            error!(error = %e, "Failed to queue evaluation");
            error_body(StatusCode::SERVICE_UNAVAILABLE, "Evaluation queue unavailable")
        }
    }
}

/// GET /evaluations/{job_id} - Current snapshot of a job
pub async fn get_evaluation(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    match submit::get_eval_results(state.queue.as_ref(), &job_id).await {
        Ok(Some(result)) => {
            info!(job_id = %job_id, status = %result.status, "Evaluation retrieved");
            (StatusCode::OK, Json(result)).into_response()
        }
        Ok(None) => error_body(StatusCode::NOT_FOUND, "Evaluation not found"),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to fetch evaluation");
            error_body(StatusCode::SERVICE_UNAVAILABLE, "Evaluation store unavailable")
        }
    }
}

/// POST /evaluations/{job_id}/cancel - Ask the worker to stop a job
pub async fn cancel_evaluation(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let outcome = match submit::cancel_evaluation(state.queue.as_ref(), &job_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to request cancellation");
            return error_body(StatusCode::SERVICE_UNAVAILABLE, "Evaluation store unavailable");
        }
    };

    match outcome {
        CancelOutcome::Requested => {
            CANCELLATIONS.with_label_values(&["requested"]).inc();
            (
                StatusCode::ACCEPTED,
                Json(json!({ "jobId": job_id, "cancelRequested": true })),
            )
                .into_response()
        }
        CancelOutcome::AlreadyTerminal => {
            CANCELLATIONS.with_label_values(&["terminal"]).inc();
            error_body(StatusCode::CONFLICT, "Evaluation already finished")
        }
        CancelOutcome::NotFound => {
            CANCELLATIONS.with_label_values(&["not_found"]).inc();
            error_body(StatusCode::NOT_FOUND, "Evaluation not found")
        }
    }
}

/// GET /health - Liveness
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text format
pub async fn render_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use skilleval_common::fakes::MemoryQueue;
    use skilleval_common::types::{JobId, JobStatus};
    use skilleval_common::JobQueue;
    use std::time::Duration;

    fn state() -> (Arc<MemoryQueue>, State<Arc<AppState>>) {
        let queue = Arc::new(MemoryQueue::new());
        let app = Arc::new(AppState {
            queue: queue.clone(),
        });
        (queue, State(app))
    }

    fn request(cases: Vec<TestCase>) -> Json<SubmitRequest> {
        Json(SubmitRequest {
            skill_version_id: "sv-1".into(),
            test_cases: cases,
            skill_path: "/skills/demo".into(),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn submit_one(state: &State<Arc<AppState>>) -> String {
        let response = submit_evaluation(
            State(state.0.clone()),
            request(vec![TestCase::new("t1", "hi").with_expected_output("hi")]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await["jobId"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_request_uses_camel_case() {
        let payload: SubmitRequest = serde_json::from_str(
            r#"{"skillVersionId": "sv", "skillPath": "/p",
                "testCases": [{"name": "t1", "input": "x", "expectedPatterns": ["a"]}]}"#,
        )
        .unwrap();
        assert_eq!(payload.skill_version_id, "sv");
        assert_eq!(
            payload.test_cases[0].expected_patterns.as_deref(),
            Some(&["a".to_string()][..])
        );
    }

    #[tokio::test]
    async fn test_submit_then_poll() {
        let (queue, state) = state();
        let job_id = submit_one(&state).await;
        assert_eq!(queue.pending_len(), 1);

        let response = get_evaluation(State(state.0.clone()), Path(job_id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "PENDING");
        assert_eq!(body["skillVersionId"], "sv-1");
        assert_eq!(body["results"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_submission_is_400() {
        let (queue, state) = state();
        let response = submit_evaluation(state, request(Vec::new())).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("at least one test case"));
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_503() {
        let (queue, state) = state();
        queue.fail_next_pushes(1);
        let response = submit_evaluation(state, request(vec![TestCase::new("t1", "")])).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids_are_404() {
        let (_queue, state) = state();
        let unknown = get_evaluation(State(state.0.clone()), Path(JobId::new_v4().to_string())).await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let malformed = get_evaluation(state, Path("not-a-job".into())).await;
        assert_eq!(malformed.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_status_codes() {
        let (queue, state) = state();
        let missing = cancel_evaluation(State(state.0.clone()), Path(JobId::new_v4().to_string())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let job_id = submit_one(&state).await;
        let accepted = cancel_evaluation(State(state.0.clone()), Path(job_id.clone())).await;
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);

        let mut claimed = queue.claim("w", Duration::from_secs(5)).await.unwrap().unwrap();
        claimed.job.fail("gone", chrono::Utc::now()).unwrap();
        queue.save(&claimed.job, &claimed.lease).await.unwrap();
        assert!(queue.ack(&claimed.lease).await.unwrap());
        assert_eq!(claimed.job.status(), JobStatus::Failed);

        let conflict = cancel_evaluation(state, Path(job_id)).await;
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        assert_eq!(health_check().await.into_response().status(), StatusCode::OK);

        SUBMISSIONS.with_label_values(&["queued"]).inc();
        let response = render_metrics().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
