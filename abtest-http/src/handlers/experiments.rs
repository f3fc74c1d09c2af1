use abtest::experiments::{
    aggregator::VariantEvent,
    config::{ExperimentPatch, ExperimentStatus, Metric, NewExperiment},
    lifecycle::ListQuery,
    store::ExperimentFilter,
};
use abtest::ExperimentError;
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::AppState;

// ── Envelopes ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct DataEnvelope<T> {
    ok: bool,
    data: T,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    ok: bool,
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

fn respond<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(DataEnvelope { ok: true, data })).into_response()
}

fn experiment_error_to_response(err: ExperimentError) -> Response {
    let status = err.status_code();
    if status.is_server_error() {
        tracing::error!(error = %err, "experiment request failed");
    } else if err.is_validation() {
        tracing::debug!(code = err.code(), error = %err, "rejected invalid experiment request");
    }
    (
        status,
        Json(ErrorEnvelope {
            ok: false,
            error: ErrorBody {
                code: err.code(),
                message: err.to_string(),
            },
        }),
    )
        .into_response()
}

/// Unwraps a JSON body, turning axum's plain-text rejection into a
/// `validation_error` envelope.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    body.map(|Json(value)| value).map_err(|rejection| {
        experiment_error_to_response(ExperimentError::Validation(rejection.body_text()))
    })
}

fn to_response<T: Serialize>(status: StatusCode, result: abtest::Result<T>) -> Response {
    match result {
        Ok(data) => respond(status, data),
        Err(err) => experiment_error_to_response(err),
    }
}

// ── Requests ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExperimentsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExperimentRequest {
    #[serde(default)]
    pub members: Option<Vec<String>>,
}

/// Either one event or a webhook batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RecordEventsRequest {
    Batch { events: Vec<VariantEvent> },
    Single(VariantEvent),
}

impl RecordEventsRequest {
    fn into_events(self) -> Vec<VariantEvent> {
        match self {
            RecordEventsRequest::Batch { events } => events,
            RecordEventsRequest::Single(event) => vec![event],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsQuery {
    #[serde(default)]
    pub metric: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclareWinnerRequest {
    pub variant_index: usize,
    #[serde(default)]
    pub metric: Option<Metric>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteExperimentResponse {
    pub deleted: String,
}

// ── Handlers ────────────────────────────────────────────────────────

pub async fn create_experiment(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewExperiment>, JsonRejection>,
) -> Response {
    let body = match json_body(body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    to_response(StatusCode::CREATED, state.manager.create_experiment(body))
}

pub async fn list_experiments(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListExperimentsQuery>,
) -> Response {
    let status = match params.status.as_deref() {
        Some(status) => match ExperimentStatus::parse(status) {
            Ok(parsed) => Some(parsed),
            Err(err) => return experiment_error_to_response(err),
        },
        None => None,
    };
    let query = ListQuery {
        filter: ExperimentFilter {
            status,
            campaign_id: params.campaign_id,
        },
        limit: params.limit,
        offset: params.offset.unwrap_or(0),
    };
    to_response(StatusCode::OK, state.manager.list_experiments(&query))
}

pub async fn get_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    to_response(StatusCode::OK, state.manager.get_experiment(&id))
}

pub async fn update_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<ExperimentPatch>, JsonRejection>,
) -> Response {
    let body = match json_body(body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    to_response(StatusCode::OK, state.manager.update_experiment(&id, body))
}

pub async fn delete_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let result = state
        .manager
        .delete_experiment(&id)
        .map(|()| DeleteExperimentResponse { deleted: id });
    to_response(StatusCode::OK, result)
}

/// The body is optional; an empty body starts without a member batch.
pub async fn start_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartExperimentRequest::default()
    } else {
        match serde_json::from_slice::<StartExperimentRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                return experiment_error_to_response(ExperimentError::Validation(format!(
                    "invalid start request: {err}"
                )))
            }
        }
    };
    to_response(
        StatusCode::OK,
        state.manager.start_experiment(&id, request.members),
    )
}

pub async fn pause_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    to_response(StatusCode::OK, state.manager.pause_experiment(&id))
}

pub async fn resume_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    to_response(StatusCode::OK, state.manager.resume_experiment(&id))
}

pub async fn record_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<RecordEventsRequest>, JsonRejection>,
) -> Response {
    let events = match json_body(body) {
        Ok(body) => body.into_events(),
        Err(resp) => return resp,
    };
    to_response(StatusCode::ACCEPTED, state.manager.record_events(&id, &events))
}

pub async fn get_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ResultsQuery>,
) -> Response {
    let metric = match params.metric.as_deref().map(Metric::parse).transpose() {
        Ok(metric) => metric,
        Err(err) => return experiment_error_to_response(err),
    };
    to_response(StatusCode::OK, state.manager.get_results(&id, metric))
}

pub async fn declare_winner(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<DeclareWinnerRequest>, JsonRejection>,
) -> Response {
    let body = match json_body(body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    to_response(
        StatusCode::OK,
        state
            .manager
            .declare_winner(&id, body.variant_index, body.metric),
    )
}

pub async fn apply_winner(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    to_response(StatusCode::OK, state.manager.apply_winner(&id))
}

pub async fn get_assignment(
    State(state): State<Arc<AppState>>,
    Path((id, member_id)): Path<(String, String)>,
) -> Response {
    to_response(StatusCode::OK, state.manager.get_assignment(&id, &member_id))
}
