use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;
use tracing::error;

use crate::app::AppState;
use crate::context::{ContextError, WorkflowContext, WorkflowStatus};
use crate::scheduler::{SchedulerError, WorkflowDefinition};

#[derive(Debug, Serialize)]
pub(crate) struct SubmitResponse {
    workflow_id: String,
    status: WorkflowStatus,
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    error: String,
}

impl ApiError {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            error: message.into(),
        })
    }
}

pub(crate) async fn submit(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, Json<ApiError>)> {
    let scheduler = state.scheduler();
    let context = scheduler.submit(&definition).await.map_err(|error| {
        let status = match &error {
            SchedulerError::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
            SchedulerError::Context(ContextError::AlreadyExists(_)) => StatusCode::CONFLICT,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, ApiError::new(error.to_string()))
    })?;

    let _driver = scheduler.spawn_run(context.workflow_id.clone());
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            workflow_id: context.workflow_id,
            status: context.status,
        }),
    ))
}

pub(crate) async fn status(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<WorkflowContext>, (StatusCode, Json<ApiError>)> {
    match state.context_store().load(&workflow_id).await {
        Ok(context) => Ok(Json(context)),
        Err(ContextError::NotFound(_)) => Err((
            StatusCode::NOT_FOUND,
            ApiError::new(format!("workflow {workflow_id} not found")),
        )),
        Err(context_error) => {
            error!(workflow_id, error = %context_error, "failed to load workflow context");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                ApiError::new(context_error.to_string()),
            ))
        }
    }
}

pub(crate) async fn cancel(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    match state.scheduler().cancel(&workflow_id).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(SchedulerError::Context(ContextError::NotFound(_))) => Err((
            StatusCode::NOT_FOUND,
            ApiError::new(format!("workflow {workflow_id} not found")),
        )),
        Err(scheduler_error) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            ApiError::new(scheduler_error.to_string()),
        )),
    }
}
