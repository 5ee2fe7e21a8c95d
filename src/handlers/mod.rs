use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{AdmissionRequest, AdmissionResponse, NewPurchase};
use crate::routes::AppState;
use crate::utils::error::{AppError, ErrorCode};
use crate::utils::response::{created, success};

#[derive(Serialize)]
struct HealthPayload {
    status: &'static str,
    service: &'static str,
}

pub async fn health_check() -> Response {
    let payload = HealthPayload {
        status: "ok",
        service: "admission-server",
    };

    success(payload, "Health check successful")
}

/// Admission bodies stay flat so scanners never unwrap an envelope, and the
/// status mirrors the outcome code.
fn admission_reply(response: AdmissionResponse) -> Response {
    let status = response
        .error_code
        .map_or(StatusCode::OK, |code| code.status_code());
    (status, Json(response)).into_response()
}

pub async fn admit(
    State(state): State<AppState>,
    payload: Result<Json<AdmissionRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected admission body");
            return admission_reply(AdmissionResponse::failed(
                ErrorCode::InvalidInput,
                rejection.body_text(),
            ));
        }
    };

    admission_reply(state.orchestrator.handle(&request).await)
}

pub async fn lookup_ticket(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Response {
    let request = AdmissionRequest::lookup(identifier, "");
    admission_reply(state.orchestrator.handle(&request).await)
}

pub async fn register_purchase(
    State(state): State<AppState>,
    Json(new): Json<NewPurchase>,
) -> Result<Response, AppError> {
    let purchase = state.registry.register(new).await?;
    Ok(created(purchase, "Purchase registered"))
}

pub async fn generate_individual_tickets(
    State(state): State<AppState>,
    Path(purchase_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let tickets = state
        .orchestrator
        .generator()
        .generate(purchase_id)
        .await?;
    Ok(success(tickets, "Individual tickets ready"))
}
