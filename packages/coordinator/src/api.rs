//! Swap API handlers
//!
//! Every handler returns `Result<_, ApiError>`. [`ApiError`] wraps the
//! engine's [`SwapError`] and renders it as
//!
//! ```json
//! { "kind": "timelock_expired", "message": "...", "retryable": false }
//! ```
//!
//! with the status code from [`status_for`]. Malformed bodies and query
//! strings are reported as `invalid_parameters`.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use htlc_core::{
    Attestation, AttestationAck, BreakerStatus, ChainId, ClaimReceipt, EmergencyAction,
    EmergencyVote, ErrorKind, InitiateReceipt, InitiateRequest, ListQuery, OperationId,
    RefundReceipt, SwapError, SwapId, SwapSummary, SwapView,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::server::AppState;

// ============================================================================
// Errors
// ============================================================================

/// HTTP status for each error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidParameters => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::UnknownSwap | ErrorKind::UnknownOperation => StatusCode::NOT_FOUND,
        ErrorKind::NotReady | ErrorKind::TimelockNotExpired | ErrorKind::StateConflict => {
            StatusCode::CONFLICT
        }
        ErrorKind::TimelockExpired => StatusCode::GONE,
        ErrorKind::InvalidPreimage => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::OperationPaused => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug)]
pub struct ApiError(pub SwapError);

impl From<SwapError> for ApiError {
    fn from(err: SwapError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);

        // Storage failures carry driver detail that stays in the logs
        let message = match &self.0 {
            SwapError::Storage { .. } => {
                error!(error = %self.0, "Storage failure while serving request");
                "internal storage error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            kind: kind.as_str().to_string(),
            message,
            retryable: kind.retryable(),
        };
        let mut response = (status, Json(body)).into_response();

        if let SwapError::RateLimitExceeded {
            retry_after_seconds,
            ..
        } = &self.0
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn json_error(rejection: JsonRejection) -> SwapError {
    SwapError::invalid(format!("malformed request body: {}", rejection.body_text()))
}

fn query_error(rejection: QueryRejection) -> SwapError {
    SwapError::invalid(format!("malformed query string: {}", rejection.body_text()))
}

fn required(field: &str, value: Option<String>) -> Result<String, SwapError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| SwapError::invalid(format!("{} is required", field)))
}

impl AppState {
    /// Count a rejected operation and wrap it for the response
    fn rejected(&self, operation: &'static str, err: SwapError) -> ApiError {
        self.metrics.record_rejection(operation, err.kind());
        ApiError(err)
    }
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    #[serde(alias = "address")]
    pub recipient: Option<String>,
    /// Source or destination chain
    pub chain: Option<String>,
}

impl From<ListParams> for ListQuery {
    fn from(params: ListParams) -> Self {
        ListQuery {
            limit: params.limit,
            recipient: params.recipient,
            chain: params.chain,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub count: usize,
    pub swaps: Vec<SwapSummary>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClaimRequest {
    pub preimage: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationRequest {
    pub operation_id: Option<String>,
    pub chain: Option<String>,
    pub outcome: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EmergencyRequest {
    pub member: Option<String>,
    pub action: Option<String>,
}

impl AttestationRequest {
    fn parse(self) -> Result<(OperationId, ChainId, Attestation), SwapError> {
        let operation_id = OperationId::from_hex(&required("operationId", self.operation_id)?)?;
        let chain = ChainId::new(&required("chain", self.chain)?)?;
        let outcome: Attestation = required("outcome", self.outcome)?.parse()?;
        Ok((operation_id, chain, outcome))
    }
}

impl EmergencyRequest {
    fn parse(self) -> Result<(String, EmergencyAction), SwapError> {
        let member = required("member", self.member)?;
        let action = parse_action(&required("action", self.action)?)?;
        Ok((member, action))
    }
}

fn parse_action(action: &str) -> Result<EmergencyAction, SwapError> {
    match action.trim().to_ascii_lowercase().as_str() {
        "engage" => Ok(EmergencyAction::Engage),
        "lift" => Ok(EmergencyAction::Lift),
        other => Err(SwapError::invalid(format!(
            "unknown emergency action: {} (expected engage or lift)",
            other
        ))),
    }
}

// ============================================================================
// Swaps
// ============================================================================

/// POST /swaps
pub async fn initiate_swap(
    State(state): State<AppState>,
    body: Result<Json<InitiateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InitiateReceipt>), ApiError> {
    let Json(request) = body.map_err(|e| state.rejected("initiate", json_error(e)))?;
    let receipt = state
        .coordinator
        .initiate(request)
        .await
        .map_err(|e| state.rejected("initiate", e))?;
    state.metrics.swaps_initiated_total.inc();

    if let Some(dispatcher) = &state.dispatcher {
        let started = dispatcher.dispatch(
            receipt.operation_id,
            receipt.timelock_deadline,
            state.coordinator.now(),
        );
        info!(swap_id = %receipt.swap_id, polls = started, "Attestation polling started");
    }

    Ok((StatusCode::CREATED, Json(receipt)))
}

/// GET /swaps?limit=N&recipient=ADDR&chain=CHAIN
pub async fn list_swaps(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<ListResponse>, ApiError> {
    let Query(params) = params.map_err(|e| state.rejected("list", query_error(e)))?;
    let swaps = state
        .coordinator
        .list(params.into())
        .await
        .map_err(|e| state.rejected("list", e))?;
    Ok(Json(ListResponse {
        count: swaps.len(),
        swaps,
    }))
}

/// GET /swaps/{swap_id}
pub async fn swap_status(
    State(state): State<AppState>,
    Path(swap_id): Path<String>,
) -> Result<Json<SwapView>, ApiError> {
    let swap_id = SwapId::from_hex(&swap_id).map_err(|e| state.rejected("status", e))?;
    let view = state
        .coordinator
        .status(&swap_id)
        .await
        .map_err(|e| state.rejected("status", e))?;
    Ok(Json(view))
}

/// POST /swaps/{swap_id}/claim
pub async fn claim_swap(
    State(state): State<AppState>,
    Path(swap_id): Path<String>,
    body: Result<Json<ClaimRequest>, JsonRejection>,
) -> Result<Json<ClaimReceipt>, ApiError> {
    let swap_id = SwapId::from_hex(&swap_id).map_err(|e| state.rejected("claim", e))?;
    let Json(request) = body.map_err(|e| state.rejected("claim", json_error(e)))?;
    let preimage =
        required("preimage", request.preimage).map_err(|e| state.rejected("claim", e))?;

    let receipt = state
        .coordinator
        .claim(&swap_id, &preimage)
        .await
        .map_err(|e| state.rejected("claim", e))?;
    state.metrics.swaps_claimed_total.inc();
    Ok(Json(receipt))
}

/// POST /swaps/{swap_id}/refund
pub async fn refund_swap(
    State(state): State<AppState>,
    Path(swap_id): Path<String>,
) -> Result<Json<RefundReceipt>, ApiError> {
    let swap_id = SwapId::from_hex(&swap_id).map_err(|e| state.rejected("refund", e))?;
    let receipt = state
        .coordinator
        .refund(&swap_id)
        .await
        .map_err(|e| state.rejected("refund", e))?;
    state.metrics.swaps_refunded_total.inc();
    Ok(Json(receipt))
}

// ============================================================================
// Adapter callback
// ============================================================================

/// POST /attestations
pub async fn report_attestation(
    State(state): State<AppState>,
    body: Result<Json<AttestationRequest>, JsonRejection>,
) -> Result<Json<AttestationAck>, ApiError> {
    let Json(request) = body.map_err(|e| state.rejected("attestation", json_error(e)))?;
    let (operation_id, chain, outcome) =
        request.parse().map_err(|e| state.rejected("attestation", e))?;

    let ack = state
        .coordinator
        .on_chain_attestation(&operation_id, &chain, outcome)
        .await
        .map_err(|e| state.rejected("attestation", e))?;
    state
        .metrics
        .attestations_total
        .with_label_values(&[chain.as_str(), outcome.as_str()])
        .inc();
    Ok(Json(ack))
}

// ============================================================================
// Breaker
// ============================================================================

/// GET /breaker
pub async fn breaker_status(State(state): State<AppState>) -> Json<BreakerStatus> {
    let status = state.coordinator.breaker_status().await;
    state.metrics.observe_breaker(&status);
    Json(status)
}

/// POST /breaker/emergency
pub async fn emergency_approval(
    State(state): State<AppState>,
    body: Result<Json<EmergencyRequest>, JsonRejection>,
) -> Result<Json<EmergencyVote>, ApiError> {
    let Json(request) = body.map_err(|e| state.rejected("emergency", json_error(e)))?;
    let (member, action) = request.parse().map_err(|e| state.rejected("emergency", e))?;

    let vote = state
        .coordinator
        .approve_emergency(action, &member)
        .await
        .map_err(|e| state.rejected("emergency", e))?;

    let status = state.coordinator.breaker_status().await;
    state.metrics.observe_breaker(&status);
    Ok(Json(vote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use htlc_core::SwapStatus;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::InvalidParameters), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Unauthorized), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::UnknownOperation), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::TimelockNotExpired), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::TimelockExpired), StatusCode::GONE);
        assert_eq!(
            status_for(ErrorKind::InvalidPreimage),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(ErrorKind::OperationPaused),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let response = ApiError(SwapError::RateLimitExceeded {
            limit: 10,
            window_seconds: 60,
            retry_after_seconds: 42,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_conflict_has_no_retry_after() {
        let response = ApiError(SwapError::StateConflict {
            status: SwapStatus::Claimed,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn test_expired_is_gone() {
        let response = ApiError(SwapError::TimelockExpired {
            deadline: Utc::now(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[test]
    fn test_parse_action() {
        assert_eq!(parse_action("Engage").unwrap(), EmergencyAction::Engage);
        assert_eq!(parse_action(" lift ").unwrap(), EmergencyAction::Lift);
        assert_eq!(
            parse_action("pause").unwrap_err().kind(),
            ErrorKind::InvalidParameters
        );
    }

    #[test]
    fn test_required_rejects_blank() {
        assert!(required("preimage", None).is_err());
        assert!(required("preimage", Some("  ".to_string())).is_err());
        assert_eq!(required("preimage", Some("0xab".to_string())).unwrap(), "0xab");
    }
}
