// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Request status lookup.

use alloy::primitives::B256;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    blockchain::RequestKind,
    error::ApiError,
    state::AppState,
    storage::{RequestRecord, RequestStatus, Resolution},
};

#[derive(Debug, Serialize, ToSchema)]
pub struct RequestStatusResponse {
    pub request_id: String,
    /// `deposit` or `withdrawal`
    pub kind: String,
    /// `pending` or `processed`
    pub state: String,
    /// `applied`, `reconciled` or `rejected` once processed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Transaction that wrote the envelope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Rejection reason, or last failure while still pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl From<RequestRecord> for RequestStatusResponse {
    fn from(record: RequestRecord) -> Self {
        let kind = match record.kind {
            RequestKind::Deposit => "deposit",
            RequestKind::Withdrawal => "withdrawal",
        };
        let last_error = record.last_error.map(|e| e.error_code);

        let (state, outcome, tx_hash, error_code) = match record.status {
            RequestStatus::Pending => ("pending", None, None, last_error),
            RequestStatus::Processed { resolution } => match resolution {
                Resolution::Applied { tx_hash, .. } => {
                    ("processed", Some("applied"), Some(format!("{tx_hash:#x}")), None)
                }
                Resolution::Reconciled => ("processed", Some("reconciled"), None, None),
                Resolution::Rejected { error_code } => {
                    ("processed", Some("rejected"), None, Some(error_code))
                }
            },
        };

        Self {
            request_id: format!("{:#x}", record.request_id),
            kind: kind.to_string(),
            state: state.to_string(),
            outcome: outcome.map(str::to_string),
            tx_hash,
            error_code,
            attempts: record.attempts,
            updated_at: record.updated_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/requests/{request_id}",
    params(
        ("request_id" = String, Path, description = "Deposit or withdrawal request id (0x-prefixed bytes32)")
    ),
    tag = "Requests",
    responses(
        (status = 200, description = "Request status", body = RequestStatusResponse),
        (status = 404, description = "Unknown request", body = crate::error::ErrorBody),
    )
)]
pub async fn get_request(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<RequestStatusResponse>, ApiError> {
    let id: B256 = request_id
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid request id: {request_id}")))?;

    let record = state
        .orchestrator
        .request_status(id)?
        .ok_or_else(|| ApiError::not_found(format!("request {id:#x} not found")))?;
    Ok(Json(record.into()))
}
