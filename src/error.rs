// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::orchestrator::{Disposition, ProcessingError};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

/// Error body returned by every endpoint.
#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable error kind.
    pub error_code: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl From<ProcessingError> for ApiError {
    fn from(err: ProcessingError) -> Self {
        let code = err.error_code();
        let status = match &err {
            ProcessingError::InvalidSignature(_) | ProcessingError::UnauthorizedWithdrawal(_) => {
                StatusCode::UNAUTHORIZED
            }
            ProcessingError::UnregisteredUser(_) => StatusCode::NOT_FOUND,
            ProcessingError::Ledger(e) if e.is_retriable() => StatusCode::SERVICE_UNAVAILABLE,
            ProcessingError::Ledger(_) => StatusCode::BAD_GATEWAY,
            ProcessingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ if err.disposition() == Disposition::Reject => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Server-side faults keep their kind but not their detail.
        if status.is_server_error() {
            tracing::error!(error_code = code, error = %err, "Request failed");
            let message = match status {
                StatusCode::SERVICE_UNAVAILABLE => "ledger unavailable, try again later",
                StatusCode::BAD_GATEWAY => "ledger rejected the call",
                _ => "internal server error",
            };
            return Self::new(status, code, message);
        }
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            error_code: self.code.to_string(),
        });
        (self.status, body).into_response()
    }
}
