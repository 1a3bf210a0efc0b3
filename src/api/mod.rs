// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{error::ErrorBody, state::AppState};

pub mod balance;
pub mod health;
pub mod requests;
pub mod users;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/users/register", post(users::register_user))
        .route("/users/{address}/index", get(users::get_encrypted_index))
        .route("/balance/decrypt", post(balance::decrypt_balance))
        .route("/requests/{request_id}", get(requests::get_request));

    Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .nest("/v1", v1_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::liveness,
        health::readiness,
        users::register_user,
        users::get_encrypted_index,
        balance::decrypt_balance,
        requests::get_request
    ),
    components(
        schemas(
            ErrorBody,
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse,
            users::RegisterRequest,
            users::RegisterResponse,
            users::EncryptedIndexResponse,
            balance::DecryptBalanceRequest,
            balance::DecryptBalanceResponse,
            requests::RequestStatusResponse
        )
    ),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Users", description = "Encryption key registration"),
        (name = "Balance", description = "Server-side balance decryption"),
        (name = "Requests", description = "Deposit and withdrawal request tracking")
    )
)]
struct ApiDoc;
