// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! User registration endpoints.
//!
//! Registration binds an address to the secp256k1 public key recovered from a
//! wallet signature. The response carries the user index sealed for the
//! server; the user submits it on-chain with `authenticateUser`.

use alloy::primitives::Address;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{error::ApiError, state::AppState, storage::UserRecord};

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    /// Wallet address (0x-prefixed)
    pub address: String,
    /// EIP-191 signature over `"Encryption public key for <checksummed address>"`, hex
    pub signature: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RegisterResponse {
    /// Checksummed wallet address
    pub address: String,
    /// keccak256 of the registration signature, hex
    pub user_index: String,
    /// User index sealed for the server, hex. Submit via `authenticateUser`.
    pub encrypted_index: String,
    pub registered_at: DateTime<Utc>,
}

impl From<UserRecord> for RegisterResponse {
    fn from(record: UserRecord) -> Self {
        Self {
            address: record.address.to_checksum(None),
            user_index: format!("{:#x}", record.user_index),
            encrypted_index: format!("{}", record.encrypted_index),
            registered_at: record.registered_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EncryptedIndexResponse {
    pub address: String,
    /// User index sealed for the server, hex
    pub encrypted_index: String,
}

pub(crate) fn parse_address(raw: &str) -> Result<Address, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid address: {raw}")))
}

pub(crate) fn parse_signature(raw: &str) -> Result<Vec<u8>, ApiError> {
    alloy::hex::decode(raw.trim()).map_err(|_| ApiError::bad_request("signature must be hex"))
}

/// Register the caller's encryption key.
///
/// Idempotent: registering again returns the original record.
#[utoipa::path(
    post,
    path = "/v1/users/register",
    request_body = RegisterRequest,
    tag = "Users",
    responses(
        (status = 201, description = "User registered", body = RegisterResponse),
        (status = 400, description = "Malformed address or signature", body = crate::error::ErrorBody),
        (status = 401, description = "Signature not produced by the address", body = crate::error::ErrorBody),
    )
)]
pub async fn register_user(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let address = parse_address(&request.address)?;
    let signature = parse_signature(&request.signature)?;

    let record = state
        .orchestrator
        .register_user(address, &signature)
        .await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

/// Fetch the sealed user index for a registered address.
#[utoipa::path(
    get,
    path = "/v1/users/{address}/index",
    params(
        ("address" = String, Path, description = "Wallet address")
    ),
    tag = "Users",
    responses(
        (status = 200, description = "Sealed user index", body = EncryptedIndexResponse),
        (status = 404, description = "Address not registered", body = crate::error::ErrorBody),
    )
)]
pub async fn get_encrypted_index(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<EncryptedIndexResponse>, ApiError> {
    let address = parse_address(&address)?;
    let record = state
        .orchestrator
        .user(address)?
        .ok_or_else(|| ApiError::not_found(format!("user {address} is not registered")))?;

    Ok(Json(EncryptedIndexResponse {
        address: record.address.to_checksum(None),
        encrypted_index: format!("{}", record.encrypted_index),
    }))
}
