// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Server-side balance decryption.
//!
//! For wallets that cannot run the decryption locally. The caller proves
//! control of the address with an EIP-191 signature over
//! `"Decrypt confidential balance for <checksummed address> at <unix seconds>"`,
//! valid for five minutes around the server clock.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::users::{parse_address, parse_signature};
use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize, ToSchema)]
pub struct DecryptBalanceRequest {
    pub address: String,
    /// Unix timestamp (seconds) included in the signed message
    pub issued_at: i64,
    /// EIP-191 signature, hex
    pub signature: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DecryptBalanceResponse {
    pub address: String,
    /// Decimal balance in token base units
    pub balance: String,
    /// Whether an encrypted balance exists on-chain
    pub exists: bool,
    /// Version of the key the envelope is encrypted under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<u32>,
}

#[utoipa::path(
    post,
    path = "/v1/balance/decrypt",
    request_body = DecryptBalanceRequest,
    tag = "Balance",
    responses(
        (status = 200, description = "Decrypted balance", body = DecryptBalanceResponse),
        (status = 401, description = "Signature invalid or expired", body = crate::error::ErrorBody),
        (status = 404, description = "Address not registered", body = crate::error::ErrorBody),
        (status = 503, description = "Ledger unavailable", body = crate::error::ErrorBody),
    )
)]
pub async fn decrypt_balance(
    State(state): State<AppState>,
    Json(request): Json<DecryptBalanceRequest>,
) -> Result<Json<DecryptBalanceResponse>, ApiError> {
    let address = parse_address(&request.address)?;
    let signature = parse_signature(&request.signature)?;

    let reading = state
        .orchestrator
        .decrypt_balance_for(address, request.issued_at, &signature)
        .await?;

    Ok(Json(DecryptBalanceResponse {
        address: address.to_checksum(None),
        balance: reading.map(|r| r.balance).unwrap_or_default().to_string(),
        exists: reading.is_some(),
        key_id: reading.map(|r| r.key_id.0),
    }))
}
