// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Confidential ERC20 - Balance Encryption Server
//!
//! Custodial service that keeps ERC20-style balances confidential on-chain.
//! Every balance is stored as an envelope: the amount encrypted under a
//! per-user AES-256-GCM key, plus two ECIES-wrapped copies of that key, one
//! for the user and one for this server.
//!
//! ## Modules
//!
//! - `codec` - balance plaintext and packed wire layouts
//! - `crypto` - AES-256-GCM cipher and secp256k1 ECIES key wrapping
//! - `identity` - server key, wallet signature recovery, user indexes
//! - `blockchain` - ledger trait, alloy contract client, in-memory ledger
//! - `storage` - key store, user directory, request tracker (redb)
//! - `orchestrator` - deposit/withdrawal processing
//! - `listener` - contract event listener, per-identity dispatch, retries
//! - `client` - client-side envelope decryption and wallet signatures
//! - `api` - HTTP API handlers (Axum)

pub mod api;
pub mod blockchain;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod listener;
pub mod orchestrator;
pub mod state;
pub mod storage;
