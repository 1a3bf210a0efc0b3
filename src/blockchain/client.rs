// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! JSON-RPC client for the ServerEncryptedERC20 contract.

use std::time::Duration;

use alloy::{
    network::EthereumWallet,
    primitives::{Address, Bytes, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{Filter, Log, TransactionReceipt},
    signers::local::PrivateKeySigner,
    sol_types::SolEvent,
};
use async_trait::async_trait;

use super::contract::IServerEncryptedERC20::{self, IServerEncryptedERC20Instance};
use super::types::*;
use super::Ledger;

/// Default bound on waiting for a transaction receipt.
const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Ledger backed by a deployed contract.
pub struct AlloyLedger {
    network: NetworkConfig,
    contract_address: Address,
    provider: DynProvider,
    contract: IServerEncryptedERC20Instance<DynProvider>,
    confirmation_timeout: Duration,
}

impl AlloyLedger {
    /// Connect to `rpc_url`, signing transactions with `signer`.
    pub fn new(
        rpc_url: &str,
        contract_address: Address,
        signer: PrivateKeySigner,
        network: NetworkConfig,
    ) -> Result<Self, LedgerError> {
        let url: url::Url = rpc_url
            .parse()
            .map_err(|e: url::ParseError| LedgerError::InvalidRpcUrl(e.to_string()))?;

        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(url)
            .erased();
        let contract = IServerEncryptedERC20::new(contract_address, provider.clone());

        Ok(Self {
            network,
            contract_address,
            provider,
            contract,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        })
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    fn decode_log(log: &Log) -> Option<LedgerEvent> {
        let block_number = log.block_number?;
        let log_index = log.log_index?;
        let topic0 = *log.topic0()?;

        let kind = if topic0 == IServerEncryptedERC20::DepositRequested::SIGNATURE_HASH {
            let decoded = log
                .log_decode::<IServerEncryptedERC20::DepositRequested>()
                .ok()?
                .inner
                .data;
            LedgerEventKind::Deposit(DepositRequested {
                request_id: decoded.requestId,
                packed_data: decoded.packedData,
                encrypted_index: decoded.encryptedIndex,
            })
        } else if topic0 == IServerEncryptedERC20::WithdrawalRequested::SIGNATURE_HASH {
            let decoded = log
                .log_decode::<IServerEncryptedERC20::WithdrawalRequested>()
                .ok()?
                .inner
                .data;
            LedgerEventKind::Withdrawal(WithdrawalRequested {
                request_id: decoded.requestId,
                requester: decoded.user,
                amount: decoded.amount,
                signature: decoded.signature,
                timestamp: decoded.timestamp,
            })
        } else {
            return None;
        };

        Some(LedgerEvent {
            block_number,
            log_index,
            kind,
        })
    }

    fn confirmation(&self, receipt: TransactionReceipt) -> Result<TxConfirmation, LedgerError> {
        let tx_hash = receipt.transaction_hash;
        if !receipt.status() {
            return Err(LedgerError::Reverted { tx_hash });
        }

        let block_number = receipt.block_number.ok_or_else(|| LedgerError::Unconfirmed {
            tx_hash,
            reason: "receipt without block number".to_string(),
        })?;

        tracing::info!(
            tx_hash = %tx_hash,
            block = block_number,
            network = %self.network.name,
            explorer = ?self.network.tx_url(&tx_hash),
            "Ledger write confirmed"
        );

        Ok(TxConfirmation {
            tx_hash,
            block_number,
        })
    }
}

#[async_trait]
impl Ledger for AlloyLedger {
    async fn latest_block(&self) -> Result<u64, LedgerError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))
    }

    async fn fetch_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let filter = Filter::new()
            .address(self.contract_address)
            .event_signature(vec![
                IServerEncryptedERC20::DepositRequested::SIGNATURE_HASH,
                IServerEncryptedERC20::WithdrawalRequested::SIGNATURE_HASH,
            ])
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match Self::decode_log(log) {
                Some(event) => events.push(event),
                None => tracing::warn!(
                    tx_hash = ?log.transaction_hash,
                    "Skipping undecodable contract log"
                ),
            }
        }
        events.sort_by_key(LedgerEvent::position);
        Ok(events)
    }

    async fn get_user_index(&self, user: Address) -> Result<Bytes, LedgerError> {
        self.contract
            .getUserIndexByAddress(user)
            .call()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))
    }

    async fn get_encrypted_balance(&self, user_index: B256) -> Result<StoredEnvelope, LedgerError> {
        let result = self
            .contract
            .getEncryptedBalance(user_index)
            .call()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;

        Ok(StoredEnvelope {
            encrypted_amount: result.encryptedAmount,
            wrapped_key_user: result.encryptedSymmetricKeyUser,
            wrapped_key_server: result.encryptedSymmetricKeyServer,
            exists: result.exists,
            last_updated: None,
        })
    }

    async fn request_completed(&self, request_id: B256) -> Result<bool, LedgerError> {
        self.contract
            .requestCompleted(request_id)
            .call()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))
    }

    async fn store_deposit(&self, write: EnvelopeWrite) -> Result<TxConfirmation, LedgerError> {
        let pending = self
            .contract
            .storeDeposit(
                write.request_id,
                write.user_index,
                write.encrypted_amount,
                write.wrapped_key_user,
                write.wrapped_key_server,
            )
            .send()
            .await
            .map_err(|e| LedgerError::Rpc(format!("storeDeposit failed: {}", e)))?;

        let tx_hash = *pending.tx_hash();
        tracing::debug!(tx_hash = %tx_hash, request_id = %write.request_id, "storeDeposit sent");

        let receipt = pending
            .with_timeout(Some(self.confirmation_timeout))
            .get_receipt()
            .await
            .map_err(|e| LedgerError::Unconfirmed {
                tx_hash,
                reason: e.to_string(),
            })?;

        self.confirmation(receipt)
    }

    async fn process_withdrawal(
        &self,
        write: EnvelopeWrite,
        user: Address,
        amount: U256,
    ) -> Result<TxConfirmation, LedgerError> {
        let pending = self
            .contract
            .processWithdrawal(
                write.request_id,
                write.user_index,
                user,
                amount,
                write.encrypted_amount,
                write.wrapped_key_user,
                write.wrapped_key_server,
            )
            .send()
            .await
            .map_err(|e| LedgerError::Rpc(format!("processWithdrawal failed: {}", e)))?;

        let tx_hash = *pending.tx_hash();
        tracing::debug!(tx_hash = %tx_hash, request_id = %write.request_id, "processWithdrawal sent");

        let receipt = pending
            .with_timeout(Some(self.confirmation_timeout))
            .get_receipt()
            .await
            .map_err(|e| LedgerError::Unconfirmed {
                tx_hash,
                reason: e.to_string(),
            })?;

        self.confirmation(receipt)
    }
}
