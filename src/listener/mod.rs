// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Event Listener
//!
//! Background task that follows `DepositRequested` / `WithdrawalRequested`
//! events on the confidential token contract and feeds them to the
//! orchestrator through the per-identity [`Dispatcher`].
//!
//! ## Strategy
//!
//! 1. Read the checkpoint (last scanned block) and the chain head.
//! 2. Fetch events in block chunks, ordered by (block, log index).
//! 3. Record every request as Pending in the tracker.
//! 4. Advance the checkpoint past the chunk.
//! 5. Dispatch the requests that are still Pending.
//!
//! ## Checkpointing
//!
//! The checkpoint only moves after the chunk's requests are durably Pending, so
//! a crash can lose dispatches but never requests. The [`RetryWorker`]'s
//! startup sweep re-dispatches whatever was left Pending.

pub mod dispatcher;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blockchain::{Ledger, LedgerError};
use crate::storage::{RequestTracker, StorageError, Store};

pub use dispatcher::{DispatchError, Dispatcher, DEFAULT_IDLE_TIMEOUT, DEFAULT_QUEUE_CAPACITY};
pub use retry::RetryWorker;

/// Default block chunk size per `eth_getLogs` query.
const DEFAULT_CHUNK_SIZE: u64 = 2000;

/// Default poll interval when caught up to chain head.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How far back to look when starting fresh (no checkpoint, no start block).
const INITIAL_LOOKBACK_BLOCKS: u64 = 10_000;

/// Contract event listener that runs as a background tokio task.
pub struct EventListener {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn Store>,
    tracker: RequestTracker,
    dispatcher: Arc<Dispatcher>,
    poll_interval: Duration,
    chunk_size: u64,
    start_block: Option<u64>,
}

impl EventListener {
    pub fn new(ledger: Arc<dyn Ledger>, store: Arc<dyn Store>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            tracker: RequestTracker::new(store.clone()),
            ledger,
            store,
            dispatcher,
            poll_interval: DEFAULT_POLL_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            start_block: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// First block to scan when no checkpoint exists yet.
    pub fn with_start_block(mut self, start_block: Option<u64>) -> Self {
        self.start_block = start_block;
        self
    }

    /// Run the listener loop until the cancellation token is triggered.
    ///
    /// This should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(listener.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            chunk_size = self.chunk_size,
            "Event listener starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Event listener shutting down");
                return;
            }

            if let Err(e) = self.poll_step().await {
                warn!(error = %e, "Listener step failed, will retry");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Event listener shutting down");
                    return;
                }
            }
        }
    }

    /// Scan from the checkpoint to the chain head. Returns the number of
    /// requests dispatched.
    pub async fn poll_step(&self) -> Result<usize, ListenerError> {
        let head = self.ledger.latest_block().await?;

        let start = match self.store.last_scanned_block()? {
            Some(checkpoint) => checkpoint + 1,
            None => self
                .start_block
                .unwrap_or_else(|| head.saturating_sub(INITIAL_LOOKBACK_BLOCKS)),
        };

        if start > head {
            // Already caught up
            return Ok(0);
        }

        let mut dispatched = 0;
        let mut from = start;
        while from <= head {
            let to = from.saturating_add(self.chunk_size - 1).min(head);
            dispatched += self.scan_chunk(from, to).await?;
            from = to + 1;
        }
        Ok(dispatched)
    }

    async fn scan_chunk(&self, from_block: u64, to_block: u64) -> Result<usize, ListenerError> {
        let events = self.ledger.fetch_events(from_block, to_block).await?;

        let mut pending = Vec::with_capacity(events.len());
        for event in events {
            let record = self.tracker.record_pending(&event)?;
            if record.is_pending() {
                pending.push(event);
            } else {
                debug!(request_id = %event.request_id(), "Skipping processed request");
            }
        }

        self.store.set_last_scanned_block(to_block)?;

        if !pending.is_empty() {
            debug!(
                from_block,
                to_block,
                requests = pending.len(),
                "Dispatching contract requests"
            );
        }

        let count = pending.len();
        for event in pending {
            self.dispatcher.dispatch(event).await?;
        }
        Ok(count)
    }
}

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, Bytes, U256};
    use k256::SecretKey;
    use rand::rngs::OsRng;

    use super::*;
    use crate::blockchain::MemoryLedger;
    use crate::client;
    use crate::identity::{self, ServerIdentity};
    use crate::orchestrator::Orchestrator;
    use crate::storage::{CheckpointStore, MemoryStore};

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        store: Arc<MemoryStore>,
        orchestrator: Arc<Orchestrator>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            ServerIdentity::from_secret(SecretKey::random(&mut OsRng)),
            ledger.clone(),
            store.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            orchestrator.clone(),
            DEFAULT_QUEUE_CAPACITY,
            CancellationToken::new(),
        ));
        Fixture {
            ledger,
            store,
            orchestrator,
            dispatcher,
        }
    }

    impl Fixture {
        fn listener(&self) -> EventListener {
            EventListener::new(self.ledger.clone(), self.store.clone(), self.dispatcher.clone())
        }

        async fn user(&self) -> (SecretKey, Address, Bytes) {
            let secret = SecretKey::random(&mut OsRng);
            let address = identity::address_of(&secret.public_key());
            let (signature, _) = client::register(&secret).unwrap();
            let record = self
                .orchestrator
                .register_user(address, &signature)
                .await
                .unwrap();
            self.ledger
                .authenticate_user(address, record.encrypted_index.clone());
            (secret, address, record.encrypted_index)
        }

        async fn balance(&self, secret: &SecretKey, address: Address) -> U256 {
            let index = self.orchestrator.user(address).unwrap().unwrap().user_index;
            client::read_balance(self.ledger.as_ref(), index, secret)
                .await
                .unwrap()
                .map(|b| b.balance)
                .unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn scans_dispatches_and_checkpoints() {
        let f = fixture();
        let (secret, address, index) = f.user().await;
        f.ledger.request_deposit(address, U256::from(100u64), index.clone());
        f.ledger.request_deposit(address, U256::from(50u64), index);

        let head = f.ledger.latest_block().await.unwrap();
        let listener = f.listener().with_start_block(Some(0));
        assert_eq!(listener.poll_step().await.unwrap(), 2);
        f.dispatcher.drain().await;

        assert_eq!(f.balance(&secret, address).await, U256::from(150u64));
        assert_eq!(f.store.last_scanned_block().unwrap(), Some(head));

        // Caught up: nothing new to dispatch.
        assert_eq!(listener.poll_step().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rescan_does_not_reapply_processed_requests() {
        let f = fixture();
        let (secret, address, index) = f.user().await;
        f.ledger.request_deposit(address, U256::from(70u64), index);

        let listener = f.listener().with_start_block(Some(0)).with_chunk_size(1);
        listener.poll_step().await.unwrap();
        f.dispatcher.drain().await;

        // A reorg-style rewind replays the same logs.
        f.store.set_last_scanned_block(0).unwrap();
        assert_eq!(listener.poll_step().await.unwrap(), 0);
        f.dispatcher.drain().await;

        assert_eq!(f.balance(&secret, address).await, U256::from(70u64));
        assert_eq!(f.ledger.write_count(), 1);
    }

    #[tokio::test]
    async fn ledger_outage_keeps_checkpoint() {
        let f = fixture();
        let (_, address, index) = f.user().await;
        f.ledger.request_deposit(address, U256::from(1u64), index);
        f.ledger.set_unavailable(true);

        let listener = f.listener().with_start_block(Some(0));
        assert!(matches!(
            listener.poll_step().await,
            Err(ListenerError::Ledger(_))
        ));
        assert_eq!(f.store.last_scanned_block().unwrap(), None);
    }

    #[tokio::test]
    async fn stops_on_cancellation() {
        let f = fixture();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            f.listener()
                .with_poll_interval(Duration::from_secs(3600))
                .run(shutdown.clone()),
        );
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
