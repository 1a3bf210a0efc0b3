// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-identity work queues.
//!
//! Each requester gets one bounded channel and one worker task. Events of the
//! same requester are handled strictly in the order they were dispatched;
//! different requesters run in parallel. A full queue applies backpressure to
//! the caller (the listener or the retry sweep).
//!
//! A worker whose queue stays empty for `idle_timeout` retires and removes its
//! own entry, so only recently active requesters keep a task alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy::primitives::Address;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blockchain::LedgerEvent;
use crate::orchestrator::Orchestrator;

/// Default per-identity queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default time an empty worker waits before retiring.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is shutting down")]
    Closed,
}

struct Worker {
    generation: u64,
    sender: mpsc::Sender<LedgerEvent>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    next_generation: u64,
    by_lane: HashMap<Address, Worker>,
}

type SharedWorkers = Arc<Mutex<Workers>>;

fn lock(workers: &Mutex<Workers>) -> MutexGuard<'_, Workers> {
    workers.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    queue_capacity: usize,
    idle_timeout: Duration,
    workers: SharedWorkers,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            queue_capacity: queue_capacity.max(1),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            workers: SharedWorkers::default(),
            shutdown,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Queue an event behind earlier events of the same requester.
    pub async fn dispatch(&self, event: LedgerEvent) -> Result<(), DispatchError> {
        let lane = event.requester().unwrap_or(Address::ZERO);
        let mut event = event;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(DispatchError::Closed);
            }
            match self.sender_for(lane).send(event).await {
                Ok(()) => return Ok(()),
                // The worker retired or stopped after we picked it; start another.
                Err(mpsc::error::SendError(returned)) => event = returned,
            }
        }
    }

    /// Number of identities with a live worker.
    pub fn active_workers(&self) -> usize {
        lock(&self.workers).by_lane.len()
    }

    /// Stop accepting work for current workers and wait until their queues are empty.
    ///
    /// Later dispatches start fresh workers.
    pub async fn drain(&self) {
        let workers: Vec<Worker> = lock(&self.workers)
            .by_lane
            .drain()
            .map(|(_, w)| w)
            .collect();
        for worker in workers {
            drop(worker.sender);
            let _ = worker.handle.await;
        }
    }

    fn sender_for(&self, lane: Address) -> mpsc::Sender<LedgerEvent> {
        let mut workers = lock(&self.workers);
        if let Some(worker) = workers.by_lane.get(&lane) {
            if !worker.sender.is_closed() {
                return worker.sender.clone();
            }
        }

        let generation = workers.next_generation;
        workers.next_generation += 1;

        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let handle = tokio::spawn(run_worker(
            WorkerSlot {
                lane,
                generation,
                workers: self.workers.clone(),
            },
            receiver,
            self.orchestrator.clone(),
            self.idle_timeout,
            self.shutdown.clone(),
        ));
        workers.by_lane.insert(
            lane,
            Worker {
                generation,
                sender: sender.clone(),
                handle,
            },
        );
        debug!(identity = %lane, "Started identity worker");
        sender
    }
}

/// A worker's own entry in the dispatcher map.
struct WorkerSlot {
    lane: Address,
    generation: u64,
    workers: SharedWorkers,
}

impl WorkerSlot {
    /// Remove the entry if nothing is queued and no dispatch holds a sender.
    ///
    /// Senders are only cloned under the map lock, so once the map's copy is
    /// the last one no new event can reach this queue.
    fn retire(&self, receiver: &mpsc::Receiver<LedgerEvent>) -> bool {
        let mut workers = lock(&self.workers);
        let idle = workers.by_lane.get(&self.lane).is_some_and(|w| {
            w.generation == self.generation && w.sender.strong_count() == 1 && receiver.is_empty()
        });
        if idle {
            workers.by_lane.remove(&self.lane);
        }
        idle
    }
}

async fn run_worker(
    slot: WorkerSlot,
    mut receiver: mpsc::Receiver<LedgerEvent>,
    orchestrator: Arc<Orchestrator>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    let lane = slot.lane;
    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(idle_timeout, receiver.recv()) => next,
            _ = shutdown.cancelled() => break,
        };
        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) if slot.retire(&receiver) => {
                debug!(identity = %lane, "Identity worker idle, retiring");
                break;
            }
            Err(_) => continue,
        };

        // Outcomes and failures are recorded and logged by the orchestrator.
        if let Err(e) = orchestrator.handle_event(&event).await {
            debug!(
                identity = %lane,
                request_id = %event.request_id(),
                error_code = e.error_code(),
                "Request left pending or rejected"
            );
        }
    }
    debug!(identity = %lane, "Identity worker stopped");
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Bytes, U256};
    use k256::SecretKey;
    use rand::rngs::OsRng;

    use super::*;
    use crate::blockchain::MemoryLedger;
    use crate::client::{self, Holder};
    use crate::crypto::{KeyId, SymmetricKey};
    use crate::identity::{self, ServerIdentity};
    use crate::storage::{KeyStore, MemoryStore, RequestStatus, Resolution};

    fn setup() -> (Arc<Orchestrator>, Arc<MemoryLedger>) {
        let (orchestrator, ledger, _) = setup_with_store();
        (orchestrator, ledger)
    }

    fn setup_with_store() -> (Arc<Orchestrator>, Arc<MemoryLedger>, Arc<MemoryStore>) {
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            ServerIdentity::from_secret(SecretKey::random(&mut OsRng)),
            ledger.clone(),
            store.clone(),
        ));
        (orchestrator, ledger, store)
    }

    async fn balance_of(
        orchestrator: &Orchestrator,
        ledger: &MemoryLedger,
        secret: &SecretKey,
        address: Address,
    ) -> U256 {
        let index = orchestrator.user(address).unwrap().unwrap().user_index;
        client::read_balance(ledger, index, secret)
            .await
            .unwrap()
            .map(|b| b.balance)
            .unwrap_or_default()
    }

    fn status(orchestrator: &Orchestrator, event: &LedgerEvent) -> RequestStatus {
        orchestrator
            .request_status(event.request_id())
            .unwrap()
            .unwrap()
            .status
    }

    fn is_applied(status: &RequestStatus) -> bool {
        matches!(
            status,
            RequestStatus::Processed {
                resolution: Resolution::Applied { .. }
            }
        )
    }

    async fn wait_for_idle(dispatcher: &Dispatcher) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.active_workers() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("workers did not retire");
    }

    async fn registered(
        orchestrator: &Orchestrator,
        ledger: &MemoryLedger,
    ) -> (SecretKey, Address, Bytes) {
        let secret = SecretKey::random(&mut OsRng);
        let address = identity::address_of(&secret.public_key());
        let (signature, _) = client::register(&secret).unwrap();
        let record = orchestrator.register_user(address, &signature).await.unwrap();
        ledger.authenticate_user(address, record.encrypted_index.clone());
        (secret, address, record.encrypted_index)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn identities_get_their_own_ordered_worker() {
        let (orchestrator, ledger) = setup();
        let dispatcher = Dispatcher::new(orchestrator.clone(), 2, CancellationToken::new());

        let (alice, alice_addr, alice_index) = registered(&orchestrator, &ledger).await;
        let (bob, bob_addr, bob_index) = registered(&orchestrator, &ledger).await;

        for amount in [10u64, 20, 30] {
            dispatcher
                .dispatch(ledger.request_deposit(alice_addr, U256::from(amount), alice_index.clone()))
                .await
                .unwrap();
        }
        dispatcher
            .dispatch(ledger.request_deposit(bob_addr, U256::from(5u64), bob_index))
            .await
            .unwrap();
        // Withdrawal queued after the deposits must see all three.
        let signature = client::authorize_withdrawal(&alice, U256::from(60u64)).unwrap();
        dispatcher
            .dispatch(ledger.request_withdrawal(alice_addr, U256::from(60u64), signature.to_vec()))
            .await
            .unwrap();

        assert_eq!(dispatcher.active_workers(), 2);
        dispatcher.drain().await;
        assert_eq!(dispatcher.active_workers(), 0);

        let alice_index = orchestrator.user(alice_addr).unwrap().unwrap().user_index;
        let alice_balance = client::read_balance(ledger.as_ref(), alice_index, &alice)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alice_balance.balance, U256::ZERO);

        let bob_index = orchestrator.user(bob_addr).unwrap().unwrap().user_index;
        let bob_envelope = ledger.envelope(bob_index).unwrap();
        assert_eq!(
            client::decrypt_envelope(&bob_envelope, Holder::User, &bob).unwrap().balance,
            U256::from(5u64)
        );
    }

    #[tokio::test]
    async fn idle_workers_retire_without_drain() {
        let (orchestrator, ledger) = setup();
        let dispatcher = Dispatcher::new(orchestrator.clone(), 4, CancellationToken::new())
            .with_idle_timeout(Duration::from_millis(50));

        let (alice, alice_addr, alice_index) = registered(&orchestrator, &ledger).await;
        let (_, bob_addr, bob_index) = registered(&orchestrator, &ledger).await;
        dispatcher
            .dispatch(ledger.request_deposit(alice_addr, U256::from(7u64), alice_index.clone()))
            .await
            .unwrap();
        dispatcher
            .dispatch(ledger.request_deposit(bob_addr, U256::from(3u64), bob_index))
            .await
            .unwrap();
        assert_eq!(dispatcher.active_workers(), 2);

        wait_for_idle(&dispatcher).await;
        assert_eq!(orchestrator.locks_held(), 0);
        assert_eq!(
            balance_of(&orchestrator, &ledger, &alice, alice_addr).await,
            U256::from(7u64)
        );

        // A retired identity gets a fresh worker on its next request.
        dispatcher
            .dispatch(ledger.request_deposit(alice_addr, U256::from(5u64), alice_index))
            .await
            .unwrap();
        wait_for_idle(&dispatcher).await;
        assert_eq!(
            balance_of(&orchestrator, &ledger, &alice, alice_addr).await,
            U256::from(12u64)
        );
    }

    #[tokio::test]
    async fn withdrawal_waits_for_deposit_that_failed_to_write() {
        let (orchestrator, ledger) = setup();
        let dispatcher = Dispatcher::new(orchestrator.clone(), 4, CancellationToken::new());
        let (alice, alice_addr, alice_index) = registered(&orchestrator, &ledger).await;

        ledger.fail_next_writes(1);
        let deposit = ledger.request_deposit(alice_addr, U256::from(100u64), alice_index);
        let signature = client::authorize_withdrawal(&alice, U256::from(50u64)).unwrap();
        let withdrawal =
            ledger.request_withdrawal(alice_addr, U256::from(50u64), signature.to_vec());
        dispatcher.dispatch(deposit.clone()).await.unwrap();
        dispatcher.dispatch(withdrawal.clone()).await.unwrap();
        dispatcher.drain().await;

        let held = orchestrator.request_status(withdrawal.request_id()).unwrap().unwrap();
        assert!(held.is_waiting());
        assert!(ledger.payouts().is_empty());
        assert_eq!(
            balance_of(&orchestrator, &ledger, &alice, alice_addr).await,
            U256::ZERO
        );

        // Re-dispatched the way the retry sweep does it.
        dispatcher.dispatch(deposit.clone()).await.unwrap();
        dispatcher.drain().await;

        assert!(is_applied(&status(&orchestrator, &deposit)));
        assert!(is_applied(&status(&orchestrator, &withdrawal)));
        assert_eq!(
            balance_of(&orchestrator, &ledger, &alice, alice_addr).await,
            U256::from(50u64)
        );
        assert_eq!(ledger.payouts().len(), 1);
    }

    #[tokio::test]
    async fn requests_behind_one_under_investigation_stay_pending() {
        let (orchestrator, ledger, store) = setup_with_store();
        let dispatcher = Dispatcher::new(orchestrator.clone(), 4, CancellationToken::new());
        let (alice, alice_addr, alice_index) = registered(&orchestrator, &ledger).await;

        dispatcher
            .dispatch(ledger.request_deposit(alice_addr, U256::from(10u64), alice_index.clone()))
            .await
            .unwrap();
        dispatcher.drain().await;

        let good_key = store.get_key(alice_addr).unwrap().unwrap();
        store
            .put_key(alice_addr, &SymmetricKey::generate(KeyId(0)))
            .unwrap();

        let deposit = ledger.request_deposit(alice_addr, U256::from(100u64), alice_index);
        let signature = client::authorize_withdrawal(&alice, U256::from(50u64)).unwrap();
        let withdrawal =
            ledger.request_withdrawal(alice_addr, U256::from(50u64), signature.to_vec());
        dispatcher.dispatch(deposit.clone()).await.unwrap();
        dispatcher.dispatch(withdrawal.clone()).await.unwrap();
        dispatcher.drain().await;

        let stuck = orchestrator.request_status(deposit.request_id()).unwrap().unwrap();
        assert!(stuck.is_pending());
        assert!(!stuck.is_retry_candidate());
        let held = orchestrator.request_status(withdrawal.request_id()).unwrap().unwrap();
        assert!(held.is_waiting());
        assert!(ledger.payouts().is_empty());
        assert_eq!(
            balance_of(&orchestrator, &ledger, &alice, alice_addr).await,
            U256::from(10u64)
        );

        // Once the key is repaired the deposit goes through, then the withdrawal.
        store.put_key(alice_addr, &good_key).unwrap();
        dispatcher.dispatch(deposit.clone()).await.unwrap();
        dispatcher.drain().await;

        assert!(is_applied(&status(&orchestrator, &deposit)));
        assert!(is_applied(&status(&orchestrator, &withdrawal)));
        assert_eq!(
            balance_of(&orchestrator, &ledger, &alice, alice_addr).await,
            U256::from(60u64)
        );
        assert_eq!(ledger.payouts().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_dispatcher_refuses_work() {
        let (orchestrator, ledger) = setup();
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(orchestrator, DEFAULT_QUEUE_CAPACITY, shutdown.clone());
        shutdown.cancel();

        let event = ledger.request_deposit(Address::repeat_byte(1), U256::from(1u64), Bytes::new());
        assert!(matches!(
            dispatcher.dispatch(event).await,
            Err(DispatchError::Closed)
        ));
    }
}
