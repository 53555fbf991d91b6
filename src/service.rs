//! Async front door to the consensus loop
//!
//! Peers submit through cloned [`ConsensusHandle`]s into one bounded queue.
//! A single worker drains it, running each command on the blocking pool and
//! finishing it before taking the next, so submissions reach the loop in
//! queue order. Shutdown cancels the node-wide token, stops the worker and
//! flushes the coin cache.

use crate::consensus_loop::ConsensusLoop;
use crate::error::{Error, Result};
use crate::hashing::hash_to_hex;
use crate::network::{BroadcastState, PeerId, SubmitOutcome};
use crate::types::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Work item for the consensus worker.
#[derive(Debug)]
pub enum Command {
    SubmitHeader { header: BlockHeader, peer: Option<PeerId> },
    SubmitBlock { block: Block, peer: Option<PeerId> },
    DeliverBlock { hash: Hash, block: Block, peer: Option<PeerId> },
    SubmitTransaction { tx: Transaction, peer: Option<PeerId> },
}

impl Command {
    fn execute(self, consensus: &ConsensusLoop) -> Result<SubmitOutcome> {
        match self {
            Command::SubmitHeader { header, peer } => consensus.submit_header(header, peer),
            Command::SubmitBlock { block, peer } => consensus.submit_block(block, peer),
            Command::DeliverBlock { hash, block, peer } => consensus.deliver_block(hash, block, peer),
            Command::SubmitTransaction { tx, peer } => consensus.submit_transaction(tx, peer),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Command::SubmitHeader { .. } => "submit_header",
            Command::SubmitBlock { .. } => "submit_block",
            Command::DeliverBlock { .. } => "deliver_block",
            Command::SubmitTransaction { .. } => "submit_transaction",
        }
    }
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<SubmitOutcome>>,
}

/// Result of waiting for a broadcast transaction to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationOutcome {
    Propagated,
    /// The deadline passed first; not a failure.
    NotConfirmedYet,
    Cancelled,
}

/// Cloneable submission endpoint.
#[derive(Clone)]
pub struct ConsensusHandle {
    consensus: Arc<ConsensusLoop>,
    sender: mpsc::Sender<Request>,
}

impl ConsensusHandle {
    pub async fn submit_header(&self, header: BlockHeader, peer: Option<PeerId>) -> Result<SubmitOutcome> {
        self.request(Command::SubmitHeader { header, peer }).await
    }

    pub async fn submit_block(&self, block: Block, peer: Option<PeerId>) -> Result<SubmitOutcome> {
        self.request(Command::SubmitBlock { block, peer }).await
    }

    pub async fn deliver_block(&self, hash: Hash, block: Block, peer: Option<PeerId>) -> Result<SubmitOutcome> {
        self.request(Command::DeliverBlock { hash, block, peer }).await
    }

    pub async fn submit_transaction(&self, tx: Transaction, peer: Option<PeerId>) -> Result<SubmitOutcome> {
        self.request(Command::SubmitTransaction { tx, peer }).await
    }

    /// Queue `command` and wait for its outcome. A closed queue or a dropped
    /// reply means the service is shutting down.
    async fn request(&self, command: Command) -> Result<SubmitOutcome> {
        let (reply, response) = oneshot::channel();
        self.sender.send(Request { command, reply }).await.map_err(|_| Error::Cancelled)?;
        response.await.map_err(|_| Error::Cancelled)?
    }

    /// WaitForPropagation: poll the relay until peers stop asking for `txid`
    ///
    /// 1. Every `poll_interval_ms`, read the broadcast state
    /// 2. `Propagated` ends the wait
    /// 3. After `deadline_ms` the answer is `NotConfirmedYet`
    /// 4. Shutdown ends the wait with `Cancelled`
    pub async fn wait_for_propagation(&self, txid: Hash) -> PropagationOutcome {
        let config = &self.consensus.context().config.propagation;
        let deadline = Instant::now() + Duration::from_millis(config.deadline_ms);
        let mut ticker = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
        let cancel = self.consensus.cancellation_token().clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PropagationOutcome::Cancelled,
                _ = ticker.tick() => {
                    if self.consensus.relay().broadcast_state(&txid) == BroadcastState::Propagated {
                        debug!(txid = %hash_to_hex(&txid), "transaction propagated");
                        return PropagationOutcome::Propagated;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(txid = %hash_to_hex(&txid), "propagation not confirmed before deadline");
                    return PropagationOutcome::NotConfirmedYet;
                }
            }
        }
    }

    pub fn consensus(&self) -> &Arc<ConsensusLoop> {
        &self.consensus
    }
}

/// Owner of the worker task.
pub struct ConsensusService {
    handle: ConsensusHandle,
    worker: JoinHandle<()>,
}

impl ConsensusService {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(consensus: Arc<ConsensusLoop>) -> Self {
        let capacity = consensus.context().config.inbound_queue_capacity;
        let (sender, receiver) = mpsc::channel(capacity);
        let worker = tokio::spawn(run_worker(consensus.clone(), receiver));
        Self { handle: ConsensusHandle { consensus, sender }, worker }
    }

    pub fn handle(&self) -> ConsensusHandle {
        self.handle.clone()
    }

    /// Cancel, wait for the worker to stop, then flush the coin cache.
    ///
    /// Commands still queued are answered with [`Error::Cancelled`].
    pub async fn shutdown(self) -> Result<()> {
        let ConsensusService { handle, worker } = self;
        handle.consensus.cancellation_token().cancel();
        drop(handle.sender);
        if let Err(err) = worker.await {
            warn!(%err, "consensus worker ended abnormally");
        }

        let consensus = handle.consensus;
        tokio::task::spawn_blocking(move || consensus.shutdown())
            .await
            .map_err(|err| Error::InconsistentState(format!("shutdown flush did not complete: {err}")))?
    }
}

async fn run_worker(consensus: Arc<ConsensusLoop>, mut receiver: mpsc::Receiver<Request>) {
    let cancel = consensus.cancellation_token().clone();
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = receiver.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let Request { command, reply } = request;
        let name = command.name();
        let worker = consensus.clone();
        let result = match tokio::task::spawn_blocking(move || command.execute(&worker)).await {
            Ok(result) => result,
            Err(err) => {
                error!(command = name, %err, "consensus command did not complete");
                Err(Error::InconsistentState(format!("{name} did not complete: {err}")))
            }
        };
        if reply.send(result).is_err() {
            debug!(command = name, "submitter went away before the reply");
        }
    }
    debug!("consensus worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_index::ChainedHeader;
    use crate::config::ConsensusConfig;
    use crate::constants::COIN;
    use crate::context::{ConsensusContext, ConsensusParams, ManualClock};
    use crate::network::RecordingRelay;
    use crate::rules::test_support::{block_on, coinbase, mine, GENESIS_TIME};
    use crate::signals::Signals;
    use crate::storage::{MemoryBlockStore, MemoryCoinStore};

    fn consensus(relay: Arc<RecordingRelay>, store: Arc<MemoryCoinStore>) -> Arc<ConsensusLoop> {
        let mut config = ConsensusConfig::default();
        config.propagation.poll_interval_ms = 100;
        config.propagation.deadline_ms = 5_000;
        let context = ConsensusContext::new(
            ConsensusParams::regtest(GENESIS_TIME),
            config,
            Arc::new(ManualClock::new(GENESIS_TIME + 100_000)),
        );
        Arc::new(
            ConsensusLoop::new(context, store, Arc::new(MemoryBlockStore::new()), relay, Arc::new(Signals::new()))
                .unwrap(),
        )
    }

    fn next_block(parent: &ChainedHeader) -> Block {
        let mut block = block_on(parent, vec![coinbase(parent.height + 1, 50 * COIN)]);
        mine(&mut block);
        block
    }

    #[tokio::test]
    async fn test_commands_are_served_in_order() {
        let node = consensus(Arc::new(RecordingRelay::new()), Arc::new(MemoryCoinStore::new()));
        let service = ConsensusService::spawn(node.clone());
        let handle = service.handle();

        let first = next_block(&node.tip());
        let hash = crate::hashing::block_hash(&first.header);
        assert_eq!(handle.submit_header(first.header.clone(), None).await.unwrap(), SubmitOutcome::Accepted);
        assert_eq!(handle.deliver_block(hash, first, None).await.unwrap(), SubmitOutcome::Accepted);
        assert_eq!(node.height(), 1);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_are_serialized() {
        let node = consensus(Arc::new(RecordingRelay::new()), Arc::new(MemoryCoinStore::new()));
        let service = ConsensusService::spawn(node.clone());
        let block = next_block(&node.tip());

        let mut tasks = Vec::new();
        for peer in 0..4 {
            let handle = service.handle();
            let block = block.clone();
            tasks.push(tokio::spawn(async move { handle.submit_block(block, Some(PeerId(peer))).await }));
        }

        let mut accepted = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                SubmitOutcome::Accepted => accepted += 1,
                SubmitOutcome::AlreadyKnown => {}
                other => panic!("unexpected outcome {other}"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(node.height(), 1);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes_queue() {
        let store = Arc::new(MemoryCoinStore::new());
        let node = consensus(Arc::new(RecordingRelay::new()), store.clone());
        let service = ConsensusService::spawn(node.clone());
        let handle = service.handle();
        let block = next_block(&node.tip());
        handle.submit_block(block, None).await.unwrap();

        service.shutdown().await.unwrap();
        assert!(store.batch_count() > 0);
        assert!(!store.utxo_set().is_empty());

        let late = next_block(&node.tip());
        assert!(matches!(handle.submit_block(late, None).await, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_propagation_observed() {
        let relay = Arc::new(RecordingRelay::new());
        let node = consensus(relay.clone(), Arc::new(MemoryCoinStore::new()));
        let service = ConsensusService::spawn(node);
        let handle = service.handle();
        let txid = [0x42; 32];
        relay.set_broadcast_state(txid, BroadcastState::Pending);

        let setter = relay.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_250)).await;
            setter.set_broadcast_state(txid, BroadcastState::Propagated);
        });

        let started = Instant::now();
        assert_eq!(handle.wait_for_propagation(txid).await, PropagationOutcome::Propagated);
        assert!(started.elapsed() < Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_propagation_deadline_is_not_an_error() {
        let relay = Arc::new(RecordingRelay::new());
        let node = consensus(relay.clone(), Arc::new(MemoryCoinStore::new()));
        let service = ConsensusService::spawn(node);
        let handle = service.handle();
        relay.set_broadcast_state([0x43; 32], BroadcastState::Pending);

        let started = Instant::now();
        assert_eq!(handle.wait_for_propagation([0x43; 32]).await, PropagationOutcome::NotConfirmedYet);
        assert!(started.elapsed() >= Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_propagation_wait_observes_cancellation() {
        let node = consensus(Arc::new(RecordingRelay::new()), Arc::new(MemoryCoinStore::new()));
        let service = ConsensusService::spawn(node.clone());
        let handle = service.handle();

        let token = node.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });
        assert_eq!(handle.wait_for_propagation([0x44; 32]).await, PropagationOutcome::Cancelled);
    }
}
