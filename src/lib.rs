//! # consensus-core
//!
//! Consensus and relay core of a full node: accepts headers, blocks and
//! transactions, validates them under pluggable consensus rules, keeps the
//! best chain and its coin set, and tells downstream consumers what changed.
//!
//! ## Architecture
//!
//! - [`chain_index`]: every known header, cumulative work, the active chain
//! - [`rules`]: ordered header, integrity, partial and full rule stages
//! - [`coinview`]: write-back coin cache over a [`storage::CoinStore`]
//! - [`consensus_loop`]: the single mutation path (connect, reorganize,
//!   invalidate, mempool admission)
//! - [`mempool`]: fee-rate ordered pool with ancestor/descendant accounting
//! - [`signals`]: synchronous, ordered notifications
//! - [`service`]: async queue in front of the loop
//!
//! Networking, wallets, RPC and on-disk encodings are collaborators reached
//! through the traits in [`network`] and [`storage`].
//!
//! ## Usage
//!
//! ```rust
//! use consensus_core::config::ConsensusConfig;
//! use consensus_core::consensus_loop::ConsensusLoop;
//! use consensus_core::context::{ConsensusContext, ConsensusParams, SystemClock};
//! use consensus_core::network::NullRelay;
//! use consensus_core::signals::{BlockConnected, Signals};
//! use consensus_core::storage::{MemoryBlockStore, MemoryCoinStore};
//! use std::sync::Arc;
//!
//! let context = ConsensusContext::new(
//!     ConsensusParams::regtest(1_600_000_000),
//!     ConsensusConfig::default(),
//!     Arc::new(SystemClock),
//! );
//! let signals = Arc::new(Signals::new());
//! signals.subscribe(|event: &BlockConnected| println!("connected {}", event.0.header.height));
//!
//! let node = ConsensusLoop::new(
//!     context,
//!     Arc::new(MemoryCoinStore::new()),
//!     Arc::new(MemoryBlockStore::new()),
//!     Arc::new(NullRelay),
//!     signals,
//! )
//! .unwrap();
//! assert_eq!(node.height(), 0);
//! ```

pub mod types;
pub mod constants;
pub mod hashing;
pub mod error;
pub mod config;
pub mod context;
pub mod pow;
pub mod economic;
pub mod script;
pub mod transaction;
pub mod block;
pub mod chain_index;
pub mod storage;
pub mod coinview;
pub mod rules;
pub mod reorganization;
pub mod mempool;
pub mod signals;
pub mod network;
pub mod consensus_loop;
pub mod service;

// Re-export commonly used types
pub use types::*;
pub use chain_index::{ChainIndex, ChainedHeader, ValidationState};
pub use config::ConsensusConfig;
pub use consensus_loop::{BlockStatus, ConsensusLoop};
pub use context::{ConsensusContext, ConsensusParams};
pub use error::{ConsensusError, Error, Result};
pub use mempool::{MempoolError, TxMempool};
pub use network::{PeerId, PeerRelay, SubmitOutcome};
pub use service::{ConsensusHandle, ConsensusService, PropagationOutcome};
pub use signals::{BlockConnected, BlockDisconnected, Signals, TransactionReceived};
