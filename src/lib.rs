//! Segment state transfer for a distributed in-memory data grid.
//!
//! When cluster membership changes, the segments of a cache are reassigned
//! and their entries move between nodes while the cache keeps serving reads
//! and writes. This crate implements the node-side half of that protocol:
//!
//! - **Four-phase rebalance**: READ_OLD_WRITE_ALL, READ_ALL_WRITE_ALL,
//!   READ_NEW_WRITE_ALL, then back to NO_REBALANCE, each phase confirmed
//!   to the coordinator by every member
//! - **Pull-based transfer**: new owners request segments from current
//!   owners and apply the streamed chunks
//! - **Freshness tracking**: a live write always beats transferred state
//!   for the same key
//! - **Stale command handling**: commands stamped with an old topology
//!   are retried, rejected or forwarded to the new owners
//!
//! # Example
//!
//! ```rust,ignore
//! use gridstate::{CacheComponents, MokaDataContainer, StateTransferConfig, StateTransferManager};
//! use std::sync::Arc;
//!
//! let config = StateTransferConfig::new("users")
//!     .with_num_segments(256)
//!     .with_num_owners(2);
//! let components = CacheComponents::new(config, transport, Arc::new(MokaDataContainer::new()));
//! let manager = StateTransferManager::new(components, coordinator);
//!
//! // Joins the cache and waits for the initial state transfer
//! manager.start().await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          Topology coordinator               │
//! └─────────────────────────────────────────────┘
//!          │ topologies          ▲ confirmations
//!          ▼                     │
//! ┌─────────────────────────────────────────────┐
//! │          StateTransferManager               │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┬───────────────┐
//!     ▼               ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌───────────┐   ┌─────────────┐
//! │Consumer │   │ Provider │   │Interceptor│   │CommitManager│
//! │(inbound)│   │(outbound)│   │  (stale   │   │ (freshness) │
//! │         │   │          │   │ commands) │   │             │
//! └─────────┘   └──────────┘   └───────────┘   └─────────────┘
//! ```

pub mod command;
pub mod config;
pub mod container;
pub mod error;
pub mod metrics;
pub mod network;
pub mod statetransfer;
pub mod testing;
pub mod topology;
pub mod tx;
pub mod types;

// Re-export main types for convenience
pub use config::{CacheMode, MergePolicy, StateTransferConfig};
pub use error::{Error, NetworkError, Result, StorageError, TransferError};
pub use types::{CacheEntry, EntryMetadata, Flag, Flags, NodeId, SegmentId, TopologyId, WriteOrigin};

// Re-export state transfer types
pub use statetransfer::{
    CacheComponents, CommitManager, ConflictManager, RebalanceType, StateConsumer, StateProvider,
    StateTransferInterceptor, StateTransferLock, StateTransferManager,
};

// Re-export topology types
pub use topology::{CacheJoinInfo, CacheTopology, ConsistentHash, Phase};

// Re-export storage types
pub use container::{DataContainer, InMemoryPersistence, MokaDataContainer, PersistenceManager};

// Re-export network types
pub use network::{Message, MessageHandler, TopologyListener, TopologyService, Transport};

// Re-export metrics types
pub use metrics::{Counter, Gauge, Histogram, MetricsSnapshot, StateTransferMetrics};

// Re-export testing types
pub use testing::{InMemoryNetwork, TestCluster, TestTopologyCoordinator};
