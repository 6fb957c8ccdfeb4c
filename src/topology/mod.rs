//! Segment ownership model.
//!
//! A [`CacheTopology`] bundles up to three [`ConsistentHash`]es: the current
//! one, the pending target of a rebalance and their union. Which of them
//! serves reads and writes depends on the rebalance [`Phase`].

mod cache_topology;
mod consistent_hash;

pub use cache_topology::{CacheJoinInfo, CacheTopology, Phase, TopologyHolder};
pub use consistent_hash::{segment_for_key, ConsistentHash};
