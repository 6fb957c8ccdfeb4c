//! Sending side of a segment transfer to one destination.
//!
//! ```text
//!   container scan ──┐
//!                    ├──► per-segment buffers ──(total ≥ chunk_size)──► StateResponse
//!   store keys ──────┘                                                    │
//!                                                                          ▼
//!                          one terminal chunk per live segment ──► StateResponse
//! ```
//!
//! Batches are sent one after another, so the terminal chunk of a segment
//! always reaches the destination after every other chunk of that segment.

use crate::container::{DataContainer, PersistenceManager};
use crate::error::{Error, Result};
use crate::metrics::StateTransferMetrics;
use crate::network::{StateChunk, StateResponseCommand, Transport};
use crate::topology::segment_for_key;
use crate::types::{CacheEntry, NodeId, SegmentId, TopologyId};
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Streams a set of segments to one destination.
pub struct OutboundTransferTask {
    cache_name: SmolStr,
    destination: NodeId,
    topology_id: TopologyId,
    num_segments: u32,
    chunk_size: usize,
    timeout: Duration,
    segments: Mutex<BTreeSet<SegmentId>>,
    container: Arc<dyn DataContainer>,
    persistence: Option<Arc<dyn PersistenceManager>>,
    transport: Arc<dyn Transport>,
    metrics: Arc<StateTransferMetrics>,
    cancel: CancellationToken,
}

/// Dependencies shared by every outbound task of a provider.
#[derive(Clone)]
pub struct OutboundContext {
    pub cache_name: SmolStr,
    pub num_segments: u32,
    pub chunk_size: usize,
    pub timeout: Duration,
    pub container: Arc<dyn DataContainer>,
    pub persistence: Option<Arc<dyn PersistenceManager>>,
    pub transport: Arc<dyn Transport>,
    pub metrics: Arc<StateTransferMetrics>,
}

impl OutboundTransferTask {
    /// Create a task sending `segments` to `destination`.
    pub fn new(
        ctx: &OutboundContext,
        destination: NodeId,
        segments: BTreeSet<SegmentId>,
        topology_id: TopologyId,
    ) -> Self {
        Self {
            cache_name: ctx.cache_name.clone(),
            destination,
            topology_id,
            num_segments: ctx.num_segments,
            chunk_size: ctx.chunk_size.max(1),
            timeout: ctx.timeout,
            segments: Mutex::new(segments),
            container: ctx.container.clone(),
            persistence: ctx.persistence.clone(),
            transport: ctx.transport.clone(),
            metrics: ctx.metrics.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Destination node.
    pub fn destination(&self) -> NodeId {
        self.destination
    }

    /// Topology the task streams under.
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Segments still being sent.
    pub fn segments(&self) -> BTreeSet<SegmentId> {
        self.segments.lock().clone()
    }

    /// Whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop sending `segments`. Returns true when the task has nothing left
    /// and was cancelled as a whole.
    pub fn cancel_segments(&self, segments: &BTreeSet<SegmentId>) -> bool {
        let empty = {
            let mut live = self.segments.lock();
            live.retain(|s| !segments.contains(s));
            live.is_empty()
        };
        if empty {
            self.cancel();
        }
        empty
    }

    /// Cancel the task. In-flight sends finish; nothing further is sent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stream every live segment, then send the terminal chunks.
    pub async fn execute(&self) -> Result<()> {
        let requested = self.segments();
        debug!(
            destination = self.destination,
            topology_id = self.topology_id,
            segments = ?requested,
            "starting outbound transfer"
        );

        let mut buffers: BTreeMap<SegmentId, Vec<CacheEntry>> = BTreeMap::new();
        let mut buffered = 0usize;

        for entry in self.container.entries() {
            self.check_cancelled()?;
            if entry.is_expired() {
                continue;
            }
            let segment = segment_for_key(&entry.key, self.num_segments);
            if !requested.contains(&segment) {
                continue;
            }
            buffers.entry(segment).or_default().push(entry);
            buffered += 1;
            if buffered >= self.chunk_size {
                self.flush(&mut buffers, false).await?;
                buffered = 0;
            }
        }

        if let Some(persistence) = &self.persistence {
            let num_segments = self.num_segments;
            let container = self.container.clone();
            let keys = persistence
                .load_all_keys(&|key: &[u8]| {
                    requested.contains(&segment_for_key(key, num_segments))
                        && !container.contains(key)
                })
                .await?;

            for key in keys {
                self.check_cancelled()?;
                let entry = match persistence.load(&key).await {
                    Ok(Some(entry)) if !entry.is_expired() => entry,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(
                            destination = self.destination,
                            key = %String::from_utf8_lossy(&key),
                            error = %e,
                            "failed to load entry from store, skipping"
                        );
                        continue;
                    }
                };
                let segment = segment_for_key(&entry.key, self.num_segments);
                buffers.entry(segment).or_default().push(entry);
                buffered += 1;
                if buffered >= self.chunk_size {
                    self.flush(&mut buffers, false).await?;
                    buffered = 0;
                }
            }
        }

        self.flush(&mut buffers, true).await?;
        debug!(destination = self.destination, "outbound transfer finished");
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn flush(
        &self,
        buffers: &mut BTreeMap<SegmentId, Vec<CacheEntry>>,
        last: bool,
    ) -> Result<()> {
        self.check_cancelled()?;
        let live = self.segments();

        let chunks: Vec<StateChunk> = if last {
            live.iter()
                .map(|s| StateChunk::new(*s, buffers.remove(s).unwrap_or_default(), true))
                .collect()
        } else {
            std::mem::take(buffers)
                .into_iter()
                .filter(|(s, entries)| live.contains(s) && !entries.is_empty())
                .map(|(s, entries)| StateChunk::new(s, entries, false))
                .collect()
        };
        buffers.clear();
        if chunks.is_empty() {
            return Ok(());
        }

        let entries: usize = chunks.iter().map(|c| c.entries.len()).sum();
        let chunk_count = chunks.len();
        let response = StateResponseCommand {
            cache_name: self.cache_name.clone(),
            origin: self.transport.local_node(),
            topology_id: self.topology_id,
            chunks,
            push: false,
        };

        tokio::select! {
            sent = self.transport.send_state_response(self.destination, response, self.timeout) => sent?,
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        }
        self.metrics.record_batch_sent(chunk_count, entries);
        Ok(())
    }
}

impl std::fmt::Debug for OutboundTransferTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundTransferTask")
            .field("destination", &self.destination)
            .field("topology_id", &self.topology_id)
            .field("segments", &*self.segments.lock())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{InMemoryPersistence, MokaDataContainer};
    use crate::network::Message;
    use crate::types::EntryMetadata;
    use async_trait::async_trait;

    #[derive(Debug, Default)]
    struct Sink {
        batches: Mutex<Vec<StateResponseCommand>>,
    }

    #[async_trait]
    impl Transport for Sink {
        fn local_node(&self) -> NodeId {
            9
        }

        async fn send(&self, _target: NodeId, msg: Message, _timeout: Duration) -> Result<Message> {
            if let Message::StateResponse(resp) = msg {
                self.batches.lock().push(resp);
            }
            Ok(Message::Ack)
        }
    }

    const SEGMENTS: u32 = 4;

    fn key_in(segment: SegmentId, n: usize) -> Vec<String> {
        (0..)
            .map(|i| format!("key-{}", i))
            .filter(|k| segment_for_key(k.as_bytes(), SEGMENTS) == segment)
            .take(n)
            .collect()
    }

    fn context(
        container: Arc<MokaDataContainer>,
        persistence: Option<Arc<InMemoryPersistence>>,
        sink: Arc<Sink>,
        chunk_size: usize,
    ) -> OutboundContext {
        OutboundContext {
            cache_name: "c".into(),
            num_segments: SEGMENTS,
            chunk_size,
            timeout: Duration::from_secs(1),
            container,
            persistence: persistence.map(|p| p as Arc<dyn PersistenceManager>),
            transport: sink,
            metrics: Arc::new(StateTransferMetrics::new()),
        }
    }

    #[tokio::test]
    async fn test_chunks_then_terminal_per_segment() {
        let container = Arc::new(MokaDataContainer::new());
        for key in key_in(1, 5) {
            container.put(CacheEntry::new(key, "v"));
        }
        for key in key_in(2, 3) {
            container.put(CacheEntry::new(key, "v"));
        }
        let sink = Arc::new(Sink::default());
        let ctx = context(container, None, sink.clone(), 3);

        let task = OutboundTransferTask::new(&ctx, 1, BTreeSet::from([1, 2, 3]), 7);
        task.execute().await.unwrap();

        let batches = sink.batches.lock();
        let total: usize = batches
            .iter()
            .flat_map(|b| &b.chunks)
            .map(|c| c.entries.len())
            .sum();
        assert_eq!(total, 8);

        let terminal = batches.last().unwrap();
        let last_segments: Vec<_> = terminal
            .chunks
            .iter()
            .filter(|c| c.is_last_chunk)
            .map(|c| c.segment_id)
            .collect();
        assert_eq!(last_segments, vec![1, 2, 3]);

        // Segment 3 has no data but still gets a terminal chunk.
        let empty = terminal.chunks.iter().find(|c| c.segment_id == 3).unwrap();
        assert!(empty.entries.is_empty());

        // No earlier batch carries a terminal chunk.
        assert!(batches[..batches.len() - 1]
            .iter()
            .flat_map(|b| &b.chunks)
            .all(|c| !c.is_last_chunk));
        assert!(batches.iter().all(|b| b.topology_id == 7 && b.origin == 9));
    }

    #[tokio::test]
    async fn test_store_keys_and_failed_loads() {
        let container = Arc::new(MokaDataContainer::new());
        let store = Arc::new(InMemoryPersistence::new());
        let keys = key_in(0, 3);
        container.put(CacheEntry::new(keys[0].clone(), "mem"));
        store.write(CacheEntry::new(keys[0].clone(), "disk")).await.unwrap();
        store.write(CacheEntry::new(keys[1].clone(), "disk")).await.unwrap();
        store.write(CacheEntry::new(keys[2].clone(), "disk")).await.unwrap();
        store.fail_loads_for(keys[2].clone());

        let sink = Arc::new(Sink::default());
        let ctx = context(container, Some(store), sink.clone(), 100);
        OutboundTransferTask::new(&ctx, 1, BTreeSet::from([0]), 1)
            .execute()
            .await
            .unwrap();

        let batches = sink.batches.lock();
        let entries: Vec<_> = batches
            .iter()
            .flat_map(|b| &b.chunks)
            .flat_map(|c| &c.entries)
            .collect();
        assert_eq!(entries.len(), 2);
        let mem = entries.iter().find(|e| e.key == keys[0].as_bytes()).unwrap();
        assert_eq!(mem.value, "mem".as_bytes());
    }

    #[tokio::test]
    async fn test_expired_entries_skipped() {
        let container = Arc::new(MokaDataContainer::new());
        let keys = key_in(0, 2);
        container.put(CacheEntry::new(keys[0].clone(), "live"));
        container.put(CacheEntry::with_metadata(
            keys[1].clone(),
            "dead",
            EntryMetadata {
                expires_at_ms: Some(1),
                version: None,
            },
        ));
        let sink = Arc::new(Sink::default());
        let ctx = context(container, None, sink.clone(), 10);
        OutboundTransferTask::new(&ctx, 1, BTreeSet::from([0]), 1)
            .execute()
            .await
            .unwrap();
        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].chunks[0].entries.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_segments() {
        let container = Arc::new(MokaDataContainer::new());
        let sink = Arc::new(Sink::default());
        let ctx = context(container, None, sink.clone(), 10);
        let task = OutboundTransferTask::new(&ctx, 1, BTreeSet::from([0, 1]), 1);

        assert!(!task.cancel_segments(&BTreeSet::from([0])));
        assert_eq!(task.segments(), BTreeSet::from([1]));
        assert!(task.cancel_segments(&BTreeSet::from([1])));
        assert!(task.is_cancelled());
        assert!(matches!(task.execute().await, Err(Error::Cancelled)));
        assert!(sink.batches.lock().is_empty());
    }
}
