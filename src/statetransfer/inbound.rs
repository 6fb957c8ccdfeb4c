//! Receiving side of a segment transfer from one source.

use crate::error::{Error, Result};
use crate::network::{StateRequestCommand, StateRequestReply, StateRequestType, Transport};
use crate::types::{NodeId, SegmentId, TopologyId};
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Final state of an inbound task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Still receiving.
    Pending,
    /// Every segment received its last chunk.
    Completed,
    /// Cancelled before completion.
    Cancelled,
}

#[derive(Debug)]
struct Segments {
    all: BTreeSet<SegmentId>,
    unfinished: BTreeSet<SegmentId>,
    cancelled: bool,
}

/// Pulls a set of segments from one source.
pub struct InboundTransferTask {
    cache_name: SmolStr,
    local: NodeId,
    source: NodeId,
    topology_id: TopologyId,
    timeout: Duration,
    transport: Arc<dyn Transport>,
    segments: Mutex<Segments>,
    chunks: AtomicU64,
    cancel: CancellationToken,
    outcome: watch::Sender<TaskOutcome>,
}

impl InboundTransferTask {
    /// Create a task for `segments` from `source`.
    pub fn new(
        cache_name: SmolStr,
        source: NodeId,
        segments: BTreeSet<SegmentId>,
        topology_id: TopologyId,
        timeout: Duration,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (outcome, _) = watch::channel(TaskOutcome::Pending);
        Self {
            cache_name,
            local: transport.local_node(),
            source,
            topology_id,
            timeout,
            transport,
            segments: Mutex::new(Segments {
                unfinished: segments.clone(),
                all: segments,
                cancelled: false,
            }),
            chunks: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            outcome,
        }
    }

    /// Node the segments are pulled from.
    pub fn source(&self) -> NodeId {
        self.source
    }

    /// Topology the task was created for.
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Segments the task still owns.
    pub fn segments(&self) -> BTreeSet<SegmentId> {
        self.segments.lock().all.clone()
    }

    /// Segments that have not received their last chunk.
    pub fn unfinished_segments(&self) -> BTreeSet<SegmentId> {
        self.segments.lock().unfinished.clone()
    }

    /// Whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.segments.lock().cancelled
    }

    /// Current outcome.
    pub fn outcome(&self) -> TaskOutcome {
        *self.outcome.borrow()
    }

    /// Ask the source to start streaming.
    ///
    /// Returns `Error::Cancelled` if the task was cancelled before or while
    /// the request was in flight.
    pub async fn request_segments(&self) -> Result<()> {
        let segments = {
            let state = self.segments.lock();
            if state.cancelled {
                return Err(Error::Cancelled);
            }
            state.unfinished.clone()
        };
        if segments.is_empty() {
            return Ok(());
        }

        debug!(
            source = self.source,
            topology_id = self.topology_id,
            ?segments,
            "requesting segments"
        );
        let request = StateRequestCommand::new(
            self.cache_name.clone(),
            StateRequestType::StartStateTransfer,
            self.local,
            self.topology_id,
            segments,
        );

        let reply = tokio::select! {
            reply = self.transport.send_state_request(self.source, request, self.timeout) => reply?,
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match reply {
            StateRequestReply::Accepted => Ok(()),
            other => Err(Error::Internal(format!(
                "unexpected reply to start request: {:?}",
                other
            ))),
        }
    }

    /// Count a chunk accepted for this task.
    pub fn record_chunk(&self) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Chunks accepted so far.
    pub fn chunks_received(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    /// Record a received chunk. Returns true when this completed the task.
    pub fn on_state_received(&self, segment: SegmentId, is_last_chunk: bool) -> bool {
        if !is_last_chunk {
            return false;
        }
        let mut state = self.segments.lock();
        if state.cancelled || !state.unfinished.remove(&segment) {
            return false;
        }
        trace!(source = self.source, segment, "segment finished");
        if state.unfinished.is_empty() {
            drop(state);
            self.outcome.send_replace(TaskOutcome::Completed);
            return true;
        }
        false
    }

    /// Stop receiving `segments` and tell the source. Cancels the whole task
    /// once nothing is left.
    pub fn cancel_segments(&self, segments: &BTreeSet<SegmentId>) {
        let (removed, now_empty, finished) = {
            let mut state = self.segments.lock();
            if state.cancelled {
                return;
            }
            let removed: BTreeSet<SegmentId> =
                state.all.intersection(segments).copied().collect();
            for s in &removed {
                state.all.remove(s);
                state.unfinished.remove(s);
            }
            let now_empty = state.all.is_empty();
            (removed, now_empty, !now_empty && state.unfinished.is_empty())
        };
        if removed.is_empty() {
            return;
        }

        debug!(source = self.source, segments = ?removed, "cancelling segments");
        self.send_cancel(removed);
        if now_empty {
            self.cancel();
        } else if finished {
            self.outcome.send_replace(TaskOutcome::Completed);
        }
    }

    fn send_cancel(&self, segments: BTreeSet<SegmentId>) {
        let request = StateRequestCommand::new(
            self.cache_name.clone(),
            StateRequestType::CancelStateTransfer,
            self.local,
            self.topology_id,
            segments,
        );
        let transport = self.transport.clone();
        let source = self.source;
        let timeout = self.timeout;
        tokio::spawn(async move {
            if let Err(e) = transport.send_state_request(source, request, timeout).await {
                warn!(source, error = %e, "failed to cancel state transfer");
            }
        });
    }

    /// Cancel the task. A completed task stays completed.
    pub fn cancel(&self) {
        {
            let mut state = self.segments.lock();
            if state.cancelled || (state.unfinished.is_empty() && !state.all.is_empty()) {
                return;
            }
            state.cancelled = true;
        }
        self.cancel.cancel();
        self.outcome.send_if_modified(|o| {
            if *o == TaskOutcome::Pending {
                *o = TaskOutcome::Cancelled;
                true
            } else {
                false
            }
        });
    }

    /// Wait for the task to complete or be cancelled.
    pub async fn await_outcome(&self) -> TaskOutcome {
        let mut rx = self.outcome.subscribe();
        let outcome = match rx.wait_for(|o| *o != TaskOutcome::Pending).await {
            Ok(outcome) => *outcome,
            Err(_) => TaskOutcome::Cancelled,
        };
        outcome
    }
}

impl std::fmt::Debug for InboundTransferTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.segments.lock();
        f.debug_struct("InboundTransferTask")
            .field("source", &self.source)
            .field("topology_id", &self.topology_id)
            .field("segments", &state.all)
            .field("unfinished", &state.unfinished)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Message;
    use async_trait::async_trait;

    #[derive(Debug, Default)]
    struct Recorder {
        sent: Mutex<Vec<(NodeId, StateRequestType, BTreeSet<SegmentId>)>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        fn local_node(&self) -> NodeId {
            1
        }

        async fn send(&self, target: NodeId, msg: Message, _timeout: Duration) -> Result<Message> {
            if let Message::StateRequest(req) = msg {
                self.sent.lock().push((target, req.kind, req.segments));
            }
            Ok(Message::StateRequestReply(StateRequestReply::Accepted))
        }
    }

    fn task(transport: Arc<Recorder>, segments: &[SegmentId]) -> InboundTransferTask {
        InboundTransferTask::new(
            "c".into(),
            2,
            segments.iter().copied().collect(),
            5,
            Duration::from_secs(1),
            transport,
        )
    }

    #[tokio::test]
    async fn test_completes_after_all_last_chunks() {
        let transport = Arc::new(Recorder::default());
        let t = task(transport.clone(), &[1, 2]);
        t.request_segments().await.unwrap();
        assert_eq!(transport.sent.lock()[0].1, StateRequestType::StartStateTransfer);

        assert!(!t.on_state_received(1, false));
        assert!(!t.on_state_received(1, true));
        assert!(!t.on_state_received(1, true));
        assert!(t.on_state_received(2, true));
        assert_eq!(t.outcome(), TaskOutcome::Completed);
        assert_eq!(t.await_outcome().await, TaskOutcome::Completed);
    }

    #[tokio::test]
    async fn test_cancel_all_segments_cancels_task() {
        let transport = Arc::new(Recorder::default());
        let t = task(transport.clone(), &[1, 2]);

        t.cancel_segments(&[1].into_iter().collect());
        assert!(!t.is_cancelled());
        assert_eq!(t.segments(), BTreeSet::from([2]));

        t.cancel_segments(&[2].into_iter().collect());
        assert!(t.is_cancelled());
        assert_eq!(t.outcome(), TaskOutcome::Cancelled);

        // Never reports success afterwards.
        assert!(!t.on_state_received(2, true));
        assert_eq!(t.outcome(), TaskOutcome::Cancelled);
        assert!(matches!(t.request_segments().await, Err(Error::Cancelled)));

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let sent = transport.sent.lock();
        assert!(sent
            .iter()
            .all(|(_, kind, _)| *kind == StateRequestType::CancelStateTransfer));
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_keeps_completed() {
        let transport = Arc::new(Recorder::default());
        let t = task(transport, &[4]);
        assert!(t.on_state_received(4, true));
        t.cancel();
        assert_eq!(t.outcome(), TaskOutcome::Completed);
        assert!(!t.is_cancelled());
    }
}
