//! Load scheduler: deduplicated, cancellable tile fetches.
//!
//! Requests queue FIFO and are dispatched as tokio tasks up to a concurrency
//! limit. A fetch task's only side effect is sending a completion record on
//! a channel; the owner drains that channel once per frame, so scheduler
//! state is only ever mutated from the frame step.
//!
//! Cancelling a pending request drops it before dispatch. Cancelling an
//! in-flight one aborts its task, frees its dispatch slot at once and gives
//! the source a cancel hint. A record the task managed to send before the
//! abort took effect is discarded on drain.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::cache::key::TileKey;
use crate::loader::source::{FetchError, TileData, TileSource};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Load scheduler must be created inside a tokio runtime")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Identifies one fetch attempt.
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadState {
    Pending,
    InFlight,
    Done,
    Cancelled,
    Failed,
}

impl LoadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadState::Done | LoadState::Cancelled | LoadState::Failed)
    }
}

/// A live fetch request.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub id: RequestId,
    pub key: TileKey,
    pub state: LoadState,
    /// 1 for the first attempt, incremented on each retry.
    pub attempt: u32,
}

/// What a fetch task sends back.
#[derive(Debug)]
struct CompletionRecord {
    id: RequestId,
    key: TileKey,
    result: Result<TileData, FetchError>,
}

/// A live request that finished, handed to the cache in arrival order.
#[derive(Debug)]
pub struct Completion {
    pub key: TileKey,
    pub id: RequestId,
    pub attempt: u32,
    /// `Done` or `Failed`.
    pub state: LoadState,
    pub result: Result<TileData, FetchError>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LoadStats {
    pub total_requested: u64,
    pub total_deduplicated: u64,
    pub total_dispatched: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_stale: u64,
}

pub struct LoadScheduler {
    source: Arc<dyn TileSource>,
    runtime: Handle,

    /// Non-terminal requests; at most one per key.
    active: HashMap<TileKey, LoadRequest>,

    /// Pending keys in request order.
    queue: VecDeque<TileKey>,

    /// Abort handles of dispatched tasks that have not reported.
    tasks: HashMap<RequestId, AbortHandle>,

    max_concurrent: usize,
    in_flight: usize,
    next_id: RequestId,

    tx: mpsc::UnboundedSender<CompletionRecord>,
    rx: mpsc::UnboundedReceiver<CompletionRecord>,

    /// Records received but not yet handed out.
    arrived: VecDeque<CompletionRecord>,

    stats: LoadStats,
}

impl LoadScheduler {
    /// Create a scheduler that spawns fetches on the current tokio runtime.
    pub fn new(source: Arc<dyn TileSource>, max_concurrent: usize) -> Result<Self, LoaderError> {
        Ok(Self::with_runtime(source, max_concurrent, Handle::try_current()?))
    }

    pub fn with_runtime(source: Arc<dyn TileSource>, max_concurrent: usize, runtime: Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            source,
            runtime,
            active: HashMap::new(),
            queue: VecDeque::new(),
            tasks: HashMap::new(),
            max_concurrent: max_concurrent.max(1),
            in_flight: 0,
            next_id: 0,
            tx,
            rx,
            arrived: VecDeque::new(),
            stats: LoadStats::default(),
        }
    }

    /// Request `key`. Returns `false` if a live request already exists.
    pub fn request(&mut self, key: TileKey) -> bool {
        self.request_attempt(key, 1)
    }

    /// Request `key`, recording which attempt this is.
    pub fn request_attempt(&mut self, key: TileKey, attempt: u32) -> bool {
        if self.active.contains_key(&key) {
            self.stats.total_deduplicated += 1;
            return false;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.active.insert(
            key,
            LoadRequest {
                id,
                key,
                state: LoadState::Pending,
                attempt,
            },
        );
        self.queue.push_back(key);
        self.stats.total_requested += 1;
        debug!(key = %key, id, attempt, "Queued tile fetch");

        self.pump();
        true
    }

    /// Cancel the live request for `key`, returning it in its terminal state.
    pub fn cancel(&mut self, key: &TileKey) -> Option<LoadRequest> {
        let mut request = self.active.remove(key)?;

        match request.state {
            LoadState::Pending => {
                self.queue.retain(|k| k != key);
            }
            LoadState::InFlight => {
                if let Some(task) = self.tasks.remove(&request.id) {
                    task.abort();
                }
                self.in_flight = self.in_flight.saturating_sub(1);
                self.source.cancel(*key);
            }
            _ => {}
        }

        self.stats.total_cancelled += 1;
        debug!(key = %key, id = request.id, state = ?request.state, "Cancelled tile fetch");
        request.state = LoadState::Cancelled;
        self.pump();
        Some(request)
    }

    /// Hand over every completion received since the last drain, in arrival
    /// order. Stale records for cancelled requests are dropped here.
    pub fn drain(&mut self) -> Vec<Completion> {
        while let Ok(record) = self.rx.try_recv() {
            self.arrived.push_back(record);
        }

        let mut completions = Vec::with_capacity(self.arrived.len());
        while let Some(record) = self.arrived.pop_front() {
            let live = matches!(
                self.active.get(&record.key),
                Some(req) if req.id == record.id && req.state == LoadState::InFlight
            );
            if !live {
                self.stats.total_stale += 1;
                debug!(key = %record.key, id = record.id, "Discarded completion of cancelled fetch");
                continue;
            }
            self.tasks.remove(&record.id);

            let Some(request) = self.active.remove(&record.key) else {
                continue;
            };
            self.in_flight = self.in_flight.saturating_sub(1);
            let state = match &record.result {
                Ok(_) => {
                    self.stats.total_completed += 1;
                    LoadState::Done
                }
                Err(_) => {
                    self.stats.total_failed += 1;
                    LoadState::Failed
                }
            };

            completions.push(Completion {
                key: record.key,
                id: record.id,
                attempt: request.attempt,
                state,
                result: record.result,
            });
        }

        self.pump();
        completions
    }

    /// Wait until at least `count` completion records are buffered.
    ///
    /// Nothing is applied; the records are handed out by the next
    /// [`drain`](Self::drain). Returns the number buffered.
    pub async fn wait_for_completions(&mut self, count: usize) -> usize {
        while self.arrived.len() < count {
            match self.rx.recv().await {
                Some(record) => self.arrived.push_back(record),
                None => break,
            }
        }
        self.arrived.len()
    }

    /// State of the live request for `key`, if any.
    pub fn state(&self, key: &TileKey) -> Option<LoadState> {
        self.active.get(key).map(|r| r.state)
    }

    pub fn request_for(&self, key: &TileKey) -> Option<&LoadRequest> {
        self.active.get(key)
    }

    /// Number of live (pending or in-flight) requests.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Dispatched tasks that have not reported.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
    }

    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    fn pump(&mut self) {
        while self.in_flight < self.max_concurrent {
            let Some(key) = self.queue.pop_front() else {
                break;
            };
            let Some(request) = self.active.get_mut(&key) else {
                continue;
            };
            request.state = LoadState::InFlight;
            let id = request.id;
            self.in_flight += 1;
            self.stats.total_dispatched += 1;

            let source = Arc::clone(&self.source);
            let tx = self.tx.clone();
            let task = self.runtime.spawn(async move {
                let result = match AssertUnwindSafe(source.fetch(key)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Transient(format!("tile source panicked on {key}"))),
                };
                let _ = tx.send(CompletionRecord { id, key, result });
            });
            self.tasks.insert(id, task.abort_handle());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::scripted::ScriptedSource;
    use crate::loader::source::TileData;

    fn k(x: u32) -> TileKey {
        TileKey::new(x, 0, 0)
    }

    fn tile() -> TileData {
        TileData::solid(1, [0; 4])
    }

    #[tokio::test]
    async fn test_request_is_deduplicated() {
        let source = Arc::new(ScriptedSource::new());
        let mut sched = LoadScheduler::new(source, 4).unwrap();

        assert!(sched.request(k(1)));
        assert!(!sched.request(k(1)));
        assert_eq!(sched.active_count(), 1);
        assert_eq!(sched.stats().total_requested, 1);
        assert_eq!(sched.stats().total_deduplicated, 1);
        assert_eq!(sched.state(&k(1)), Some(LoadState::InFlight));
    }

    #[tokio::test]
    async fn test_concurrency_limit_keeps_requests_pending() {
        let source = Arc::new(ScriptedSource::new());
        let mut sched = LoadScheduler::new(source.clone(), 1).unwrap();

        sched.request(k(1));
        sched.request(k(2));
        assert_eq!(sched.state(&k(1)), Some(LoadState::InFlight));
        assert_eq!(sched.state(&k(2)), Some(LoadState::Pending));

        source.complete(k(1), tile());
        sched.wait_for_completions(1).await;
        let done = sched.drain();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key, k(1));
        assert_eq!(sched.state(&k(2)), Some(LoadState::InFlight));
    }

    #[tokio::test]
    async fn test_cancel_pending_never_dispatches() {
        let source = Arc::new(ScriptedSource::new());
        let mut sched = LoadScheduler::new(source.clone(), 1).unwrap();

        sched.request(k(1));
        sched.request(k(2));
        assert_eq!(sched.cancel(&k(2)).unwrap().state, LoadState::Cancelled);
        assert!(sched.cancel(&k(2)).is_none());
        assert_eq!(sched.pending_count(), 0);
        assert_eq!(source.cancel_count(&k(2)), 0);
    }

    #[tokio::test]
    async fn test_cancel_frees_slot_of_hung_fetch() {
        // The scripted source never answers k(1), like a hung device.
        let source = Arc::new(ScriptedSource::new());
        let mut sched = LoadScheduler::new(source.clone(), 1).unwrap();

        sched.request(k(1));
        sched.request(k(2));
        assert_eq!(sched.state(&k(2)), Some(LoadState::Pending));

        assert!(sched.cancel(&k(1)).is_some());
        assert_eq!(source.cancel_count(&k(1)), 1);
        assert_eq!(sched.state(&k(2)), Some(LoadState::InFlight));
        assert_eq!(sched.in_flight_count(), 1);

        source.complete(k(2), tile());
        sched.wait_for_completions(1).await;
        let done = sched.drain();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key, k(2));
        assert_eq!(sched.in_flight_count(), 0);
        assert_eq!(source.fetch_count(&k(1)), 0);
    }

    #[tokio::test]
    async fn test_completion_sent_before_cancel_is_discarded() {
        let source = Arc::new(ScriptedSource::new());
        let mut sched = LoadScheduler::new(source.clone(), 2).unwrap();

        sched.request(k(1));
        source.complete(k(1), tile());
        sched.wait_for_completions(1).await;

        assert!(sched.cancel(&k(1)).is_some());
        assert!(sched.drain().is_empty());
        assert_eq!(sched.stats().total_stale, 1);
        assert_eq!(sched.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_rerequest_after_cancel_ignores_old_result() {
        let source = Arc::new(ScriptedSource::new());
        let mut sched = LoadScheduler::new(source.clone(), 4).unwrap();

        sched.request(k(1));
        let first = sched.request_for(&k(1)).unwrap().id;
        source.complete(k(1), tile());
        sched.wait_for_completions(1).await;

        sched.cancel(&k(1));
        sched.request(k(1));
        let second = sched.request_for(&k(1)).unwrap().id;
        assert_ne!(first, second);

        source.complete(k(1), tile());
        sched.wait_for_completions(2).await;
        let done = sched.drain();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, second);
        assert_eq!(sched.stats().total_stale, 1);
    }

    struct PanickingSource;

    #[async_trait::async_trait]
    impl TileSource for PanickingSource {
        async fn fetch(&self, _key: TileKey) -> Result<TileData, FetchError> {
            panic!("decoder blew up");
        }
    }

    #[tokio::test]
    async fn test_panicking_source_reports_transient_failure() {
        let mut sched = LoadScheduler::new(Arc::new(PanickingSource), 1).unwrap();
        sched.request(k(1));
        sched.wait_for_completions(1).await;
        let done = sched.drain();
        assert_eq!(done[0].state, LoadState::Failed);
        assert!(matches!(done[0].result, Err(FetchError::Transient(_))));
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let source = Arc::new(ScriptedSource::new());
        assert!(matches!(
            LoadScheduler::new(source, 1),
            Err(LoaderError::NoRuntime(_))
        ));
    }
}
