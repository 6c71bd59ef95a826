//! Cache manager: the per-frame orchestrator.
//!
//! The manager is the single writer for the slot allocator, recency tracker
//! and indirection table. Once per frame, [`CacheManager::request_tiles`]:
//! - installs the frame's needed list as the protected set
//! - applies fetch completions queued since the last frame, in arrival
//!   order, evicting least recently used unprotected tiles as needed
//! - starts loads for unknown needed tiles and touches resident ones
//! - cancels loads that have gone unrequested past the grace period
//! - publishes the indirection snapshot the renderer samples through
//!
//! Slots are allocated when a tile's data arrives, not when it is requested,
//! so a loading tile never holds a slot. If every resident tile is protected
//! when data arrives, the tile is parked and placement is retried next frame.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::cache::indirection::{IndirectionEntry, IndirectionTable, Residency};
use crate::cache::key::{AddressSpace, ProtectedSet, TileKey};
use crate::cache::recency::RecencyTracker;
use crate::cache::slot::{PhysicalSlot, SlotAllocator, SlotError};
use crate::cache::snapshot::{IndirectionSnapshot, SampleLocation};
use crate::config::{Config, ConfigError};
use crate::loader::scheduler::{LoadScheduler, LoadStats, LoaderError};
use crate::loader::source::{FetchError, TileData, TileSource};
use crate::store::PhysicalStore;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Loader(#[from] LoaderError),
}

/// Where a key is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TileState {
    Unknown,
    Loading,
    Resident,
}

/// What one frame step did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    /// Distinct valid keys in the needed list.
    pub needed: usize,
    pub hits: usize,
    pub misses: usize,
    /// Fetches started this frame, retries included.
    pub new_requests: usize,
    pub retries: usize,
    /// Tiles that became resident.
    pub committed: Vec<TileKey>,
    pub evicted: Vec<TileKey>,
    pub cancelled: Vec<TileKey>,
    pub failed: Vec<TileKey>,
    /// Failed tiles that exhausted their retries this frame.
    pub given_up: usize,
    /// Arrived tiles left unplaced because every resident tile was protected.
    pub capacity_exhausted: usize,
    pub stale_completions: usize,
    pub invalid_keys: usize,
}

impl FrameReport {
    /// Fraction of needed tiles not resident this frame.
    pub fn miss_rate(&self) -> f64 {
        if self.needed == 0 {
            return 0.0;
        }
        self.misses as f64 / self.needed as f64
    }
}

/// Running totals across all frames.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub frames: u64,
    pub tiles_needed: u64,
    pub hits: u64,
    pub misses: u64,
    pub fetches_issued: u64,
    pub retries: u64,
    pub uploads: u64,
    pub evictions: u64,
    pub capacity_exhausted: u64,
    pub cancellations: u64,
    pub stale_completions: u64,
    pub fetch_failures: u64,
    pub given_up: u64,
    pub invalid_keys: u64,
}

impl CacheStats {
    fn absorb(&mut self, report: &FrameReport) {
        self.frames += 1;
        self.tiles_needed += report.needed as u64;
        self.hits += report.hits as u64;
        self.misses += report.misses as u64;
        self.fetches_issued += report.new_requests as u64;
        self.retries += report.retries as u64;
        self.uploads += report.committed.len() as u64;
        self.evictions += report.evicted.len() as u64;
        self.capacity_exhausted += report.capacity_exhausted as u64;
        self.cancellations += report.cancelled.len() as u64;
        self.stale_completions += report.stale_completions as u64;
        self.fetch_failures += report.failed.len() as u64;
        self.given_up += report.given_up as u64;
        self.invalid_keys += report.invalid_keys as u64;
    }
}

/// Failure history of a recently needed key.
///
/// Dropped once the key goes unneeded for longer than the grace period, so
/// the map only covers tiles near the current view.
#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    failures: u32,
    /// First frame a retry may start; `None` once retries are exhausted.
    retry_at: Option<u64>,
    last_needed_frame: u64,
}

/// The virtual texture cache.
pub struct CacheManager<S: PhysicalStore> {
    config: Arc<Config>,
    space: AddressSpace,

    allocator: SlotAllocator,
    recency: RecencyTracker,
    table: IndirectionTable,
    scheduler: LoadScheduler,
    store: S,

    /// This frame's needed keys.
    protected: ProtectedSet,

    /// Arrived tiles waiting for an evictable slot, in arrival order.
    parked: VecDeque<(TileKey, TileData)>,

    failures: HashMap<TileKey, FailureRecord>,

    frame: u64,
    snapshot: IndirectionSnapshot,
    last_report: FrameReport,
    stats: CacheStats,
}

impl<S: PhysicalStore> CacheManager<S> {
    /// Build a cache that fetches from `source` on the current tokio runtime.
    pub fn new(config: Arc<Config>, source: Arc<dyn TileSource>, store: S) -> Result<Self, CacheError> {
        config.validate()?;
        let scheduler = LoadScheduler::new(source, config.loader.max_concurrent_fetches)?;
        Self::with_scheduler(config, scheduler, store).map_err(CacheError::from)
    }

    /// Build a cache around an existing scheduler.
    pub fn with_scheduler(
        config: Arc<Config>,
        scheduler: LoadScheduler,
        store: S,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let space = config.cache.address_space()?;
        let side = u16::try_from(config.cache.cache_side_tiles).map_err(|_| {
            ConfigError::CacheSideOutOfRange {
                got: config.cache.cache_side_tiles,
                max: u32::from(u16::MAX),
            }
        })?;

        Ok(Self {
            allocator: SlotAllocator::new(side),
            recency: RecencyTracker::with_capacity(config.cache.capacity()),
            table: IndirectionTable::new(space.max_mip()),
            scheduler,
            store,
            protected: ProtectedSet::new(),
            parked: VecDeque::new(),
            failures: HashMap::new(),
            frame: 0,
            snapshot: IndirectionSnapshot::new(0),
            last_report: FrameReport::default(),
            stats: CacheStats::default(),
            space,
            config,
        })
    }

    /// Advance one frame with this frame's needed tiles.
    pub fn request_tiles(&mut self, needed: &[TileKey]) -> FrameReport {
        self.frame += 1;
        let mut report = FrameReport {
            frame: self.frame,
            ..Default::default()
        };

        self.install_protected(needed, &mut report);
        self.apply_completions(&mut report);

        let keys: Vec<TileKey> = self.protected.iter().copied().collect();
        for key in keys {
            if let Some(record) = self.failures.get_mut(&key) {
                record.last_needed_frame = self.frame;
            }
            match self.table.lookup(&key).map(|e| e.residency) {
                Some(Residency::Resident { .. }) => {
                    self.table.touch(&key, self.frame);
                    self.recency.touch(key);
                    report.hits += 1;
                }
                Some(Residency::Loading) => {
                    self.table.touch(&key, self.frame);
                    report.misses += 1;
                }
                None => {
                    report.misses += 1;
                    self.start_load(key, &mut report);
                }
            }
        }

        self.sweep_abandoned(&mut report);
        self.publish_snapshot();

        if !report.evicted.is_empty() || !report.cancelled.is_empty() || report.capacity_exhausted > 0 {
            debug!(
                frame = self.frame,
                committed = report.committed.len(),
                evicted = report.evicted.len(),
                cancelled = report.cancelled.len(),
                capacity_exhausted = report.capacity_exhausted,
                "Frame step"
            );
        }

        self.stats.absorb(&report);
        self.last_report = report.clone();
        report
    }

    /// Wait until `count` fetch results are queued for the next frame.
    ///
    /// For callers that pace frames on I/O rather than on a clock.
    pub async fn wait_for_completions(&mut self, count: usize) -> usize {
        self.scheduler.wait_for_completions(count).await
    }

    /// The read-only indirection view for the last frame.
    pub fn snapshot_indirection(&self) -> &IndirectionSnapshot {
        &self.snapshot
    }

    pub fn capacity(&self) -> usize {
        self.allocator.capacity()
    }

    pub fn resident_count(&self) -> usize {
        self.table.resident_count()
    }

    pub fn loading_count(&self) -> usize {
        self.table.loading_count()
    }

    pub fn miss_rate_last_frame(&self) -> f64 {
        self.last_report.miss_rate()
    }

    pub fn last_report(&self) -> &FrameReport {
        &self.last_report
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn load_stats(&self) -> &LoadStats {
        self.scheduler.stats()
    }

    pub fn scheduler(&self) -> &LoadScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Frames stepped so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn state(&self, key: &TileKey) -> TileState {
        match self.table.lookup(key).map(|e| e.residency) {
            None => TileState::Unknown,
            Some(Residency::Loading) => TileState::Loading,
            Some(Residency::Resident { .. }) => TileState::Resident,
        }
    }

    pub fn lookup(&self, key: &TileKey) -> Option<&IndirectionEntry> {
        self.table.lookup(key)
    }

    pub fn slot_of(&self, key: &TileKey) -> Option<PhysicalSlot> {
        self.table.lookup(key).and_then(|e| e.slot())
    }

    /// Resident keys from least to most recently used.
    pub fn recency_order(&self) -> Vec<TileKey> {
        self.recency.iter().collect()
    }

    /// Arrived tiles still waiting for a slot.
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Whether `key` gave up after exhausting its retries.
    pub fn is_given_up(&self, key: &TileKey) -> bool {
        matches!(self.failures.get(key), Some(r) if r.retry_at.is_none())
    }

    /// Keys with failure history still on record.
    pub fn failure_history_len(&self) -> usize {
        self.failures.len()
    }

    /// Slots not holding any tile.
    pub fn free_slots(&self) -> usize {
        self.allocator.free_count()
    }

    /// Let a key that gave up be fetched again the next time it is needed.
    pub fn forget_failure(&mut self, key: &TileKey) -> bool {
        self.failures.remove(key).is_some()
    }

    /// Clear all failure history, e.g. after the source was repaired.
    pub fn forget_failures(&mut self) {
        self.failures.clear();
    }

    /// Cross-check the allocator, recency tracker and table.
    ///
    /// Returns a description of every inconsistency found.
    pub fn check_invariants(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let resident = self.table.resident_count();

        if resident > self.capacity() {
            problems.push(format!("{resident} resident tiles exceed capacity {}", self.capacity()));
        }
        if self.allocator.allocated() != resident {
            problems.push(format!(
                "allocator holds {} slots but {resident} tiles are resident",
                self.allocator.allocated()
            ));
        }
        if self.recency.len() != resident {
            problems.push(format!(
                "recency tracks {} keys but {resident} tiles are resident",
                self.recency.len()
            ));
        }
        for key in self.recency.iter() {
            match self.table.lookup(&key).and_then(|e| e.slot()) {
                Some(slot) if self.allocator.owner(slot) == Some(key) => {}
                Some(slot) => problems.push(format!("slot {slot} of {key} owned by another tile")),
                None => problems.push(format!("{key} tracked as recent but not resident")),
            }
        }
        for (key, _) in &self.parked {
            if self.state(key) != TileState::Loading {
                problems.push(format!("parked tile {key} is not loading"));
            }
        }
        problems
    }

    fn install_protected(&mut self, needed: &[TileKey], report: &mut FrameReport) {
        self.protected.clear();
        for &key in needed {
            if !self.space.contains(&key) {
                warn!(key = %key, "Ignoring tile outside the virtual space");
                report.invalid_keys += 1;
                continue;
            }
            if !self.protected.insert(key) {
                debug!(key = %key, "Duplicate tile in needed list");
            }
        }
        report.needed = self.protected.len();
    }

    fn apply_completions(&mut self, report: &mut FrameReport) {
        let parked = std::mem::take(&mut self.parked);
        for (key, tile) in parked {
            self.commit(key, tile, report);
        }

        let stale_before = self.scheduler.stats().total_stale;
        let completions = self.scheduler.drain();
        report.stale_completions += (self.scheduler.stats().total_stale - stale_before) as usize;

        for completion in completions {
            match completion.result {
                Ok(tile) => self.commit(completion.key, tile, report),
                Err(err) => {
                    debug!(key = %completion.key, attempt = completion.attempt, error = %err, "Tile fetch failed");
                    self.fail(completion.key, err, report);
                }
            }
        }
    }

    /// LOADING → RESIDENT: place, upload and bind an arrived tile.
    fn commit(&mut self, key: TileKey, tile: TileData, report: &mut FrameReport) {
        if self.state(&key) != TileState::Loading {
            debug!(key = %key, "Discarding completion for tile that is not loading");
            report.stale_completions += 1;
            return;
        }

        let acquired = match self.allocator.acquire(key, &self.protected, &mut self.recency) {
            Ok(acquired) => acquired,
            Err(SlotError::CapacityExhausted { capacity }) => {
                debug!(key = %key, capacity, "No evictable slot, parking tile");
                report.capacity_exhausted += 1;
                self.parked.push_back((key, tile));
                return;
            }
            Err(err) => {
                error!(key = %key, error = %err, "Slot allocation failed");
                self.table.unbind(&key);
                return;
            }
        };

        if let Some(victim) = acquired.evicted {
            self.table.unbind(&victim);
            report.evicted.push(victim);
        }

        if let Err(err) = self.store.upload(acquired.slot, &tile) {
            warn!(key = %key, slot = %acquired.slot, error = %err, "Tile upload failed");
            self.release_slot(acquired.slot);
            self.fail(key, FetchError::Transient(err.to_string()), report);
            return;
        }

        if let Err(err) = self.table.bind(key, acquired.slot, self.frame) {
            error!(key = %key, error = %err, "Bind failed, releasing slot");
            self.release_slot(acquired.slot);
            self.fail(key, FetchError::Transient(err.to_string()), report);
            return;
        }

        self.recency.touch(key);
        self.failures.remove(&key);
        report.committed.push(key);
    }

    fn release_slot(&mut self, slot: PhysicalSlot) {
        match self.allocator.release(slot) {
            Ok(owner) => debug!(slot = %slot, owner = %owner, "Released slot"),
            Err(err) => error!(slot = %slot, error = %err, "Slot release failed"),
        }
    }

    /// LOADING → UNKNOWN, recording when (if ever) to retry.
    fn fail(&mut self, key: TileKey, err: FetchError, report: &mut FrameReport) {
        if self.table.unbind(&key).is_none() {
            report.stale_completions += 1;
            return;
        }
        report.failed.push(key);

        let failures = self.failures.get(&key).map_or(0, |r| r.failures) + 1;
        let retry_at = if err.is_permanent() {
            None
        } else {
            self.config
                .loader
                .retry
                .delay_after(failures)
                .map(|delay| self.frame + delay)
        };

        if retry_at.is_none() {
            report.given_up += 1;
            warn!(key = %key, failures, error = %err, "Giving up on tile, falling back to coarser mips");
        }
        self.failures.insert(
            key,
            FailureRecord {
                failures,
                retry_at,
                last_needed_frame: self.frame,
            },
        );
    }

    /// UNKNOWN → LOADING, unless the key is backing off or gave up.
    fn start_load(&mut self, key: TileKey, report: &mut FrameReport) {
        let attempt = match self.failures.get(&key) {
            None => 1,
            Some(FailureRecord { retry_at: None, .. }) => return,
            Some(FailureRecord {
                retry_at: Some(at), ..
            }) if self.frame < *at => return,
            Some(record) => record.failures + 1,
        };

        self.table.mark_loading(key, self.frame);
        if self.scheduler.request_attempt(key, attempt) {
            report.new_requests += 1;
            if attempt > 1 {
                report.retries += 1;
            }
        }
    }

    /// LOADING → CANCELLED for keys unrequested past the grace period.
    fn sweep_abandoned(&mut self, report: &mut FrameReport) {
        let grace = self.config.cache.grace_period_frames;
        for key in self.table.stale_loading(self.frame, grace) {
            if self.protected.contains(&key) {
                continue;
            }
            self.scheduler.cancel(&key);
            self.parked.retain(|(k, _)| *k != key);
            self.table.unbind(&key);
            report.cancelled.push(key);
        }

        let frame = self.frame;
        let before = self.failures.len();
        self.failures
            .retain(|_, record| frame.saturating_sub(record.last_needed_frame) <= grace);
        let expired = before - self.failures.len();
        if expired > 0 {
            debug!(expired, "Expired failure history of tiles out of view");
        }
    }

    fn publish_snapshot(&mut self) {
        let side = self.allocator.side();
        let mut snapshot = IndirectionSnapshot::new(self.frame);
        for key in self.protected.iter() {
            let location = self
                .table
                .lookup_with_fallback(key)
                .map(|fb| SampleLocation::from_fallback(&fb, side));
            snapshot.insert(*key, location);
        }
        self.snapshot = snapshot;
    }
}
