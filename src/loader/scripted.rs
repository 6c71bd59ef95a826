//! A tile source whose fetches resolve only when the caller says so.
//!
//! Used to drive the cache deterministically: each fetch parks on a oneshot
//! until [`ScriptedSource::complete`] or [`ScriptedSource::fail`] is called
//! for its key. A result scripted before the fetch starts is returned
//! immediately.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::cache::key::TileKey;
use crate::loader::source::{FetchError, TileData, TileSource};

type FetchResult = Result<TileData, FetchError>;

enum Outcome {
    Ready(FetchResult),
    Wait(oneshot::Receiver<FetchResult>),
}

#[derive(Default)]
struct Script {
    waiting: HashMap<TileKey, Vec<oneshot::Sender<FetchResult>>>,
    ready: HashMap<TileKey, VecDeque<FetchResult>>,
    fetches: HashMap<TileKey, u32>,
    cancels: HashMap<TileKey, u32>,
}

#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<Script>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the outstanding (or next) fetch of `key` with `tile`.
    pub fn complete(&self, key: TileKey, tile: TileData) {
        self.resolve(key, Ok(tile));
    }

    /// Resolve the outstanding (or next) fetch of `key` with `error`.
    pub fn fail(&self, key: TileKey, error: FetchError) {
        self.resolve(key, Err(error));
    }

    /// How many times `key` has been fetched.
    pub fn fetch_count(&self, key: &TileKey) -> u32 {
        self.with_script(|s| s.fetches.get(key).copied().unwrap_or(0))
    }

    /// How many cancel hints `key` has received.
    pub fn cancel_count(&self, key: &TileKey) -> u32 {
        self.with_script(|s| s.cancels.get(key).copied().unwrap_or(0))
    }

    fn resolve(&self, key: TileKey, result: FetchResult) {
        self.with_script(|s| {
            let waiter = s.waiting.get_mut(&key).and_then(|w| {
                if w.is_empty() {
                    None
                } else {
                    Some(w.remove(0))
                }
            });
            match waiter {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => {
                    s.ready.entry(key).or_default().push_back(result);
                }
            }
        })
    }

    fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut guard = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait]
impl TileSource for ScriptedSource {
    async fn fetch(&self, key: TileKey) -> Result<TileData, FetchError> {
        let outcome = self.with_script(|s| {
            *s.fetches.entry(key).or_insert(0) += 1;
            if let Some(result) = s.ready.get_mut(&key).and_then(|r| r.pop_front()) {
                return Outcome::Ready(result);
            }
            let (tx, rx) = oneshot::channel();
            s.waiting.entry(key).or_default().push(tx);
            Outcome::Wait(rx)
        });

        match outcome {
            Outcome::Ready(result) => result,
            Outcome::Wait(rx) => rx
                .await
                .unwrap_or_else(|_| Err(FetchError::Transient("script dropped".to_string()))),
        }
    }

    fn cancel(&self, key: TileKey) {
        self.with_script(|s| *s.cancels.entry(key).or_insert(0) += 1);
    }
}
