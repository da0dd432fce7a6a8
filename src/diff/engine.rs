//! Hash-join set difference over two streams
//!
//! `DiffEngine::compare` drains the base stream and the compare stream into
//! hash-keyed maps, then emits one classification per distinct hash:
//!
//! - present only in base    => `Removed`
//! - present only in compare => `Added`
//! - present in both         => `Unchanged` (both values paired)
//!
//! There is no notion of position or alignment, only membership by hash.
//! Both inputs are buffered in full before the first result is produced,
//! so memory grows with `len(base) + len(compare)`. Scan result sets are
//! bounded per task, which keeps this acceptable; very large inputs would
//! need a sorted merge-join instead.
//!
//! Every item moves the signed per-hash counter, so duplicates count: base
//! `[a, a]` against compare `[a]` leaves `a` at +1 and classifies it as
//! `Removed`. Each side keeps the first value seen for a hash.

use std::collections::HashMap;
use std::sync::Arc;
use futures::{Stream, StreamExt};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Caller-supplied identity function
pub type HashFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Lazy, finite, non-restartable sequence of classifications
pub type DiffStream<T> = ReceiverStream<DiffResult<T>>;

/// Classification label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffStatus {
    Added,
    Removed,
    Unchanged,
}

/// One classified item
#[derive(Debug, Clone, PartialEq)]
pub enum DiffResult<T> {
    Added { hash: String, compare: T },
    Removed { hash: String, base: T },
    Unchanged { hash: String, base: T, compare: T },
}

impl<T> DiffResult<T> {
    pub fn status(&self) -> DiffStatus {
        match self {
            DiffResult::Added { .. } => DiffStatus::Added,
            DiffResult::Removed { .. } => DiffStatus::Removed,
            DiffResult::Unchanged { .. } => DiffStatus::Unchanged,
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            DiffResult::Added { hash, .. }
            | DiffResult::Removed { hash, .. }
            | DiffResult::Unchanged { hash, .. } => hash,
        }
    }

    pub fn base(&self) -> Option<&T> {
        match self {
            DiffResult::Removed { base, .. } | DiffResult::Unchanged { base, .. } => Some(base),
            DiffResult::Added { .. } => None,
        }
    }

    pub fn compare(&self) -> Option<&T> {
        match self {
            DiffResult::Added { compare, .. } | DiffResult::Unchanged { compare, .. } => Some(compare),
            DiffResult::Removed { .. } => None,
        }
    }
}

/// Running totals over a diff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl DiffSummary {
    pub fn record<T>(&mut self, result: &DiffResult<T>) {
        match result.status() {
            DiffStatus::Added => self.added += 1,
            DiffStatus::Removed => self.removed += 1,
            DiffStatus::Unchanged => self.unchanged += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.added + self.removed + self.unchanged
    }
}

/// Generic streaming set-diff
#[derive(Debug, Clone)]
pub struct DiffEngine {
    channel_capacity: usize,
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new(64)
    }
}

impl DiffEngine {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Compare two streams by `hash`.
    ///
    /// Without a hash function the result is an empty stream and a
    /// configuration error is logged. The producer stops early and closes
    /// the stream when `cancel` fires or the consumer drops the stream.
    pub fn compare<T, B, C>(
        &self,
        base: B,
        compare: C,
        hash: Option<HashFn<T>>,
        cancel: CancellationToken,
    ) -> DiffStream<T>
    where
        T: Send + 'static,
        B: Stream<Item = T> + Send + 'static,
        C: Stream<Item = T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.channel_capacity);

        let Some(hash) = hash else {
            error!("Diff requested without a hash function; producing no results");
            return ReceiverStream::new(rx);
        };

        tokio::spawn(async move {
            let mut table = DiffTable::default();

            if !table.drain(base, &hash, 1, &cancel).await {
                debug!("Diff cancelled while reading base sequence");
                return;
            }
            if !table.drain(compare, &hash, -1, &cancel).await {
                debug!("Diff cancelled while reading compare sequence");
                return;
            }

            let total = table.order.len();
            for result in table.into_results() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Diff cancelled while emitting results");
                        return;
                    }
                    sent = tx.send(result) => {
                        if sent.is_err() {
                            debug!("Diff consumer went away; stopping producer");
                            return;
                        }
                    }
                }
            }
            debug!("Diff emitted {} classifications", total);
        });

        ReceiverStream::new(rx)
    }
}

/// Hash-keyed buffers for both sides plus the signed membership counter
struct DiffTable<T> {
    counter: HashMap<String, i64>,
    base: HashMap<String, T>,
    compare: HashMap<String, T>,
    /// First-seen order of distinct hashes
    order: Vec<String>,
}

impl<T> Default for DiffTable<T> {
    fn default() -> Self {
        Self {
            counter: HashMap::new(),
            base: HashMap::new(),
            compare: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<T> DiffTable<T> {
    /// Drain one side; returns false if cancelled first
    async fn drain<S>(&mut self, side: S, hash: &HashFn<T>, delta: i64, cancel: &CancellationToken) -> bool
    where
        S: Stream<Item = T>,
    {
        futures::pin_mut!(side);
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                item = side.next() => item,
            };
            let Some(item) = item else { return true };

            let key = hash(&item);
            let values = if delta > 0 { &mut self.base } else { &mut self.compare };
            values.entry(key.clone()).or_insert(item);

            match self.counter.get_mut(&key) {
                Some(count) => *count += delta,
                None => {
                    self.counter.insert(key.clone(), delta);
                    self.order.push(key);
                }
            }
        }
    }

    fn into_results(mut self) -> Vec<DiffResult<T>> {
        let mut results = Vec::with_capacity(self.order.len());
        for hash in self.order {
            let count = self.counter.get(&hash).copied().unwrap_or(0);
            let result = if count > 0 {
                self.base.remove(&hash).map(|base| DiffResult::Removed { hash, base })
            } else if count < 0 {
                self.compare.remove(&hash).map(|compare| DiffResult::Added { hash, compare })
            } else {
                match (self.base.remove(&hash), self.compare.remove(&hash)) {
                    (Some(base), Some(compare)) => Some(DiffResult::Unchanged { hash, base, compare }),
                    _ => None,
                }
            };
            results.extend(result);
        }
        results
    }
}
