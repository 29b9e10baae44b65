//! Memory Interface
//!
//! Short-term memory is an ordered list of notes scoped to one run. Long-term
//! memory is keyed knowledge shared across runs, ranked by similarity to a
//! query and only ever changed through `upsert_long_term`.
//!
//! Components never write to a store directly. The reflector emits a
//! [`MemoryDelta`] and the orchestration loop applies it with [`apply_delta`].

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

pub mod similarity;

/// One short-term note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortTermEntry {
    /// Origin of the note, e.g. `reflection` or `goal`
    pub kind: String,
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
}

/// One long-term entry as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermEntry {
    pub key: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    /// Milliseconds since the Unix epoch; last writer wins
    pub updated_at: i64,
}

/// A ranked long-term retrieval result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermHit {
    pub key: String,
    pub content: String,
    pub score: f64,
}

/// Outcome of a long-term upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// The entry was inserted or replaced
    Applied,
    /// A newer write for the same key already exists; the entry was ignored
    Stale,
}

/// Read-only view of memory handed to the planner and reflector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub short_term: Vec<ShortTermEntry>,
    pub long_term: Vec<LongTermHit>,
}

impl MemorySnapshot {
    pub fn is_empty(&self) -> bool {
        self.short_term.is_empty() && self.long_term.is_empty()
    }

    /// Long-term hit stored under `key`, if retrieved
    pub fn long_term_entry(&self, key: &str) -> Option<&LongTermHit> {
        self.long_term.iter().find(|hit| hit.key == key)
    }
}

/// Short-term note emitted by the reflector, stamped when applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryNote {
    pub kind: String,
    pub content: String,
}

/// Long-term write emitted by the reflector, stamped when applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermWrite {
    pub key: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Memory changes produced by one reflection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryDelta {
    #[serde(default)]
    pub short_term: Vec<MemoryNote>,
    #[serde(default)]
    pub long_term: Vec<LongTermWrite>,
}

impl MemoryDelta {
    pub fn is_empty(&self) -> bool {
        self.short_term.is_empty() && self.long_term.is_empty()
    }

    pub fn merge(&mut self, other: MemoryDelta) {
        self.short_term.extend(other.short_term);
        self.long_term.extend(other.long_term);
    }
}

/// Storage backend for short-term and long-term memory
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Short-term notes of a run, oldest first
    async fn read_short_term(&self, run_id: &str) -> Result<Vec<ShortTermEntry>, EngineError>;

    async fn append_short_term(
        &self,
        run_id: &str,
        entry: ShortTermEntry,
    ) -> Result<(), EngineError>;

    /// Up to `k` long-term entries ranked by relevance to `query`, best first
    async fn query_long_term(&self, query: &str, k: usize)
        -> Result<Vec<LongTermHit>, EngineError>;

    /// Insert or replace an entry, unless a newer write for the key exists
    async fn upsert_long_term(&self, entry: LongTermEntry) -> Result<UpsertOutcome, EngineError>;
}

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Build a snapshot for planning.
///
/// Read failures are logged and treated as empty results.
pub async fn snapshot(
    store: &dyn MemoryStore,
    run_id: &str,
    query: &str,
    k: usize,
) -> MemorySnapshot {
    let short_term = match store.read_short_term(run_id).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Short-term memory read failed for {}: {}", run_id, e);
            Vec::new()
        }
    };

    let long_term = match store.query_long_term(query, k).await {
        Ok(hits) => hits,
        Err(e) => {
            tracing::warn!("Long-term memory query failed: {}", e);
            Vec::new()
        }
    };

    MemorySnapshot {
        short_term,
        long_term,
    }
}

/// Apply a reflector delta. Each write is retried once before the error is
/// returned.
pub async fn apply_delta(
    store: &dyn MemoryStore,
    run_id: &str,
    delta: &MemoryDelta,
) -> Result<(), EngineError> {
    for note in &delta.short_term {
        let entry = ShortTermEntry {
            kind: note.kind.clone(),
            content: note.content.clone(),
            created_at: now_millis(),
        };
        if let Err(e) = store.append_short_term(run_id, entry.clone()).await {
            tracing::warn!("Short-term append failed, retrying once: {}", e);
            store.append_short_term(run_id, entry).await?;
        }
    }

    for write in &delta.long_term {
        let entry = LongTermEntry {
            key: write.key.clone(),
            content: write.content.clone(),
            metadata: write.metadata.clone(),
            updated_at: now_millis(),
        };
        let outcome = match store.upsert_long_term(entry.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Long-term upsert failed, retrying once: {}", e);
                store.upsert_long_term(entry).await?
            }
        };
        if outcome == UpsertOutcome::Stale {
            tracing::debug!("Long-term write for {} superseded by a newer one", write.key);
        }
    }

    Ok(())
}

#[derive(Debug, Default)]
struct InMemoryState {
    short_term: HashMap<String, Vec<ShortTermEntry>>,
    long_term: HashMap<String, LongTermEntry>,
}

/// Process-local memory store
///
/// A single async lock guards both maps, so upserts to the same key are
/// serialized and the `updated_at` comparison is never raced.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored long-term entry for `key`
    pub async fn long_term(&self, key: &str) -> Option<LongTermEntry> {
        self.state.lock().await.long_term.get(key).cloned()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn read_short_term(&self, run_id: &str) -> Result<Vec<ShortTermEntry>, EngineError> {
        Ok(self
            .state
            .lock()
            .await
            .short_term
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_short_term(
        &self,
        run_id: &str,
        entry: ShortTermEntry,
    ) -> Result<(), EngineError> {
        self.state
            .lock()
            .await
            .short_term
            .entry(run_id.to_string())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn query_long_term(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<LongTermHit>, EngineError> {
        let state = self.state.lock().await;

        let mut hits: Vec<LongTermHit> = state
            .long_term
            .values()
            .filter_map(|entry| {
                let score = similarity::cosine(query, &format!("{} {}", entry.key, entry.content));
                (score > 0.0).then(|| LongTermHit {
                    key: entry.key.clone(),
                    content: entry.content.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn upsert_long_term(&self, entry: LongTermEntry) -> Result<UpsertOutcome, EngineError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.long_term.get(&entry.key) {
            if existing.updated_at > entry.updated_at {
                return Ok(UpsertOutcome::Stale);
            }
        }

        state.long_term.insert(entry.key.clone(), entry);
        Ok(UpsertOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(key: &str, content: &str, updated_at: i64) -> LongTermEntry {
        LongTermEntry {
            key: key.to_string(),
            content: content.to_string(),
            metadata: json!({}),
            updated_at,
        }
    }

    #[tokio::test]
    async fn test_short_term_is_scoped_per_run() {
        let store = InMemoryStore::new();
        let note = ShortTermEntry {
            kind: "reflection".into(),
            content: "one".into(),
            created_at: 1,
        };

        store.append_short_term("run_a", note.clone()).await.unwrap();

        assert_eq!(store.read_short_term("run_a").await.unwrap(), vec![note]);
        assert!(store.read_short_term("run_b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = InMemoryStore::new();

        assert_eq!(
            store.upsert_long_term(entry("k", "new", 20)).await.unwrap(),
            UpsertOutcome::Applied
        );
        assert_eq!(
            store.upsert_long_term(entry("k", "old", 10)).await.unwrap(),
            UpsertOutcome::Stale
        );

        assert_eq!(store.long_term("k").await.unwrap().content, "new");
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity() {
        let store = InMemoryStore::new();
        store
            .upsert_long_term(entry("rust", "tokio async runtime for rust", 1))
            .await
            .unwrap();
        store
            .upsert_long_term(entry("garden", "tomatoes need sun", 1))
            .await
            .unwrap();

        let hits = store.query_long_term("rust async", 5).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "rust");
    }

    /// Fails the first call of each kind, then delegates
    struct Flaky {
        inner: InMemoryStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl MemoryStore for Flaky {
        async fn read_short_term(&self, _run_id: &str) -> Result<Vec<ShortTermEntry>, EngineError> {
            Err(EngineError::Memory("unreadable".into()))
        }

        async fn append_short_term(
            &self,
            run_id: &str,
            entry: ShortTermEntry,
        ) -> Result<(), EngineError> {
            if self.failures.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(EngineError::Memory("busy".into()));
            }
            self.inner.append_short_term(run_id, entry).await
        }

        async fn query_long_term(
            &self,
            _query: &str,
            _k: usize,
        ) -> Result<Vec<LongTermHit>, EngineError> {
            Err(EngineError::Memory("unreadable".into()))
        }

        async fn upsert_long_term(
            &self,
            entry: LongTermEntry,
        ) -> Result<UpsertOutcome, EngineError> {
            self.inner.upsert_long_term(entry).await
        }
    }

    #[tokio::test]
    async fn test_failed_reads_degrade_to_empty_snapshot() {
        let store = Flaky {
            inner: InMemoryStore::new(),
            failures: AtomicUsize::new(0),
        };

        let snap = snapshot(&store, "run_1", "anything", 5).await;
        assert!(snap.is_empty());
    }

    #[tokio::test]
    async fn test_apply_delta_retries_write_once() {
        let store = Flaky {
            inner: InMemoryStore::new(),
            failures: AtomicUsize::new(0),
        };
        let delta = MemoryDelta {
            short_term: vec![MemoryNote {
                kind: "reflection".into(),
                content: "iteration 1".into(),
            }],
            long_term: vec![],
        };

        apply_delta(&store, "run_1", &delta).await.unwrap();

        let notes = store.inner.read_short_term("run_1").await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].content, "iteration 1");
    }
}
