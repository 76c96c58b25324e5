//! Batched key-value reads and writes against a page-limited table.
//!
//! The underlying store accepts at most 100 keys per read page and 25
//! operations per write page, and either page call may hand back an
//! "unprocessed" residue under load. The free functions here chunk the
//! request, run pages concurrently, and retry residue with exponential
//! backoff. Residue surviving the last attempt is logged and reported back
//! as a best-effort shortfall; it never fails the caller.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::util::chunk_vec;

pub const READ_PAGE_LIMIT: usize = 100;
pub const WRITE_PAGE_LIMIT: usize = 25;
pub const MAX_ATTEMPTS: u32 = 4;

/// One write operation against a composite-key table.
#[derive(Debug, Clone)]
pub enum WriteOp<K, R> {
    Put(K, R),
    Delete(K),
}

impl<K: Clone, R> WriteOp<K, R> {
    pub fn key(&self) -> K {
        match self {
            WriteOp::Put(k, _) => k.clone(),
            WriteOp::Delete(k) => k.clone(),
        }
    }
}

/// Result of a single read page: records found plus any residue the store
/// declined to process this round.
pub struct BatchGetPage<K, R> {
    pub found: Vec<(K, R)>,
    pub unprocessed: Vec<K>,
}

/// A composite-key table supporting page-limited batch reads and writes.
///
/// Page calls must be safe to run concurrently against the same store.
#[async_trait]
pub trait BatchTable: Sync {
    type Key: Clone + Eq + Hash + Debug + Send + Sync;
    type Record: Clone + Send + Sync;

    /// Read up to [`READ_PAGE_LIMIT`] keys. Missing keys are simply absent
    /// from `found`; overloaded stores may return them in `unprocessed`.
    async fn batch_get_page(
        &self,
        keys: &[Self::Key],
    ) -> anyhow::Result<BatchGetPage<Self::Key, Self::Record>>;

    /// Apply up to [`WRITE_PAGE_LIMIT`] puts/deletes, returning the
    /// operations the store declined to process.
    async fn batch_write_page(
        &self,
        ops: Vec<WriteOp<Self::Key, Self::Record>>,
    ) -> anyhow::Result<Vec<WriteOp<Self::Key, Self::Record>>>;
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(100 * 2u64.pow(attempt - 1))
}

/// Batched read of an arbitrary key set. Returns whatever could be read;
/// keys still unprocessed after the retry budget are logged and dropped.
pub async fn batch_get<T: BatchTable>(
    table: &T,
    keys: Vec<T::Key>,
) -> anyhow::Result<HashMap<T::Key, T::Record>> {
    let mut results = HashMap::with_capacity(keys.len());
    let mut pending = keys;

    for attempt in 1..=MAX_ATTEMPTS {
        if pending.is_empty() {
            break;
        }
        if attempt > 1 {
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
        }
        let pages = chunk_vec(pending, READ_PAGE_LIMIT);
        let outcomes = join_all(pages.iter().map(|page| table.batch_get_page(page))).await;
        pending = Vec::new();
        for outcome in outcomes {
            let page = outcome?;
            results.extend(page.found);
            pending.extend(page.unprocessed);
        }
    }

    if !pending.is_empty() {
        tracing::warn!(
            "batch read left {} keys unprocessed after {MAX_ATTEMPTS} attempts: {:?}",
            pending.len(),
            pending,
        );
    }
    Ok(results)
}

/// Batched write of puts/deletes. Returns the shortfall count: operations
/// still unprocessed after the retry budget, logged but not raised.
pub async fn batch_write<T: BatchTable>(
    table: &T,
    ops: Vec<WriteOp<T::Key, T::Record>>,
) -> anyhow::Result<usize> {
    let mut pending = ops;

    for attempt in 1..=MAX_ATTEMPTS {
        if pending.is_empty() {
            break;
        }
        if attempt > 1 {
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
        }
        let pages = chunk_vec(pending, WRITE_PAGE_LIMIT);
        let outcomes = join_all(pages.into_iter().map(|page| table.batch_write_page(page))).await;
        pending = Vec::new();
        for outcome in outcomes {
            pending.extend(outcome?);
        }
    }

    if !pending.is_empty() {
        let keys: Vec<_> = pending.iter().map(|op| op.key()).collect();
        tracing::warn!(
            "batch write left {} operations unprocessed after {MAX_ATTEMPTS} attempts: {keys:?}",
            pending.len(),
        );
    }
    Ok(pending.len())
}
