use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::time::Instant;

use super::ToolCallResult;

pub type SharedToolResult = Shared<BoxFuture<'static, ToolCallResult>>;

/// Logical identity of one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub session_id: String,
    pub tool: String,
    pub tool_call_id: String,
}

impl CacheKey {
    pub fn new(session_id: &str, tool: &str, tool_call_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            tool_call_id: tool_call_id.to_string(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.session_id, self.tool, self.tool_call_id)
    }
}

pub enum CacheLookup {
    Completed(ToolCallResult),
    InFlight(SharedToolResult),
    Miss,
}

enum CacheEntry {
    InFlight(SharedToolResult),
    Completed {
        result: ToolCallResult,
        deadline: Instant,
    },
}

/// Per-instance record of in-flight and recently completed tool calls.
///
/// An entry moves from in-flight to completed once and is evicted after the
/// retention window.
#[derive(Clone)]
pub struct IdempotencyCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    retention: Duration,
}

impl IdempotencyCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                retention,
            }),
        }
    }

    pub fn retention(&self) -> Duration {
        self.inner.retention
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, key: &CacheKey) -> CacheLookup {
        let mut entries = self.entries();
        Self::lookup_locked(&mut entries, key)
    }

    fn lookup_locked(entries: &mut HashMap<CacheKey, CacheEntry>, key: &CacheKey) -> CacheLookup {
        match entries.get(key) {
            Some(CacheEntry::InFlight(pending)) => CacheLookup::InFlight(pending.clone()),
            Some(CacheEntry::Completed { result, deadline }) if *deadline > Instant::now() => {
                CacheLookup::Completed(result.clone())
            }
            Some(CacheEntry::Completed { .. }) => {
                entries.remove(key);
                CacheLookup::Miss
            }
            None => CacheLookup::Miss,
        }
    }

    /// Returns the existing entry for `key`, or records `start()` as the
    /// in-flight execution. `start` runs under the cache lock, so it must only
    /// spawn, never await.
    pub fn get_or_start<F>(&self, key: &CacheKey, start: F) -> CacheLookup
    where
        F: FnOnce() -> BoxFuture<'static, ToolCallResult>,
    {
        let mut entries = self.entries();
        match Self::lookup_locked(&mut entries, key) {
            CacheLookup::Miss => {
                let pending = start().shared();
                entries.insert(key.clone(), CacheEntry::InFlight(pending.clone()));
                CacheLookup::InFlight(pending)
            }
            hit => hit,
        }
    }

    /// Stores the final result and schedules its eviction.
    pub fn complete(&self, key: &CacheKey, result: ToolCallResult) {
        let deadline = Instant::now() + self.inner.retention;
        self.entries().insert(
            key.clone(),
            CacheEntry::Completed {
                result,
                deadline,
            },
        );

        let cache = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut entries = cache.entries();
            let expired = matches!(
                entries.get(&key),
                Some(CacheEntry::Completed { deadline: current, .. }) if *current <= Instant::now()
            );
            if expired {
                entries.remove(&key);
                tracing::trace!(key = %key, "tool result evicted");
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for IdempotencyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyCache")
            .field("entries", &self.len())
            .field("retention", &self.inner.retention)
            .finish()
    }
}
