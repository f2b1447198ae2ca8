use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::metrics::{EDGE_CACHE_EVICTIONS_TOTAL, EDGE_CACHE_HITS_TOTAL, EDGE_CACHE_MISSES_TOTAL};

/// Tag carried by every edge-event read response
pub const EDGE_EVENTS_TAG: &str = "edge-events";

/// Cache key of a single edge event
pub fn edge_event_key(id: Uuid) -> String {
    format!("edge-event:{id}")
}

/// Signal that cached reads are stale.
///
/// Callers treat this as fire-and-forget: an error is logged, never
/// propagated into the request that triggered it.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn evict_tag(&self, tag: &str) -> Result<()>;
    async fn evict_key(&self, key: &str) -> Result<()>;
}

/// A cached JSON response
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: String,
    /// `X-Pagination` header value, for paged listings
    pub pagination: Option<String>,
    tags: Vec<String>,
    cached_at: Instant,
}

impl CachedResponse {
    pub fn new(body: String, pagination: Option<String>, tags: &[&str]) -> Self {
        Self {
            body,
            pagination,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            cached_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// TTL cache for edge-event read endpoints, evictable by key or tag.
pub struct ResponseCache {
    ttl: Duration,
    items: RwLock<HashMap<String, CachedResponse>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            items: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        if !self.enabled() {
            return None;
        }

        let mut items = self.items.write().await;
        match items.get(key) {
            Some(item) if !item.is_expired(self.ttl) => {
                EDGE_CACHE_HITS_TOTAL.inc();
                Some(item.clone())
            }
            Some(_) => {
                items.remove(key);
                EDGE_CACHE_MISSES_TOTAL.inc();
                None
            }
            None => {
                EDGE_CACHE_MISSES_TOTAL.inc();
                None
            }
        }
    }

    /// Insert a response, dropping any entries that have outlived the TTL
    pub async fn put(&self, key: impl Into<String>, response: CachedResponse) {
        if !self.enabled() {
            return;
        }

        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, item| !item.is_expired(self.ttl));
        let expired = before - items.len();
        if expired > 0 {
            debug!(expired, "swept expired cached responses");
        }
        items.insert(key.into(), response);
    }
}

#[async_trait]
impl CacheInvalidator for ResponseCache {
    async fn evict_tag(&self, tag: &str) -> Result<()> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, item| !item.tags.iter().any(|t| t == tag));
        let evicted = (before - items.len()) as u64;

        EDGE_CACHE_EVICTIONS_TOTAL.inc_by(evicted);
        debug!(tag = %tag, evicted, "evicted cached responses by tag");
        Ok(())
    }

    async fn evict_key(&self, key: &str) -> Result<()> {
        if self.items.write().await.remove(key).is_some() {
            EDGE_CACHE_EVICTIONS_TOTAL.inc();
            debug!(key = %key, "evicted cached response");
        }
        Ok(())
    }
}
