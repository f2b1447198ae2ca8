use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use common::edge_events::{
    CreateEdgeEventRequest, EdgeEvent, EdgeEventFilter, PageRequest, PagedResult,
};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence for edge events.
///
/// Every query orders by creation time, newest first. Consumers that need a
/// different order (the frame selector) sort on their own.
#[async_trait]
pub trait EdgeEventStore: Send + Sync {
    async fn create(&self, request: CreateEdgeEventRequest) -> Result<EdgeEvent>;
    async fn get(&self, id: Uuid) -> Result<Option<EdgeEvent>>;
    async fn list_page(
        &self,
        filter: &EdgeEventFilter,
        page: PageRequest,
    ) -> Result<PagedResult<EdgeEvent>>;
    async fn list_all(&self, filter: &EdgeEventFilter) -> Result<Vec<EdgeEvent>>;
    /// Returns whether a record was removed
    async fn delete(&self, id: Uuid) -> Result<bool>;
    async fn health_check(&self) -> Result<()>;
}

/// Process-local store used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryEdgeEventStore {
    events: RwLock<Vec<EdgeEvent>>,
}

impl MemoryEdgeEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed record, keeping its id and timestamps
    pub async fn insert(&self, event: EdgeEvent) {
        self.events.write().await.push(event);
    }

    async fn matching(&self, filter: &EdgeEventFilter) -> Vec<EdgeEvent> {
        let events = self.events.read().await;
        let mut matched: Vec<EdgeEvent> =
            events.iter().filter(|e| filter.matches(e)).cloned().collect();
        matched.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        matched
    }
}

#[async_trait]
impl EdgeEventStore for MemoryEdgeEventStore {
    async fn create(&self, request: CreateEdgeEventRequest) -> Result<EdgeEvent> {
        let event = request.into_event(Utc::now());
        self.events.write().await.push(event.clone());
        Ok(event)
    }

    async fn get(&self, id: Uuid) -> Result<Option<EdgeEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().find(|e| e.id == id).cloned())
    }

    async fn list_page(
        &self,
        filter: &EdgeEventFilter,
        page: PageRequest,
    ) -> Result<PagedResult<EdgeEvent>> {
        let matched = self.matching(filter).await;
        let total_count = matched.len() as i64;
        let items = matched
            .into_iter()
            .skip(page.offset().max(0) as usize)
            .take(page.page_size as usize)
            .collect();

        Ok(PagedResult {
            items,
            total_count,
            page_number: page.page_number,
            page_size: page.page_size,
        })
    }

    async fn list_all(&self, filter: &EdgeEventFilter) -> Result<Vec<EdgeEvent>> {
        Ok(self.matching(filter).await)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.id != id);
        Ok(events.len() != before)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
