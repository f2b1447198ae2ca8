use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::edge_events::{
    CreateEdgeEventRequest, EdgeEvent, EdgeEventFilter, PageRequest, PagedResult,
};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::store::EdgeEventStore;

const SELECT_COLUMNS: &str = "SELECT id, capture_timestamp_utc, created_utc, camera_id, \
     compute_model, compute_inference_ms, image_width, image_height, detections, \
     frame_raw_url, frame_annotated_url FROM edge_events";

#[derive(Debug, sqlx::FromRow)]
struct EdgeEventRow {
    id: Uuid,
    capture_timestamp_utc: DateTime<Utc>,
    created_utc: DateTime<Utc>,
    camera_id: String,
    compute_model: Option<String>,
    compute_inference_ms: Option<f64>,
    image_width: Option<i32>,
    image_height: Option<i32>,
    detections: Option<String>,
    frame_raw_url: Option<String>,
    frame_annotated_url: Option<String>,
}

impl From<EdgeEventRow> for EdgeEvent {
    fn from(row: EdgeEventRow) -> Self {
        EdgeEvent {
            id: row.id,
            capture_timestamp_utc: row.capture_timestamp_utc,
            created_utc: row.created_utc,
            camera_id: row.camera_id,
            compute_model: row.compute_model,
            compute_inference_ms: row.compute_inference_ms,
            image_width: row.image_width,
            image_height: row.image_height,
            detections: row.detections,
            frame_raw_url: row.frame_raw_url,
            frame_annotated_url: row.frame_annotated_url,
        }
    }
}

#[derive(Clone)]
pub struct PgEdgeEventStore {
    pool: PgPool,
}

impl PgEdgeEventStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &EdgeEventFilter) {
        builder.push(" WHERE 1=1");

        if let Some(term) = filter.search_term() {
            let pattern = format!("%{}%", escape_like(term));
            builder.push(" AND (camera_id ILIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR frame_raw_url ILIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR frame_annotated_url ILIKE ");
            builder.push_bind(pattern);
            builder.push(")");
        }
        if let Some(from) = filter.from_utc {
            builder.push(" AND capture_timestamp_utc >= ");
            builder.push_bind(from);
        }
        if let Some(to) = filter.to_utc {
            builder.push(" AND capture_timestamp_utc <= ");
            builder.push_bind(to);
        }
    }
}

/// Escape LIKE wildcards so the search term matches literally
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl EdgeEventStore for PgEdgeEventStore {
    async fn create(&self, request: CreateEdgeEventRequest) -> Result<EdgeEvent> {
        let event = request.into_event(Utc::now());

        let row = sqlx::query_as::<_, EdgeEventRow>(
            r#"
            INSERT INTO edge_events (id, capture_timestamp_utc, created_utc, camera_id,
                                     compute_model, compute_inference_ms, image_width,
                                     image_height, detections, frame_raw_url, frame_annotated_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, capture_timestamp_utc, created_utc, camera_id, compute_model,
                      compute_inference_ms, image_width, image_height, detections,
                      frame_raw_url, frame_annotated_url
            "#,
        )
        .bind(event.id)
        .bind(event.capture_timestamp_utc)
        .bind(event.created_utc)
        .bind(&event.camera_id)
        .bind(&event.compute_model)
        .bind(event.compute_inference_ms)
        .bind(event.image_width)
        .bind(event.image_height)
        .bind(&event.detections)
        .bind(&event.frame_raw_url)
        .bind(&event.frame_annotated_url)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert edge event")?;

        Ok(row.into())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EdgeEvent>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");
        let row = sqlx::query_as::<_, EdgeEventRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get edge event")?;

        Ok(row.map(Into::into))
    }

    async fn list_page(
        &self,
        filter: &EdgeEventFilter,
        page: PageRequest,
    ) -> Result<PagedResult<EdgeEvent>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM edge_events");
        Self::push_filter(&mut count, filter);
        let total_count: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context("failed to count edge events")?;

        let mut query = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        Self::push_filter(&mut query, filter);
        query.push(" ORDER BY created_utc DESC LIMIT ");
        query.push_bind(page.page_size);
        query.push(" OFFSET ");
        query.push_bind(page.offset());

        let rows = query
            .build_query_as::<EdgeEventRow>()
            .fetch_all(&self.pool)
            .await
            .context("failed to list edge events")?;

        Ok(PagedResult {
            items: rows.into_iter().map(Into::into).collect(),
            total_count,
            page_number: page.page_number,
            page_size: page.page_size,
        })
    }

    async fn list_all(&self, filter: &EdgeEventFilter) -> Result<Vec<EdgeEvent>> {
        let mut query = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        Self::push_filter(&mut query, filter);
        query.push(" ORDER BY created_utc DESC");

        let rows = query
            .build_query_as::<EdgeEventRow>()
            .fetch_all(&self.pool)
            .await
            .context("failed to list edge events")?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM edge_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete edge event")?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database health check failed")?;
        Ok(())
    }
}
