pub mod blob_store;
pub mod cache;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metadata;
pub mod metrics;
pub mod pg_store;
pub mod routes;
pub mod state;
pub mod store;
pub mod timelapse;

pub use config::EdgeServiceConfig;
pub use error::{ApiError, PipelineError};
pub use routes::create_router;
pub use state::EdgeState;
pub use store::{EdgeEventStore, MemoryEdgeEventStore};
