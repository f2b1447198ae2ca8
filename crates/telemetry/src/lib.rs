//! Logging and request-correlation plumbing shared by the edge services.

pub mod correlation;
pub mod logging;

pub use correlation::{CorrelationId, CorrelationIdLayer, X_CORRELATION_ID, X_REQUEST_ID};
pub use logging::{init_structured_logging, init_with_service, LogConfig, LogFormat, LoggingGuard};
