use axum::http::{HeaderMap, HeaderValue, Request, Response};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;
use uuid::Uuid;

/// HTTP header name for correlation ID
pub const X_CORRELATION_ID: &str = "x-correlation-id";

/// HTTP header name for request ID (same as correlation ID)
pub const X_REQUEST_ID: &str = "x-request-id";

/// Longest client-supplied id that is accepted as-is
pub const MAX_CORRELATION_ID_LENGTH: usize = 128;

pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

fn acceptable(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_CORRELATION_ID_LENGTH
        && value.bytes().all(|b| b.is_ascii_graphic())
}

/// Incoming `x-correlation-id` (then `x-request-id`), or a fresh UUID when
/// neither is present and well-formed
pub fn extract_or_generate_correlation_id(headers: &HeaderMap) -> String {
    [X_CORRELATION_ID, X_REQUEST_ID]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|h| h.to_str().ok())
        .map(str::trim)
        .find(|v| acceptable(v))
        .map(str::to_string)
        .unwrap_or_else(generate_correlation_id)
}

/// Tags each request with a correlation id.
///
/// The id is stored in request extensions as [`CorrelationId`], recorded on
/// an `http_request` span wrapping the whole request, and echoed back in the
/// `x-correlation-id` response header.
#[derive(Clone, Default)]
pub struct CorrelationIdLayer;

impl CorrelationIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for CorrelationIdLayer {
    type Service = CorrelationIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationIdService { inner }
    }
}

#[derive(Clone)]
pub struct CorrelationIdService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CorrelationIdService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let correlation_id = extract_or_generate_correlation_id(req.headers());
        let header = HeaderValue::from_str(&correlation_id).ok();

        if let Some(value) = &header {
            req.headers_mut().insert(X_CORRELATION_ID, value.clone());
        }
        req.extensions_mut()
            .insert(CorrelationId(correlation_id.clone()));

        let span = tracing::info_span!(
            "http_request",
            correlation_id = %correlation_id,
            method = %req.method(),
            path = %req.uri().path(),
        );
        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let mut response = fut.await?;
                if let Some(value) = header {
                    response.headers_mut().insert(X_CORRELATION_ID, value);
                }
                Ok(response)
            }
            .instrument(span),
        )
    }
}

/// Correlation ID wrapper for use in request extensions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
