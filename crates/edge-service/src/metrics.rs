#![allow(clippy::expect_used)]

use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static EDGE_INGEST_ACCEPTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("edge_ingest_accepted_total", "Edge uploads persisted")
        .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static EDGE_INGEST_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("edge_ingest_rejected_total", "Edge uploads rejected, by reason"),
        &["reason"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static EDGE_CACHE_HITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("edge_cache_hits_total", "Edge-event reads served from cache")
        .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static EDGE_CACHE_MISSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("edge_cache_misses_total", "Edge-event reads that missed the cache")
        .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static EDGE_CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("edge_cache_evictions_total", "Cached responses evicted on writes")
        .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TIMELAPSE_RUNS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("timelapse_runs_total", "Timelapse runs started").expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TIMELAPSE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("timelapse_failures_total", "Timelapse runs that failed, by reason"),
        &["reason"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TIMELAPSE_FRAMES_FETCHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "timelapse_frames_fetched_total",
        "Frames materialized for timelapse runs",
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TIMELAPSE_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new("timelapse_duration_seconds", "Wall time of successful timelapse runs")
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

/// Short label for a pipeline failure
pub fn reason(err: &crate::error::PipelineError) -> &'static str {
    use crate::error::PipelineError::*;
    match err {
        MetadataParse(_) => "metadata_parse",
        Validation(_) => "validation",
        UnsupportedMedia(_) => "unsupported_media",
        InsufficientFrames { .. } => "insufficient_frames",
        FrameFetch { .. } => "frame_fetch",
        EncoderNotFound(_) => "encoder_not_found",
        EncodingFailed(_) => "encoding_failed",
        Cancelled => "cancelled",
        Storage(_) => "storage",
        Repository(_) => "repository",
    }
}

pub fn render() -> String {
    // Touch every metric so it appears in the output before first use
    Lazy::force(&EDGE_INGEST_ACCEPTED_TOTAL);
    Lazy::force(&EDGE_INGEST_REJECTED_TOTAL);
    Lazy::force(&EDGE_CACHE_HITS_TOTAL);
    Lazy::force(&EDGE_CACHE_MISSES_TOTAL);
    Lazy::force(&EDGE_CACHE_EVICTIONS_TOTAL);
    Lazy::force(&TIMELAPSE_RUNS_TOTAL);
    Lazy::force(&TIMELAPSE_FAILURES_TOTAL);
    Lazy::force(&TIMELAPSE_FRAMES_FETCHED_TOTAL);
    Lazy::force(&TIMELAPSE_DURATION_SECONDS);

    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    let mfs = REGISTRY.gather();
    encoder.encode(&mfs, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
