//! Per-RPC request metrics in Prometheus text exposition format

use crate::error::{Code, Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

const NAMESPACE: &str = "jiva_csi";

/// Request counter and latency histogram on a private registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "RPC requests by method and status code")
                .namespace(NAMESPACE),
            &["method", "code"],
        )
        .map_err(metrics_error)?;
        let duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "RPC latency by method")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
            &["method"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(requests.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            requests,
            duration,
        })
    }

    /// Record one finished call
    pub fn observe(&self, method: &str, code: Code, elapsed: Duration) {
        self.requests
            .with_label_values(&[method, code.as_str()])
            .inc();
        self.duration
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
    }

    /// Calls recorded for `method` with `code`
    pub fn request_count(&self, method: &str, code: Code) -> u64 {
        self.requests
            .with_label_values(&[method, code.as_str()])
            .get()
    }

    /// Text exposition of every metric, with its content type
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
