//! Prometheus metrics for the HTTP surface.
//!
//! Families:
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `app_requests_total` | Counter | `handler`, `method`, `status` |
//! | `app_requests_5xx_total` | Counter | `handler`, `method` |
//! | `app_request_latency_seconds` | Histogram | `handler`, `method` |
//!
//! Metrics are registered against a private registry so tests can build
//! isolated instances.

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Latency buckets in seconds.
const LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Request metrics shared by all handlers.
#[derive(Clone)]
pub struct HttpMetrics {
    registry: Registry,
    requests_total: CounterVec,
    requests_5xx: CounterVec,
    latency: HistogramVec,
}

impl HttpMetrics {
    /// Create and register all metric families.
    ///
    /// # Errors
    /// Returns an error if a family fails to register.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("app_requests_total", "Total HTTP requests"),
            &["handler", "method", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_5xx = CounterVec::new(
            Opts::new("app_requests_5xx_total", "Total HTTP 5xx responses"),
            &["handler", "method"],
        )?;
        registry.register(Box::new(requests_5xx.clone()))?;

        let latency = HistogramVec::new(
            HistogramOpts::new("app_request_latency_seconds", "HTTP request latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["handler", "method"],
        )?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_5xx,
            latency,
        })
    }

    /// Record one completed request.
    pub fn observe(&self, handler: &str, method: &str, status: u16, seconds: f64) {
        let status_str = status.to_string();
        self.requests_total
            .with_label_values(&[handler, method, status_str.as_str()])
            .inc();
        if (500..600).contains(&status) {
            self.requests_5xx.with_label_values(&[handler, method]).inc();
        }
        self.latency
            .with_label_values(&[handler, method])
            .observe(seconds);
    }

    /// Render the text exposition format.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_families_rendered() {
        let metrics = HttpMetrics::new().expect("Should build metrics");
        metrics.observe("/dau/{day}", "GET", 200, 0.02);
        metrics.observe("/dau/{day}", "GET", 500, 1.3);
        metrics.observe("/event", "POST", 202, 0.07);

        let text = metrics.encode_text().expect("Should encode");
        assert!(text.contains("app_requests_total"));
        assert!(text.contains("app_requests_5xx_total"));
        assert!(text.contains("app_request_latency_seconds_bucket"));
        assert!(text.contains("app_request_latency_seconds_sum"));
        assert!(text.contains("app_request_latency_seconds_count"));
        assert!(text.contains(r#"handler="/dau/{day}",method="GET",status="200""#));
    }

    #[test]
    fn test_5xx_counted_separately() {
        let metrics = HttpMetrics::new().expect("Should build metrics");
        metrics.observe("/mau", "GET", 200, 0.01);
        metrics.observe("/mau", "GET", 503, 0.01);

        let text = metrics.encode_text().expect("Should encode");
        assert!(text.contains(r#"app_requests_5xx_total{handler="/mau",method="GET"} 1"#));
    }
}
