#![cfg(feature = "metrics")]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

pub struct MetricsContext {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration: HistogramVec,
    online_users: IntGauge,
    live_connections: IntGauge,
    attachment_jobs_in_flight: IntGauge,
    attachment_outcomes: IntCounterVec,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "parley_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "parley_http_request_duration_seconds",
                "HTTP request latency, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_request_duration.clone()))?;

        let online_users = IntGauge::new("parley_online_users", "Users with a live connection")?;
        registry.register(Box::new(online_users.clone()))?;

        let live_connections =
            IntGauge::new("parley_live_connections", "Open WebSocket connections")?;
        registry.register(Box::new(live_connections.clone()))?;

        let attachment_jobs_in_flight = IntGauge::new(
            "parley_attachment_jobs_in_flight",
            "Upload jobs queued or running",
        )?;
        registry.register(Box::new(attachment_jobs_in_flight.clone()))?;

        let attachment_outcomes = IntCounterVec::new(
            Opts::new(
                "parley_attachment_outcomes_total",
                "Resolved upload jobs, labeled by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(attachment_outcomes.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            http_request_duration,
            online_users,
            live_connections,
            attachment_jobs_in_flight,
            attachment_outcomes,
        }))
    }

    pub fn observe_http_latency(&self, route: &str, status: u16, latency: Duration) {
        let status = status.to_string();
        let labels = [route, status.as_str()];
        self.http_requests_total.with_label_values(&labels).inc();
        self.http_request_duration
            .with_label_values(&labels)
            .observe(latency.as_secs_f64());
    }

    pub fn set_presence(&self, online_users: usize, live_connections: usize) {
        self.online_users.set(online_users as i64);
        self.live_connections.set(live_connections as i64);
    }

    pub fn set_jobs_in_flight(&self, jobs: usize) {
        self.attachment_jobs_in_flight.set(jobs as i64);
    }

    /// `outcome` is `uploaded`, `failed` or `reconciled`.
    pub fn record_attachment_outcome(&self, outcome: &str) {
        self.attachment_outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
