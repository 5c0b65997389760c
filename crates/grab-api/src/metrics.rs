use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use grab_core::{DeliveryMethod, EndpointCategory};

use crate::state::AppState;

/// Process-wide request counters, rendered by `/metrics`.
#[derive(Debug)]
pub struct Metrics {
    started_at: DateTime<Utc>,
    extractions_found: AtomicU64,
    extractions_empty: AtomicU64,
    extractions_failed: AtomicU64,
    conversions_direct: AtomicU64,
    conversions_tunnel: AtomicU64,
    conversions_failed: AtomicU64,
    grants_issued: AtomicU64,
    grants_rejected: AtomicU64,
    rate_limited: DashMap<EndpointCategory, u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            extractions_found: AtomicU64::new(0),
            extractions_empty: AtomicU64::new(0),
            extractions_failed: AtomicU64::new(0),
            conversions_direct: AtomicU64::new(0),
            conversions_tunnel: AtomicU64::new(0),
            conversions_failed: AtomicU64::new(0),
            grants_issued: AtomicU64::new(0),
            grants_rejected: AtomicU64::new(0),
            rate_limited: DashMap::new(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_extraction(&self, videos: usize) {
        let counter = if videos > 0 {
            &self.extractions_found
        } else {
            &self.extractions_empty
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_extraction_failure(&self) {
        self.extractions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conversion(&self, method: DeliveryMethod) {
        let counter = match method {
            DeliveryMethod::Direct => &self.conversions_direct,
            DeliveryMethod::Tunnel => &self.conversions_tunnel,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conversion_failure(&self) {
        self.conversions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grant_issued(&self) {
        self.grants_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grant_rejected(&self) {
        self.grants_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self, category: EndpointCategory) {
        *self.rate_limited.entry(category).or_insert(0) += 1;
    }

    pub fn grants_issued(&self) -> u64 {
        self.grants_issued.load(Ordering::Relaxed)
    }

    pub fn grants_rejected(&self) -> u64 {
        self.grants_rejected.load(Ordering::Relaxed)
    }

    pub fn rate_limited(&self, category: EndpointCategory) -> u64 {
        self.rate_limited.get(&category).map(|c| *c).unwrap_or(0)
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        writeln!(out, "# TYPE media_grab_extractions counter").unwrap();
        writeln!(out, "# HELP media_grab_extractions Extraction requests by outcome").unwrap();
        for (outcome, counter) in [
            ("found", &self.extractions_found),
            ("empty", &self.extractions_empty),
            ("failed", &self.extractions_failed),
        ] {
            writeln!(
                out,
                "media_grab_extractions_total{{outcome=\"{}\"}} {}",
                outcome,
                counter.load(Ordering::Relaxed)
            )
            .unwrap();
        }

        writeln!(out, "# TYPE media_grab_conversions counter").unwrap();
        writeln!(out, "# HELP media_grab_conversions Conversions by delivery method").unwrap();
        for (method, counter) in [
            ("direct", &self.conversions_direct),
            ("tunnel", &self.conversions_tunnel),
            ("failed", &self.conversions_failed),
        ] {
            writeln!(
                out,
                "media_grab_conversions_total{{method=\"{}\"}} {}",
                method,
                counter.load(Ordering::Relaxed)
            )
            .unwrap();
        }

        writeln!(out, "# TYPE media_grab_grants counter").unwrap();
        writeln!(out, "# HELP media_grab_grants Presigned grants issued and rejected").unwrap();
        writeln!(out, "media_grab_grants_total{{result=\"issued\"}} {}", self.grants_issued()).unwrap();
        writeln!(out, "media_grab_grants_total{{result=\"rejected\"}} {}", self.grants_rejected()).unwrap();

        writeln!(out, "# TYPE media_grab_rate_limited counter").unwrap();
        writeln!(out, "# HELP media_grab_rate_limited Requests rejected by admission control").unwrap();
        for category in EndpointCategory::ALL {
            writeln!(
                out,
                "media_grab_rate_limited_total{{category=\"{}\"}} {}",
                category,
                self.rate_limited(category)
            )
            .unwrap();
        }

        writeln!(out, "# TYPE media_grab_uptime_seconds gauge").unwrap();
        writeln!(out, "# HELP media_grab_uptime_seconds Time since the server started").unwrap();
        let uptime = (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0;
        writeln!(out, "media_grab_uptime_seconds {:.3}", uptime).unwrap();

        writeln!(out, "# EOF").unwrap();
        out
    }
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        state.metrics.render(),
    )
}
