//! Telemetry events consumed by an external aggregator

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TransportKind;

/// Usage telemetry; this crate only emits these, aggregation happens elsewhere
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum MetricsEvent {
    TemplateRun {
        template_id: String,
        run_id: String,
        timestamp: DateTime<Utc>,
    },
    ServiceUsed {
        sid: u8,
        transport: TransportKind,
        ecu_id: String,
        timestamp: DateTime<Utc>,
    },
    FeedbackSubmitted {
        rating: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

/// Time-windowed totals produced by the aggregator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub template_runs: u64,
    /// Executions per service id, keyed `0xNN`
    pub service_usage: BTreeMap<String, u64>,
    pub feedback_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_rating: Option<f64>,
}
