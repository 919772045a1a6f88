//! Persistence, audit and telemetry contracts
//!
//! These traits are implemented by external collaborators (a key-value or
//! IndexedDB-like store, a telemetry aggregator). [`crate::MemoryStore`] is
//! the in-process reference implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{
    AutomatedTestRun, DiagnosticAuditEntry, DiagnosticScenarioTemplate, MetricsEvent,
};

/// Key-value persistence for templates, audit entries and runs, keyed by `id`
#[async_trait]
pub trait DiagnosticStore: Send + Sync {
    /// Save or replace a template
    ///
    /// Fails with `DuplicateName` if another template already uses the name.
    async fn save_template(&self, template: DiagnosticScenarioTemplate) -> StoreResult<()>;

    async fn get_template(&self, id: &str) -> StoreResult<Option<DiagnosticScenarioTemplate>>;

    async fn list_templates(&self) -> StoreResult<Vec<DiagnosticScenarioTemplate>>;

    /// Returns whether a template was removed
    async fn delete_template(&self, id: &str) -> StoreResult<bool>;

    async fn save_audit_entry(&self, entry: DiagnosticAuditEntry) -> StoreResult<()>;

    async fn get_audit_entry(&self, id: &str) -> StoreResult<Option<DiagnosticAuditEntry>>;

    /// All audit entries, oldest first
    async fn list_audit_entries(&self) -> StoreResult<Vec<DiagnosticAuditEntry>>;

    async fn delete_audit_entry(&self, id: &str) -> StoreResult<bool>;

    async fn save_run(&self, run: AutomatedTestRun) -> StoreResult<()>;

    async fn get_run(&self, id: &str) -> StoreResult<Option<AutomatedTestRun>>;

    async fn list_runs(&self) -> StoreResult<Vec<AutomatedTestRun>>;

    async fn delete_run(&self, id: &str) -> StoreResult<bool>;

    /// Remove audit entries older than `max_age`; returns how many were removed
    async fn cleanup_expired(&self, max_age: Duration) -> StoreResult<usize>;
}

/// Receives one audit record per executed step or ad-hoc request
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: DiagnosticAuditEntry) -> StoreResult<()>;
}

/// Receives telemetry events
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: MetricsEvent);
}

/// Sink that drops every metrics event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn emit(&self, _event: MetricsEvent) {}
}
