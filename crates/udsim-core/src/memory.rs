//! In-memory store
//!
//! Reference implementation of the persistence, audit and metrics contracts.
//! Used by tests and by the command-line runner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::models::{
    AutomatedTestRun, DiagnosticAuditEntry, DiagnosticScenarioTemplate, MetricsEvent,
};
use crate::store::{AuditSink, DiagnosticStore, MetricsSink};

/// Thread-safe in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    templates: RwLock<HashMap<String, DiagnosticScenarioTemplate>>,
    /// Append order is preserved
    audit: RwLock<Vec<DiagnosticAuditEntry>>,
    runs: RwLock<HashMap<String, AutomatedTestRun>>,
    metrics: RwLock<Vec<MetricsEvent>>,
    /// When set, every write fails with a backend error
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (simulates an unavailable backend)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Metrics events emitted so far
    pub fn metrics_events(&self) -> Vec<MetricsEvent> {
        self.metrics.read().clone()
    }

    /// Audit entries recorded so far, oldest first
    pub fn audit_entries(&self) -> Vec<DiagnosticAuditEntry> {
        self.audit.read().clone()
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store is read-only".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DiagnosticStore for MemoryStore {
    async fn save_template(&self, template: DiagnosticScenarioTemplate) -> StoreResult<()> {
        self.check_writable()?;
        let mut templates = self.templates.write();
        if templates
            .values()
            .any(|t| t.name == template.name && t.id != template.id)
        {
            return Err(StoreError::DuplicateName(template.name));
        }
        debug!(id = %template.id, name = %template.name, "Template saved");
        templates.insert(template.id.clone(), template);
        Ok(())
    }

    async fn get_template(&self, id: &str) -> StoreResult<Option<DiagnosticScenarioTemplate>> {
        Ok(self.templates.read().get(id).cloned())
    }

    async fn list_templates(&self) -> StoreResult<Vec<DiagnosticScenarioTemplate>> {
        let mut templates: Vec<_> = self.templates.read().values().cloned().collect();
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(templates)
    }

    async fn delete_template(&self, id: &str) -> StoreResult<bool> {
        self.check_writable()?;
        Ok(self.templates.write().remove(id).is_some())
    }

    async fn save_audit_entry(&self, entry: DiagnosticAuditEntry) -> StoreResult<()> {
        self.check_writable()?;
        self.audit.write().push(entry);
        Ok(())
    }

    async fn get_audit_entry(&self, id: &str) -> StoreResult<Option<DiagnosticAuditEntry>> {
        Ok(self.audit.read().iter().find(|e| e.id == id).cloned())
    }

    async fn list_audit_entries(&self) -> StoreResult<Vec<DiagnosticAuditEntry>> {
        Ok(self.audit_entries())
    }

    async fn delete_audit_entry(&self, id: &str) -> StoreResult<bool> {
        self.check_writable()?;
        let mut audit = self.audit.write();
        let before = audit.len();
        audit.retain(|e| e.id != id);
        Ok(audit.len() != before)
    }

    async fn save_run(&self, run: AutomatedTestRun) -> StoreResult<()> {
        self.check_writable()?;
        self.runs.write().insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, id: &str) -> StoreResult<Option<AutomatedTestRun>> {
        Ok(self.runs.read().get(id).cloned())
    }

    async fn list_runs(&self) -> StoreResult<Vec<AutomatedTestRun>> {
        Ok(self.runs.read().values().cloned().collect())
    }

    async fn delete_run(&self, id: &str) -> StoreResult<bool> {
        self.check_writable()?;
        Ok(self.runs.write().remove(id).is_some())
    }

    async fn cleanup_expired(&self, max_age: Duration) -> StoreResult<usize> {
        self.check_writable()?;
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| StoreError::Backend(format!("Invalid retention window: {}", e)))?;
        let cutoff = Utc::now() - max_age;

        let mut audit = self.audit.write();
        let before = audit.len();
        audit.retain(|e| e.timestamp >= cutoff);
        let removed = before - audit.len();
        if removed > 0 {
            debug!(removed, "Expired audit entries removed");
        }
        Ok(removed)
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn record(&self, entry: DiagnosticAuditEntry) -> StoreResult<()> {
        self.save_audit_entry(entry).await
    }
}

impl MetricsSink for MemoryStore {
    fn emit(&self, event: MetricsEvent) {
        self.metrics.write().push(event);
    }
}
