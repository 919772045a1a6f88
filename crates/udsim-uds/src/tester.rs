//! Diagnostic tester pipeline
//!
//! One request goes through: security gate, encode, transport, simulated
//! ECU, decode. The automation engine runs scenario steps through the same
//! pipeline; [`Tester::execute`] is the ad-hoc entry point.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use udsim_core::{
    AuditResult, AuditSink, CodecError, DiagnosticAuditEntry, MetricsEvent, MetricsSink,
    NoopMetrics, SecurityError, SecurityLevel, StoreError, StoreResult, TransportExchange,
    TransportKind, UdsServiceRequest, UdsServiceResponse,
};
use uuid::Uuid;

use crate::config::{ConfigError, SimulatorConfig};
use crate::ecu::EcuRegistry;
use crate::security::SecurityManager;
use crate::transport::{create_transports, Framing, TransportError, TransportSet};
use crate::uds::{codec, service_id, service_name};

/// Why an exchange produced no decoded response
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The exchange ran but its audit entry could not be written
    #[error("Audit entry not recorded: {0}")]
    Audit(#[from] StoreError),
}

/// A completed request/response exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub transport: TransportKind,
    /// Encoded request bytes
    pub request: Vec<u8>,
    /// Raw response bytes
    pub raw_response: Vec<u8>,
    pub response: UdsServiceResponse,
    pub framing: Framing,
    pub latency_ms: u64,
}

impl Exchange {
    /// Trace record for the host UI
    pub fn to_record(
        &self,
        ecu_id: &str,
        run_id: Option<&str>,
        step_id: Option<&str>,
    ) -> TransportExchange {
        TransportExchange {
            run_id: run_id.map(str::to_string),
            step_id: step_id.map(str::to_string),
            ecu_id: ecu_id.to_string(),
            transport: self.transport,
            request: hex::encode_upper(&self.request),
            response: hex::encode_upper(&self.raw_response),
            frames: self.framing.frames,
            overhead_bytes: self.framing.overhead_bytes,
            latency_ms: self.latency_ms,
            timestamp: Utc::now(),
        }
    }
}

/// Context of an audited exchange
#[derive(Debug, Clone, Copy)]
pub struct AuditContext<'a> {
    pub ecu_id: &'a str,
    /// `None` for ad-hoc requests
    pub scenario_id: Option<&'a str>,
    pub user_persona: &'a str,
    /// Level held by the ECU session when the request was sent
    pub security_level: SecurityLevel,
}

/// Sends UDS requests to simulated ECUs
pub struct Tester {
    transports: TransportSet,
    ecus: Arc<EcuRegistry>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<dyn MetricsSink>,
    user_persona: String,
}

impl Tester {
    pub fn new(transports: TransportSet, ecus: Arc<EcuRegistry>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            transports,
            ecus,
            audit,
            metrics: Arc::new(NoopMetrics),
            user_persona: "tester".to_string(),
        }
    }

    /// Transports, security manager and ECUs from configuration
    pub fn from_config(
        config: &SimulatorConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError> {
        let transports = create_transports(&config.transport)?;
        let security = Arc::new(SecurityManager::new(&config.security));
        let ecus = Arc::new(EcuRegistry::from_config(&config.ecus, security)?);
        Ok(Self::new(transports, ecus, audit).with_user_persona(&config.worker.user_persona))
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_user_persona(mut self, persona: impl Into<String>) -> Self {
        self.user_persona = persona.into();
        self
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        self.ecus.security()
    }

    pub fn ecus(&self) -> &Arc<EcuRegistry> {
        &self.ecus
    }

    pub fn user_persona(&self) -> &str {
        &self.user_persona
    }

    /// Run one request through the pipeline without auditing it
    ///
    /// Requests that can change security state hold the ECU's handshake
    /// lease for the duration of the exchange.
    pub async fn exchange(
        &self,
        ecu_id: &str,
        request: &UdsServiceRequest,
    ) -> Result<Exchange, ExchangeError> {
        let _lease = if changes_security_state(request) {
            Some(self.security().lock_ecu(ecu_id).await)
        } else {
            None
        };
        self.exchange_leased(ecu_id, request).await
    }

    /// Same pipeline as [`Tester::exchange`] for a caller already holding the
    /// ECU's handshake lease
    pub(crate) async fn exchange_leased(
        &self,
        ecu_id: &str,
        request: &UdsServiceRequest,
    ) -> Result<Exchange, ExchangeError> {
        self.security()
            .check_access(ecu_id, request.security_level_required)?;

        let payload = codec::encode(request);
        let transport = self.transports.for_kind(request.transport);

        let started = Instant::now();
        let delivered = transport.send(&payload).await?;
        let raw_response = self.ecus.get(ecu_id).handle(&delivered);
        let latency_ms = started.elapsed().as_millis() as u64;

        let response = codec::decode(&raw_response)?;
        debug!(
            ecu_id,
            sid = format!("0x{:02X}", request.sid),
            service = service_name(request.sid),
            transport = %request.transport,
            request = %hex::encode_upper(&payload),
            response = %hex::encode_upper(&raw_response),
            latency_ms,
            "UDS exchange"
        );

        Ok(Exchange {
            transport: request.transport,
            framing: transport.framing(payload.len()),
            request: payload,
            raw_response,
            response,
            latency_ms,
        })
    }

    /// Ad-hoc request: run it, audit it and emit a usage event
    ///
    /// A failed audit write fails the request with [`ExchangeError::Audit`].
    pub async fn execute(
        &self,
        ecu_id: &str,
        request: &UdsServiceRequest,
    ) -> Result<Exchange, ExchangeError> {
        let security_level = self.security().current_level(ecu_id);
        let started = Instant::now();
        let result = self.exchange(ecu_id, request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let context = AuditContext {
            ecu_id,
            scenario_id: None,
            user_persona: &self.user_persona,
            security_level,
        };
        let audited = self
            .record_audit(audit_entry(&context, request, &result, duration_ms))
            .await;
        self.emit_service_used(ecu_id, request);

        let result = audited.map_err(ExchangeError::from).and(result);
        if let Err(e) = &result {
            info!(ecu_id, sid = format!("0x{:02X}", request.sid), error = %e, "Ad-hoc request failed");
        }
        result
    }

    /// Write an audit entry
    pub async fn record_audit(&self, entry: DiagnosticAuditEntry) -> StoreResult<()> {
        let id = entry.id.clone();
        self.audit.record(entry).await.inspect_err(|e| {
            warn!(audit_id = %id, error = %e, "Failed to record audit entry");
        })
    }

    pub fn emit_service_used(&self, ecu_id: &str, request: &UdsServiceRequest) {
        self.metrics.emit(MetricsEvent::ServiceUsed {
            sid: request.sid,
            transport: request.transport,
            ecu_id: ecu_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }
}

/// Session control and security access can move the ECU's security level
pub(crate) fn changes_security_state(request: &UdsServiceRequest) -> bool {
    request.sid == service_id::SECURITY_ACCESS
        || request.sid == service_id::DIAGNOSTIC_SESSION_CONTROL
}

/// Audit entry for an exchange outcome
///
/// Positive responses audit as `success`, negative ones as `nrc`, and
/// anything without a decoded response as `error`.
pub fn audit_entry(
    context: &AuditContext<'_>,
    request: &UdsServiceRequest,
    result: &Result<Exchange, ExchangeError>,
    duration_ms: u64,
) -> DiagnosticAuditEntry {
    let (result, nrc_code) = match result {
        Ok(exchange) if exchange.response.is_positive => (AuditResult::Success, None),
        Ok(exchange) => (AuditResult::Nrc, exchange.response.nrc),
        Err(_) => (AuditResult::Error, None),
    };

    DiagnosticAuditEntry {
        id: Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        user_persona: context.user_persona.to_string(),
        scenario_id: context.scenario_id.map(str::to_string),
        ecu_id: context.ecu_id.to_string(),
        service_sid: request.sid,
        transport: request.transport,
        security_level_used: context.security_level,
        result,
        nrc_code,
        duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CanConfig, DoIpConfig, TransportsConfig};
    use crate::ecu::SimulatedEcu;
    use pretty_assertions::assert_eq;
    use udsim_core::MemoryStore;

    fn tester(store: Arc<MemoryStore>) -> Tester {
        let mut config = SimulatorConfig::default();
        config.transport = TransportsConfig {
            can: CanConfig {
                latency_ms: 2,
                ..CanConfig::default()
            },
            doip: DoIpConfig {
                latency_ms: 1,
                ..DoIpConfig::default()
            },
        };
        Tester::from_config(&config, store.clone())
            .unwrap()
            .with_metrics(store)
            .with_user_persona("bench")
    }

    #[tokio::test]
    async fn test_execute_positive_over_can() {
        let store = Arc::new(MemoryStore::new());
        let tester = tester(store.clone());

        let request = UdsServiceRequest::new(0x10).with_sub_function(0x03);
        let exchange = tester.execute("engine_ecu", &request).await.unwrap();
        assert_eq!(exchange.raw_response, vec![0x50, 0x03]);
        assert_eq!(exchange.response, UdsServiceResponse::positive(0x10, vec![0x03]));
        assert_eq!(exchange.framing.frames, 1);

        let audit = store.audit_entries();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].result, AuditResult::Success);
        assert_eq!(audit[0].scenario_id, None);
        assert_eq!(audit[0].user_persona, "bench");
        assert_eq!(store.metrics_events().len(), 1);

        let record = exchange.to_record("engine_ecu", None, None);
        assert_eq!(record.request, "1003");
        assert_eq!(record.response, "5003");
    }

    #[tokio::test]
    async fn test_execute_negative_over_doip() {
        let store = Arc::new(MemoryStore::new());
        let tester = tester(store.clone());
        tester.ecus().insert(
            SimulatedEcu::new("engine_ecu", tester.security().clone())
                .with_response(vec![0x22, 0x00, 0x00], vec![0x7F, 0x22, 0x31]),
        );

        let request = UdsServiceRequest::new(0x22)
            .with_data(vec![0x00, 0x00])
            .with_transport(TransportKind::DoIp);
        let exchange = tester.execute("engine_ecu", &request).await.unwrap();
        assert!(!exchange.response.is_positive);
        assert_eq!(exchange.framing.overhead_bytes, 12);

        let audit = store.audit_entries();
        assert_eq!(audit[0].result, AuditResult::Nrc);
        assert_eq!(audit[0].nrc_code, Some(0x31));
        assert_eq!(audit[0].transport, TransportKind::DoIp);
    }

    #[tokio::test]
    async fn test_security_gate_blocks_and_audits_error() {
        let store = Arc::new(MemoryStore::new());
        let tester = tester(store.clone());

        let request = UdsServiceRequest::new(0x2E)
            .with_data(vec![0xF1, 0x90, 0x00])
            .with_security_level(SecurityLevel::Supplier);
        let err = tester.execute("engine_ecu", &request).await.unwrap_err();
        assert_eq!(
            err,
            ExchangeError::Security(SecurityError::AccessDenied {
                required: SecurityLevel::Supplier,
                current: SecurityLevel::Default,
            })
        );

        let audit = store.audit_entries();
        assert_eq!(audit[0].result, AuditResult::Error);
        assert_eq!(audit[0].security_level_used, SecurityLevel::Default);
    }

    #[tokio::test]
    async fn test_audit_failure_fails_request() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let tester = tester(store.clone());

        let request = UdsServiceRequest::new(0x3E).with_sub_function(0x00);
        let err = tester.execute("engine_ecu", &request).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Audit(StoreError::Backend(_))));
        assert!(store.audit_entries().is_empty());

        // The exchange itself still reached the ECU
        store.set_fail_writes(false);
        tokio_test::assert_ok!(tester.execute("engine_ecu", &request).await);
        assert_eq!(store.audit_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_exchange_waits_for_handshake_lease() {
        let store = Arc::new(MemoryStore::new());
        let tester = Arc::new(tester(store));
        let lease = tester.security().lock_ecu("engine_ecu").await;

        let seed_request = UdsServiceRequest::new(0x27).with_sub_function(0x01);
        let pending = tokio::spawn({
            let tester = tester.clone();
            let request = seed_request.clone();
            async move { tester.exchange("engine_ecu", &request).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        // The lease holder is not blocked by its own lease
        let own = tester.exchange_leased("engine_ecu", &seed_request).await.unwrap();
        assert!(own.response.is_positive);

        drop(lease);
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_response_is_codec_error() {
        let store = Arc::new(MemoryStore::new());
        let tester = tester(store.clone());
        tester.ecus().insert(
            SimulatedEcu::new("engine_ecu", tester.security().clone())
                .with_response(vec![0x31, 0x01], vec![0x7F, 0x31]),
        );

        let request = UdsServiceRequest::new(0x31).with_data(vec![0x01, 0xFF, 0x00]);
        let err = tester.exchange("engine_ecu", &request).await.unwrap_err();
        assert_eq!(
            err,
            ExchangeError::Codec(CodecError::MalformedNegativeResponse { len: 2 })
        );
    }
}
