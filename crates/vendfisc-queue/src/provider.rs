//! # Fiscal Provider Port
//!
//! The narrow contract between the queue worker and a fiscal data operator
//! (OFD) or tax terminal.
//!
//! ```text
//! ┌──────────────┐  ProviderRequest         ┌──────────────────────────┐
//! │ QueueWorker  │ ───────────────────────► │ dyn FiscalProvider       │
//! │              │  (payload + idempotency  │                          │
//! │ timeout(..)  │   key, device creds)     │  SandboxProvider         │
//! │              │ ◄─────────────────────── │  ScriptedProvider        │
//! └──────────────┘  ProviderResponse |      │  <real OFD adapters>     │
//!                   ProviderError{class}    └──────────────────────────┘
//! ```
//!
//! The worker bounds every call with a timeout and treats an expired
//! timeout as a transient failure. Adapters must honour the idempotency
//! key: submitting the same key twice returns the first result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use vendfisc_core::{
    Credentials, FailureClass, FiscalDevice, FiscalQueueItem, FiscalSignature, OperationKind,
    ProviderMode, QueuePayload,
};

// =============================================================================
// Request / Response
// =============================================================================

/// One call to the provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub device_id: String,
    pub provider: String,
    pub mode: ProviderMode,
    pub credentials: Credentials,
    pub operation: OperationKind,
    pub idempotency_key: String,
    pub payload: QueuePayload,
}

impl ProviderRequest {
    pub fn for_item(device: &FiscalDevice, item: &FiscalQueueItem) -> Self {
        ProviderRequest {
            device_id: device.id.clone(),
            provider: device.provider.clone(),
            mode: device.mode,
            credentials: device.credentials.clone(),
            operation: item.operation,
            idempotency_key: item.idempotency_key.clone(),
            payload: item.payload.clone(),
        }
    }
}

/// Successful provider answer.
///
/// Receipts carry a fiscal number and sign; `shift_open` may report the
/// provider's shift number and `shift_close` the Z-report number.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub fiscal_number: Option<String>,
    pub fiscal_sign: Option<String>,
    pub receipt_url: Option<String>,
    pub shift_number: Option<i64>,
    pub z_report_number: Option<String>,
    /// Provider's own response, kept verbatim for audits.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl ProviderResponse {
    /// Fiscal attributes of a receipt.
    ///
    /// A receipt answer without a number or sign is malformed; retrying
    /// with the same idempotency key returns the provider's stored result.
    pub fn signature(&self) -> Result<FiscalSignature, ProviderError> {
        match (&self.fiscal_number, &self.fiscal_sign) {
            (Some(number), Some(sign)) => Ok(FiscalSignature {
                fiscal_number: number.clone(),
                fiscal_sign: sign.clone(),
                receipt_url: self.receipt_url.clone(),
            }),
            _ => Err(ProviderError::transient(
                "provider response has no fiscal number or sign",
            )),
        }
    }

    /// Value stored as the queue item's result.
    pub fn to_result(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| self.raw.clone())
    }
}

/// Failed provider call, already classified by the adapter.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{class}: {message}")]
pub struct ProviderError {
    pub class: FailureClass,
    pub message: String,
    pub raw: Option<serde_json::Value>,
}

impl ProviderError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        ProviderError {
            class,
            message: message.into(),
            raw: None,
        }
    }

    /// Network trouble, 5xx, rate limiting.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }

    /// Business or validation rejection.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Permanent, message)
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

// =============================================================================
// Provider Port
// =============================================================================

/// Adapter to a fiscal provider.
#[async_trait]
pub trait FiscalProvider: Send + Sync {
    /// Adapter name, matched against `FiscalDevice::provider`.
    fn name(&self) -> &str;

    /// Submits one operation. The caller applies the timeout.
    async fn submit(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

// =============================================================================
// Sandbox Provider
// =============================================================================

#[derive(Debug, Default)]
struct SandboxState {
    responses: HashMap<String, ProviderResponse>,
    receipts_issued: u64,
    z_reports_issued: u64,
    shift_numbers: HashMap<String, i64>,
}

/// Deterministic in-process provider for sandbox devices.
///
/// Numbers are sequential per instance, and a repeated idempotency key gets
/// the stored response back without issuing anything new.
#[derive(Debug, Default)]
pub struct SandboxProvider {
    state: Mutex<SandboxState>,
}

impl SandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receipts issued so far (repeats of a key are not counted).
    pub async fn receipts_issued(&self) -> u64 {
        self.state.lock().await.receipts_issued
    }
}

#[async_trait]
impl FiscalProvider for SandboxProvider {
    fn name(&self) -> &str {
        "sandbox"
    }

    async fn submit(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut state = self.state.lock().await;
        if let Some(stored) = state.responses.get(&request.idempotency_key) {
            debug!(key = %request.idempotency_key, "Sandbox replaying stored response");
            return Ok(stored.clone());
        }

        let raw = json!({
            "provider": "sandbox",
            "operation": request.operation.as_str(),
            "device_id": request.device_id,
            "idempotency_key": request.idempotency_key,
        });

        let response = match request.operation {
            OperationKind::ReceiptSale | OperationKind::ReceiptRefund => {
                state.receipts_issued += 1;
                let number = format!("SBX{:010}", state.receipts_issued);
                ProviderResponse {
                    fiscal_sign: Some(format!(
                        "{:010}",
                        fnv1a(&format!("{}/{}", request.idempotency_key, number)) % 10_000_000_000
                    )),
                    receipt_url: Some(format!("sandbox://receipts/{number}")),
                    fiscal_number: Some(number),
                    raw,
                    ..Default::default()
                }
            }
            OperationKind::ShiftOpen => {
                let counter = state
                    .shift_numbers
                    .entry(request.device_id.clone())
                    .or_insert(0);
                *counter += 1;
                ProviderResponse {
                    shift_number: Some(*counter),
                    raw,
                    ..Default::default()
                }
            }
            OperationKind::ShiftClose => {
                state.z_reports_issued += 1;
                ProviderResponse {
                    z_report_number: Some(format!("Z{:08}", state.z_reports_issued)),
                    raw,
                    ..Default::default()
                }
            }
            OperationKind::XReport => ProviderResponse {
                raw,
                ..Default::default()
            },
        };

        state
            .responses
            .insert(request.idempotency_key.clone(), response.clone());
        Ok(response)
    }
}

/// 64-bit FNV-1a, stable across runs.
fn fnv1a(input: &str) -> u64 {
    input.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

// =============================================================================
// Scripted Provider
// =============================================================================

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Answer like the sandbox would.
    Succeed,
    Fail(ProviderError),
    /// Sleep before answering, long enough to trip the worker's timeout.
    Hang(Duration),
}

/// Provider that replays a script of outcomes, then succeeds.
///
/// Records every request so tests can assert what reached the provider.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    calls: Mutex<Vec<ProviderRequest>>,
    inner: SandboxProvider,
}

impl ScriptedProvider {
    pub fn new(outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        ScriptedProvider {
            script: Mutex::new(outcomes.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            inner: SandboxProvider::new(),
        }
    }

    pub async fn push(&self, outcome: ScriptedOutcome) {
        self.script.lock().await.push_back(outcome);
    }

    /// Idempotency keys of every call, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|r| r.idempotency_key.clone())
            .collect()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl FiscalProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.lock().await.push(request.clone());
        let next = self.script.lock().await.pop_front();

        match next {
            None | Some(ScriptedOutcome::Succeed) => self.inner.submit(request).await,
            Some(ScriptedOutcome::Fail(error)) => Err(error),
            Some(ScriptedOutcome::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                self.inner.submit(request).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vendfisc_core::operation::{FiscalOperation, XReportRequest};

    fn request(operation: OperationKind, key: &str) -> ProviderRequest {
        ProviderRequest {
            device_id: "D1".to_string(),
            provider: "sandbox".to_string(),
            mode: ProviderMode::Sandbox,
            credentials: Credentials::default(),
            operation,
            idempotency_key: key.to_string(),
            payload: QueuePayload::new(
                "D1",
                key,
                FiscalOperation::XReport(XReportRequest {
                    cashier: "auto".to_string(),
                }),
            ),
        }
    }

    #[tokio::test]
    async fn test_sandbox_honours_idempotency_key() {
        let sandbox = SandboxProvider::new();
        let first = sandbox
            .submit(&request(OperationKind::ReceiptSale, "sale:s1"))
            .await
            .unwrap();
        let again = sandbox
            .submit(&request(OperationKind::ReceiptSale, "sale:s1"))
            .await
            .unwrap();
        let other = sandbox
            .submit(&request(OperationKind::ReceiptSale, "sale:s2"))
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(first.fiscal_number.as_deref(), Some("SBX0000000001"));
        assert_eq!(other.fiscal_number.as_deref(), Some("SBX0000000002"));
        assert_eq!(sandbox.receipts_issued().await, 2);
        assert!(first.signature().is_ok());
    }

    #[tokio::test]
    async fn test_sandbox_shift_numbers_per_device() {
        let sandbox = SandboxProvider::new();
        let a = sandbox
            .submit(&request(OperationKind::ShiftOpen, "shift_open:D1:1"))
            .await
            .unwrap();
        let b = sandbox
            .submit(&request(OperationKind::ShiftOpen, "shift_open:D1:2"))
            .await
            .unwrap();
        assert_eq!(a.shift_number, Some(1));
        assert_eq!(b.shift_number, Some(2));

        let z = sandbox
            .submit(&request(OperationKind::ShiftClose, "shift_close:S1"))
            .await
            .unwrap();
        assert_eq!(z.z_report_number.as_deref(), Some("Z00000001"));
        assert!(z.signature().is_err());
    }

    #[tokio::test]
    async fn test_scripted_provider_replays_then_succeeds() {
        let scripted = ScriptedProvider::new([
            ScriptedOutcome::Fail(ProviderError::transient("503")),
            ScriptedOutcome::Fail(ProviderError::permanent("bad tax code")),
        ]);
        let req = request(OperationKind::ReceiptSale, "sale:s1");

        let e1 = scripted.submit(&req).await.unwrap_err();
        assert_eq!(e1.class, FailureClass::Transient);
        let e2 = scripted.submit(&req).await.unwrap_err();
        assert_eq!(e2.class, FailureClass::Permanent);
        assert!(scripted.submit(&req).await.is_ok());
        assert_eq!(scripted.call_count().await, 3);
    }
}
