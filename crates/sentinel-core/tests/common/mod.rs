//! Test doubles shared by the integration tests: recording sinks and stores, a scripted
//! location provider, counting SOS actions and a recording dialer.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sentinel_core::{
    ContactNotification, Dialer, EmergencyCall, KvStore, Location, LocationError, LocationProvider, MemoryStore,
    NotificationSink, NotifyError, ServiceRequest, SosActions, SosError, SosReport, SosSnapshot, StoreResult,
    SOS_STATE_KEY,
};
use serde_json::Value;

pub const BENGALURU: (f64, f64) = (12.9716, 77.5946);

pub fn bengaluru() -> Location {
    Location::new(BENGALURU.0, BENGALURU.1, 5.0)
}

/// Let spawned tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Advance the paused clock and let woken tasks run.
pub async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

// =============================================================================
// Notification sink
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    NotifyContacts(ContactNotification),
    SosStart(SosReport),
    SosStop(String),
    Service(ServiceRequest),
}

#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.failing.store(true, Ordering::SeqCst);
        sink
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn contact_notifications(&self) -> Vec<ContactNotification> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::NotifyContacts(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn sos_starts(&self) -> Vec<SosReport> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::SosStart(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn sos_stops(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::SosStop(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: SinkCall) -> Result<Value, NotifyError> {
        self.calls.lock().unwrap().push(call);
        if self.failing.load(Ordering::SeqCst) {
            Err(NotifyError::Status(503, "service unavailable".into()))
        } else {
            Ok(serde_json::json!({ "success": true }))
        }
    }
}

#[async_trait::async_trait]
impl NotificationSink for RecordingSink {
    async fn notify_contacts(&self, n: &ContactNotification) -> Result<Value, NotifyError> {
        self.record(SinkCall::NotifyContacts(n.clone()))
    }

    async fn sos_start(&self, report: &SosReport) -> Result<Value, NotifyError> {
        self.record(SinkCall::SosStart(report.clone()))
    }

    async fn sos_stop(&self, user_id: &str) -> Result<Value, NotifyError> {
        self.record(SinkCall::SosStop(user_id.to_string()))
    }

    async fn request_service(&self, request: &ServiceRequest) -> Result<Value, NotifyError> {
        self.record(SinkCall::Service(request.clone()))
    }
}

// =============================================================================
// Store
// =============================================================================

/// In-memory store that remembers every write.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    puts: Mutex<Vec<(String, Vec<u8>)>>,
    deletes: Mutex<Vec<String>>,
}

impl RecordingStore {
    /// Every SOS snapshot written, oldest first.
    pub fn sos_snapshots(&self) -> Vec<SosSnapshot> {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == SOS_STATE_KEY)
            .map(|(_, v)| serde_json::from_slice(v).unwrap())
            .collect()
    }

    pub fn deleted(&self, key: &str) -> bool {
        self.deletes.lock().unwrap().iter().any(|k| k == key)
    }
}

impl KvStore for RecordingStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.puts.lock().unwrap().push((key.to_string(), value.to_vec()));
        self.inner.put(key, value)
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.deletes.lock().unwrap().push(key.to_string());
        self.inner.delete(key)
    }
}

// =============================================================================
// Location provider
// =============================================================================

/// Plays back scripted results, then a fixed location forever.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Location, LocationError>>>,
    fallback: Location,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn fixed(location: Location) -> Self {
        Self::scripted(vec![], location)
    }

    pub fn scripted(script: Vec<Result<Location, LocationError>>, fallback: Location) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Each fix takes `delay` of (paused) time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LocationProvider for ScriptedProvider {
    async fn fix(&self, _timeout: Duration) -> Result<Location, LocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

// =============================================================================
// SOS actions and dialer
// =============================================================================

#[derive(Default)]
pub struct CountingActions {
    pub sms: AtomicUsize,
    pub calls: AtomicUsize,
    sms_delay: Duration,
    fail_next_sms: AtomicBool,
}

impl CountingActions {
    /// SMS dispatch takes `delay`; use a long one to park the sequence in SMS_DISPATCHING.
    pub fn with_sms_delay(delay: Duration) -> Self {
        Self {
            sms_delay: delay,
            ..Self::default()
        }
    }

    pub fn fail_next_sms(&self) {
        self.fail_next_sms.store(true, Ordering::SeqCst);
    }

    pub fn sms_count(&self) -> usize {
        self.sms.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SosActions for CountingActions {
    async fn dispatch_sms(&self, _location: Option<&Location>) -> Result<(), SosError> {
        self.sms.fetch_add(1, Ordering::SeqCst);
        if !self.sms_delay.is_zero() {
            tokio::time::sleep(self.sms_delay).await;
        }
        if self.fail_next_sms.swap(false, Ordering::SeqCst) {
            return Err(SosError::SmsDispatch("carrier rejected".into()));
        }
        Ok(())
    }

    async fn initiate_call(&self, _location: Option<&Location>) -> Result<(), SosError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingDialer {
    calls: Mutex<Vec<EmergencyCall>>,
}

impl RecordingDialer {
    pub fn calls(&self) -> Vec<EmergencyCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Dialer for RecordingDialer {
    fn dial(&self, call: &EmergencyCall) {
        self.calls.lock().unwrap().push(call.clone());
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
