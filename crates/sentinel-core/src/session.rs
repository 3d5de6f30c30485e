//! Session control plane: one emergency session per device.
//!
//! Wires the tracker, decision engine, escalation controller, SOS orchestrator, contact book
//! and path history together, and keeps the audit log the UI reads.
//!
//! ```text
//! tracker ──Fix──▶ location pump ──▶ path history, live SOS report (while active)
//! sos ──events──▶ sos reporter ──▶ audit log, sos_start on completion, sos_stop on stop
//! handle_alert ──▶ decision engine ──trigger──▶ active alerts + escalation
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::SentinelConfig;
use crate::contacts::ContactBook;
use crate::decision::{AlertDecisionEngine, Decision};
use crate::error::InputError;
use crate::escalation::{Dialer, EscalationController};
use crate::lock;
use crate::notify::{fire_and_forget, NotificationSink, ServiceRequest, SosReport};
use crate::path_history::PathHistory;
use crate::shared::{Alert, Location};
use crate::sos::{SosActions, SosEvent, SosOrchestrator, SosPhase, SosState};
use crate::store::{KvStore, TypedStore};
use crate::tracker::{LocationProvider, LocationTracker, TrackerEvent, TrackingContext, TrackingStatus};

/// Entries kept per audit list.
const AUDIT_CAPACITY: usize = 100;

/// External collaborators of a session.
pub struct SessionDeps {
    pub store: Arc<dyn KvStore>,
    pub location: Arc<dyn LocationProvider>,
    pub sink: Arc<dyn NotificationSink>,
    pub dialer: Arc<dyn Dialer>,
    pub actions: Arc<dyn SosActions>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SosAuditEntry {
    pub event: String,
    pub phase: SosPhase,
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A service request and whatever came back. Recorded on success and failure alike.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    #[serde(flatten)]
    pub request: ServiceRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLog {
    pub sos: Vec<SosAuditEntry>,
    pub services: Vec<ServiceRecord>,
    pub decisions: Vec<Decision>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub user_id: String,
    pub location: Option<Location>,
    pub is_sos_active: bool,
    pub sos_phase: SosPhase,
    pub sos_started_at: Option<DateTime<Utc>>,
    pub active_alerts: Vec<Alert>,
    pub pending_auto_dial: Option<u64>,
    pub tracking: TrackingStatus,
    pub battery_level: u8,
    pub is_low_power_mode: bool,
    pub contact_count: usize,
    pub can_add_contact: bool,
}

/// Background tasks of a running session. Aborted on [`SessionHandles::shutdown`] or drop.
pub struct SessionHandles {
    location_pump: JoinHandle<()>,
    sos_reporter: JoinHandle<()>,
}

impl SessionHandles {
    pub fn shutdown(self) {
        // Drop aborts.
    }

    pub fn is_running(&self) -> bool {
        !self.location_pump.is_finished() && !self.sos_reporter.is_finished()
    }
}

impl Drop for SessionHandles {
    fn drop(&mut self) {
        self.location_pump.abort();
        self.sos_reporter.abort();
    }
}

#[derive(Default)]
struct AuditState {
    sos: VecDeque<SosAuditEntry>,
    services: VecDeque<ServiceRecord>,
}

fn push_capped<T>(list: &mut VecDeque<T>, item: T) {
    while list.len() >= AUDIT_CAPACITY {
        list.pop_front();
    }
    list.push_back(item);
}

struct Device {
    battery_level: u8,
    low_power_override: Option<bool>,
}

pub struct EmergencySession {
    config: SentinelConfig,
    sink: Arc<dyn NotificationSink>,
    decisions: Mutex<AlertDecisionEngine>,
    active_alerts: Mutex<Vec<Alert>>,
    escalation: EscalationController,
    sos: SosOrchestrator,
    tracker: LocationTracker,
    contacts: ContactBook,
    path: PathHistory,
    audit: Mutex<AuditState>,
    device: Mutex<Device>,
}

impl EmergencySession {
    pub fn new(config: SentinelConfig, deps: SessionDeps) -> Self {
        let store = TypedStore::new(deps.store);
        let escalation = EscalationController::new(deps.sink.clone(), deps.dialer, config.escalation_grace());
        let sos = SosOrchestrator::new(
            store.clone(),
            deps.location.clone(),
            deps.actions,
            config.sos_fix_timeout(),
        );
        sos.attach_escalation(escalation.clone());
        let tracker = LocationTracker::new(deps.location, config.tracker.clone());

        Self {
            sink: deps.sink,
            decisions: Mutex::new(AlertDecisionEngine::new()),
            active_alerts: Mutex::new(Vec::new()),
            escalation,
            sos,
            tracker,
            contacts: ContactBook::open(store.clone()),
            path: PathHistory::open(store),
            audit: Mutex::new(AuditState::default()),
            device: Mutex::new(Device {
                battery_level: 100,
                low_power_override: None,
            }),
            config,
        }
    }

    /// Start tracking and the background tasks.
    pub fn run_background(self: &Arc<Self>) -> SessionHandles {
        // Subscribe before tracking starts so the first fix is not missed.
        let fixes = self.tracker.subscribe();
        let sos_events = self.sos.subscribe();
        let location_pump = tokio::spawn(location_pump(self.clone(), fixes));
        let sos_reporter = tokio::spawn(sos_reporter(self.clone(), sos_events));
        self.refresh_tracking(true);
        tracing::info!(target: "sentinel::session", user = %self.config.user_id, "session running");
        SessionHandles {
            location_pump,
            sos_reporter,
        }
    }

    /// Restore a crashed SOS for display. Re-issues nothing.
    pub fn recover(&self) -> Option<SosState> {
        let state = self.sos.recover()?;
        if let Some(location) = state.location.clone() {
            self.tracker.restore_location(location);
        }
        self.refresh_tracking(false);
        Some(state)
    }

    // -------------------------------------------------------------------------
    // Alerts
    // -------------------------------------------------------------------------

    /// Evaluate an inbound alert against the latest location and escalate if it concerns us.
    pub fn handle_alert(&self, alert: Alert) -> Decision {
        let current = self.tracker.latest_location();
        let (decision, used_location) = {
            let mut engine = lock(&self.decisions);
            let decision = engine.evaluate(current.as_ref(), &alert);
            (decision, engine.last_known().cloned())
        };
        if !decision.should_trigger {
            return decision;
        }

        let is_new = {
            let mut active = lock(&self.active_alerts);
            if active.iter().any(|a| a.id == alert.id) {
                false
            } else {
                active.push(alert.clone());
                true
            }
        };
        if !is_new {
            tracing::debug!(target: "sentinel::session", alert_id = alert.id, "duplicate alert delivery ignored");
            return decision;
        }

        tracing::warn!(
            target: "sentinel::session",
            alert_id = alert.id,
            kind = %alert.alert_type,
            severity = alert.severity.as_str(),
            zone = alert.zone.display_name(),
            "alert concerns this device"
        );
        self.escalation
            .on_trigger(&alert, used_location.as_ref(), &self.contacts.list());
        decision
    }

    /// Remove an active alert. Its pending auto-dial is cancelled, and all escalation is
    /// cancelled once no alerts remain.
    pub fn dismiss_alert(&self, id: u64) -> bool {
        let (removed, remaining) = {
            let mut active = lock(&self.active_alerts);
            let before = active.len();
            active.retain(|a| a.id != id);
            (active.len() != before, active.len())
        };
        if removed {
            self.escalation.cancel_for(id);
        }
        if remaining == 0 {
            self.escalation.cancel();
        }
        removed
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        lock(&self.active_alerts).clone()
    }

    // -------------------------------------------------------------------------
    // SOS
    // -------------------------------------------------------------------------

    pub fn start_sos(&self) -> bool {
        let started = self.sos.start();
        if started {
            self.refresh_tracking(false);
        }
        started
    }

    pub fn stop_sos(&self) -> SosState {
        let state = self.sos.stop();
        self.refresh_tracking(false);
        state
    }

    pub fn toggle_sos(&self) -> SosState {
        if self.sos.is_active() {
            self.stop_sos()
        } else {
            self.start_sos();
            self.sos.state()
        }
    }

    pub fn retry_sos(&self) -> bool {
        self.sos.retry()
    }

    // -------------------------------------------------------------------------
    // Device and services
    // -------------------------------------------------------------------------

    /// New battery reading. Low power follows the battery threshold unless given explicitly.
    pub fn update_device(&self, battery_level: u16, is_low_power_mode: Option<bool>) -> Result<TrackingContext, InputError> {
        let battery_level = u8::try_from(battery_level)
            .ok()
            .filter(|b| *b <= 100)
            .ok_or(InputError::BatteryLevel(battery_level))?;
        let mut device = lock(&self.device);
        device.battery_level = battery_level;
        device.low_power_override = is_low_power_mode;
        Ok(self.apply_tracking(&device, true))
    }

    /// User-initiated only. The outcome is recorded whether or not the server answered.
    pub async fn request_service(&self, service: &str) -> Result<ServiceRecord, InputError> {
        let service = service.trim();
        if service.is_empty() {
            return Err(InputError::MissingService);
        }
        let request = ServiceRequest {
            service: service.to_string(),
            location: self.tracker.latest_location().map(|l| l.point()),
            user_id: self.config.user_id.clone(),
            timestamp: Utc::now(),
        };
        let record = match self.sink.request_service(&request).await {
            Ok(response) => ServiceRecord {
                request,
                response: Some(response),
                error: None,
            },
            Err(e) => {
                tracing::warn!(target: "sentinel::session", service, "service request failed: {}", e);
                ServiceRecord {
                    request,
                    response: None,
                    error: Some(e.to_string()),
                }
            }
        };
        push_capped(&mut lock(&self.audit).services, record.clone());
        Ok(record)
    }

    /// Restart tracking if the context changed, or unconditionally when `force`.
    fn refresh_tracking(&self, force: bool) -> TrackingContext {
        let device = lock(&self.device);
        self.apply_tracking(&device, force)
    }

    /// Caller holds the device lock across the context read and the tracker restart.
    fn apply_tracking(&self, device: &Device, force: bool) -> TrackingContext {
        let threshold = self.config.tracker.low_battery_threshold;
        let mut ctx = TrackingContext::from_battery(self.sos.is_active(), device.battery_level, threshold);
        if let Some(low) = device.low_power_override {
            ctx.is_low_power_mode = low;
        }
        if force || self.tracker.current_context() != Some(ctx) {
            self.tracker.start(ctx);
        }
        ctx
    }

    // -------------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------------

    pub fn view(&self) -> SessionView {
        let sos = self.sos.state();
        let device = lock(&self.device);
        let ctx = self.tracker.current_context();
        SessionView {
            user_id: self.config.user_id.clone(),
            location: self.tracker.latest_location(),
            is_sos_active: sos.is_active(),
            sos_phase: sos.phase,
            sos_started_at: sos.started_at,
            active_alerts: self.active_alerts(),
            pending_auto_dial: self.escalation.pending_alert(),
            tracking: self.tracker.status(),
            battery_level: device.battery_level,
            is_low_power_mode: ctx.map(|c| c.is_low_power_mode).unwrap_or(false),
            contact_count: self.contacts.len(),
            can_add_contact: self.contacts.can_add_more(),
        }
    }

    pub fn audit(&self) -> AuditLog {
        let audit = lock(&self.audit);
        AuditLog {
            sos: audit.sos.iter().cloned().collect(),
            services: audit.services.iter().cloned().collect(),
            decisions: lock(&self.decisions).log().to_vec(),
        }
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn contacts(&self) -> &ContactBook {
        &self.contacts
    }

    pub fn path(&self) -> &PathHistory {
        &self.path
    }

    pub fn sos(&self) -> &SosOrchestrator {
        &self.sos
    }

    pub fn tracker(&self) -> &LocationTracker {
        &self.tracker
    }

    pub fn escalation(&self) -> &EscalationController {
        &self.escalation
    }

    fn record_sos(&self, event: &str, state: &SosState, error: Option<String>) {
        let entry = SosAuditEntry {
            event: event.to_string(),
            phase: state.phase,
            location: state.location.clone(),
            error,
            timestamp: Utc::now(),
        };
        push_capped(&mut lock(&self.audit).sos, entry);
    }

    fn sos_report(&self, state: &SosState) -> SosReport {
        SosReport {
            user_id: self.config.user_id.clone(),
            location: state.location.as_ref().map(Location::point),
            phase: state.phase,
        }
    }
}

/// Feeds each fix into the path history and, while SOS is active, the live SOS report.
async fn location_pump(session: Arc<EmergencySession>, mut fixes: tokio::sync::broadcast::Receiver<TrackerEvent>) {
    loop {
        match fixes.recv().await {
            Ok(TrackerEvent::Fix(location)) => {
                session.path.record(&location);
                lock(&session.decisions).observe_location(&location);
                if session.sos.is_active() {
                    session.sos.record_location(&location);
                    let report = SosReport {
                        user_id: session.config.user_id.clone(),
                        location: Some(location.point()),
                        phase: session.sos.phase(),
                    };
                    let sink = session.sink.clone();
                    fire_and_forget("live SOS location", async move { sink.sos_start(&report).await });
                }
            }
            Ok(TrackerEvent::Error(e)) => {
                tracing::debug!(target: "sentinel::session", "tracker error: {}", e);
            }
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(target: "sentinel::session", "location pump lagged by {} events", n);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Audits every SOS event and reports completion and stop to the server.
async fn sos_reporter(session: Arc<EmergencySession>, mut events: tokio::sync::broadcast::Receiver<SosEvent>) {
    loop {
        match events.recv().await {
            Ok(SosEvent::PhaseChanged { state }) => session.record_sos("phase_changed", &state, None),
            Ok(SosEvent::Failed { phase, error }) => {
                let mut state = session.sos.state();
                state.phase = phase;
                session.record_sos("failed", &state, Some(error));
            }
            Ok(SosEvent::Completed { state }) => {
                session.record_sos("completed", &state, None);
                let report = session.sos_report(&state);
                let sink = session.sink.clone();
                fire_and_forget("SOS activation report", async move { sink.sos_start(&report).await });
            }
            Ok(SosEvent::Stopped { state }) => {
                session.record_sos("stopped", &state, None);
                let user_id = session.config.user_id.clone();
                let sink = session.sink.clone();
                fire_and_forget("SOS stop report", async move { sink.sos_stop(&user_id).await });
            }
            Ok(SosEvent::Recovered { state }) => session.record_sos("recovered", &state, None),
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(target: "sentinel::session", "SOS reporter lagged by {} events", n);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
