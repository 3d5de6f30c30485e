//! SOS Orchestrator: the emergency activation state machine.
//!
//! ```text
//! IDLE → GPS_CAPTURING → GPS_CAPTURED → SMS_DISPATCHING → SMS_DISPATCHED → CALL_INITIATING → STREAMING
//!   ▲                                                                                          │
//!   └──────────────────────────────── stop() from any phase ───────────────────────────────────┘
//! ```
//!
//! Each transition updates the in-memory state, persists a snapshot, then publishes a
//! [`SosEvent`]. A failed step publishes `Failed` and leaves the phase where it was. Nothing
//! here retries on its own; `retry()` re-runs the in-flight step on request.
//!
//! `recover()` restores visibility only. It never re-issues SMS or calls.
//!
//! Every sequence run has a token. `stop()` bumps it, so a step that completes after stop
//! finds its token stale and does nothing.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::SosError;
use crate::escalation::EscalationController;
use crate::lock;
use crate::shared::Location;
use crate::store::TypedStore;
use crate::tracker::LocationProvider;

/// Store key of the crash-recovery snapshot.
pub const SOS_STATE_KEY: &str = "sentinelnet_sos_state";

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SosPhase {
    Idle,
    GpsCapturing,
    GpsCaptured,
    SmsDispatching,
    SmsDispatched,
    CallInitiating,
    Streaming,
}

impl SosPhase {
    /// The only valid forward transition. `Streaming` has none.
    pub fn next(self) -> Option<SosPhase> {
        use SosPhase::*;
        match self {
            Idle => Some(GpsCapturing),
            GpsCapturing => Some(GpsCaptured),
            GpsCaptured => Some(SmsDispatching),
            SmsDispatching => Some(SmsDispatched),
            SmsDispatched => Some(CallInitiating),
            CallInitiating => Some(Streaming),
            Streaming => None,
        }
    }

    pub fn label(self) -> &'static str {
        use SosPhase::*;
        match self {
            Idle => "IDLE",
            GpsCapturing => "GPS_CAPTURING",
            GpsCaptured => "GPS_CAPTURED",
            SmsDispatching => "SMS_DISPATCHING",
            SmsDispatched => "SMS_DISPATCHED",
            CallInitiating => "CALL_INITIATING",
            Streaming => "STREAMING",
        }
    }

    pub fn is_active(self) -> bool {
        self != SosPhase::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SosState {
    pub phase: SosPhase,
    pub location: Option<Location>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
}

impl SosState {
    pub fn idle() -> Self {
        Self {
            phase: SosPhase::Idle,
            location: None,
            started_at: None,
            last_updated_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }
}

/// What survives a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SosSnapshot {
    pub phase: SosPhase,
    pub location: Option<Location>,
    pub started_at: Option<DateTime<Utc>>,
}

impl From<&SosState> for SosSnapshot {
    fn from(s: &SosState) -> Self {
        Self {
            phase: s.phase,
            location: s.location.clone(),
            started_at: s.started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SosEvent {
    PhaseChanged { state: SosState },
    Failed { phase: SosPhase, error: String },
    /// Entered `STREAMING`.
    Completed { state: SosState },
    Stopped { state: SosState },
    Recovered { state: SosState },
}

/// The fire-once external actions of the sequence.
#[async_trait::async_trait]
pub trait SosActions: Send + Sync {
    async fn dispatch_sms(&self, location: Option<&Location>) -> Result<(), SosError>;

    async fn initiate_call(&self, location: Option<&Location>) -> Result<(), SosError>;
}

/// Logs the actions after a short delay. Real SMS and telephony are out of scope.
#[derive(Debug, Clone)]
pub struct SimulatedSosActions {
    delay: Duration,
}

impl SimulatedSosActions {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SimulatedSosActions {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait::async_trait]
impl SosActions for SimulatedSosActions {
    async fn dispatch_sms(&self, location: Option<&Location>) -> Result<(), SosError> {
        tokio::time::sleep(self.delay).await;
        match location {
            Some(l) => tracing::warn!(target: "sentinel::sos", "[SOS] SMS sent: need help at {:.5}, {:.5}", l.latitude, l.longitude),
            None => tracing::warn!(target: "sentinel::sos", "[SOS] SMS sent without location"),
        }
        Ok(())
    }

    async fn initiate_call(&self, _location: Option<&Location>) -> Result<(), SosError> {
        tokio::time::sleep(self.delay).await;
        tracing::warn!(target: "sentinel::sos", "[SOS] emergency call initiated");
        Ok(())
    }
}

struct Machine {
    state: SosState,
    run: u64,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    machine: Mutex<Machine>,
    store: TypedStore,
    provider: Arc<dyn LocationProvider>,
    actions: Arc<dyn SosActions>,
    escalation: OnceLock<EscalationController>,
    events: broadcast::Sender<SosEvent>,
    fix_timeout: Duration,
}

impl Inner {
    fn emit(&self, event: SosEvent) {
        let _ = self.events.send(event);
    }

    fn persist(&self, state: &SosState) {
        if let Err(e) = self.store.put_json(SOS_STATE_KEY, &SosSnapshot::from(state)) {
            tracing::error!(target: "sentinel::sos", phase = state.phase.label(), "failed to persist SOS snapshot: {}", e);
        }
    }

    fn clear_snapshot(&self) {
        if let Err(e) = self.store.delete(SOS_STATE_KEY) {
            tracing::error!(target: "sentinel::sos", "failed to clear SOS snapshot: {}", e);
        }
    }

    /// Advance one phase. Invalid or stale transitions are a logged no-op.
    fn transition(&self, m: &mut Machine, run: u64, to: SosPhase) -> bool {
        if m.run != run {
            tracing::debug!(target: "sentinel::sos", run, current = m.run, "stale SOS step ignored");
            return false;
        }
        if m.state.phase.next() != Some(to) {
            tracing::warn!(
                target: "sentinel::sos",
                from = m.state.phase.label(),
                to = to.label(),
                "invalid SOS transition ignored"
            );
            return false;
        }
        m.state.phase = to;
        m.state.last_updated_at = Utc::now();
        self.persist(&m.state);
        tracing::info!(target: "sentinel::sos", phase = to.label(), "SOS phase changed");
        self.emit(SosEvent::PhaseChanged { state: m.state.clone() });
        if to == SosPhase::Streaming {
            self.emit(SosEvent::Completed { state: m.state.clone() });
        }
        true
    }

    async fn perform(&self, phase: SosPhase, location: Option<&Location>) -> Result<Option<Location>, SosError> {
        match phase {
            SosPhase::GpsCapturing => Ok(Some(self.provider.fix(self.fix_timeout).await?)),
            SosPhase::SmsDispatching => self.actions.dispatch_sms(location).await.map(|_| None),
            SosPhase::CallInitiating => self.actions.initiate_call(location).await.map(|_| None),
            _ => Ok(None),
        }
    }
}

/// Runs the sequence from the current phase until `STREAMING`, a failure, or a stop.
async fn drive(inner: Arc<Inner>, run: u64) {
    loop {
        let (phase, location) = {
            let m = lock(&inner.machine);
            if m.run != run {
                return;
            }
            (m.state.phase, m.state.location.clone())
        };
        let Some(next) = phase.next().filter(|_| phase.is_active()) else {
            break;
        };

        let result = inner.perform(phase, location.as_ref()).await;

        let mut m = lock(&inner.machine);
        if m.run != run {
            return;
        }
        match result {
            Ok(fix) => {
                if let Some(fix) = fix {
                    m.state.location = Some(fix);
                }
                if !inner.transition(&mut m, run, next) {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(target: "sentinel::sos", phase = phase.label(), "SOS step failed: {}", e);
                m.task = None;
                inner.emit(SosEvent::Failed {
                    phase,
                    error: e.to_string(),
                });
                return;
            }
        }
    }
    let mut m = lock(&inner.machine);
    if m.run == run {
        m.task = None;
    }
}

/// Cheap to clone; clones drive the same state machine.
#[derive(Clone)]
pub struct SosOrchestrator {
    inner: Arc<Inner>,
}

impl SosOrchestrator {
    pub fn new(
        store: TypedStore,
        provider: Arc<dyn LocationProvider>,
        actions: Arc<dyn SosActions>,
        fix_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                machine: Mutex::new(Machine {
                    state: SosState::idle(),
                    run: 0,
                    task: None,
                }),
                store,
                provider,
                actions,
                escalation: OnceLock::new(),
                events,
                fix_timeout,
            }),
        }
    }

    /// Tie escalation to this session so `stop()` cancels pending auto-dials. First call wins.
    pub fn attach_escalation(&self, escalation: EscalationController) {
        if self.inner.escalation.set(escalation).is_err() {
            tracing::debug!(target: "sentinel::sos", "escalation controller already attached");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SosEvent> {
        self.inner.events.subscribe()
    }

    /// Begin the sequence. No-op (returns false) while a sequence is active.
    pub fn start(&self) -> bool {
        let mut m = lock(&self.inner.machine);
        if m.state.is_active() {
            tracing::debug!(target: "sentinel::sos", phase = m.state.phase.label(), "SOS already active; start ignored");
            return false;
        }
        m.run += 1;
        let run = m.run;
        let now = Utc::now();
        m.state = SosState {
            phase: SosPhase::Idle,
            location: None,
            started_at: Some(now),
            last_updated_at: now,
        };
        if !self.inner.transition(&mut m, run, SosPhase::GpsCapturing) {
            return false;
        }
        m.task = Some(tokio::spawn(drive(self.inner.clone(), run)));
        true
    }

    /// Re-run the step the sequence is parked on. Only valid when active, not running and
    /// not yet streaming.
    pub fn retry(&self) -> bool {
        let mut m = lock(&self.inner.machine);
        let running = m.task.as_ref().is_some_and(|t| !t.is_finished());
        if !m.state.is_active() || m.state.phase == SosPhase::Streaming || running {
            tracing::debug!(
                target: "sentinel::sos",
                phase = m.state.phase.label(),
                running,
                "SOS retry ignored"
            );
            return false;
        }
        m.run += 1;
        let run = m.run;
        tracing::info!(target: "sentinel::sos", phase = m.state.phase.label(), "SOS step retried");
        m.task = Some(tokio::spawn(drive(self.inner.clone(), run)));
        true
    }

    /// Stop from any phase: back to IDLE, snapshot cleared, escalation cancelled.
    pub fn stop(&self) -> SosState {
        let (state, was_active) = {
            let mut m = lock(&self.inner.machine);
            m.run += 1;
            if let Some(task) = m.task.take() {
                task.abort();
            }
            let was_active = m.state.is_active();
            m.state = SosState::idle();
            self.inner.clear_snapshot();
            (m.state.clone(), was_active)
        };

        if let Some(escalation) = self.inner.escalation.get() {
            escalation.cancel();
        }
        if was_active {
            tracing::info!(target: "sentinel::sos", "SOS stopped");
            self.inner.emit(SosEvent::Stopped { state: state.clone() });
        }
        state
    }

    /// Restore a persisted, non-idle sequence for display. Performs no side effects.
    pub fn recover(&self) -> Option<SosState> {
        let snapshot = match self.inner.store.get_json::<SosSnapshot>(SOS_STATE_KEY) {
            Ok(Some(s)) => s,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(target: "sentinel::sos", "unreadable SOS snapshot ignored: {}", e);
                return None;
            }
        };
        if !snapshot.phase.is_active() {
            self.inner.clear_snapshot();
            return None;
        }

        let mut m = lock(&self.inner.machine);
        if m.state.is_active() {
            tracing::debug!(target: "sentinel::sos", "SOS already active; recovery skipped");
            return None;
        }
        m.run += 1;
        m.state = SosState {
            phase: snapshot.phase,
            location: snapshot.location,
            started_at: snapshot.started_at,
            last_updated_at: Utc::now(),
        };
        let state = m.state.clone();
        drop(m);

        tracing::info!(target: "sentinel::sos", phase = state.phase.label(), "SOS state recovered");
        self.inner.emit(SosEvent::Recovered { state: state.clone() });
        Some(state)
    }

    /// Record a live fix while active so the snapshot tracks the latest position.
    pub fn record_location(&self, location: &Location) {
        let mut m = lock(&self.inner.machine);
        if !m.state.is_active() || m.state.phase == SosPhase::GpsCapturing {
            return;
        }
        m.state.location = Some(location.clone());
        m.state.last_updated_at = Utc::now();
        self.inner.persist(&m.state);
    }

    pub fn state(&self) -> SosState {
        lock(&self.inner.machine).state.clone()
    }

    pub fn phase(&self) -> SosPhase {
        lock(&self.inner.machine).state.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase().is_active()
    }

    /// A step is currently executing.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.machine)
            .task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_order() {
        let mut seq = vec![];
        let mut p = SosPhase::Idle;
        while let Some(n) = p.next() {
            seq.push(n.label());
            p = n;
        }
        assert_eq!(
            seq,
            [
                "GPS_CAPTURING",
                "GPS_CAPTURED",
                "SMS_DISPATCHING",
                "SMS_DISPATCHED",
                "CALL_INITIATING",
                "STREAMING"
            ]
        );
    }

    #[test]
    fn phase_serde_matches_label() {
        for p in [SosPhase::Idle, SosPhase::SmsDispatching, SosPhase::Streaming] {
            assert_eq!(serde_json::to_value(p).unwrap(), serde_json::json!(p.label()));
        }
    }

    #[test]
    fn snapshot_is_camel_case() {
        let state = SosState {
            phase: SosPhase::GpsCaptured,
            location: Some(Location::new(1.0, 2.0, 3.0)),
            started_at: Some(Utc::now()),
            last_updated_at: Utc::now(),
        };
        let v = serde_json::to_value(SosSnapshot::from(&state)).unwrap();
        assert_eq!(v["phase"], "GPS_CAPTURED");
        assert!(v.get("startedAt").is_some());
        assert_eq!(v["location"]["lat"], 1.0);
    }
}
