//! SentinelNet emergency orchestration core.
//!
//! Decides whether disaster alerts concern the user, drives the SOS activation sequence
//! (with crash recovery), escalates severe alerts to contacts and emergency services, and
//! adapts location polling to battery and emergency state.
//!
//! ```text
//!  LocationTracker ──fix──▶ AlertDecisionEngine ──trigger──▶ EscalationController ──▶ NotificationSink
//!        │                                                          ▲
//!        └──fix──▶ SosOrchestrator ──phase events──▶ UI / audit / NotificationSink
//!                        │  stop() cancels escalation ──────────────┘
//!                        └──snapshot──▶ KvStore (sled)
//! ```

pub mod config;
pub mod contacts;
pub mod decision;
pub mod error;
pub mod escalation;
pub mod geofence;
pub mod notify;
pub mod path_history;
pub mod session;
pub mod shared;
pub mod sos;
pub mod store;
pub mod tracker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::SentinelConfig;
pub use contacts::{ContactBook, CONTACTS_KEY, MAX_CONTACTS};
pub use decision::{AlertDecisionEngine, Decision, DecisionLog, DecisionReason, DECISION_LOG_CAPACITY};
pub use error::{ConfigError, ContactError, InputError, LocationError, NotifyError, SosError, StoreError, StoreResult};
pub use escalation::{
    emergency_service, Dialer, EmergencyCall, EmergencyService, EscalationController, EscalationEvent,
    EscalationOutcome, SimulatedDialer, DEFAULT_GRACE_WINDOW,
};
pub use geofence::{contains, distance, EARTH_RADIUS_METERS};
pub use notify::{
    fire_and_forget, ContactNotification, ContactRef, HttpNotificationSink, LoggingNotificationSink,
    NotificationSink, ServiceRequest, SosReport,
};
pub use path_history::{PathHistory, PathPoint, MAX_PATH_POINTS, MIN_MOVEMENT_METERS, PATH_HISTORY_KEY};
pub use session::{AuditLog, EmergencySession, ServiceRecord, SessionDeps, SessionHandles, SessionView, SosAuditEntry};
pub use shared::{Alert, AlertSummary, AlertType, AlertZone, Contact, Location, Point, Severity};
pub use sos::{
    SimulatedSosActions, SosActions, SosEvent, SosOrchestrator, SosPhase, SosSnapshot, SosState, SOS_STATE_KEY,
};
pub use store::{KvStore, MemoryStore, SledStore, TypedStore};
pub use tracker::{
    LocationProvider, LocationTracker, ReportedLocationProvider, TrackerConfig, TrackerEvent, TrackingContext,
    TrackingMode, TrackingStatus,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Locks a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
