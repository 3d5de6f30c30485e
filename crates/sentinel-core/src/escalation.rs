//! Severity Escalation Controller.
//!
//! MEDIUM and HIGH triggers notify contacts at once (fire-and-forget). HIGH triggers also
//! schedule an auto-dial after a grace window. The dial stays a cancellable scheduled action
//! until it actually fires: `cancel()` inside the window guarantees no call is placed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::lock;
use crate::notify::{ContactNotification, ContactRef, NotificationSink};
use crate::shared::{Alert, AlertType, Contact, Location};

pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_millis(2000);

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmergencyService {
    pub number: &'static str,
    pub name: &'static str,
}

/// Alert type to emergency line.
pub fn emergency_service(alert_type: &AlertType) -> EmergencyService {
    match alert_type {
        AlertType::Fire => EmergencyService {
            number: "101",
            name: "Fire Department",
        },
        AlertType::ToxicGasLeak => EmergencyService {
            number: "108",
            name: "Ambulance",
        },
        _ => EmergencyService {
            number: "112",
            name: "Police/Emergency",
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyCall {
    pub alert_id: u64,
    pub number: String,
    pub service: String,
    pub placed_at: DateTime<Utc>,
}

/// Places the emergency call. Real telephony is out of scope; see [`SimulatedDialer`].
pub trait Dialer: Send + Sync {
    fn dial(&self, call: &EmergencyCall);
}

#[derive(Debug, Default, Clone)]
pub struct SimulatedDialer;

impl Dialer for SimulatedDialer {
    fn dial(&self, call: &EmergencyCall) {
        tracing::warn!(
            target: "sentinel::escalation",
            "[AutoCall] Dialing {} ({}) for alert {}",
            call.number,
            call.service,
            call.alert_id
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EscalationEvent {
    ContactsNotified { alert_id: u64, count: usize },
    ContactNotificationFailed { alert_id: u64, error: String },
    NoContacts { alert_id: u64 },
    AutoDialScheduled { alert_id: u64, number: String, service: String, grace_ms: u64 },
    AutoDialCancelled { alert_id: u64 },
    AutoDialed { call: EmergencyCall },
}

/// What `on_trigger` set in motion. Side effects themselves complete later.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationOutcome {
    pub contacts_notified: bool,
    pub auto_dial: Option<EmergencyService>,
    /// A pending dial for another alert was replaced.
    pub replaced_pending: bool,
}

struct PendingDial {
    token: u64,
    alert_id: u64,
    service: EmergencyService,
    handle: JoinHandle<()>,
}

struct Inner {
    sink: Arc<dyn NotificationSink>,
    dialer: Arc<dyn Dialer>,
    grace: Duration,
    pending: Mutex<Option<PendingDial>>,
    next_token: AtomicU64,
    events: broadcast::Sender<EscalationEvent>,
}

impl Inner {
    fn emit(&self, event: EscalationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Timer expiry. Places the call only if this timer is still the pending one.
    fn fire(&self, token: u64) {
        let taken = {
            let mut pending = lock(&self.pending);
            match pending.as_ref() {
                Some(p) if p.token == token => pending.take(),
                _ => None,
            }
        };
        let Some(p) = taken else {
            tracing::debug!(target: "sentinel::escalation", token, "stale auto-dial timer ignored");
            return;
        };
        let call = EmergencyCall {
            alert_id: p.alert_id,
            number: p.service.number.to_string(),
            service: p.service.name.to_string(),
            placed_at: Utc::now(),
        };
        self.dialer.dial(&call);
        self.emit(EscalationEvent::AutoDialed { call });
    }
}

/// Cheap to clone; clones share the pending dial.
#[derive(Clone)]
pub struct EscalationController {
    inner: Arc<Inner>,
}

impl EscalationController {
    pub fn new(sink: Arc<dyn NotificationSink>, dialer: Arc<dyn Dialer>, grace: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                sink,
                dialer,
                grace,
                pending: Mutex::new(None),
                next_token: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EscalationEvent> {
        self.inner.events.subscribe()
    }

    pub fn grace_window(&self) -> Duration {
        self.inner.grace
    }

    /// React to a triggered alert. Never blocks and never fails; must run inside a tokio runtime.
    pub fn on_trigger(&self, alert: &Alert, location: Option<&Location>, contacts: &[Contact]) -> EscalationOutcome {
        let mut outcome = EscalationOutcome {
            contacts_notified: false,
            auto_dial: None,
            replaced_pending: false,
        };

        if alert.severity.notifies_contacts() {
            outcome.contacts_notified = self.notify_contacts(alert, location, contacts);
        }

        if alert.severity.auto_dials() {
            let service = emergency_service(&alert.alert_type);
            outcome.replaced_pending = self.schedule_dial(alert.id, service);
            outcome.auto_dial = Some(service);
        }

        tracing::info!(
            target: "sentinel::escalation",
            alert_id = alert.id,
            severity = alert.severity.as_str(),
            contacts = outcome.contacts_notified,
            auto_dial = ?outcome.auto_dial.map(|s| s.number),
            "escalation started"
        );
        outcome
    }

    fn notify_contacts(&self, alert: &Alert, location: Option<&Location>, contacts: &[Contact]) -> bool {
        if contacts.is_empty() {
            tracing::info!(target: "sentinel::escalation", alert_id = alert.id, "no emergency contacts to notify");
            self.inner.emit(EscalationEvent::NoContacts { alert_id: alert.id });
            return false;
        }
        let notification = ContactNotification {
            contacts: contacts.iter().map(ContactRef::from).collect(),
            location: location.map(Location::point),
            alert: alert.summary(),
        };
        let inner = self.inner.clone();
        let alert_id = alert.id;
        let count = notification.contacts.len();
        tokio::spawn(async move {
            match inner.sink.notify_contacts(&notification).await {
                Ok(_) => {
                    tracing::info!(target: "sentinel::escalation", alert_id, count, "contacts notified");
                    inner.emit(EscalationEvent::ContactsNotified { alert_id, count });
                }
                Err(e) => {
                    tracing::warn!(target: "sentinel::escalation", alert_id, "contact notification failed: {}", e);
                    inner.emit(EscalationEvent::ContactNotificationFailed {
                        alert_id,
                        error: e.to_string(),
                    });
                }
            }
        });
        true
    }

    /// Replace any pending dial with a fresh one. Returns true if one was replaced.
    fn schedule_dial(&self, alert_id: u64, service: EmergencyService) -> bool {
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        let deadline = Instant::now() + self.inner.grace;

        // The lock is held across spawn so the timer can never observe the slot before it is filled.
        let mut pending = lock(&self.inner.pending);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            inner.fire(token);
        });
        let previous = pending.replace(PendingDial {
            token,
            alert_id,
            service,
            handle,
        });
        drop(pending);

        let replaced = match previous {
            Some(prev) => {
                prev.handle.abort();
                tracing::info!(
                    target: "sentinel::escalation",
                    replaced = prev.alert_id,
                    alert_id,
                    "pending auto-dial replaced"
                );
                true
            }
            None => false,
        };
        self.inner.emit(EscalationEvent::AutoDialScheduled {
            alert_id,
            number: service.number.to_string(),
            service: service.name.to_string(),
            grace_ms: self.inner.grace.as_millis() as u64,
        });
        replaced
    }

    /// Cancel the pending auto-dial, if it has not fired. Returns true if one was cancelled.
    pub fn cancel(&self) -> bool {
        let taken = lock(&self.inner.pending).take();
        self.finish_cancel(taken)
    }

    /// Cancel only if the pending auto-dial belongs to `alert_id`.
    pub fn cancel_for(&self, alert_id: u64) -> bool {
        let taken = {
            let mut pending = lock(&self.inner.pending);
            match pending.as_ref() {
                Some(p) if p.alert_id == alert_id => pending.take(),
                _ => None,
            }
        };
        self.finish_cancel(taken)
    }

    fn finish_cancel(&self, taken: Option<PendingDial>) -> bool {
        match taken {
            Some(p) => {
                p.handle.abort();
                tracing::info!(target: "sentinel::escalation", alert_id = p.alert_id, "auto-dial cancelled");
                self.inner.emit(EscalationEvent::AutoDialCancelled { alert_id: p.alert_id });
                true
            }
            None => false,
        }
    }

    /// Alert id of the pending auto-dial.
    pub fn pending_alert(&self) -> Option<u64> {
        lock(&self.inner.pending).as_ref().map(|p| p.alert_id)
    }
}
