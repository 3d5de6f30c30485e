//! Alert Decision Engine: is this alert about the user?
//!
//! Evaluation never blocks on a fresher fix. With no current fix it falls back to the last
//! known one, and with neither it fails closed (`NO_LOCATION`, no trigger).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geofence;
use crate::shared::{Alert, Location};

/// Decisions kept in the audit log; the oldest is evicted first.
pub const DECISION_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    InZone,
    OutOfZone,
    NoLocation,
}

/// One evaluation outcome. Never mutated after it is logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub alert_id: u64,
    pub should_trigger: bool,
    /// Absent only for `NO_LOCATION`.
    pub distance_meters: Option<f64>,
    pub reason: DecisionReason,
    /// The location came from the last-known fallback rather than the caller.
    #[serde(default)]
    pub used_last_known: bool,
    pub evaluated_at: DateTime<Utc>,
}

/// Append-only FIFO ring of decisions.
#[derive(Debug, Clone)]
pub struct DecisionLog {
    entries: VecDeque<Decision>,
    capacity: usize,
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::with_capacity(DECISION_LOG_CAPACITY)
    }
}

impl DecisionLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, decision: Decision) {
        while self.entries.len() >= self.capacity.max(1) {
            self.entries.pop_front();
        }
        self.entries.push_back(decision);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Decision> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Decision> {
        self.entries.iter().cloned().collect()
    }
}

/// Owns the decision log and the last-known location used as a fallback.
#[derive(Debug, Default)]
pub struct AlertDecisionEngine {
    log: DecisionLog,
    last_known: Option<Location>,
}

impl AlertDecisionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fix as the fallback for later evaluations without one.
    pub fn observe_location(&mut self, location: &Location) {
        if location.point().is_valid() {
            self.last_known = Some(location.clone());
        }
    }

    pub fn evaluate(&mut self, current: Option<&Location>, alert: &Alert) -> Decision {
        let (location, used_last_known) = match current.filter(|l| l.point().is_valid()) {
            Some(l) => {
                self.last_known = Some(l.clone());
                (Some(l.clone()), false)
            }
            None => (self.last_known.clone(), self.last_known.is_some()),
        };

        let decision = match location {
            None => Decision {
                alert_id: alert.id,
                should_trigger: false,
                distance_meters: None,
                reason: DecisionReason::NoLocation,
                used_last_known: false,
                evaluated_at: Utc::now(),
            },
            Some(loc) => {
                let d = geofence::distance(alert.zone.center, loc.point());
                let inside = geofence::contains(&alert.zone, loc.point());
                Decision {
                    alert_id: alert.id,
                    should_trigger: inside,
                    distance_meters: Some(d),
                    reason: if inside {
                        DecisionReason::InZone
                    } else {
                        DecisionReason::OutOfZone
                    },
                    used_last_known,
                    evaluated_at: Utc::now(),
                }
            }
        };

        tracing::debug!(
            target: "sentinel::decision",
            alert_id = alert.id,
            trigger = decision.should_trigger,
            reason = ?decision.reason,
            distance = ?decision.distance_meters,
            used_last_known = decision.used_last_known,
            "alert evaluated"
        );
        self.log.push(decision.clone());
        decision
    }

    pub fn log(&self) -> &DecisionLog {
        &self.log
    }

    pub fn last_known(&self) -> Option<&Location> {
        self.last_known.as_ref()
    }
}
