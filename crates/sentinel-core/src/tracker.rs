//! Adaptive Location Tracker.
//!
//! One polling task at a time. Cadence comes from the [`TrackingContext`] given at
//! (re)start. Fixes go out on a broadcast channel and on a `watch` feed holding the latest
//! location. Failures are published as events and polling continues at the same cadence.
//!
//! Restart is atomic: each run carries a generation number and publishes only while its
//! generation is current, checked under the same lock that `start`/`stop` take. A run that
//! was replaced mid-fix therefore never delivers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{InputError, LocationError};
use crate::lock;
use crate::shared::Location;

const EVENT_CHANNEL_CAPACITY: usize = 128;
const MIN_INTERVAL: Duration = Duration::from_millis(100);

// -----------------------------------------------------------------------------
// Context and cadence
// -----------------------------------------------------------------------------

/// Supplied on every (re)start. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingContext {
    pub is_sos_active: bool,
    /// 0-100.
    pub battery_level: u8,
    pub is_low_power_mode: bool,
}

impl Default for TrackingContext {
    fn default() -> Self {
        Self {
            is_sos_active: false,
            battery_level: 100,
            is_low_power_mode: false,
        }
    }
}

impl TrackingContext {
    /// Low-power mode derived from the battery level: at or below `threshold` is low.
    pub fn from_battery(is_sos_active: bool, battery_level: u8, threshold: u8) -> Self {
        Self {
            is_sos_active,
            battery_level,
            is_low_power_mode: battery_level <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingMode {
    Idle,
    Sos,
    LowPower,
}

impl TrackingMode {
    /// Low power outranks SOS: a low battery slows polling even during an emergency.
    pub fn for_context(ctx: &TrackingContext) -> Self {
        if ctx.is_low_power_mode {
            TrackingMode::LowPower
        } else if ctx.is_sos_active {
            TrackingMode::Sos
        } else {
            TrackingMode::Idle
        }
    }
}

/// Polling cadence table, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub idle_interval_ms: u64,
    pub sos_interval_ms: u64,
    pub low_power_interval_ms: u64,
    pub fix_timeout_ms: u64,
    pub low_battery_threshold: u8,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 10_000,
            sos_interval_ms: 3_000,
            low_power_interval_ms: 30_000,
            fix_timeout_ms: 10_000,
            low_battery_threshold: 20,
        }
    }
}

impl TrackerConfig {
    pub fn interval_for(&self, mode: TrackingMode) -> Duration {
        let ms = match mode {
            TrackingMode::Idle => self.idle_interval_ms,
            TrackingMode::Sos => self.sos_interval_ms,
            TrackingMode::LowPower => self.low_power_interval_ms,
        };
        Duration::from_millis(ms).max(MIN_INTERVAL)
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_millis(self.fix_timeout_ms)
    }
}

// -----------------------------------------------------------------------------
// Location sources
// -----------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync {
    /// One fix, or an error within `timeout`.
    async fn fix(&self, timeout: Duration) -> Result<Location, LocationError>;
}

/// Fixes reported by the device (e.g. the gateway's location endpoint).
///
/// A fix younger than `max_age` is served immediately; otherwise `fix` waits for the next
/// report until the timeout.
pub struct ReportedLocationProvider {
    latest: watch::Sender<Option<Location>>,
    max_age: Duration,
}

impl ReportedLocationProvider {
    pub fn new(max_age: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        Self { latest, max_age }
    }

    pub fn report(&self, location: Location) -> Result<(), InputError> {
        if !location.point().is_valid() {
            return Err(InputError::InvalidLocation(format!(
                "{}, {}",
                location.latitude, location.longitude
            )));
        }
        self.latest.send_replace(Some(location));
        Ok(())
    }

    fn fresh(&self, location: &Location) -> bool {
        // Timestamps from the future count as fresh.
        (Utc::now() - location.captured_at)
            .to_std()
            .map(|age| age <= self.max_age)
            .unwrap_or(true)
    }
}

#[async_trait::async_trait]
impl LocationProvider for ReportedLocationProvider {
    async fn fix(&self, timeout: Duration) -> Result<Location, LocationError> {
        let mut rx = self.latest.subscribe();
        let wait = async {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(loc) = current {
                    if self.fresh(&loc) {
                        return Ok(loc);
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(LocationError::Unavailable("location source closed".into()));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(LocationError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

// -----------------------------------------------------------------------------
// Tracker
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Fix(Location),
    Error(LocationError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub is_tracking: bool,
    pub mode: Option<TrackingMode>,
    pub interval_ms: Option<u64>,
    pub context: Option<TrackingContext>,
    pub fixes: u64,
    pub errors: u64,
    pub last_fix_at: Option<DateTime<Utc>>,
}

struct Run {
    context: TrackingContext,
    mode: TrackingMode,
    interval: Duration,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    generation: u64,
    run: Option<Run>,
    fixes: u64,
    errors: u64,
    last_fix_at: Option<DateTime<Utc>>,
}

struct Shared {
    provider: Arc<dyn LocationProvider>,
    config: TrackerConfig,
    state: Mutex<State>,
    events: broadcast::Sender<TrackerEvent>,
    latest: watch::Sender<Option<Location>>,
}

impl Shared {
    /// Publish one poll result. Returns false when `generation` is no longer current.
    fn publish(&self, generation: u64, result: Result<Location, LocationError>) -> bool {
        let mut state = lock(&self.state);
        if state.generation != generation || state.run.is_none() {
            return false;
        }
        match result {
            Ok(location) => {
                state.fixes += 1;
                state.last_fix_at = Some(location.captured_at);
                self.latest.send_replace(Some(location.clone()));
                let _ = self.events.send(TrackerEvent::Fix(location));
            }
            Err(err) => {
                state.errors += 1;
                tracing::warn!(target: "sentinel::tracker", "location fix failed: {}", err);
                let _ = self.events.send(TrackerEvent::Error(err));
            }
        }
        true
    }
}

async fn poll(shared: Arc<Shared>, generation: u64, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let result = shared.provider.fix(shared.config.fix_timeout()).await;
        if !shared.publish(generation, result) {
            return;
        }
    }
}

pub struct LocationTracker {
    shared: Arc<Shared>,
}

impl LocationTracker {
    pub fn new(provider: Arc<dyn LocationProvider>, config: TrackerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (latest, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                provider,
                config,
                state: Mutex::new(State::default()),
                events,
                latest,
            }),
        }
    }

    /// Start, or restart with a new cadence. The previous run is cancelled first.
    pub fn start(&self, context: TrackingContext) {
        let mode = TrackingMode::for_context(&context);
        let interval = self.shared.config.interval_for(mode);

        let mut state = lock(&self.shared.state);
        state.generation += 1;
        let generation = state.generation;
        let replaced = state.run.take().map(|old| old.handle.abort()).is_some();
        let handle = tokio::spawn(poll(self.shared.clone(), generation, interval));
        state.run = Some(Run {
            context,
            mode,
            interval,
            handle,
        });
        drop(state);

        tracing::info!(
            target: "sentinel::tracker",
            mode = ?mode,
            interval_ms = interval.as_millis() as u64,
            battery = context.battery_level,
            restarted = replaced,
            "location tracking started"
        );
    }

    /// Idempotent. Returns true if tracking was running.
    pub fn stop(&self) -> bool {
        let mut state = lock(&self.shared.state);
        state.generation += 1;
        match state.run.take() {
            Some(run) => {
                run.handle.abort();
                drop(state);
                tracing::info!(target: "sentinel::tracker", "location tracking stopped");
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> TrackingStatus {
        let state = lock(&self.shared.state);
        let run = state.run.as_ref();
        TrackingStatus {
            is_tracking: run.is_some(),
            mode: run.map(|r| r.mode),
            interval_ms: run.map(|r| r.interval.as_millis() as u64),
            context: run.map(|r| r.context),
            fixes: state.fixes,
            errors: state.errors,
            last_fix_at: state.last_fix_at,
        }
    }

    pub fn current_context(&self) -> Option<TrackingContext> {
        lock(&self.shared.state).run.as_ref().map(|r| r.context)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.shared.events.subscribe()
    }

    /// Latest-location feed; most recent fix wins.
    pub fn location_feed(&self) -> watch::Receiver<Option<Location>> {
        self.shared.latest.subscribe()
    }

    pub fn latest_location(&self) -> Option<Location> {
        self.shared.latest.borrow().clone()
    }

    /// Seed the feed (crash recovery) unless a live fix already exists.
    pub fn restore_location(&self, location: Location) {
        self.shared.latest.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(location);
                true
            } else {
                false
            }
        });
    }
}

impl Drop for LocationTracker {
    fn drop(&mut self) {
        if let Some(run) = lock(&self.shared.state).run.take() {
            run.handle.abort();
        }
    }
}
