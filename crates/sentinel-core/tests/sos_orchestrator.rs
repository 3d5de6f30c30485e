//! Integration test: the SOS state machine.
//!
//! ## Scenarios
//! 1. A full run emits the six phases in order, with a persisted snapshot after each.
//! 2. `start()` while active is a no-op.
//! 3. `stop()` from any phase returns IDLE, clears the snapshot, and leaves nothing to recover.
//! 4. A failed step parks the phase and publishes `Failed`; `retry()` resumes it.
//! 5. Crash in SMS_DISPATCHING, then `recover()`: phase restored, no second SMS.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use sentinel_core::{
    LocationError, SosEvent, SosOrchestrator, SosPhase, TypedStore, SOS_STATE_KEY,
};
use tokio::sync::broadcast;

const FULL_RUN: [SosPhase; 6] = [
    SosPhase::GpsCapturing,
    SosPhase::GpsCaptured,
    SosPhase::SmsDispatching,
    SosPhase::SmsDispatched,
    SosPhase::CallInitiating,
    SosPhase::Streaming,
];

struct Rig {
    sos: SosOrchestrator,
    store: Arc<RecordingStore>,
    actions: Arc<CountingActions>,
    events: broadcast::Receiver<SosEvent>,
}

fn rig_with(store: Arc<RecordingStore>, provider: ScriptedProvider, actions: CountingActions) -> Rig {
    let actions = shared(actions);
    let sos = SosOrchestrator::new(
        TypedStore::new(store.clone()),
        shared(provider),
        actions.clone(),
        Duration::from_secs(10),
    );
    let events = sos.subscribe();
    Rig {
        sos,
        store,
        actions,
        events,
    }
}

fn rig() -> Rig {
    rig_with(
        shared(RecordingStore::default()),
        ScriptedProvider::fixed(bengaluru()),
        CountingActions::default(),
    )
}

fn drain(events: &mut broadcast::Receiver<SosEvent>) -> Vec<SosEvent> {
    let mut out = vec![];
    while let Ok(ev) = events.try_recv() {
        out.push(ev);
    }
    out
}

fn phases(events: &[SosEvent]) -> Vec<SosPhase> {
    events
        .iter()
        .filter_map(|e| match e {
            SosEvent::PhaseChanged { state } => Some(state.phase),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Scenario 1: full run
// =============================================================================

#[tokio::test(start_paused = true)]
async fn full_run_emits_phases_in_order_with_snapshots() {
    let mut r = rig();
    assert!(r.sos.start());
    settle().await;

    let events = drain(&mut r.events);
    assert_eq!(phases(&events), FULL_RUN);
    assert!(matches!(events.last(), Some(SosEvent::Completed { state }) if state.phase == SosPhase::Streaming));

    let snapshots: Vec<SosPhase> = r.store.sos_snapshots().iter().map(|s| s.phase).collect();
    assert_eq!(snapshots, FULL_RUN);

    let state = r.sos.state();
    assert_eq!(state.phase, SosPhase::Streaming);
    assert_eq!(state.location.as_ref().map(|l| l.latitude), Some(BENGALURU.0));
    assert!(state.started_at.is_some());
    assert_eq!(r.actions.sms_count(), 1);
    assert_eq!(r.actions.call_count(), 1);
    assert!(!r.sos.is_running());
}

#[tokio::test(start_paused = true)]
async fn snapshot_after_capture_carries_location() {
    let r = rig();
    r.sos.start();
    settle().await;

    let snaps = r.store.sos_snapshots();
    assert!(snaps[0].location.is_none(), "GPS_CAPTURING has no fix yet");
    assert!(snaps[1].location.is_some());
    assert!(snaps.iter().all(|s| s.started_at == snaps[0].started_at));
}

// =============================================================================
// Scenario 2: idempotent start
// =============================================================================

#[tokio::test(start_paused = true)]
async fn start_twice_does_not_restart() {
    let mut r = rig_with(
        shared(RecordingStore::default()),
        ScriptedProvider::fixed(bengaluru()),
        CountingActions::with_sms_delay(Duration::from_secs(5)),
    );
    assert!(r.sos.start());
    settle().await;
    assert_eq!(r.sos.phase(), SosPhase::SmsDispatching);
    let started_at = r.sos.state().started_at;

    assert!(!r.sos.start());
    advance(5000).await;

    assert_eq!(phases(&drain(&mut r.events)), FULL_RUN);
    assert_eq!(r.sos.state().started_at, started_at);
    assert_eq!(r.actions.sms_count(), 1);

    assert!(!r.sos.start(), "still active in STREAMING");
}

// =============================================================================
// Scenario 3: stop from any phase
// =============================================================================

async fn stop_at(target: SosPhase) {
    // GPS capture and SMS dispatch each take 1 s, so the run parks on known phases.
    let mut r = rig_with(
        shared(RecordingStore::default()),
        ScriptedProvider::fixed(bengaluru()).with_delay(Duration::from_secs(1)),
        CountingActions::with_sms_delay(Duration::from_secs(1)),
    );
    r.sos.start();
    settle().await;
    let mut waited = 0;
    while r.sos.phase() != target {
        advance(1000).await;
        waited += 1;
        assert!(waited < 10, "never reached {:?}", target);
    }

    let state = r.sos.stop();
    assert_eq!(state.phase, SosPhase::Idle);
    assert!(!r.sos.is_active());
    assert!(r.store.deleted(SOS_STATE_KEY));
    assert!(r.sos.recover().is_none());

    let before = drain(&mut r.events);
    assert!(matches!(before.last(), Some(SosEvent::Stopped { .. })));

    // A step that was in flight must not resurrect the sequence.
    advance(10_000).await;
    assert_eq!(r.sos.phase(), SosPhase::Idle);
    assert!(drain(&mut r.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_during_gps_capture() {
    stop_at(SosPhase::GpsCapturing).await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_sms_dispatch() {
    stop_at(SosPhase::SmsDispatching).await;
}

#[tokio::test(start_paused = true)]
async fn stop_while_streaming() {
    stop_at(SosPhase::Streaming).await;
}

#[tokio::test(start_paused = true)]
async fn stop_then_start_restarts_sequence() {
    let mut r = rig();
    r.sos.start();
    settle().await;
    r.sos.stop();
    drain(&mut r.events);

    assert!(r.sos.start());
    settle().await;
    assert_eq!(phases(&drain(&mut r.events)), FULL_RUN);
    assert_eq!(r.actions.sms_count(), 2);
}

#[tokio::test]
async fn stop_when_idle_is_harmless() {
    let mut r = rig();
    let state = r.sos.stop();
    assert_eq!(state.phase, SosPhase::Idle);
    assert!(drain(&mut r.events).is_empty());
}

// =============================================================================
// Scenario 4: failure parks the phase; retry is explicit
// =============================================================================

#[tokio::test(start_paused = true)]
async fn gps_timeout_parks_in_capturing() {
    let mut r = rig_with(
        shared(RecordingStore::default()),
        ScriptedProvider::scripted(vec![Err(LocationError::Timeout(10_000))], bengaluru()),
        CountingActions::default(),
    );
    r.sos.start();
    settle().await;

    let events = drain(&mut r.events);
    assert_eq!(phases(&events), [SosPhase::GpsCapturing]);
    assert!(matches!(
        events.last(),
        Some(SosEvent::Failed { phase: SosPhase::GpsCapturing, error }) if error.contains("timed out")
    ));
    assert_eq!(r.sos.phase(), SosPhase::GpsCapturing);
    assert!(r.sos.is_active());

    // Nothing happens on its own.
    advance(60_000).await;
    assert_eq!(r.sos.phase(), SosPhase::GpsCapturing);
    assert_eq!(r.actions.sms_count(), 0);

    assert!(r.sos.retry());
    settle().await;
    assert_eq!(r.sos.phase(), SosPhase::Streaming);
    assert_eq!(phases(&drain(&mut r.events)), FULL_RUN[1..]);
}

#[tokio::test(start_paused = true)]
async fn sms_failure_then_retry_dispatches_once_more() {
    let actions = CountingActions::default();
    actions.fail_next_sms();
    let r = rig_with(shared(RecordingStore::default()), ScriptedProvider::fixed(bengaluru()), actions);
    r.sos.start();
    settle().await;
    assert_eq!(r.sos.phase(), SosPhase::SmsDispatching);
    assert_eq!(r.actions.sms_count(), 1);

    assert!(r.sos.retry());
    settle().await;
    assert_eq!(r.sos.phase(), SosPhase::Streaming);
    assert_eq!(r.actions.sms_count(), 2);
    assert_eq!(r.actions.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_is_rejected_when_idle_running_or_streaming() {
    let r = rig_with(
        shared(RecordingStore::default()),
        ScriptedProvider::fixed(bengaluru()),
        CountingActions::with_sms_delay(Duration::from_secs(5)),
    );
    assert!(!r.sos.retry(), "idle");
    r.sos.start();
    settle().await;
    assert!(!r.sos.retry(), "a step is still in flight");
    advance(5000).await;
    assert_eq!(r.sos.phase(), SosPhase::Streaming);
    assert!(!r.sos.retry(), "already streaming");
}

// =============================================================================
// Scenario 5: crash recovery restores visibility only
// =============================================================================

#[tokio::test(start_paused = true)]
async fn crash_in_sms_dispatch_recovers_without_resending() {
    let store = shared(RecordingStore::default());

    // First process: parks forever in SMS_DISPATCHING, then "crashes".
    let first = rig_with(
        store.clone(),
        ScriptedProvider::fixed(bengaluru()),
        CountingActions::with_sms_delay(Duration::from_secs(3600)),
    );
    first.sos.start();
    settle().await;
    assert_eq!(first.sos.phase(), SosPhase::SmsDispatching);
    assert_eq!(first.actions.sms_count(), 1);
    drop(first);

    // Second process over the same store.
    let mut second = rig_with(store, ScriptedProvider::fixed(bengaluru()), CountingActions::default());
    let restored = second.sos.recover().expect("snapshot should be resumable");
    assert_eq!(restored.phase, SosPhase::SmsDispatching);
    assert!(restored.is_active());
    assert_eq!(restored.location.as_ref().map(|l| l.latitude), Some(BENGALURU.0));

    settle().await;
    assert!(second.sos.is_active());
    assert!(!second.sos.is_running());
    assert_eq!(second.actions.sms_count(), 0, "recovery must not re-dispatch SMS");
    assert_eq!(second.actions.call_count(), 0);

    let events = drain(&mut second.events);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], SosEvent::Recovered { state } if state.phase == SosPhase::SmsDispatching));

    assert!(!second.sos.start(), "recovered sequence counts as active");
}

#[tokio::test(start_paused = true)]
async fn recovered_step_reruns_only_on_explicit_retry() {
    let store = shared(RecordingStore::default());
    let first = rig_with(
        store.clone(),
        ScriptedProvider::fixed(bengaluru()),
        CountingActions::with_sms_delay(Duration::from_secs(3600)),
    );
    first.sos.start();
    settle().await;
    drop(first);

    let second = rig_with(store, ScriptedProvider::fixed(bengaluru()), CountingActions::default());
    second.sos.recover();
    assert!(second.sos.retry());
    settle().await;
    assert_eq!(second.sos.phase(), SosPhase::Streaming);
    assert_eq!(second.actions.sms_count(), 1);
}

#[tokio::test]
async fn idle_or_corrupt_snapshot_is_not_recovered() {
    use sentinel_core::KvStore;

    let store = shared(RecordingStore::default());
    store
        .put(SOS_STATE_KEY, br#"{"phase":"IDLE","location":null,"startedAt":null}"#)
        .unwrap();
    let r = rig_with(store.clone(), ScriptedProvider::fixed(bengaluru()), CountingActions::default());
    assert!(r.sos.recover().is_none());

    store.put(SOS_STATE_KEY, b"not json").unwrap();
    assert!(r.sos.recover().is_none());
    assert!(!r.sos.is_active());
}
