//! SentinelNet Gateway: the on-device control surface.
//!
//! Accepts the inbound alert broadcast, device location and battery reports, and UI
//! actions (SOS, contacts, service requests), and streams SOS and escalation events over SSE.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{future, stream, Stream, StreamExt};
use sentinel_core::{
    Alert, ContactError, Decision, EmergencySession, HttpNotificationSink, Location, LoggingNotificationSink,
    NotificationSink, ReportedLocationProvider, SentinelConfig, SessionDeps, SimulatedDialer, SimulatedSosActions,
    SledStore,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type ApiResult<T> = Result<T, (StatusCode, String)>;

#[derive(Clone)]
struct AppState {
    session: Arc<EmergencySession>,
    reporter: Arc<ReportedLocationProvider>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceUpdate {
    battery_level: u16,
    #[serde(default)]
    is_low_power_mode: Option<bool>,
}

#[derive(Deserialize)]
struct NewContact {
    #[serde(default)]
    name: String,
    #[serde(default)]
    phone: String,
}

#[derive(Deserialize)]
struct ServiceBody {
    #[serde(default)]
    service: String,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SentinelConfig::load().expect("invalid SentinelNet configuration");
    let store = SledStore::open(Some(&config.storage_path)).expect("failed to open local store");

    let sink: Arc<dyn NotificationSink> = match config.notification_base_url.as_deref() {
        Some(url) => Arc::new(
            HttpNotificationSink::new(url, config.notify_timeout()).expect("failed to build notification client"),
        ),
        None => {
            tracing::warn!("no notification_base_url configured; notifications are logged only");
            Arc::new(LoggingNotificationSink)
        }
    };
    let reporter = Arc::new(ReportedLocationProvider::new(config.location_max_age()));

    let session = Arc::new(EmergencySession::new(
        config.clone(),
        SessionDeps {
            store: Arc::new(store),
            location: reporter.clone(),
            sink,
            dialer: Arc::new(SimulatedDialer),
            actions: Arc::new(SimulatedSosActions::default()),
        },
    ));

    if let Some(state) = session.recover() {
        tracing::warn!(phase = state.phase.label(), "recovered an active SOS from the previous run");
    }
    let background = session.run_background();

    let app = router(AppState { session, reporter });
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind gateway address");
    tracing::info!("SentinelNet gateway listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("gateway server error");

    background.shutdown();
    tracing::info!("SentinelNet gateway stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/alert", post(alert_handler))
        .route("/api/alert/:id/dismiss", post(dismiss_handler))
        .route("/api/sos/start", post(sos_start))
        .route("/api/sos/stop", post(sos_stop))
        .route("/api/sos/toggle", post(sos_toggle))
        .route("/api/sos/retry", post(sos_retry))
        .route("/api/location", post(location_handler))
        .route("/api/device", post(device_handler))
        .route("/api/contacts", get(list_contacts).post(add_contact))
        .route("/api/contacts/:id", delete(remove_contact))
        .route("/api/service/request", post(service_handler))
        .route("/api/logs", get(logs))
        .route("/api/path", get(path_handler).delete(clear_path))
        .route("/api/events", get(events_handler))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.session.view()))
}

/// Inbound alert broadcast. Every delivery is evaluated independently.
async fn alert_handler(State(state): State<AppState>, Json(alert): Json<Alert>) -> Json<Decision> {
    Json(state.session.handle_alert(alert))
}

async fn dismiss_handler(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Json<Value>> {
    if state.session.dismiss_alert(id) {
        Ok(Json(json!({ "dismissed": id })))
    } else {
        Err((StatusCode::NOT_FOUND, format!("alert {} is not active", id)))
    }
}

async fn sos_start(State(state): State<AppState>) -> Json<Value> {
    let started = state.session.start_sos();
    Json(json!({ "started": started, "state": state.session.sos().state() }))
}

async fn sos_stop(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "state": state.session.stop_sos() }))
}

async fn sos_toggle(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "state": state.session.toggle_sos() }))
}

async fn sos_retry(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    if state.session.retry_sos() {
        Ok(Json(json!({ "retried": true, "state": state.session.sos().state() })))
    } else {
        Err((StatusCode::CONFLICT, "no parked SOS step to retry".to_string()))
    }
}

async fn location_handler(State(state): State<AppState>, Json(location): Json<Location>) -> ApiResult<StatusCode> {
    state
        .reporter
        .report(location)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(StatusCode::ACCEPTED)
}

async fn device_handler(State(state): State<AppState>, Json(update): Json<DeviceUpdate>) -> ApiResult<Json<Value>> {
    let ctx = state
        .session
        .update_device(update.battery_level, update.is_low_power_mode)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!(ctx)))
}

async fn list_contacts(State(state): State<AppState>) -> Json<Value> {
    let contacts = state.session.contacts();
    Json(json!({
        "contacts": contacts.list(),
        "canAddMore": contacts.can_add_more(),
        "maxContacts": sentinel_core::MAX_CONTACTS,
    }))
}

fn contact_error(e: ContactError) -> (StatusCode, String) {
    let code = match e {
        ContactError::Full(_) => StatusCode::CONFLICT,
        ContactError::NotFound(_) => StatusCode::NOT_FOUND,
        ContactError::MissingField | ContactError::InvalidPhone(_) => StatusCode::BAD_REQUEST,
    };
    (code, e.to_string())
}

async fn add_contact(
    State(state): State<AppState>,
    Json(body): Json<NewContact>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let contact = state
        .session
        .contacts()
        .add(&body.name, &body.phone)
        .map_err(contact_error)?;
    Ok((StatusCode::CREATED, Json(json!(contact))))
}

async fn remove_contact(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.session.contacts().remove(&id).map_err(contact_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// User-initiated only; the gateway never calls this on its own.
async fn service_handler(State(state): State<AppState>, Json(body): Json<ServiceBody>) -> ApiResult<Json<Value>> {
    let record = state
        .session
        .request_service(&body.service)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!(record)))
}

async fn logs(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.session.audit()))
}

async fn path_handler(State(state): State<AppState>) -> Json<Value> {
    let path = state.session.path();
    Json(json!({
        "points": path.points(),
        "coordinates": path.coordinates(),
    }))
}

async fn clear_path(State(state): State<AppState>) -> StatusCode {
    state.session.path().clear();
    StatusCode::NO_CONTENT
}

/// SSE feed of SOS phase and escalation events. Lagged receivers skip what they missed.
async fn events_handler(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let sos = BroadcastStream::new(state.session.sos().subscribe()).filter_map(|msg| {
        future::ready(
            msg.ok()
                .and_then(|ev| Event::default().event("sos").json_data(&ev).ok()),
        )
    });
    let escalation = BroadcastStream::new(state.session.escalation().subscribe()).filter_map(|msg| {
        future::ready(
            msg.ok()
                .and_then(|ev| Event::default().event("escalation").json_data(&ev).ok()),
        )
    });
    Sse::new(stream::select(sos, escalation).map(Ok)).keep_alive(KeepAlive::default())
}
