//! Notification sink: the out-of-process service that notifies contacts and logs SOS and
//! service requests.
//!
//! Every call is best-effort. Callers either `await` the result to record it (service
//! requests) or hand the future to [`fire_and_forget`], which logs the outcome and nothing
//! else. No call is ever retried here.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::NotifyError;
use crate::shared::{AlertSummary, Contact, Point};
use crate::sos::SosPhase;

/// `{name, phone}` as sent to the contact-notification endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRef {
    pub name: String,
    pub phone: String,
}

impl From<&Contact> for ContactRef {
    fn from(c: &Contact) -> Self {
        Self {
            name: c.name.clone(),
            phone: c.phone.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactNotification {
    pub contacts: Vec<ContactRef>,
    pub location: Option<Point>,
    pub alert: AlertSummary,
}

/// Live SOS report. `phase` is the orchestrator phase at the time of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SosReport {
    pub user_id: String,
    pub location: Option<Point>,
    pub phase: SosPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    pub service: String,
    pub location: Option<Point>,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_contacts(&self, notification: &ContactNotification) -> Result<Value, NotifyError>;

    async fn sos_start(&self, report: &SosReport) -> Result<Value, NotifyError>;

    async fn sos_stop(&self, user_id: &str) -> Result<Value, NotifyError>;

    async fn request_service(&self, request: &ServiceRequest) -> Result<Value, NotifyError>;
}

// -----------------------------------------------------------------------------
// HTTP sink
// -----------------------------------------------------------------------------

/// POSTs JSON to the SentinelNet server.
pub struct HttpNotificationSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNotificationSink {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: Serialize + ?Sized + Sync>(&self, path: &str, body: &T) -> Result<Value, NotifyError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status(status.as_u16(), text));
        }
        // Some endpoints answer with an empty body.
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())))
    }
}

#[async_trait::async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn notify_contacts(&self, notification: &ContactNotification) -> Result<Value, NotifyError> {
        self.post("/api/contacts/notify", notification).await
    }

    async fn sos_start(&self, report: &SosReport) -> Result<Value, NotifyError> {
        self.post("/api/sos/start", report).await
    }

    async fn sos_stop(&self, user_id: &str) -> Result<Value, NotifyError> {
        self.post("/api/sos/stop", &serde_json::json!({ "userId": user_id })).await
    }

    async fn request_service(&self, request: &ServiceRequest) -> Result<Value, NotifyError> {
        self.post("/api/service/request", request).await
    }
}

// -----------------------------------------------------------------------------
// Logging sink (no server configured)
// -----------------------------------------------------------------------------

/// Logs every call and acknowledges it. Used when no notification server is configured.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotificationSink;

#[async_trait::async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify_contacts(&self, n: &ContactNotification) -> Result<Value, NotifyError> {
        for c in &n.contacts {
            tracing::info!(
                target: "sentinel::notify",
                "[SMS] to {} ({}): {} alert {}",
                c.name,
                c.phone,
                n.alert.alert_type,
                n.alert.id
            );
        }
        Ok(serde_json::json!({ "success": true, "notified": n.contacts.len() }))
    }

    async fn sos_start(&self, report: &SosReport) -> Result<Value, NotifyError> {
        tracing::info!(target: "sentinel::notify", user = %report.user_id, phase = report.phase.label(), "[SOS] start reported");
        Ok(serde_json::json!({ "success": true }))
    }

    async fn sos_stop(&self, user_id: &str) -> Result<Value, NotifyError> {
        tracing::info!(target: "sentinel::notify", user = %user_id, "[SOS] stop reported");
        Ok(serde_json::json!({ "success": true }))
    }

    async fn request_service(&self, request: &ServiceRequest) -> Result<Value, NotifyError> {
        tracing::info!(target: "sentinel::notify", service = %request.service, user = %request.user_id, "[Service] requested");
        Ok(serde_json::json!({ "success": true, "service": request.service }))
    }
}

/// Spawn a sink call and log its outcome. The result never flows back to the caller.
pub fn fire_and_forget<F>(label: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<Value, NotifyError>> + Send + 'static,
{
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => tracing::info!(target: "sentinel::notify", "{} delivered", label),
            Err(e) => tracing::warn!(target: "sentinel::notify", "{} failed: {}", label, e),
        }
    })
}
