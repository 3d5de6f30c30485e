//! Shared types: locations, alert zones, alerts, contacts.
//!
//! Wire names follow the SentinelNet broadcast server (`lat`/`lng`, `radius`,
//! `"Toxic Gas Leak"`, upper-case severities) so alerts deserialize straight off the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Coordinates
// -----------------------------------------------------------------------------

/// A bare coordinate pair in degrees. Zone centers are points; fixes carry more.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(rename = "lat", alias = "latitude")]
    pub latitude: f64,
    #[serde(rename = "lng", alias = "longitude")]
    pub longitude: f64,
}

impl Point {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Finite and within [-90, 90] / [-180, 180].
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One location fix. Immutable once captured; later fixes supersede it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(rename = "lat", alias = "latitude")]
    pub latitude: f64,
    #[serde(rename = "lng", alias = "longitude")]
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default = "Utc::now", alias = "timestamp")]
    pub captured_at: DateTime<Utc>,
}

impl Location {
    /// A fix captured now.
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self::at(latitude, longitude, accuracy, Utc::now())
    }

    pub fn at(latitude: f64, longitude: f64, accuracy: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            captured_at,
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.latitude, self.longitude)
    }
}

impl From<&Location> for Point {
    fn from(location: &Location) -> Self {
        location.point()
    }
}

// -----------------------------------------------------------------------------
// Alerts
// -----------------------------------------------------------------------------

/// Circular alert zone. Owned by the alert originator; read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertZone {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub center: Point,
    #[serde(rename = "radius", alias = "radius_meters", alias = "radiusMeters")]
    pub radius_meters: f64,
}

impl AlertZone {
    pub fn new(center: Point, radius_meters: f64) -> Self {
        Self {
            name: None,
            center,
            radius_meters,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Your Area")
    }
}

/// Disaster category. Unknown broadcaster categories are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AlertType {
    Fire,
    Flood,
    Earthquake,
    ToxicGasLeak,
    Other(String),
}

impl AlertType {
    pub fn as_str(&self) -> &str {
        match self {
            AlertType::Fire => "Fire",
            AlertType::Flood => "Flood",
            AlertType::Earthquake => "Earthquake",
            AlertType::ToxicGasLeak => "Toxic Gas Leak",
            AlertType::Other(s) => s,
        }
    }
}

impl From<String> for AlertType {
    fn from(s: String) -> Self {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "fire" => AlertType::Fire,
            "flood" => AlertType::Flood,
            "earthquake" => AlertType::Earthquake,
            "toxicgasleak" => AlertType::ToxicGasLeak,
            _ => AlertType::Other(s),
        }
    }
}

impl From<AlertType> for String {
    fn from(t: AlertType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// MEDIUM and HIGH alerts notify emergency contacts.
    pub fn notifies_contacts(self) -> bool {
        matches!(self, Severity::Medium | Severity::High)
    }

    /// Only HIGH alerts auto-dial emergency services.
    pub fn auto_dials(self) -> bool {
        self == Severity::High
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

/// A disaster alert as delivered by the broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub zone: AlertZone,
    #[serde(default)]
    pub instructions: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(id: u64, alert_type: AlertType, severity: Severity, zone: AlertZone) -> Self {
        Self {
            id,
            alert_type,
            severity,
            zone,
            instructions: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn summary(&self) -> AlertSummary {
        AlertSummary {
            id: self.id,
            alert_type: self.alert_type.clone(),
            severity: self.severity,
            timestamp: self.timestamp,
        }
    }
}

/// The part of an alert forwarded to contacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub id: u64,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// Contacts
// -----------------------------------------------------------------------------

/// Emergency contact. Owned by the user; see `ContactBook`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub created_at: DateTime<Utc>,
}
