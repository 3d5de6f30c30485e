//! Error types for the SentinelNet core.
//!
//! Input errors are returned to the caller; environment errors (GPS, network, storage) are
//! logged and surfaced as events. Neither is ever a panic.

use thiserror::Error;

pub use config::ConfigError;

/// Result type alias for persistence operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the key-value persistence sink
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors from the outbound notification sink
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification endpoint returned {0}: {1}")]
    Status(u16, String),
}

/// Location fix failures. Transient: the tracker keeps polling after any of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location fix timed out after {0} ms")]
    Timeout(u64),

    #[error("location unavailable: {0}")]
    Unavailable(String),
}

/// Rejected contact edits
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContactError {
    #[error("maximum of {0} emergency contacts reached")]
    Full(usize),

    #[error("contact name and phone are required")]
    MissingField,

    #[error("invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("contact not found: {0}")]
    NotFound(String),
}

/// A failed SOS phase. The phase stays where it was until stop or retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SosError {
    #[error("GPS capture failed: {0}")]
    Location(#[from] LocationError),

    #[error("SMS dispatch failed: {0}")]
    SmsDispatch(String),

    #[error("emergency call failed: {0}")]
    Call(String),
}

/// Invalid caller input rejected before any side effect
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("service name is required")]
    MissingService,

    #[error("battery level must be 0-100, got {0}")]
    BatteryLevel(u16),

    #[error("invalid location: {0}")]
    InvalidLocation(String),
}
