use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal outcome of a verification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Genuine,
    AlreadyScanned,
    Invalid,
    Error,
}

/// Contact details captured once per scanning session and attached to every
/// submission in that session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorIdentity {
    pub name: String,
    pub phone: String,
    pub pincode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSummary {
    pub product_id: String,
    pub manufacturer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub scan_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: i64,
    pub product_id: String,
    pub manufacturer: String,
    pub name: String,
    pub phone: String,
    pub pincode: String,
    pub status: ScanStatus,
    pub timestamp: DateTime<Utc>,
}

/// Duplicate-scan alert raised server-side and shown on the manufacturer
/// dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub id: i64,
    pub product_id: String,
    pub message: String,
    pub scanned_by: String,
    pub phone: String,
    pub pincode: String,
    pub timestamp: DateTime<Utc>,
}
