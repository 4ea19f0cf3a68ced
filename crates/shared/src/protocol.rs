use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AlertNotification, ProductSummary, ScanRecord, ScanStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub is_manufacturer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredUser {
    pub username: String,
    pub is_manufacturer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub is_manufacturer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub product_id: String,
    pub name: String,
    pub phone: String,
    pub pincode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedProduct {
    pub product_id: String,
    pub manufacturer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstScanInfo {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResponse {
    pub status: ScanStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<ScannedProduct>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_scan: Option<FirstScanInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanned_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductsResponse {
    pub products: Vec<ProductSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScansResponse {
    pub scans: Vec<ScanRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsResponse {
    pub notifications: Vec<AlertNotification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingDataRow {
    pub row: u32,
    pub missing_fields: Vec<String>,
}

/// Body returned by the CSV upload endpoint when the request does not yield
/// a QR archive. `missing_fields` reports absent header columns;
/// `missing_data` reports per-row gaps. A body carrying neither is a plain
/// failure described by `message`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvUploadFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_data: Option<Vec<MissingDataRow>>,
}

impl CsvUploadFailure {
    pub fn is_structured(&self) -> bool {
        self.missing_fields.as_ref().is_some_and(|f| !f.is_empty())
            || self.missing_data.as_ref().is_some_and(|d| !d.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_status_uses_snake_case_on_the_wire() {
        let parsed: ScanStatus = serde_json::from_str("\"already_scanned\"").expect("status");
        assert_eq!(parsed, ScanStatus::AlreadyScanned);
    }

    #[test]
    fn upload_failure_distinguishes_structured_bodies() {
        let header: CsvUploadFailure =
            serde_json::from_str(r#"{"missing_fields":["manufacturer"]}"#).expect("body");
        assert!(header.is_structured());

        let rows: CsvUploadFailure =
            serde_json::from_str(r#"{"missing_data":[{"row":3,"missing_fields":["expiry_date"]}]}"#)
                .expect("body");
        assert!(rows.is_structured());
        assert_eq!(rows.missing_data.as_deref().expect("rows")[0].row, 3);

        let plain: CsvUploadFailure =
            serde_json::from_str(r#"{"message":"Upload failed"}"#).expect("body");
        assert!(!plain.is_structured());
    }
}
