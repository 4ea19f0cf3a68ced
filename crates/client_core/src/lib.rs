use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use qr_decode::{CameraInfo, DecodeSession, DecoderOptions, QrDecoder};
use reqwest::Client;
use shared::{
    error::ApiFailure,
    protocol::{
        CsvUploadFailure, LoginRequest, LoginResponse, NotificationsResponse, ProductsResponse,
        RegisterRequest, RegisteredUser, ScanRequest, ScanResponse, ScansResponse,
    },
};
use shared::domain::{AlertNotification, ProductSummary, ScanRecord};
use tokio::sync::RwLock;
use tracing::info;

pub mod error;
pub mod scan_session;
pub mod upload;

pub use error::{ApiError, FailureKind};
pub use scan_session::{
    validate_phone, DecodeMode, IdentityFieldErrors, Notice, NoticeKind, ScanSessionController,
    SessionEvent, SessionPhase, SessionSnapshot,
};
pub use upload::{
    ArtifactSink, DirArtifactSink, MissingArtifactSink, ReportRow, RowValidation, SelectFileError,
    SkipReason, UploadController, UploadDisposition, UploadEvent, UploadPhase, UploadSnapshot,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub token: String,
    pub is_manufacturer: bool,
}

/// Bearer token shared by every authenticated call. Explicit init/teardown
/// lifecycle: `init` on login, `teardown` on logout; consumers read through
/// a passed-in handle rather than a hidden global.
#[derive(Default)]
pub struct AuthSession {
    inner: RwLock<Option<SessionToken>>,
}

impl AuthSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn init(&self, token: String, is_manufacturer: bool) {
        let mut guard = self.inner.write().await;
        *guard = Some(SessionToken {
            token,
            is_manufacturer,
        });
    }

    pub async fn teardown(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    pub async fn bearer_token(&self) -> Option<String> {
        self.inner.read().await.as_ref().map(|s| s.token.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.read().await.is_some()
    }

    pub async fn is_manufacturer(&self) -> bool {
        self.inner
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.is_manufacturer)
    }
}

/// Result of a CSV upload round trip that reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsvUploadOutcome {
    /// The server generated the QR archive; bytes are ready to save.
    Archive(Vec<u8>),
    /// The server rejected the CSV with a structured validation body.
    Rejected(CsvUploadFailure),
}

/// Typed wrappers over the verification service's HTTP endpoints.
pub struct VerifyApi {
    http: Client,
    server_url: String,
    auth: Arc<AuthSession>,
}

impl VerifyApi {
    pub fn new(server_url: impl Into<String>, auth: Arc<AuthSession>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            auth,
        }
    }

    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn bearer(&self) -> Result<String, ApiError> {
        self.auth.bearer_token().await.ok_or(ApiError::MissingToken)
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
        is_manufacturer: bool,
    ) -> Result<RegisteredUser, ApiError> {
        let response = self
            .http
            .post(format!("{}/register", self.server_url))
            .json(&RegisterRequest {
                username: username.to_string(),
                password: password.to_string(),
                is_manufacturer,
            })
            .send()
            .await?;
        let response = check(response, "Registration failed").await?;
        Ok(response.json().await?)
    }

    /// Logs in and initializes the shared auth session on success.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let response = self
            .http
            .post(format!("{}/login", self.server_url))
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let response = check(response, "Login failed").await?;
        let body: LoginResponse = response.json().await?;
        self.auth
            .init(body.token.clone(), body.is_manufacturer)
            .await;
        info!(is_manufacturer = body.is_manufacturer, "auth: session initialized");
        Ok(body)
    }

    pub async fn scan_product(&self, request: &ScanRequest) -> Result<ScanResponse, ApiError> {
        let response = self
            .http
            .post(format!("{}/scan", self.server_url))
            .json(request)
            .send()
            .await?;
        let response = check(response, "Scan failed").await?;
        Ok(response.json().await?)
    }

    pub async fn fetch_products(&self) -> Result<Vec<ProductSummary>, ApiError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/products", self.server_url))
            .bearer_auth(token)
            .send()
            .await?;
        let response = check(response, "Failed to fetch products").await?;
        let body: ProductsResponse = response.json().await?;
        Ok(body.products)
    }

    pub async fn fetch_scans(&self) -> Result<Vec<ScanRecord>, ApiError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/scans", self.server_url))
            .bearer_auth(token)
            .send()
            .await?;
        let response = check(response, "Failed to fetch scans").await?;
        let body: ScansResponse = response.json().await?;
        Ok(body.scans)
    }

    pub async fn fetch_notifications(&self) -> Result<Vec<AlertNotification>, ApiError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/notifications", self.server_url))
            .bearer_auth(token)
            .send()
            .await?;
        let response = check(response, "Failed to fetch notifications").await?;
        let body: NotificationsResponse = response.json().await?;
        Ok(body.notifications)
    }

    /// Uploads a product CSV. A success response carries the generated QR
    /// archive; a structured rejection is returned as data, not as an error,
    /// so the caller can render the per-row report.
    pub async fn upload_csv(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<CsvUploadOutcome, ApiError> {
        let token = self.bearer().await?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("text/csv")?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(format!("{}/upload_csv", self.server_url))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let archive = response.bytes().await?;
            return Ok(CsvUploadOutcome::Archive(archive.to_vec()));
        }

        let body = response.text().await.unwrap_or_default();
        if let Ok(failure) = serde_json::from_str::<CsvUploadFailure>(&body) {
            if failure.is_structured() {
                return Ok(CsvUploadOutcome::Rejected(failure));
            }
            if let Some(message) = failure.message {
                return Err(ApiError::Server { status, message });
            }
        }
        Err(ApiError::Server {
            status,
            message: "Upload failed".to_string(),
        })
    }

    pub async fn download_sample_csv(&self) -> Result<Vec<u8>, ApiError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/sample_csv", self.server_url))
            .bearer_auth(token)
            .send()
            .await?;
        let response = check(response, "Failed to download sample CSV").await?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Maps a non-success response to `ApiError::Server`, preferring the
/// server-provided `{message}` body over the caller's fallback.
async fn check(response: reqwest::Response, fallback: &str) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<ApiFailure>()
        .await
        .ok()
        .map(|failure| failure.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| fallback.to_string());
    Err(ApiError::Server { status, message })
}

/// Null decoder for environments with no camera backend: listing cameras
/// fails, which the scan session treats as degradation to the image-upload
/// path rather than an error.
pub struct MissingQrDecoder;

#[async_trait]
impl QrDecoder for MissingQrDecoder {
    async fn list_cameras(&self) -> anyhow::Result<Vec<CameraInfo>> {
        Err(anyhow!("qr decoder backend unavailable"))
    }

    async fn start(&self, _options: DecoderOptions) -> anyhow::Result<Arc<dyn DecodeSession>> {
        Err(anyhow!("qr decoder backend unavailable"))
    }

    async fn decode_image(&self, _image_bytes: &[u8]) -> anyhow::Result<String> {
        Err(anyhow!("qr decoder backend unavailable"))
    }
}

/// Front door for the verification client: the API wrappers, the shared
/// auth session, and the two stateful controllers.
pub struct VerifyClient {
    api: Arc<VerifyApi>,
    auth: Arc<AuthSession>,
    pub scan: Arc<ScanSessionController>,
    pub upload: Arc<UploadController>,
}

impl VerifyClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::new_with_dependencies(
            server_url,
            Arc::new(MissingQrDecoder),
            Arc::new(MissingArtifactSink),
        )
    }

    pub fn new_with_dependencies(
        server_url: impl Into<String>,
        decoder: Arc<dyn QrDecoder>,
        artifacts: Arc<dyn ArtifactSink>,
    ) -> Self {
        let auth = Arc::new(AuthSession::new());
        let api = Arc::new(VerifyApi::new(server_url, Arc::clone(&auth)));
        let scan = ScanSessionController::new(Arc::clone(&api), decoder);
        let upload = UploadController::new(Arc::clone(&api), artifacts);
        Self {
            api,
            auth,
            scan,
            upload,
        }
    }

    pub fn api(&self) -> &Arc<VerifyApi> {
        &self.api
    }

    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    /// Tears down the token and resets both controllers so no dependent
    /// view state survives the session.
    pub async fn logout(&self) {
        self.auth.teardown().await;
        self.scan.reset_session().await;
        self.upload.reset().await;
        info!("auth: session torn down");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
