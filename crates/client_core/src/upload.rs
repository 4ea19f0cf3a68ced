use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use shared::protocol::CsvUploadFailure;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{ApiError, CsvUploadOutcome, VerifyApi};

/// Deterministic name for the generated QR archive.
pub const QR_ARCHIVE_FILENAME: &str = "qrcodes.zip";

/// Destination for downloaded artifacts (the QR archive, the sample CSV).
/// Abstracted so the save-as step is injectable and observable in tests.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn save(&self, filename: &str, bytes: &[u8]) -> anyhow::Result<()>;
}

pub struct MissingArtifactSink;

#[async_trait]
impl ArtifactSink for MissingArtifactSink {
    async fn save(&self, filename: &str, _bytes: &[u8]) -> anyhow::Result<()> {
        Err(anyhow!("no artifact sink configured for {filename}"))
    }
}

/// Saves artifacts into a directory, creating it on first use.
pub struct DirArtifactSink {
    dir: PathBuf,
}

impl DirArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ArtifactSink for DirArtifactSink {
    async fn save(&self, filename: &str, bytes: &[u8]) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.dir.join(filename);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Idle,
    Submitting,
}

/// Row label in the validation report: either a data row number or the
/// header line itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportRow {
    Header,
    Data(u32),
}

impl fmt::Display for ReportRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportRow::Header => write!(f, "Header"),
            ReportRow::Data(row) => write!(f, "{row}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowValidation {
    pub row: ReportRow,
    pub missing_fields: Vec<String>,
}

/// Orders the report as the server describes it: the missing-header entry
/// first, then per-row gaps verbatim.
fn build_validation_report(failure: &CsvUploadFailure) -> Vec<RowValidation> {
    let mut report = Vec::new();
    if let Some(missing) = failure.missing_fields.as_ref().filter(|m| !m.is_empty()) {
        report.push(RowValidation {
            row: ReportRow::Header,
            missing_fields: missing.clone(),
        });
    }
    for row in failure.missing_data.iter().flatten() {
        report.push(RowValidation {
            row: ReportRow::Data(row.row),
            missing_fields: row.missing_fields.clone(),
        });
    }
    report
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SelectFileError {
    #[error("only .csv files are accepted")]
    NotCsv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoFileSelected,
    NotAuthenticated,
    SubmissionInFlight,
}

/// How a `submit` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadDisposition {
    Skipped(SkipReason),
    Saved { filename: String },
    Rejected { report: Vec<RowValidation> },
    Failed { message: String },
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    SubmissionStarted,
    Completed { filename: String },
    Rejected { report: Vec<RowValidation> },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SelectedCsv {
    file_name: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct UploadState {
    submitting: bool,
    selected: Option<SelectedCsv>,
    error: Option<String>,
    report: Vec<RowValidation>,
    report_open: bool,
    acknowledgement: Option<String>,
}

/// Point-in-time view of the upload screen state.
#[derive(Debug, Clone)]
pub struct UploadSnapshot {
    pub phase: UploadPhase,
    pub selected_file: Option<String>,
    pub error: Option<String>,
    pub report: Vec<RowValidation>,
    pub report_open: bool,
    pub acknowledgement: Option<String>,
}

/// Owns CSV file selection and submission, and interprets the three upload
/// outcomes: archive download, structured validation rejection, and plain
/// failure.
pub struct UploadController {
    api: Arc<VerifyApi>,
    artifacts: Arc<dyn ArtifactSink>,
    inner: Mutex<UploadState>,
    events: broadcast::Sender<UploadEvent>,
}

impl UploadController {
    pub fn new(api: Arc<VerifyApi>, artifacts: Arc<dyn ArtifactSink>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            api,
            artifacts,
            inner: Mutex::new(UploadState::default()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> UploadSnapshot {
        let state = self.inner.lock().await;
        UploadSnapshot {
            phase: if state.submitting {
                UploadPhase::Submitting
            } else {
                UploadPhase::Idle
            },
            selected_file: state.selected.as_ref().map(|s| s.file_name.clone()),
            error: state.error.clone(),
            report: state.report.clone(),
            report_open: state.report_open,
            acknowledgement: state.acknowledgement.clone(),
        }
    }

    /// Accepts only `.csv` files (case-insensitive) and clears any prior
    /// validation report or error message.
    pub async fn select_file(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), SelectFileError> {
        if !file_name.to_ascii_lowercase().ends_with(".csv") {
            return Err(SelectFileError::NotCsv);
        }
        let mut state = self.inner.lock().await;
        state.selected = Some(SelectedCsv {
            file_name: file_name.to_string(),
            bytes,
        });
        state.error = None;
        state.report.clear();
        state.report_open = false;
        state.acknowledgement = None;
        Ok(())
    }

    pub async fn clear_file(&self) {
        let mut state = self.inner.lock().await;
        state.selected = None;
    }

    pub async fn dismiss_error(&self) {
        let mut state = self.inner.lock().await;
        state.error = None;
    }

    pub async fn close_report(&self) {
        let mut state = self.inner.lock().await;
        state.report_open = false;
    }

    /// Submits the selected CSV. Fails fast with no network call when no
    /// file is selected, no token is present, or a submission is already in
    /// flight.
    pub async fn submit(&self) -> UploadDisposition {
        let selected = {
            let mut state = self.inner.lock().await;
            if state.submitting {
                return UploadDisposition::Skipped(SkipReason::SubmissionInFlight);
            }
            let Some(selected) = state.selected.clone() else {
                return UploadDisposition::Skipped(SkipReason::NoFileSelected);
            };
            if !self.api.auth().is_authenticated().await {
                return UploadDisposition::Skipped(SkipReason::NotAuthenticated);
            }
            state.submitting = true;
            state.error = None;
            state.acknowledgement = None;
            selected
        };
        let _ = self.events.send(UploadEvent::SubmissionStarted);

        let outcome = self
            .api
            .upload_csv(&selected.file_name, selected.bytes)
            .await;
        let disposition = match outcome {
            Ok(CsvUploadOutcome::Archive(bytes)) => {
                match self.artifacts.save(QR_ARCHIVE_FILENAME, &bytes).await {
                    Ok(()) => {
                        info!(
                            file = %selected.file_name,
                            archive = QR_ARCHIVE_FILENAME,
                            "upload: QR archive saved"
                        );
                        UploadDisposition::Saved {
                            filename: QR_ARCHIVE_FILENAME.to_string(),
                        }
                    }
                    Err(err) => UploadDisposition::Failed {
                        message: format!("failed to save {QR_ARCHIVE_FILENAME}: {err}"),
                    },
                }
            }
            Ok(CsvUploadOutcome::Rejected(failure)) => {
                let report = build_validation_report(&failure);
                warn!(rows = report.len(), "upload: CSV rejected by validation");
                UploadDisposition::Rejected { report }
            }
            Err(err) => {
                let message = match err {
                    ApiError::Server { message, .. } => message,
                    other => other.to_string(),
                };
                UploadDisposition::Failed { message }
            }
        };

        let mut state = self.inner.lock().await;
        state.submitting = false;
        match &disposition {
            UploadDisposition::Saved { filename } => {
                state.selected = None;
                state.report.clear();
                state.report_open = false;
                state.acknowledgement =
                    Some(format!("QR codes generated; saved as {filename}"));
                let _ = self.events.send(UploadEvent::Completed {
                    filename: filename.clone(),
                });
            }
            UploadDisposition::Rejected { report } => {
                state.report = report.clone();
                state.report_open = true;
                let _ = self.events.send(UploadEvent::Rejected {
                    report: report.clone(),
                });
            }
            UploadDisposition::Failed { message } => {
                state.error = Some(message.clone());
                let _ = self.events.send(UploadEvent::Failed {
                    message: message.clone(),
                });
            }
            UploadDisposition::Skipped(_) => {}
        }
        disposition
    }

    /// Returns the controller to its initial state. Used on logout so no
    /// upload state outlives the session token.
    pub(crate) async fn reset(&self) {
        let mut state = self.inner.lock().await;
        *state = UploadState::default();
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
