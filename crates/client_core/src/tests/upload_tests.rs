use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use shared::error::ApiFailure;
use shared::protocol::MissingDataRow;
use tokio::net::TcpListener;

use crate::{AuthSession, VerifyApi};

#[derive(Clone)]
enum ServerMode {
    Archive { delay: Duration },
    HeaderRejection,
    RowRejection,
    PlainMessage(&'static str),
}

#[derive(Clone)]
struct UploadServerState {
    mode: Arc<tokio::sync::Mutex<ServerMode>>,
    calls: Arc<AtomicUsize>,
}

async fn handle_upload(State(state): State<UploadServerState>) -> impl IntoResponse {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let mode = state.mode.lock().await.clone();
    match mode {
        ServerMode::Archive { delay } => {
            tokio::time::sleep(delay).await;
            b"PK\x03\x04fake-zip".to_vec().into_response()
        }
        ServerMode::HeaderRejection => (
            StatusCode::BAD_REQUEST,
            Json(CsvUploadFailure {
                message: Some("CSV is missing required columns".to_string()),
                missing_fields: Some(vec!["manufacturer".to_string()]),
                missing_data: None,
            }),
        )
            .into_response(),
        ServerMode::RowRejection => (
            StatusCode::BAD_REQUEST,
            Json(CsvUploadFailure {
                message: None,
                missing_fields: None,
                missing_data: Some(vec![MissingDataRow {
                    row: 3,
                    missing_fields: vec!["expiry_date".to_string()],
                }]),
            }),
        )
            .into_response(),
        ServerMode::PlainMessage(message) => {
            (StatusCode::BAD_REQUEST, Json(ApiFailure::new(message))).into_response()
        }
    }
}

async fn spawn_upload_server(mode: ServerMode) -> (String, UploadServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = UploadServerState {
        mode: Arc::new(tokio::sync::Mutex::new(mode)),
        calls: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/upload_csv", post(handle_upload))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

#[derive(Default)]
struct TestArtifactSink {
    saves: tokio::sync::Mutex<Vec<(String, Vec<u8>)>>,
    fail: bool,
}

impl TestArtifactSink {
    fn failing() -> Self {
        Self {
            saves: tokio::sync::Mutex::default(),
            fail: true,
        }
    }
}

#[async_trait]
impl ArtifactSink for TestArtifactSink {
    async fn save(&self, filename: &str, bytes: &[u8]) -> anyhow::Result<()> {
        if self.fail {
            return Err(anyhow!("disk full"));
        }
        self.saves
            .lock()
            .await
            .push((filename.to_string(), bytes.to_vec()));
        Ok(())
    }
}

async fn controller_with(
    mode: ServerMode,
    sink: Arc<TestArtifactSink>,
    authenticated: bool,
) -> (Arc<UploadController>, UploadServerState) {
    let (server_url, server) = spawn_upload_server(mode).await;
    let auth = Arc::new(AuthSession::new());
    if authenticated {
        auth.init("tok".to_string(), true).await;
    }
    let api = Arc::new(VerifyApi::new(server_url, auth));
    (UploadController::new(api, sink), server)
}

fn sample_csv() -> Vec<u8> {
    b"unique_id,manufacturer\nPRD1,Acme\n".to_vec()
}

#[tokio::test]
async fn only_csv_files_are_accepted() {
    let sink = Arc::new(TestArtifactSink::default());
    let (controller, server) = controller_with(
        ServerMode::Archive {
            delay: Duration::ZERO,
        },
        sink,
        true,
    )
    .await;

    let err = controller
        .select_file("products.txt", sample_csv())
        .await
        .expect_err("must reject");
    assert_eq!(err, SelectFileError::NotCsv);
    assert!(controller.snapshot().await.selected_file.is_none());

    // Extension matching ignores case.
    controller
        .select_file("PRODUCTS.CSV", sample_csv())
        .await
        .expect("select");

    // And with nothing selected, submit never reaches the network.
    controller.clear_file().await;
    let disposition = controller.submit().await;
    assert_eq!(
        disposition,
        UploadDisposition::Skipped(SkipReason::NoFileSelected)
    );
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn submit_without_a_token_is_a_no_op() {
    let sink = Arc::new(TestArtifactSink::default());
    let (controller, server) = controller_with(
        ServerMode::Archive {
            delay: Duration::ZERO,
        },
        sink,
        false,
    )
    .await;
    controller
        .select_file("products.csv", sample_csv())
        .await
        .expect("select");

    let disposition = controller.submit().await;

    assert_eq!(
        disposition,
        UploadDisposition::Skipped(SkipReason::NotAuthenticated)
    );
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn successful_upload_saves_the_archive_and_clears_the_selection() {
    let sink = Arc::new(TestArtifactSink::default());
    let (controller, server) = controller_with(
        ServerMode::Archive {
            delay: Duration::ZERO,
        },
        Arc::clone(&sink),
        true,
    )
    .await;
    controller
        .select_file("products.csv", sample_csv())
        .await
        .expect("select");

    let disposition = controller.submit().await;

    assert_eq!(
        disposition,
        UploadDisposition::Saved {
            filename: QR_ARCHIVE_FILENAME.to_string()
        }
    );
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    let saves = sink.saves.lock().await;
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].0, QR_ARCHIVE_FILENAME);
    assert!(saves[0].1.starts_with(b"PK\x03\x04"));

    let snapshot = controller.snapshot().await;
    assert!(snapshot.selected_file.is_none());
    assert!(snapshot.acknowledgement.is_some());
    assert!(snapshot.error.is_none());
    assert!(!snapshot.report_open);
}

#[tokio::test]
async fn missing_header_columns_open_the_report_with_the_header_sentinel() {
    let sink = Arc::new(TestArtifactSink::default());
    let (controller, _server) =
        controller_with(ServerMode::HeaderRejection, Arc::clone(&sink), true).await;
    controller
        .select_file("products.csv", sample_csv())
        .await
        .expect("select");

    let disposition = controller.submit().await;

    let expected = vec![RowValidation {
        row: ReportRow::Header,
        missing_fields: vec!["manufacturer".to_string()],
    }];
    assert_eq!(
        disposition,
        UploadDisposition::Rejected {
            report: expected.clone()
        }
    );
    let snapshot = controller.snapshot().await;
    assert!(snapshot.report_open);
    assert_eq!(snapshot.report, expected);
    assert!(sink.saves.lock().await.is_empty());
}

#[tokio::test]
async fn per_row_gaps_are_reported_verbatim() {
    let sink = Arc::new(TestArtifactSink::default());
    let (controller, _server) = controller_with(ServerMode::RowRejection, sink, true).await;
    controller
        .select_file("products.csv", sample_csv())
        .await
        .expect("select");

    let disposition = controller.submit().await;

    assert_eq!(
        disposition,
        UploadDisposition::Rejected {
            report: vec![RowValidation {
                row: ReportRow::Data(3),
                missing_fields: vec!["expiry_date".to_string()],
            }]
        }
    );
}

#[tokio::test]
async fn plain_failure_is_a_dismissible_message_not_a_report() {
    let sink = Arc::new(TestArtifactSink::default());
    let (controller, _server) =
        controller_with(ServerMode::PlainMessage("CSV file is required"), sink, true).await;
    controller
        .select_file("products.csv", sample_csv())
        .await
        .expect("select");

    let disposition = controller.submit().await;

    assert_eq!(
        disposition,
        UploadDisposition::Failed {
            message: "CSV file is required".to_string()
        }
    );
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.error.as_deref(), Some("CSV file is required"));
    assert!(!snapshot.report_open);

    controller.dismiss_error().await;
    assert!(controller.snapshot().await.error.is_none());
}

#[tokio::test]
async fn a_second_submit_while_one_is_in_flight_is_rejected() {
    let sink = Arc::new(TestArtifactSink::default());
    let (controller, server) = controller_with(
        ServerMode::Archive {
            delay: Duration::from_millis(150),
        },
        sink,
        true,
    )
    .await;
    controller
        .select_file("products.csv", sample_csv())
        .await
        .expect("select");

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.submit().await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;

    let second = controller.submit().await;
    assert_eq!(
        second,
        UploadDisposition::Skipped(SkipReason::SubmissionInFlight)
    );

    let first = first.await.expect("join");
    assert!(matches!(first, UploadDisposition::Saved { .. }));
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn artifact_save_failure_keeps_the_selection_and_reports_the_error() {
    let sink = Arc::new(TestArtifactSink::failing());
    let (controller, _server) = controller_with(
        ServerMode::Archive {
            delay: Duration::ZERO,
        },
        sink,
        true,
    )
    .await;
    controller
        .select_file("products.csv", sample_csv())
        .await
        .expect("select");

    let disposition = controller.submit().await;

    match disposition {
        UploadDisposition::Failed { message } => {
            assert!(message.contains("failed to save qrcodes.zip"));
        }
        other => panic!("unexpected disposition: {other:?}"),
    }
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.selected_file.as_deref(), Some("products.csv"));
}

#[tokio::test]
async fn selecting_a_file_clears_a_previous_report_and_error() {
    let sink = Arc::new(TestArtifactSink::default());
    let (controller, _server) = controller_with(ServerMode::HeaderRejection, sink, true).await;
    controller
        .select_file("products.csv", sample_csv())
        .await
        .expect("select");
    controller.submit().await;
    assert!(controller.snapshot().await.report_open);

    controller
        .select_file("fixed.csv", sample_csv())
        .await
        .expect("select");

    let snapshot = controller.snapshot().await;
    assert!(snapshot.report.is_empty());
    assert!(!snapshot.report_open);
    assert!(snapshot.error.is_none());
}

#[tokio::test]
async fn a_success_after_a_rejection_closes_the_report() {
    let sink = Arc::new(TestArtifactSink::default());
    let (controller, server) =
        controller_with(ServerMode::HeaderRejection, Arc::clone(&sink), true).await;
    controller
        .select_file("products.csv", sample_csv())
        .await
        .expect("select");
    controller.submit().await;
    assert!(controller.snapshot().await.report_open);

    // Resubmitting the still-selected file now succeeds.
    *server.mode.lock().await = ServerMode::Archive {
        delay: Duration::ZERO,
    };
    let disposition = controller.submit().await;

    assert!(matches!(disposition, UploadDisposition::Saved { .. }));
    let snapshot = controller.snapshot().await;
    assert!(!snapshot.report_open);
    assert!(snapshot.report.is_empty());
    assert!(snapshot.acknowledgement.is_some());
    assert_eq!(sink.saves.lock().await.len(), 1);
}

#[tokio::test]
async fn dir_artifact_sink_creates_its_directory_on_first_save() {
    let dir = tempfile::tempdir().expect("tempdir");
    let nested = dir.path().join("downloads");
    let sink = DirArtifactSink::new(&nested);

    sink.save("qrcodes.zip", b"PK\x03\x04").await.expect("save");

    let written = std::fs::read(nested.join("qrcodes.zip")).expect("read");
    assert_eq!(written, b"PK\x03\x04");
}

#[test]
fn report_rows_render_with_the_header_sentinel() {
    assert_eq!(ReportRow::Header.to_string(), "Header");
    assert_eq!(ReportRow::Data(3).to_string(), "3");
}
