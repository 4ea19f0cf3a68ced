use std::{sync::Arc, time::Duration};

use qr_decode::{DecodeEvent, DecodeSession, DecoderOptions, QrDecoder};
use shared::domain::{ScanStatus, VisitorIdentity};
use shared::protocol::{ScanRequest, ScanResponse};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::VerifyApi;

/// Window during which a re-decode of the just-scanned code is ignored. A
/// live camera feed decodes the same physical code many times per second;
/// without this every frame would issue a duplicate verification call.
pub const SCAN_COOLDOWN: Duration = Duration::from_secs(5);
/// Lifetime of a transient outcome banner.
pub const NOTICE_TTL: Duration = Duration::from_secs(3);

const PREFERRED_CAMERA: &str = "environment";
const DECODER_MAX_SCANS_PER_SECOND: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingIdentity,
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Camera,
    ImageUpload,
}

/// Field-level validation flags for the identity form. These stay local to
/// the form; nothing here reaches the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityFieldErrors {
    pub name: bool,
    pub phone: bool,
    pub pincode: bool,
}

impl IdentityFieldErrors {
    pub fn any(&self) -> bool {
        self.name || self.phone || self.pincode
    }
}

/// Accepts iff the input contains exactly 10 digits after stripping every
/// non-digit character.
pub fn validate_phone(raw: &str) -> bool {
    normalize_phone(raw).is_some()
}

pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (digits.len() == 10).then_some(digits)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

fn notice_for(response: &ScanResponse) -> Notice {
    let kind = match response.status {
        ScanStatus::Genuine => NoticeKind::Success,
        ScanStatus::AlreadyScanned => NoticeKind::Warning,
        ScanStatus::Invalid | ScanStatus::Error => NoticeKind::Error,
    };
    Notice {
        kind,
        message: response.message.clone(),
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    DecodeModeChanged(DecodeMode),
    SubmissionStarted { product_id: String },
    ResultUpdated(ScanResponse),
    NoticePublished(Notice),
    NoticeExpired,
}

/// Point-in-time view of the session for rendering and assertions.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub decode_mode: DecodeMode,
    pub identity: Option<VisitorIdentity>,
    pub field_errors: IdentityFieldErrors,
    pub cooldown_active: bool,
    pub last_scanned_code: Option<String>,
    pub last_result: Option<ScanResponse>,
    pub notice: Option<Notice>,
}

pub(crate) struct SessionTiming {
    pub cooldown: Duration,
    pub notice_ttl: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            cooldown: SCAN_COOLDOWN,
            notice_ttl: NOTICE_TTL,
        }
    }
}

struct ScanSessionState {
    phase: SessionPhase,
    decode_mode: DecodeMode,
    identity: Option<VisitorIdentity>,
    field_errors: IdentityFieldErrors,
    last_scanned_code: Option<String>,
    cooldown_active: bool,
    // Bumped every time the cooldown is (re)armed; a pending expiry task
    // only fires if its generation still matches, so a stale timer can
    // never clear a newer cooldown.
    cooldown_generation: u64,
    cooldown_task: Option<JoinHandle<()>>,
    // Most recently initiated submission. Responses completing out of order
    // are discarded unless they carry the latest sequence number.
    submission_seq: u64,
    // Bumped by reset; invalidates every in-flight submission's ability to
    // update state after the session ends.
    session_generation: u64,
    last_result: Option<ScanResponse>,
    notice: Option<Notice>,
    notice_generation: u64,
    notice_task: Option<JoinHandle<()>>,
    decoder_session: Option<Arc<dyn DecodeSession>>,
    decoder_pump: Option<JoinHandle<()>>,
}

impl ScanSessionState {
    fn new() -> Self {
        Self {
            phase: SessionPhase::AwaitingIdentity,
            decode_mode: DecodeMode::Camera,
            identity: None,
            field_errors: IdentityFieldErrors::default(),
            last_scanned_code: None,
            cooldown_active: false,
            cooldown_generation: 0,
            cooldown_task: None,
            submission_seq: 0,
            session_generation: 0,
            last_result: None,
            notice: None,
            notice_generation: 0,
            notice_task: None,
            decoder_session: None,
            decoder_pump: None,
        }
    }
}

/// Owns the per-session identity, the scanning activation state, and the
/// duplicate-suppression cooldown; mediates between the decoder and the
/// verification endpoint.
pub struct ScanSessionController {
    api: Arc<VerifyApi>,
    decoder: Arc<dyn QrDecoder>,
    timing: SessionTiming,
    inner: Mutex<ScanSessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl ScanSessionController {
    pub fn new(api: Arc<VerifyApi>, decoder: Arc<dyn QrDecoder>) -> Arc<Self> {
        Self::new_with_timing(api, decoder, SessionTiming::default())
    }

    pub(crate) fn new_with_timing(
        api: Arc<VerifyApi>,
        decoder: Arc<dyn QrDecoder>,
        timing: SessionTiming,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            api,
            decoder,
            timing,
            inner: Mutex::new(ScanSessionState::new()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.lock().await;
        SessionSnapshot {
            phase: state.phase,
            decode_mode: state.decode_mode,
            identity: state.identity.clone(),
            field_errors: state.field_errors,
            cooldown_active: state.cooldown_active,
            last_scanned_code: state.last_scanned_code.clone(),
            last_result: state.last_result.clone(),
            notice: state.notice.clone(),
        }
    }

    /// Validates the visitor form and, on success, transitions to `Scanning`
    /// and activates the decoder. On failure the session stays in
    /// `AwaitingIdentity` with per-field flags set.
    pub async fn submit_identity(
        self: &Arc<Self>,
        name: &str,
        phone: &str,
        pincode: &str,
    ) -> Result<(), IdentityFieldErrors> {
        let normalized_phone = normalize_phone(phone);
        let errors = IdentityFieldErrors {
            name: name.trim().is_empty(),
            phone: normalized_phone.is_none(),
            pincode: pincode.trim().is_empty(),
        };

        {
            let mut state = self.inner.lock().await;
            if state.phase != SessionPhase::AwaitingIdentity {
                return Ok(());
            }
            if errors.any() {
                state.field_errors = errors;
                return Err(errors);
            }
            state.field_errors = IdentityFieldErrors::default();
            state.identity = Some(VisitorIdentity {
                name: name.trim().to_string(),
                phone: normalized_phone.unwrap_or_default(),
                pincode: pincode.trim().to_string(),
            });
            state.phase = SessionPhase::Scanning;
        }
        let _ = self.events.send(SessionEvent::PhaseChanged(SessionPhase::Scanning));

        self.activate_decoder().await;
        Ok(())
    }

    /// Starts the camera feed, degrading to the image-upload path when no
    /// camera backend is available. Degradation is not an error; the
    /// session keeps scanning.
    async fn activate_decoder(self: &Arc<Self>) {
        let cameras = match self.decoder.list_cameras().await {
            Ok(cameras) => cameras,
            Err(err) => {
                info!("scan: camera unavailable, using image upload: {err}");
                self.enter_image_upload_mode().await;
                return;
            }
        };
        if cameras.is_empty() {
            info!("scan: no cameras found, using image upload");
            self.enter_image_upload_mode().await;
            return;
        }

        let options = DecoderOptions {
            preferred_camera: Some(PREFERRED_CAMERA.to_string()),
            max_scans_per_second: DECODER_MAX_SCANS_PER_SECOND,
        };
        let session = match self.decoder.start(options).await {
            Ok(session) => session,
            Err(err) => {
                warn!("scan: decoder start failed, using image upload: {err}");
                self.enter_image_upload_mode().await;
                return;
            }
        };

        let pump = self.spawn_decode_pump(Arc::clone(&session));
        let mut state = self.inner.lock().await;
        if state.phase != SessionPhase::Scanning {
            // Session was reset while the decoder was starting.
            pump.abort();
            drop(state);
            if let Err(err) = session.stop().await {
                warn!("scan: failed to stop orphaned decoder: {err}");
            }
            return;
        }
        state.decode_mode = DecodeMode::Camera;
        state.decoder_session = Some(session);
        state.decoder_pump = Some(pump);
    }

    async fn enter_image_upload_mode(&self) {
        {
            let mut state = self.inner.lock().await;
            state.decode_mode = DecodeMode::ImageUpload;
        }
        let _ = self
            .events
            .send(SessionEvent::DecodeModeChanged(DecodeMode::ImageUpload));
    }

    fn spawn_decode_pump(self: &Arc<Self>, session: Arc<dyn DecodeSession>) -> JoinHandle<()> {
        let mut events = session.subscribe_events();
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            // Decode events are handled in arrival order; submissions they
            // trigger are spawned so the feed is never blocked on a
            // verification round trip. A lagged receiver drops the stale
            // frames and keeps pumping.
            loop {
                match events.recv().await {
                    Ok(DecodeEvent::Decoded { payload }) => {
                        controller.on_decoded(payload).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "scan: decode events lagged, dropping stale frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// The decoder's sole event. Ignored outside `Scanning`; a payload equal
    /// to the code under cooldown is suppressed with no network call and no
    /// state change. Anything else rearms the cooldown on the new payload
    /// and fires a submission.
    pub async fn on_decoded(self: &Arc<Self>, payload: String) {
        let (identity, seq, generation) = {
            let mut state = self.inner.lock().await;
            if state.phase != SessionPhase::Scanning {
                return;
            }
            if state.cooldown_active && state.last_scanned_code.as_deref() == Some(payload.as_str())
            {
                info!(code = %payload, "scan: duplicate decode suppressed during cooldown");
                return;
            }
            let Some(identity) = state.identity.clone() else {
                return;
            };

            state.last_scanned_code = Some(payload.clone());
            state.cooldown_active = true;
            state.cooldown_generation += 1;
            if let Some(task) = state.cooldown_task.take() {
                task.abort();
            }
            state.cooldown_task = Some(self.spawn_cooldown_expiry(state.cooldown_generation));

            state.submission_seq += 1;
            (identity, state.submission_seq, state.session_generation)
        };

        let _ = self.events.send(SessionEvent::SubmissionStarted {
            product_id: payload.clone(),
        });

        // Fire-and-forget: the cooldown, not the round-trip latency, is what
        // throttles resubmission of the same code.
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let request = ScanRequest {
                product_id: payload,
                name: identity.name,
                phone: identity.phone,
                pincode: identity.pincode,
            };
            let response = match controller.api.scan_product(&request).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(product_id = %request.product_id, "scan: submission failed: {err}");
                    ScanResponse {
                        status: ScanStatus::Error,
                        message: err.to_string(),
                        product: None,
                        first_scan: None,
                        scanned_code: None,
                    }
                }
            };
            controller.finish_submission(seq, generation, response).await;
        });
    }

    /// Decodes a still image through the decoder boundary and feeds the
    /// payload into the normal decode path. An unreadable image surfaces a
    /// transient error without touching the session.
    pub async fn scan_image(self: &Arc<Self>, image_bytes: &[u8]) {
        {
            let state = self.inner.lock().await;
            if state.phase != SessionPhase::Scanning {
                return;
            }
        }
        match self.decoder.decode_image(image_bytes).await {
            Ok(payload) => self.on_decoded(payload).await,
            Err(err) => {
                warn!("scan: image decode failed: {err}");
                self.publish_notice(Notice {
                    kind: NoticeKind::Error,
                    message: "Failed to scan QR code from image".to_string(),
                })
                .await;
            }
        }
    }

    async fn finish_submission(
        self: &Arc<Self>,
        seq: u64,
        generation: u64,
        response: ScanResponse,
    ) {
        {
            let mut state = self.inner.lock().await;
            if state.session_generation != generation {
                return;
            }
            if seq != state.submission_seq {
                info!(
                    seq,
                    latest = state.submission_seq,
                    "scan: discarding stale submission result"
                );
                return;
            }
            state.last_result = Some(response.clone());
        }
        let notice = notice_for(&response);
        let _ = self.events.send(SessionEvent::ResultUpdated(response));
        self.publish_notice(notice).await;
    }

    /// Publishes a transient banner, replacing any pending one immediately.
    /// Last write wins; there is no queue.
    async fn publish_notice(self: &Arc<Self>, notice: Notice) {
        {
            let mut state = self.inner.lock().await;
            if let Some(task) = state.notice_task.take() {
                task.abort();
            }
            state.notice_generation += 1;
            state.notice = Some(notice.clone());
            state.notice_task = Some(self.spawn_notice_expiry(state.notice_generation));
        }
        let _ = self.events.send(SessionEvent::NoticePublished(notice));
    }

    fn spawn_notice_expiry(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        let ttl = self.timing.notice_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            {
                let mut state = controller.inner.lock().await;
                if state.notice_generation != generation {
                    return;
                }
                state.notice = None;
                state.notice_task = None;
            }
            let _ = controller.events.send(SessionEvent::NoticeExpired);
        })
    }

    fn spawn_cooldown_expiry(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        let cooldown = self.timing.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let mut state = controller.inner.lock().await;
            if state.cooldown_generation != generation {
                return;
            }
            state.cooldown_active = false;
            state.last_scanned_code = None;
            state.cooldown_task = None;
        })
    }

    /// Clears identity, result, field errors, and cooldown; deactivates the
    /// decoder; invalidates in-flight submissions; returns to
    /// `AwaitingIdentity`.
    pub async fn reset_session(&self) {
        let decoder_session = {
            let mut state = self.inner.lock().await;
            state.session_generation += 1;
            state.cooldown_generation += 1;
            state.notice_generation += 1;
            state.phase = SessionPhase::AwaitingIdentity;
            state.decode_mode = DecodeMode::Camera;
            state.identity = None;
            state.field_errors = IdentityFieldErrors::default();
            state.last_scanned_code = None;
            state.cooldown_active = false;
            state.last_result = None;
            state.notice = None;
            for task in [
                state.cooldown_task.take(),
                state.notice_task.take(),
                state.decoder_pump.take(),
            ]
            .into_iter()
            .flatten()
            {
                task.abort();
            }
            state.decoder_session.take()
        };

        if let Some(session) = decoder_session {
            if let Err(err) = session.stop().await {
                warn!("scan: failed to stop decoder on reset: {err}");
            }
        }
        let _ = self
            .events
            .send(SessionEvent::PhaseChanged(SessionPhase::AwaitingIdentity));
    }
}

#[cfg(test)]
#[path = "tests/scan_session_tests.rs"]
mod tests;
