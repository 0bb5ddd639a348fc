use crate::dispatcher::{Dispatch, Dispatcher};
use crate::sink::{FaceAnnotation, FaceStatus, FrameSink, LogSink, SnapshotSink};
use facegate_core::cooldown::format_remaining;
use facegate_core::{
    BoundingBox, Clock, Config, CooldownTracker, CosineMatcher, FaceDetector, FaceEncoder,
    FaceNetEncoder, IdentityStore, Matcher, SystemClock, UltraFaceDetector,
};
use facegate_hw::{Camera, FrameSource};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Share of near-black pixels above which a frame is not run through detection.
const DARK_FRAME_THRESHOLD: f32 = 0.95;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] facegate_hw::CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] facegate_core::detector::DetectorError),
    #[error("encoder error: {0}")]
    Encoder(#[from] facegate_core::encoder::EncoderError),
    #[error("dispatcher error: {0}")]
    Dispatcher(#[from] crate::dispatcher::DispatchError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Thresholds and window the gate applies to every face.
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub recognition_threshold: f32,
    pub confidence_threshold: f32,
    pub cooldown_window: Duration,
}

impl From<&Config> for GateSettings {
    fn from(config: &Config) -> Self {
        Self {
            recognition_threshold: config.recognition_threshold,
            confidence_threshold: config.confidence_threshold,
            cooldown_window: config.cooldown_window(),
        }
    }
}

/// Why the frame loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    Stopped,
    CaptureFailed(String),
}

/// Counters reported when the frame loop ends.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    pub dark_frames: u64,
    pub faces: u64,
    pub dispatches: u64,
    pub exit: ExitReason,
}

/// The recognition gate: detector, encoder, identity store, cooldown state
/// and dispatcher, driven one frame at a time.
pub struct Gate<D, E, P, C> {
    detector: D,
    encoder: E,
    dispatcher: P,
    clock: C,
    store: IdentityStore,
    cooldown: CooldownTracker,
    settings: GateSettings,
    faces: u64,
    dispatches: u64,
}

impl<D, E, P, C> Gate<D, E, P, C>
where
    D: FaceDetector,
    E: FaceEncoder,
    P: Dispatch,
    C: Clock,
{
    pub fn new(
        detector: D,
        encoder: E,
        dispatcher: P,
        clock: C,
        store: IdentityStore,
        settings: GateSettings,
    ) -> Self {
        Self {
            detector,
            encoder,
            dispatcher,
            clock,
            store,
            cooldown: CooldownTracker::new(),
            settings,
            faces: 0,
            dispatches: 0,
        }
    }

    #[cfg(test)]
    pub fn cooldown(&self) -> &CooldownTracker {
        &self.cooldown
    }

    /// Detect, encode, match and (maybe) dispatch every face in one frame.
    ///
    /// Detection failure yields no annotations; a face the encoder rejects
    /// is skipped. Neither ends the loop.
    pub fn process_frame(&mut self, image: &RgbImage) -> Vec<FaceAnnotation> {
        let faces = match self.detector.detect(image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; skipping frame");
                return Vec::new();
            }
        };

        let min_confidence = self.settings.confidence_threshold;
        faces
            .iter()
            .filter(|face| face.confidence >= min_confidence)
            .filter_map(|face| self.process_face(image, face))
            .collect()
    }

    fn process_face(&mut self, image: &RgbImage, face: &BoundingBox) -> Option<FaceAnnotation> {
        let embedding = match self.encoder.encode(image, face) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, confidence = face.confidence, "failed to encode face");
                return None;
            }
        };
        self.faces += 1;

        let result = CosineMatcher.compare(
            &embedding,
            self.store.references(),
            self.settings.recognition_threshold,
        );

        let mut status = None;
        if let Some(label) = result.label.as_deref() {
            let now = self.clock.now();
            let window = self.settings.cooldown_window;

            if self.cooldown.should_dispatch(label, now, window) {
                tracing::info!(label, distance = result.distance, "dispatching scan");
                // Cooldown starts at the decision, whatever the backend answers.
                self.cooldown.record(label, now);
                self.dispatches += 1;
                status = self
                    .dispatcher
                    .dispatch(&embedding)
                    .map(|r| FaceStatus::Verdict(r.summary()));
                if status.is_none() {
                    tracing::warn!(label, "no backend result for scan");
                }
            } else {
                let remaining = self.cooldown.remaining(label, now, window);
                tracing::debug!(label, remaining_secs = remaining.as_secs(), "in cooldown");
                status = Some(FaceStatus::Cooldown(format_remaining(remaining)));
            }
        }

        Some(FaceAnnotation {
            bbox: face.clone(),
            matched: result.is_match(),
            caption: format!("{} ({:.2})", result.display_label(), result.distance),
            status,
        })
    }

    /// Run until `stop` is set or the source fails to deliver a frame.
    ///
    /// Dark frames (lens covered, lights off) are still rendered but skip
    /// detection.
    pub fn run<S, K>(&mut self, source: &mut S, sink: &mut K, stop: &AtomicBool) -> RunSummary
    where
        S: FrameSource,
        K: FrameSink,
    {
        let mut frames = 0u64;
        let mut dark_frames = 0u64;

        let exit = loop {
            if stop.load(Ordering::Relaxed) {
                break ExitReason::Stopped;
            }

            let frame = match source.next_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(error = %e, "frame capture failed; stopping");
                    break ExitReason::CaptureFailed(e.to_string());
                }
            };
            frames += 1;

            let annotations = if frame.is_dark(DARK_FRAME_THRESHOLD) {
                dark_frames += 1;
                tracing::debug!(seq = frame.sequence, "skipping dark frame");
                Vec::new()
            } else {
                self.process_frame(&frame.image)
            };
            if let Err(e) = sink.render(&frame, &annotations) {
                tracing::warn!(error = %e, "failed to render frame");
            }
        };

        let summary = RunSummary {
            frames,
            dark_frames,
            faces: self.faces,
            dispatches: self.dispatches,
            exit,
        };
        tracing::info!(?summary, "frame loop finished");
        summary
    }
}

/// Resolves with the run summary once the gate thread finishes.
pub type GateDone = oneshot::Receiver<RunSummary>;

/// Spawn the gate on a dedicated OS thread.
///
/// The camera stream, both ONNX models and the HTTP client are set up on that
/// thread before the loop starts; setup failure is returned here (fail-fast).
pub async fn spawn_gate(
    config: Config,
    store: IdentityStore,
    stop: Arc<AtomicBool>,
) -> Result<GateDone, EngineError> {
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), EngineError>>();
    let (done_tx, done_rx) = oneshot::channel::<RunSummary>();

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            let setup = (|| -> Result<_, EngineError> {
                let camera = Camera::open(&config.camera_device)?;
                tracing::info!(
                    device = %config.camera_device,
                    width = camera.width,
                    height = camera.height,
                    fourcc = ?camera.fourcc,
                    "camera opened"
                );

                let detector = UltraFaceDetector::load(&config.detector_model_path())?;
                let encoder =
                    FaceNetEncoder::load(&config.encoder_model_path(), config.encoder_input_size)?;
                let dispatcher = Dispatcher::new(&config.api_url, config.request_timeout())?;
                tracing::info!(endpoint = dispatcher.endpoint(), "dispatcher ready");
                Ok((camera, detector, encoder, dispatcher))
            })();

            let (camera, detector, encoder, dispatcher) = match setup {
                Ok(parts) => parts,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let mut stream = match camera.stream() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };
            stream.warm_up(config.warmup_frames);
            let _ = ready_tx.send(Ok(()));

            let mut gate = Gate::new(
                detector,
                encoder,
                dispatcher,
                SystemClock,
                store,
                GateSettings::from(&config),
            );

            tracing::info!("engine thread started");
            let summary = match config.snapshot_path.clone() {
                Some(path) => gate.run(&mut stream, &mut SnapshotSink::new(path), &stop),
                None => gate.run(&mut stream, &mut LogSink, &stop),
            };
            drop(stream);
            drop(camera);
            let _ = done_tx.send(summary);
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    ready_rx.await.map_err(|_| EngineError::ChannelClosed)??;
    Ok(done_rx)
}
