//! The capture → classify → log → alert → stream loop.
//!
//! One `Pipeline` owns the camera, detector and identifier for its lifetime
//! and runs on a single thread. Everything it shares with the rest of the
//! daemon (labels, throttle, log sink, blacklist, stream) is behind its own
//! lock or channel.

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::alert::{AlertDispatcher, DispatchOutcome};
use crate::annotate::FrameAnnotator;
use crate::labels::LabelDirectory;
use crate::policy::ClassificationPolicy;
use crate::sink::{Blacklist, LogSink};
use crate::stream::{self, FrameEncoder};
use crate::types::{DetectedFace, Frame, IdentificationResult, LogEntry, Verdict};

/// Pause in [`Pipeline::run`] after a failed acquisition before trying the
/// source again. Keeps a source that fails instantly (unplugged device) from
/// spinning a core; [`Pipeline::step`] itself never waits.
pub const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Camera or video source.
pub trait FrameSource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Block until the next frame is available.
    fn acquire(&mut self) -> Result<Frame, Self::Error>;
}

pub trait FaceDetector {
    type Error: std::error::Error + Send + Sync + 'static;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, Self::Error>;
}

/// Maps a face to an identity. "No match" is an `Ok` result with no
/// identity; errors are reserved for failures of the identifier itself.
pub trait FaceIdentifier {
    type Error: std::error::Error + Send + Sync + 'static;

    fn identify(&mut self, crop: &FaceCrop<'_>) -> Result<IdentificationResult, Self::Error>;
}

/// One detected face together with the frame it was found in.
#[derive(Clone, Copy)]
pub struct FaceCrop<'a> {
    pub frame: &'a Frame,
    pub face: &'a DetectedFace,
}

impl<'a> FaceCrop<'a> {
    pub fn new(frame: &'a Frame, face: &'a DetectedFace) -> Self {
        Self { frame, face }
    }

    /// The face's bounding box cut out of the frame, clipped to its edges.
    pub fn to_image(&self) -> Option<RgbImage> {
        let (x, y, w, h) = self.face.clip_to(self.frame.width(), self.frame.height())?;
        Some(image::imageops::crop_imm(&self.frame.image, x, y, w, h).to_image())
    }

    pub fn encode_snapshot(&self, quality: u8) -> Option<Vec<u8>> {
        let crop = self.to_image()?;
        match stream::encode_jpeg(&crop, quality) {
            Ok(jpeg) => Some(jpeg),
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode alert snapshot");
                None
            }
        }
    }
}

/// Time source for throttling and log timestamps.
pub trait Clock: Send + Sync {
    fn instant(&self) -> Instant;
    fn utc(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn instant(&self) -> Instant {
        Instant::now()
    }

    fn utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Cooperative stop flag, checked before every iteration.
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Running totals, readable from other threads.
#[derive(Default)]
pub struct PipelineCounters {
    frames: AtomicU64,
    skipped: AtomicU64,
    faces: AtomicU64,
    log_failures: AtomicU64,
    alerts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub frames: u64,
    pub skipped: u64,
    pub faces: u64,
    pub log_failures: u64,
    pub alerts: u64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            faces: self.faces.load(Ordering::Relaxed),
            log_failures: self.log_failures.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// What one completed iteration did.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub sequence: u32,
    /// One verdict per detected face, in detection order.
    pub verdicts: Vec<Verdict>,
    pub logged: usize,
    pub alerts: usize,
    pub encoded: bool,
}

/// Everything a pipeline is built from.
pub struct PipelineParts<S, D, I> {
    pub source: S,
    pub detector: D,
    pub identifier: I,
    pub labels: Arc<LabelDirectory>,
    pub policy: ClassificationPolicy,
    pub blacklist: Arc<dyn Blacklist>,
    pub sink: Arc<dyn LogSink>,
    pub alerts: AlertDispatcher,
    pub annotator: FrameAnnotator,
    pub encoder: FrameEncoder,
    /// JPEG quality of the face crop attached to alerts.
    pub snapshot_quality: u8,
}

pub struct Pipeline<S, D, I> {
    parts: PipelineParts<S, D, I>,
    clock: Box<dyn Clock>,
    counters: Arc<PipelineCounters>,
    last_logged: Option<DateTime<Utc>>,
}

impl<S, D, I> Pipeline<S, D, I>
where
    S: FrameSource,
    D: FaceDetector,
    I: FaceIdentifier,
{
    pub fn new(parts: PipelineParts<S, D, I>) -> Self {
        Self::with_clock(parts, Box::new(SystemClock))
    }

    pub fn with_clock(parts: PipelineParts<S, D, I>, clock: Box<dyn Clock>) -> Self {
        Self {
            parts,
            clock,
            counters: Arc::new(PipelineCounters::default()),
            last_logged: None,
        }
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    /// Run one iteration. Returns `None` when no frame could be acquired,
    /// in which case nothing was logged, alerted or encoded.
    pub fn step(&mut self) -> Option<IterationReport> {
        let frame = match self.parts.source.acquire() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(error = %err, "frame acquisition failed; retrying");
                PipelineCounters::bump(&self.counters.skipped, 1);
                return None;
            }
        };

        let faces = match self.parts.detector.detect(&frame) {
            Ok(faces) => faces,
            Err(err) => {
                tracing::warn!(sequence = frame.sequence, error = %err, "face detection failed");
                Vec::new()
            }
        };

        let labels = self.parts.labels.snapshot();
        let mut canvas = frame.image.clone();
        let mut report = IterationReport {
            sequence: frame.sequence,
            verdicts: Vec::with_capacity(faces.len()),
            logged: 0,
            alerts: 0,
            encoded: false,
        };

        for face in &faces {
            let crop = FaceCrop::new(&frame, face);
            let result = self.parts.identifier.identify(&crop).unwrap_or_else(|err| {
                tracing::warn!(sequence = frame.sequence, error = %err, "identification failed; treating face as unknown");
                IdentificationResult::unidentified()
            });
            let verdict = self
                .parts
                .policy
                .classify(&result, &labels, self.parts.blacklist.as_ref());

            self.parts.annotator.annotate(&mut canvas, face, &verdict);

            let timestamp = self.next_timestamp();
            let entry = LogEntry {
                name: verdict.display_name.clone(),
                confidence: verdict.distance,
                timestamp,
            };
            match self.parts.sink.append(&entry) {
                Ok(()) => report.logged += 1,
                Err(err) => {
                    tracing::warn!(name = %entry.name, error = %err, "failed to record recognition");
                    PipelineCounters::bump(&self.counters.log_failures, 1);
                }
            }

            let quality = self.parts.snapshot_quality;
            let outcome = self.parts.alerts.submit(
                &verdict,
                self.clock.instant(),
                timestamp,
                || crop.encode_snapshot(quality),
            );
            if outcome == DispatchOutcome::Dispatched {
                report.alerts += 1;
            }

            tracing::debug!(
                sequence = frame.sequence,
                name = %verdict.display_name,
                classification = %verdict.classification,
                distance = verdict.distance,
                alert = ?outcome,
                "face classified"
            );
            report.verdicts.push(verdict);
        }

        match self.parts.encoder.publish(&canvas) {
            Ok(_) => report.encoded = true,
            Err(err) => tracing::warn!(sequence = frame.sequence, error = %err, "frame encode failed"),
        }

        PipelineCounters::bump(&self.counters.frames, 1);
        PipelineCounters::bump(&self.counters.faces, faces.len() as u64);
        PipelineCounters::bump(&self.counters.alerts, report.alerts as u64);
        Some(report)
    }

    /// Loop until `stop` is raised. The current iteration always completes.
    /// Consumes the pipeline so the camera and stream are released on return.
    pub fn run(mut self, stop: &StopSignal) -> CounterSnapshot {
        tracing::info!("pipeline started");
        while !stop.is_stopped() {
            if self.step().is_none() {
                std::thread::sleep(ACQUIRE_RETRY_DELAY);
            }
        }
        let totals = self.counters.snapshot();
        tracing::info!(
            frames = totals.frames,
            skipped = totals.skipped,
            faces = totals.faces,
            alerts = totals.alerts,
            "pipeline stopped"
        );
        totals
    }

    /// Wall-clock timestamp for the next log entry, never earlier than the
    /// previous one.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = self.clock.utc();
        let timestamp = match self.last_logged {
            Some(previous) if now < previous => previous,
            _ => now,
        };
        self.last_logged = Some(timestamp);
        timestamp
    }
}
