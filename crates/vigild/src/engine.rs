use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use vigil_core::alert::DEFAULT_QUEUE_DEPTH;
use vigil_core::annotate::FrameAnnotator;
use vigil_core::pipeline::{CounterSnapshot, PipelineCounters};
use vigil_core::{
    AlertDispatcher, AlertThrottle, Blacklist, ClassificationPolicy, FrameEncoder, LabelDirectory,
    LogSink, Notifier, Pipeline, PipelineParts, StopSignal,
};
use vigil_hw::{Camera, CameraConfig};
use vigil_vision::{ArcFaceIdentifier, Gallery, ScrfdDetector};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] vigil_hw::CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] vigil_vision::DetectorError),
    #[error("identifier error: {0}")]
    Identifier(#[from] vigil_vision::IdentifierError),
    #[error("gallery error: {0}")]
    Gallery(#[from] vigil_vision::GalleryError),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited during startup")]
    StartupAborted,
}

/// Shared collaborators handed to the pipeline.
pub struct EngineParts {
    pub labels: Arc<LabelDirectory>,
    pub blacklist: Arc<dyn Blacklist>,
    pub sink: Arc<dyn LogSink>,
    pub notifiers: Vec<Box<dyn Notifier>>,
    pub encoder: FrameEncoder,
}

/// Handle to the running pipeline thread.
pub struct EngineHandle {
    stop: StopSignal,
    thread: Option<JoinHandle<CounterSnapshot>>,
    counters: Arc<PipelineCounters>,
}

impl EngineHandle {
    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    /// Signal the pipeline to stop and wait for the current iteration to
    /// finish. The camera is released before this returns.
    pub fn shutdown(mut self) -> Option<CounterSnapshot> {
        self.stop.stop();
        let totals = self.thread.take()?.join();
        if totals.is_err() {
            tracing::error!("pipeline thread panicked");
        }
        totals.ok()
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

type Engine = Pipeline<Camera, ScrfdDetector, ArcFaceIdentifier>;

/// Spawn the pipeline on a dedicated OS thread.
///
/// The camera is opened and both ONNX models are loaded on that thread
/// (the V4L2 stream never leaves it). Returns once startup has succeeded
/// or failed; any unavailable resource fails fast.
pub fn spawn_engine(config: &Config, parts: EngineParts) -> Result<EngineHandle, EngineError> {
    let config = config.clone();
    let stop = StopSignal::new();
    let thread_stop = stop.clone();
    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<Arc<PipelineCounters>, EngineError>>(1);

    let thread = std::thread::Builder::new()
        .name("vigil-pipeline".into())
        .spawn(move || match build_pipeline(&config, parts) {
            Ok(pipeline) => {
                if ready_tx.send(Ok(pipeline.counters())).is_err() {
                    return CounterSnapshot::default();
                }
                pipeline.run(&thread_stop)
            }
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                CounterSnapshot::default()
            }
        })?;

    let counters = match ready_rx.recv() {
        Ok(Ok(counters)) => counters,
        Ok(Err(err)) => {
            let _ = thread.join();
            return Err(err);
        }
        Err(_) => {
            let _ = thread.join();
            return Err(EngineError::StartupAborted);
        }
    };

    Ok(EngineHandle {
        stop,
        thread: Some(thread),
        counters,
    })
}

fn build_pipeline(config: &Config, parts: EngineParts) -> Result<Engine, EngineError> {
    let camera = Camera::open(&CameraConfig {
        device: config.camera_device.clone(),
        width: config.camera_width,
        height: config.camera_height,
        warmup_frames: config.warmup_frames,
    })?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        "camera opened"
    );

    let scrfd_path = config.scrfd_model_path();
    let detector = ScrfdDetector::load(&scrfd_path)?;
    tracing::info!(path = %scrfd_path.display(), "SCRFD detector loaded");

    let gallery = Gallery::load(&config.gallery_path)?;
    tracing::info!(path = %config.gallery_path.display(), identities = gallery.len(), "gallery loaded");

    let arcface_path = config.arcface_model_path();
    let identifier = ArcFaceIdentifier::load(&arcface_path, gallery)?;
    tracing::info!(path = %arcface_path.display(), "ArcFace identifier loaded");

    let alerts = AlertDispatcher::spawn(
        AlertThrottle::new(config.alert_cooldown()),
        parts.notifiers,
        DEFAULT_QUEUE_DEPTH,
    )?;

    Ok(Pipeline::new(PipelineParts {
        source: camera,
        detector,
        identifier,
        labels: parts.labels,
        policy: ClassificationPolicy::new(config.confidence_threshold),
        blacklist: parts.blacklist,
        sink: parts.sink,
        alerts,
        annotator: FrameAnnotator::default(),
        encoder: parts.encoder,
        snapshot_quality: config.jpeg_quality,
    }))
}
