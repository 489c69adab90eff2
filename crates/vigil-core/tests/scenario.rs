//! Four frames, one known face then three unknown ones, against a 10 s cooldown.

use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vigil_core::annotate::FrameAnnotator;
use vigil_core::labels::LabelMapFile;
use vigil_core::pipeline::Clock;
use vigil_core::sink::{MemoryLog, StaticBlacklist};
use vigil_core::{
    Alert, AlertDispatcher, AlertThrottle, Classification, ClassificationPolicy, DetectedFace,
    FaceCrop, FaceDetector, FaceIdentifier, Frame, FrameEncoder, FrameSource,
    IdentificationResult, IdentityId, LabelDirectory, Notifier, NotifyError, Pipeline,
    PipelineParts,
};

#[derive(Debug, thiserror::Error)]
#[error("no frame")]
struct NoFrame;

struct Camera(u32);

impl FrameSource for Camera {
    type Error = NoFrame;

    fn acquire(&mut self) -> Result<Frame, NoFrame> {
        self.0 += 1;
        Ok(Frame::new(RgbImage::from_pixel(320, 240, Rgb([90, 90, 90])), self.0))
    }
}

struct OneFace;

impl FaceDetector for OneFace {
    type Error = NoFrame;

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectedFace>, NoFrame> {
        Ok(vec![DetectedFace::new(100.0, 80.0, 64.0, 64.0)])
    }
}

struct Scripted(VecDeque<IdentificationResult>);

impl FaceIdentifier for Scripted {
    type Error = NoFrame;

    fn identify(&mut self, _crop: &FaceCrop<'_>) -> Result<IdentificationResult, NoFrame> {
        Ok(self.0.pop_front().unwrap_or_else(IdentificationResult::unidentified))
    }
}

#[derive(Clone)]
struct TestClock(Arc<Mutex<Duration>>, Instant, DateTime<Utc>);

impl TestClock {
    fn set(&self, t: Duration) {
        *self.0.lock().unwrap() = t;
    }
}

impl Clock for TestClock {
    fn instant(&self) -> Instant {
        self.1 + *self.0.lock().unwrap()
    }

    fn utc(&self) -> DateTime<Utc> {
        self.2 + chrono::Duration::from_std(*self.0.lock().unwrap()).unwrap()
    }
}

#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<Vec<Alert>>>);

impl Notifier for Outbox {
    fn name(&self) -> &str {
        "outbox"
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.0.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

#[test]
fn known_face_then_unknown_faces_over_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let labels_path = dir.path().join("label_map.json");
    std::fs::write(&labels_path, r#"{"0": "alice"}"#).unwrap();
    let labels = Arc::new(LabelDirectory::new(Box::new(LabelMapFile::new(&labels_path))));
    labels.reload().unwrap();

    let log = Arc::new(MemoryLog::new());
    let outbox = Outbox::default();
    let clock = TestClock(Arc::new(Mutex::new(Duration::ZERO)), Instant::now(), Utc::now());

    let parts = PipelineParts {
        source: Camera(0),
        detector: OneFace,
        identifier: Scripted(
            [
                IdentificationResult::matched(IdentityId(0), 40.0),
                IdentificationResult::unidentified(),
                IdentificationResult::unidentified(),
                IdentificationResult::unidentified(),
            ]
            .into_iter()
            .collect(),
        ),
        labels,
        policy: ClassificationPolicy::new(70.0),
        blacklist: Arc::new(StaticBlacklist::default()),
        sink: log.clone(),
        alerts: AlertDispatcher::spawn(
            AlertThrottle::new(Duration::from_secs(10)),
            vec![Box::new(outbox.clone())],
            4,
        )
        .unwrap(),
        annotator: FrameAnnotator::default(),
        encoder: FrameEncoder::default(),
        snapshot_quality: 75,
    };
    let mut pipeline = Pipeline::with_clock(parts, Box::new(clock.clone()));

    let mut per_frame = Vec::new();
    for t in [0, 1, 5, 12] {
        clock.set(Duration::from_secs(t));
        let report = pipeline.step().unwrap();
        assert_eq!(report.verdicts.len(), 1);
        assert_eq!(report.logged, 1);
        per_frame.push((report.verdicts[0].classification, report.alerts));
    }
    drop(pipeline);

    assert_eq!(
        per_frame,
        [
            (Classification::Known, 0),
            (Classification::Unknown, 1),
            (Classification::Unknown, 0),
            (Classification::Unknown, 1),
        ]
    );

    let names: Vec<_> = log.entries().into_iter().map(|e| e.name).collect();
    assert_eq!(names, ["alice", "Unknown", "Unknown", "Unknown"]);
    assert_eq!(log.entries()[0].confidence, 40.0);

    let alerts = outbox.0.lock().unwrap();
    assert_eq!(alerts.len(), 2);
    assert!(alerts.iter().all(|a| a.name == "Unknown" && a.distance.is_none()));
    assert!(alerts.iter().all(|a| a.snapshot.is_some()));
    assert_eq!(alerts[1].timestamp - alerts[0].timestamp, chrono::Duration::seconds(11));
}
