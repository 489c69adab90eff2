//! vigil-core: face recognition decision and alert pipeline.
//!
//! Classifies identifier output against a reloadable label directory and a
//! blacklist, throttles alerts per identity, records every decision, and
//! publishes the annotated feed as a multipart JPEG stream. Camera, detector
//! and identifier plug in through the traits in [`pipeline`].

pub mod alert;
pub mod annotate;
pub mod font;
pub mod labels;
pub mod pipeline;
pub mod policy;
pub mod sink;
pub mod stream;
pub mod throttle;
pub mod types;

pub use alert::{Alert, AlertDispatcher, DispatchOutcome, Notifier, NotifyError};
pub use labels::{DirectoryError, DirectorySource, LabelDirectory, LabelMap};
pub use pipeline::{
    FaceCrop, FaceDetector, FaceIdentifier, FrameSource, Pipeline, PipelineParts, StopSignal,
};
pub use policy::ClassificationPolicy;
pub use sink::{Blacklist, LogSink, SinkError};
pub use stream::{FrameEncoder, FrameFeed};
pub use throttle::{AlertThrottle, ThrottleKey};
pub use types::{
    BlacklistEntry, Classification, DetectedFace, Frame, IdentificationResult, IdentityId,
    LogEntry, Verdict, UNKNOWN_NAME,
};
