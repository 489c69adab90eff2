use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

use crate::throttle::ThrottleKey;

/// Display name used for every face that could not be confidently identified.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Numeric identity label produced by the identifier and resolved to a name
/// through the label directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub u32);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u32,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Face location within a frame, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1].
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl DetectedFace {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
            landmarks: None,
        }
    }

    /// Integer pixel rectangle `(x, y, width, height)` clipped to a
    /// `frame_width` × `frame_height` image. `None` if nothing remains.
    pub fn clip_to(&self, frame_width: u32, frame_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).max(0.0).ceil() as u32).min(frame_width);
        let y1 = ((self.y + self.height).max(0.0).ceil() as u32).min(frame_height);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Raw identifier output for one face.
///
/// `distance` is a dissimilarity score: lower means a more confident match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentificationResult {
    pub identity: Option<IdentityId>,
    pub distance: f32,
}

impl IdentificationResult {
    pub fn matched(identity: IdentityId, distance: f32) -> Self {
        Self {
            identity: Some(identity),
            distance,
        }
    }

    /// No confident candidate. Also used in place of a failed identification.
    pub fn unidentified() -> Self {
        Self {
            identity: None,
            distance: f32::INFINITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Known,
    Unknown,
    Blacklisted,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Known => "known",
            Classification::Unknown => "unknown",
            Classification::Blacklisted => "blacklisted",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified outcome for one detected face in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub classification: Classification,
    pub display_name: String,
    pub distance: f32,
    /// Resolved identity; `None` for unknown faces.
    pub identity: Option<IdentityId>,
}

impl Verdict {
    pub fn unknown(distance: f32) -> Self {
        Self {
            classification: Classification::Unknown,
            display_name: UNKNOWN_NAME.to_string(),
            distance,
            identity: None,
        }
    }

    /// Annotation text, e.g. `alice (41.3)`. The score is omitted when the
    /// identifier produced none.
    pub fn label(&self) -> String {
        if self.distance.is_finite() {
            format!("{} ({:.1})", self.display_name, self.distance)
        } else {
            self.display_name.clone()
        }
    }

    /// Annotation color (RGB).
    pub fn color(&self) -> [u8; 3] {
        match self.classification {
            Classification::Known => [0, 200, 0],
            Classification::Unknown => [230, 0, 0],
            Classification::Blacklisted => [255, 140, 0],
        }
    }

    /// Whether this verdict qualifies for an out-of-band alert.
    pub fn is_alertable(&self) -> bool {
        matches!(
            self.classification,
            Classification::Unknown | Classification::Blacklisted
        )
    }

    /// Throttle bucket: one per blacklisted identity, one shared by all unknown faces.
    pub fn throttle_key(&self) -> ThrottleKey {
        match (self.classification, self.identity) {
            (Classification::Unknown, _) | (_, None) => ThrottleKey::Unknown,
            (_, Some(id)) => ThrottleKey::Identity(id),
        }
    }
}

/// One persisted recognition decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub name: String,
    /// The identifier distance; non-finite when no score was produced.
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

/// Blacklist row administered through the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub id: i64,
    pub name: String,
    pub notes: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}
