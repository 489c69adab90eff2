//! SCRFD face detector on ONNX Runtime.
//!
//! Frames are letterboxed into a 640×640 RGB tensor, the three stride heads
//! are decoded into boxes plus five landmarks, and overlapping boxes are
//! merged with greedy NMS.

use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;
use vigil_core::{DetectedFace, FaceDetector, Frame};

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unexpected model outputs: {0}")]
    BadOutputs(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding used to fit a frame into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(src_width: u32, src_height: u32, target: u32) -> Self {
        let scale = (target as f32 / src_width as f32).min(target as f32 / src_height as f32);
        let width = ((src_width as f32 * scale).round() as u32).clamp(1, target);
        let height = ((src_height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            pad_x: (target - width) / 2,
            pad_y: (target - height) / 2,
            width,
            height,
        }
    }

    /// Model-space point back to frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor positions `[score, bbox, kps]` for each stride.
type OutputLayout = [[usize; 3]; 3];

/// Map output tensors to stride heads. Exports either name them
/// `score_8`, `bbox_16`, `kps_32`... or use opaque names in the standard
/// order (all scores, then all boxes, then all landmarks).
fn output_layout(names: &[String]) -> Result<OutputLayout, DetectorError> {
    if names.len() < 9 {
        return Err(DetectorError::BadOutputs(format!(
            "expected 9 outputs (score/bbox/kps per stride), got {}",
            names.len()
        )));
    }

    let position = |head: &str, stride: u32| {
        let wanted = format!("{head}_{stride}");
        names.iter().position(|name| *name == wanted)
    };
    let named: Option<Vec<[usize; 3]>> = STRIDES
        .iter()
        .map(|&stride| {
            Some([
                position("score", stride)?,
                position("bbox", stride)?,
                position("kps", stride)?,
            ])
        })
        .collect();

    Ok(match named {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => {
            tracing::debug!(?names, "SCRFD outputs unnamed; assuming standard order");
            [[0, 3, 6], [1, 4, 7], [2, 5, 8]]
        }
    })
}

pub struct ScrfdDetector {
    session: Session,
    layout: OutputLayout,
    score_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let layout = output_layout(&names)?;
        tracing::info!(path = %model_path.display(), outputs = ?names, "loaded SCRFD model");

        Ok(Self {
            session,
            layout,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        })
    }

    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }
}

impl FaceDetector for ScrfdDetector {
    type Error = DetectorError;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError> {
        let letterbox = Letterbox::fit(frame.width(), frame.height(), INPUT_SIZE);
        let input = to_tensor(frame, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, heads) in STRIDES.iter().zip(self.layout.iter()) {
            let extract = |index: usize, what: &str| {
                outputs[index]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let head = StrideHead {
                stride,
                scores: extract(heads[0], "scores")?,
                boxes: extract(heads[1], "boxes")?,
                landmarks: extract(heads[2], "landmarks")?,
            };
            candidates.extend(head.decode(&letterbox, self.score_threshold));
        }

        let faces = suppress(candidates, self.nms_threshold);
        tracing::trace!(sequence = frame.sequence, faces = faces.len(), "SCRFD detection");
        Ok(faces)
    }
}

/// Letterboxed, normalized NCHW tensor. Padding maps to zero.
fn to_tensor(frame: &Frame, letterbox: &Letterbox) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let resized = imageops::resize(&frame.image, letterbox.width, letterbox.height, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + letterbox.pad_x) as usize, (y + letterbox.pad_y) as usize);
        for channel in 0..3 {
            tensor[[0, channel, ty, tx]] = (pixel.0[channel] as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }
    tensor
}

/// Raw outputs of one stride level.
struct StrideHead<'a> {
    stride: u32,
    scores: &'a [f32],
    boxes: &'a [f32],
    landmarks: &'a [f32],
}

impl StrideHead<'_> {
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<DetectedFace> {
        let cells_x = (INPUT_SIZE / self.stride) as usize;
        let step = self.stride as f32;

        self.scores
            .iter()
            .enumerate()
            .filter(|(_, &score)| score > threshold)
            .filter_map(|(anchor, &score)| {
                let cell = anchor / ANCHORS_PER_CELL;
                let cx = (cell % cells_x) as f32 * step;
                let cy = (cell / cells_x) as f32 * step;

                let d = self.boxes.get(anchor * 4..anchor * 4 + 4)?;
                let (x1, y1) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
                let (x2, y2) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);

                let landmarks = self.landmarks.get(anchor * 10..anchor * 10 + 10).map(|k| {
                    std::array::from_fn(|i| letterbox.unmap(cx + k[i * 2] * step, cy + k[i * 2 + 1] * step))
                });

                Some(DetectedFace {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression; result is ordered by descending score.
fn suppress(mut candidates: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<DetectedFace> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| overlap(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection over union.
fn overlap(a: &DetectedFace, b: &DetectedFace) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let intersection = w * h;
    let union = a.width * a.height + b.width * b.height - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn face(x: f32, y: f32, size: f32, confidence: f32) -> DetectedFace {
        DetectedFace {
            confidence,
            ..DetectedFace::new(x, y, size, size)
        }
    }

    #[test]
    fn test_overlap() {
        let a = face(0.0, 0.0, 10.0, 1.0);
        assert!((overlap(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(overlap(&a, &face(20.0, 20.0, 10.0, 1.0)), 0.0);

        let b = DetectedFace::new(5.0, 0.0, 10.0, 10.0);
        assert!((overlap(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_keeps_best_of_cluster() {
        let faces = suppress(
            vec![
                face(5.0, 5.0, 100.0, 0.8),
                face(200.0, 200.0, 50.0, 0.7),
                face(0.0, 0.0, 100.0, 0.9),
            ],
            DEFAULT_NMS_THRESHOLD,
        );
        let scores: Vec<_> = faces.iter().map(|f| f.confidence).collect();
        assert_eq!(scores, [0.9, 0.7]);
        assert!(suppress(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_landscape() {
        let lb = Letterbox::fit(640, 480, INPUT_SIZE);
        assert_eq!((lb.width, lb.height), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));

        let (x, y) = lb.unmap(100.0, 80.0 + 50.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_letterbox_upscales_small_frames() {
        let lb = Letterbox::fit(320, 240, INPUT_SIZE);
        assert_eq!(lb.scale, 2.0);
        let (x, y) = lb.unmap(200.0 + lb.pad_x as f32, 100.0 + lb.pad_y as f32);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_tensor_padding_is_zero() {
        let frame = Frame::new(RgbImage::from_pixel(640, 480, Rgb([255, 0, 128])), 1);
        let lb = Letterbox::fit(640, 480, INPUT_SIZE);
        let tensor = to_tensor(&frame, &lb);

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(tensor[[0, 0, 10, 10]], 0.0);
        assert!((tensor[[0, 0, 320, 320]] - (255.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-2);
        assert!((tensor[[0, 1, 320, 320]] - (0.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-2);
    }

    #[test]
    fn test_decode_single_anchor() {
        // One hot anchor at cell (2, 1) of the stride-32 grid.
        let cells = (INPUT_SIZE / 32) as usize;
        let anchor = (cells + 2) * ANCHORS_PER_CELL;
        let mut scores = vec![0.0; cells * cells * ANCHORS_PER_CELL];
        scores[anchor] = 0.95;
        let mut boxes = vec![0.0; scores.len() * 4];
        boxes[anchor * 4..anchor * 4 + 4].copy_from_slice(&[0.5, 0.5, 1.0, 1.0]);
        let landmarks = vec![0.0; scores.len() * 10];

        let head = StrideHead {
            stride: 32,
            scores: &scores,
            boxes: &boxes,
            landmarks: &landmarks,
        };
        let lb = Letterbox::fit(640, 640, INPUT_SIZE);
        let faces = head.decode(&lb, DEFAULT_SCORE_THRESHOLD);

        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert_eq!((f.x, f.y, f.width, f.height), (48.0, 16.0, 48.0, 48.0));
        assert_eq!(f.landmarks.unwrap()[0], (64.0, 32.0));
    }

    #[test]
    fn test_output_layout_named_in_any_order() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(output_layout(&names).unwrap(), [[2, 0, 1], [5, 3, 4], [8, 6, 7]]);
    }

    #[test]
    fn test_output_layout_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i| format!("{}", 440 + i)).collect();
        assert_eq!(output_layout(&names).unwrap(), [[0, 3, 6], [1, 4, 7], [2, 5, 8]]);
        assert!(output_layout(&names[..6]).is_err());
    }
}
