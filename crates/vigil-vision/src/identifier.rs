//! ArcFace embedding identifier on ONNX Runtime.
//!
//! Each face is aligned onto the 112×112 template (or, without landmarks,
//! its box is resized), embedded, and compared against the gallery.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;
use vigil_core::{FaceCrop, FaceIdentifier, IdentificationResult};

use crate::align::{self, ALIGNED_SIZE};
use crate::gallery::{normalize, Gallery};

const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum IdentifierError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct ArcFaceIdentifier {
    session: Session,
    gallery: Gallery,
}

impl ArcFaceIdentifier {
    pub fn load(model_path: &Path, gallery: Gallery) -> Result<Self, IdentifierError> {
        if !model_path.exists() {
            return Err(IdentifierError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            gallery = gallery.len(),
            "loaded ArcFace model"
        );
        if gallery.is_empty() {
            tracing::warn!("face gallery is empty; every face will be unknown");
        }

        Ok(Self { session, gallery })
    }

    /// L2-normalized embedding of one face.
    pub fn embed(&mut self, crop: &FaceCrop<'_>) -> Result<Vec<f32>, IdentifierError> {
        let aligned = canonical_face(crop)?;
        let input = to_tensor(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| IdentifierError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(IdentifierError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(normalize(raw.to_vec()))
    }
}

impl FaceIdentifier for ArcFaceIdentifier {
    type Error = IdentifierError;

    fn identify(&mut self, crop: &FaceCrop<'_>) -> Result<IdentificationResult, IdentifierError> {
        let embedding = self.embed(crop)?;
        Ok(match self.gallery.best_match(&embedding) {
            Some((identity, distance)) => IdentificationResult::matched(identity, distance),
            None => IdentificationResult::unidentified(),
        })
    }
}

/// 112×112 face: aligned on landmarks when the detector gave them,
/// otherwise the box resized.
fn canonical_face(crop: &FaceCrop<'_>) -> Result<RgbImage, IdentifierError> {
    if let Some(landmarks) = &crop.face.landmarks {
        if let Some(aligned) = align::align(&crop.frame.image, landmarks) {
            return Ok(aligned);
        }
        tracing::debug!("degenerate landmarks; falling back to box crop");
    }
    let boxed = crop.to_image().ok_or(IdentifierError::EmptyCrop)?;
    Ok(imageops::resize(&boxed, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle))
}

fn to_tensor(face: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        for channel in 0..3 {
            tensor[[0, channel, y as usize, x as usize]] =
                (pixel.0[channel] as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }
    tensor
}
