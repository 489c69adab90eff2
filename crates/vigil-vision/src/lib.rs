//! vigil-vision: ONNX face detection and identification backends.
//!
//! [`ScrfdDetector`] finds faces and five landmarks; [`ArcFaceIdentifier`]
//! aligns each face, embeds it and matches it against a [`Gallery`] of
//! enrolled embeddings. Both plug into the `vigil_core` pipeline traits.

pub mod align;
pub mod detector;
pub mod gallery;
pub mod identifier;

pub use detector::{DetectorError, ScrfdDetector};
pub use gallery::{Gallery, GalleryEntry, GalleryError};
pub use identifier::{ArcFaceIdentifier, IdentifierError};
