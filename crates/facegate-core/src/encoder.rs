//! FaceNet face encoder via ONNX Runtime.
//!
//! Crops a detected face out of the RGB frame, resizes it to the square
//! encoder input, standardizes it per image and extracts an L2-normalized
//! embedding.

use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Tag stored with every embedding this encoder produces.
pub const FACENET_MODEL_VERSION: &str = "facenet";

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that turns a detected face into an embedding.
pub trait FaceEncoder {
    /// Returns an L2-normalized embedding for `face` within `frame`.
    fn encode(&mut self, frame: &RgbImage, face: &BoundingBox) -> Result<Embedding, EncoderError>;
}

/// FaceNet-based encoder with NHWC input.
pub struct FaceNetEncoder {
    session: Session,
    input_size: u32,
}

impl FaceNetEncoder {
    /// Load the FaceNet ONNX model; `input_size` is the square side (160 for FaceNet).
    pub fn load(model_path: &str, input_size: u32) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            input_size,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session, input_size })
    }
}

impl FaceEncoder for FaceNetEncoder {
    fn encode(&mut self, frame: &RgbImage, face: &BoundingBox) -> Result<Embedding, EncoderError> {
        let crop = crop_face(frame, face).ok_or(EncoderError::EmptyCrop)?;
        let size = self.input_size;
        let resized = imageops::resize(&crop, size, size, FilterType::Triangle);
        let input = preprocess(&resized);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() {
            return Err(EncoderError::InferenceFailed("encoder returned an empty embedding".into()));
        }

        Ok(Embedding {
            values: raw.to_vec(),
            model_version: Some(FACENET_MODEL_VERSION.to_string()),
        }
        .l2_normalized())
    }
}

/// Crop `face` out of `frame`, clamping the box to the frame bounds.
/// Returns `None` when nothing of the box overlaps the frame.
pub fn crop_face(frame: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (fw, fh) = (frame.width() as f32, frame.height() as f32);
    let x1 = face.x.max(0.0).floor();
    let y1 = face.y.max(0.0).floor();
    let x2 = (face.x + face.width).min(fw).ceil();
    let y2 = (face.y + face.height).min(fh).ceil();

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let (x, y) = (x1 as u32, y1 as u32);
    let w = (x2 as u32).min(frame.width()) - x;
    let h = (y2 as u32).min(frame.height()) - y;
    if w == 0 || h == 0 {
        return None;
    }
    Some(imageops::crop_imm(frame, x, y, w, h).to_image())
}

/// Per-image standardization into a `[1, S, S, 3]` tensor:
/// `(p - mean) / max(std, 1/sqrt(n))` over all channels.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let (w, h) = (face.width() as usize, face.height() as usize);
    let n = (w * h * 3).max(1) as f32;

    let samples = face.as_raw();
    let mean = samples.iter().map(|&p| p as f32).sum::<f32>() / n;
    let variance = samples
        .iter()
        .map(|&p| (p as f32 - mean).powi(2))
        .sum::<f32>()
        / n;
    let std = variance.sqrt().max(1.0 / n.sqrt());

    let mut tensor = Array4::<f32>::zeros((1, h, w, 3));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = (pixel.0[c] as f32 - mean) / std;
        }
    }
    tensor
}
