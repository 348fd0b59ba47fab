//! Face localization policy: downscale-detect-rescale, padded crops, and the
//! zero/one/many decision that drives the rest of the pipeline.

use crate::detector::DetectorError;
use crate::preprocess::PreprocessError;
use crate::types::DetectedFace;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};

/// Larger-side ceiling before detection runs on a downscaled copy.
pub const DEFAULT_DETECT_MAX_DIM: u32 = 1024;

/// Padding added on each side of a face box, as a fraction of its size.
pub const DEFAULT_FACE_PADDING: f32 = 0.3;

/// Anything that can find faces in an RGB image.
pub trait FaceLocator {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError>;
}

/// Detect faces, downscaling first when the image exceeds `max_dim`.
///
/// Boxes are always returned in the coordinate space of `image`.
pub fn locate_faces<L: FaceLocator + ?Sized>(
    locator: &mut L,
    image: &DynamicImage,
    max_dim: u32,
) -> Result<Vec<DetectedFace>, DetectorError> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Ok(Vec::new());
    }

    if max_dim == 0 || (w <= max_dim && h <= max_dim) {
        return locator.detect(&image.to_rgb8());
    }

    let scale = max_dim as f32 / w.max(h) as f32;
    let small_w = ((w as f32 * scale).round() as u32).max(1);
    let small_h = ((h as f32 * scale).round() as u32).max(1);
    let small = image.resize_exact(small_w, small_h, FilterType::Triangle).to_rgb8();

    let scale_x = w as f32 / small_w as f32;
    let scale_y = h as f32 / small_h as f32;
    tracing::debug!(from = ?(w, h), to = ?(small_w, small_h), "detecting on downscaled copy");

    Ok(locator
        .detect(&small)?
        .into_iter()
        .map(|f| f.scaled(scale_x, scale_y))
        .collect())
}

/// Crop a face region expanded by `padding` of the box size on every side,
/// clamped to the image bounds.
pub fn crop_face(
    image: &DynamicImage,
    face: &DetectedFace,
    padding: f32,
) -> Result<DynamicImage, PreprocessError> {
    let (img_w, img_h) = image.dimensions();
    let pad_x = face.width * padding;
    let pad_y = face.height * padding;

    let x = (face.x - pad_x).max(0.0);
    let y = (face.y - pad_y).max(0.0);
    let w = (img_w as f32 - x).min(face.width + pad_x * 2.0);
    let h = (img_h as f32 - y).min(face.height + pad_y * 2.0);

    let right = face.x + face.width + pad_x;
    let bottom = face.y + face.height + pad_y;
    let outside = x >= img_w as f32 || y >= img_h as f32 || right <= 0.0 || bottom <= 0.0;
    if outside || !(w.is_finite() && h.is_finite()) || w < 1.0 || h < 1.0 {
        return Err(PreprocessError::EmptyCrop);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let cw = (w.round() as u32).clamp(1, img_w - x0);
    let ch = (h.round() as u32).clamp(1, img_h - y0);

    Ok(image.crop_imm(x0, y0, cw, ch))
}

/// What to do with the faces found in a photo.
#[derive(Debug, Clone, PartialEq)]
pub enum FacePolicy {
    /// No face: embed the whole photo, no face bonus.
    NoFace,
    /// Exactly one face: crop to it automatically.
    AutoCrop(DetectedFace),
    /// Several faces: the caller must pick one.
    Ambiguous(Vec<DetectedFace>),
}

impl FacePolicy {
    pub fn decide(mut faces: Vec<DetectedFace>) -> Self {
        match faces.len() {
            0 => FacePolicy::NoFace,
            1 => FacePolicy::AutoCrop(faces.remove(0)),
            _ => FacePolicy::Ambiguous(faces),
        }
    }
}
