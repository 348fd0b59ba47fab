//! Image → model tensor conversion.
//!
//! Both embedding models take a square NCHW float tensor; they differ only in
//! input size and per-channel normalization.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use ndarray::Array4;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("image decode failed: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("face crop does not overlap the image")]
    EmptyCrop,
}

/// Input geometry and normalization for one embedding model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessSpec {
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

/// CLIP image encoder: 224×224, OpenAI CLIP channel statistics.
pub const GENERAL_PREPROCESS: PreprocessSpec = PreprocessSpec {
    size: 224,
    mean: [0.481_454_66, 0.457_827_5, 0.408_210_73],
    std: [0.268_629_54, 0.261_302_58, 0.275_777_1],
};

/// MobileFaceNet/ArcFace: 112×112, symmetric normalization to [-1, 1].
pub const FACE_PREPROCESS: PreprocessSpec = PreprocessSpec {
    size: 112,
    mean: [0.5, 0.5, 0.5],
    std: [0.5, 0.5, 0.5],
};

impl PreprocessSpec {
    /// Output tensor shape.
    pub fn shape(&self) -> [usize; 4] {
        let s = self.size as usize;
        [1, 3, s, s]
    }
}

/// Decode encoded image bytes (JPEG, PNG, WebP, ...).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    let image = image::load_from_memory(bytes)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessError::EmptyImage);
    }
    Ok(image)
}

/// Downscale so the longer side is at most `max_dim`, keeping aspect ratio.
/// Images already within bounds are returned unchanged.
pub fn limit_dimensions(image: DynamicImage, max_dim: u32) -> DynamicImage {
    let (w, h) = image.dimensions();
    if max_dim == 0 || (w <= max_dim && h <= max_dim) {
        return image;
    }
    let scale = max_dim as f32 / w.max(h) as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    tracing::debug!(from = ?(w, h), to = ?(new_w, new_h), "downscaling upload");
    image.resize_exact(new_w, new_h, FilterType::Triangle)
}

/// Center-crop to a square on the shorter side, resize to `spec.size`, and
/// convert RGBA pixels to a normalized planar `[1, 3, size, size]` tensor.
pub fn preprocess(image: &DynamicImage, spec: &PreprocessSpec) -> Result<Array4<f32>, PreprocessError> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(PreprocessError::EmptyImage);
    }

    let shorter = w.min(h);
    let sx = (w - shorter) / 2;
    let sy = (h - shorter) / 2;
    let square = image.crop_imm(sx, sy, shorter, shorter);

    let size = spec.size;
    let rgba = image::imageops::resize(&square.to_rgba8(), size, size, FilterType::Triangle);

    let s = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
    for (x, y, pixel) in rgba.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel.0[c] as f32 / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (value - spec.mean[c]) / spec.std[c];
        }
    }

    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn solid(w: u32, h: u32, px: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba(px)))
    }

    #[test]
    fn test_output_shape() {
        let img = solid(640, 480, [10, 20, 30, 255]);
        let t = preprocess(&img, &GENERAL_PREPROCESS).unwrap();
        assert_eq!(t.shape(), &[1, 3, 224, 224]);
        let t = preprocess(&img, &FACE_PREPROCESS).unwrap();
        assert_eq!(t.shape(), &FACE_PREPROCESS.shape());
    }

    #[test]
    fn test_face_normalization() {
        // 255 → (1.0 - 0.5) / 0.5 = 1.0, 0 → -1.0
        let img = solid(50, 50, [255, 0, 255, 255]);
        let t = preprocess(&img, &FACE_PREPROCESS).unwrap();
        assert!((t[[0, 0, 10, 10]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 10, 10]] + 1.0).abs() < 1e-6);
        assert!((t[[0, 2, 10, 10]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_general_normalization_per_channel() {
        let img = solid(300, 300, [128, 128, 128, 255]);
        let t = preprocess(&img, &GENERAL_PREPROCESS).unwrap();
        for c in 0..3 {
            let expected = (128.0 / 255.0 - GENERAL_PREPROCESS.mean[c]) / GENERAL_PREPROCESS.std[c];
            let got = t[[0, c, 100, 100]];
            assert!((got - expected).abs() < 1e-5, "channel {c}: got {got}, expected {expected}");
        }
    }

    #[test]
    fn test_center_crop_discards_sides() {
        // 300×100: left and right thirds red, middle third blue. The square
        // crop keeps only the blue middle.
        let mut img = RgbaImage::from_pixel(300, 100, Rgba([255, 0, 0, 255]));
        for y in 0..100 {
            for x in 100..200 {
                img.put_pixel(x, y, Rgba([0, 0, 255, 255]));
            }
        }
        let t = preprocess(&DynamicImage::ImageRgba8(img), &FACE_PREPROCESS).unwrap();
        for &(y, x) in &[(5, 5), (56, 56), (100, 100), (5, 106)] {
            assert!((t[[0, 0, y, x]] + 1.0).abs() < 1e-3, "red at ({x},{y}) should be 0");
            assert!((t[[0, 2, y, x]] - 1.0).abs() < 1e-3, "blue at ({x},{y}) should be 255");
        }
    }

    #[test]
    fn test_deterministic() {
        let mut img = RgbaImage::new(97, 131);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Rgba([(x * 7 % 256) as u8, (y * 3 % 256) as u8, ((x + y) % 256) as u8, 255]);
        }
        let img = DynamicImage::ImageRgba8(img);
        let a = preprocess(&img, &GENERAL_PREPROCESS).unwrap();
        let b = preprocess(&img, &GENERAL_PREPROCESS).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PreprocessError::ImageDecode(_)));
    }

    #[test]
    fn test_decode_png_roundtrip() {
        let img = solid(8, 6, [1, 2, 3, 255]);
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let decoded = decode_image(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (8, 6));
    }

    #[test]
    fn test_limit_dimensions() {
        let big = solid(4000, 2000, [0, 0, 0, 255]);
        assert_eq!(limit_dimensions(big, 1080).dimensions(), (1080, 540));

        let small = solid(800, 600, [0, 0, 0, 255]);
        assert_eq!(limit_dimensions(small, 1080).dimensions(), (800, 600));
    }
}
