//! Advisory photo checks shown before analysis. None of them block matching.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use serde::Serialize;

const ANALYSIS_MAX_DIM: u32 = 2048;
const BRIGHTNESS_SAMPLE_STEP: usize = 40;
const MIN_BRIGHTNESS: f32 = 60.0;
const MAX_ASPECT_RATIO: f32 = 1.5;
const MIN_RESOLUTION: u32 = 200;
const SKIN_REGION_FRACTION: f32 = 0.15;
const SKIN_SAMPLE_STEP: usize = 3;
const MIN_SKIN_RATIO: f32 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Guideline {
    /// Mean sampled luma above 60.
    Brightness,
    /// Width / height below 1.5.
    AspectRatio,
    /// At least 200×200.
    Resolution,
    /// Enough skin-toned pixels near the upper-center of the frame.
    FacePresence,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GuidelineCheck {
    pub guideline: Guideline,
    pub pass: bool,
    /// The measured quantity the verdict is based on.
    pub value: f32,
}

/// Run all four checks, in a fixed order.
///
/// Ratio and resolution use the original dimensions; pixel statistics run on
/// a copy capped at 2048 px on the larger side.
pub fn check_guidelines(image: &DynamicImage) -> Vec<GuidelineCheck> {
    let (orig_w, orig_h) = image.dimensions();

    let rgb = if orig_w > ANALYSIS_MAX_DIM || orig_h > ANALYSIS_MAX_DIM {
        let scale = ANALYSIS_MAX_DIM as f32 / orig_w.max(orig_h) as f32;
        let w = ((orig_w as f32 * scale).round() as u32).max(1);
        let h = ((orig_h as f32 * scale).round() as u32).max(1);
        image.resize_exact(w, h, FilterType::Triangle).to_rgb8()
    } else {
        image.to_rgb8()
    };

    let brightness = mean_sampled_luma(rgb.as_raw());
    let ratio = if orig_h == 0 { f32::INFINITY } else { orig_w as f32 / orig_h as f32 };
    let skin = central_skin_ratio(&rgb);

    vec![
        GuidelineCheck {
            guideline: Guideline::Brightness,
            pass: brightness > MIN_BRIGHTNESS,
            value: brightness,
        },
        GuidelineCheck {
            guideline: Guideline::AspectRatio,
            pass: ratio < MAX_ASPECT_RATIO,
            value: ratio,
        },
        GuidelineCheck {
            guideline: Guideline::Resolution,
            pass: orig_w >= MIN_RESOLUTION && orig_h >= MIN_RESOLUTION,
            value: orig_w.min(orig_h) as f32,
        },
        GuidelineCheck {
            guideline: Guideline::FacePresence,
            pass: skin > MIN_SKIN_RATIO,
            value: skin,
        },
    ]
}

/// Rec. 601 luma of every 40th pixel.
fn mean_sampled_luma(rgb: &[u8]) -> f32 {
    let (sum, count) = rgb
        .chunks_exact(3)
        .step_by(BRIGHTNESS_SAMPLE_STEP)
        .fold((0.0f32, 0usize), |(sum, n), px| {
            let luma = px[0] as f32 * 0.299 + px[1] as f32 * 0.587 + px[2] as f32 * 0.114;
            (sum + luma, n + 1)
        });
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Share of skin-toned pixels in a square around (w/2, h/3).
fn central_skin_ratio(rgb: &image::RgbImage) -> f32 {
    let (w, h) = (rgb.width() as i64, rgb.height() as i64);
    let cx = w / 2;
    let cy = h / 3;
    let radius = (w.min(h) as f32 * SKIN_REGION_FRACTION).floor() as i64;

    let mut skin = 0usize;
    let mut checked = 0usize;
    for y in (cy - radius..cy + radius).step_by(SKIN_SAMPLE_STEP) {
        for x in (cx - radius..cx + radius).step_by(SKIN_SAMPLE_STEP) {
            if x < 0 || y < 0 || x >= w || y >= h {
                continue;
            }
            let [r, g, b] = rgb.get_pixel(x as u32, y as u32).0;
            if is_skin_tone(r, g, b) {
                skin += 1;
            }
            checked += 1;
        }
    }

    if checked == 0 {
        0.0
    } else {
        skin as f32 / checked as f32
    }
}

fn is_skin_tone(r: u8, g: u8, b: u8) -> bool {
    r > 80 && g > 50 && b > 30 && r > g && r > b && r - g > 10
}
