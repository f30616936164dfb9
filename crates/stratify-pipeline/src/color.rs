//! Color space conversion: sRGB to scaled CIE L\*a\*b\*.
//!
//! Distances in L\*a\*b\* track perceived color difference far better
//! than raw RGB, which is why segmentation and clustering both operate
//! there. The per-axis [`LabScale`] is applied at conversion time so
//! every downstream distance computation inherits the bias for free.

use palette::{IntoColor, Lab, Srgb};
use rayon::prelude::*;

use crate::types::{ColorSpace, LabScale, PipelineError, PixelBuffer};

/// Nominal span of the L axis in CIE L\*a\*b\*.
const L_SPAN: f32 = 100.0;
/// Nominal span of the a and b axes.
const AB_SPAN: f32 = 255.0;

/// Convert an sRGB buffer to L\*a\*b\*, multiplying each axis by the
/// configured scale. The alpha plane passes through unchanged.
///
/// This is a pure per-pixel map with no cross-pixel state, so rows are
/// converted in parallel.
///
/// # Errors
///
/// Returns [`PipelineError::UnsupportedFormat`] if the buffer is not in
/// the sRGB color space.
pub fn to_lab(buffer: &PixelBuffer, scale: LabScale) -> Result<PixelBuffer, PipelineError> {
    if buffer.color_space() != ColorSpace::Rgb {
        return Err(PipelineError::UnsupportedFormat {
            stage: "convertColorSpace",
            expected: "rgb",
            found: buffer.color_space().to_string(),
        });
    }

    let samples: Vec<[f32; 3]> = buffer
        .samples()
        .par_iter()
        .map(|&[r, g, b]| {
            let lab: Lab = Srgb::new(r, g, b).into_color();
            [lab.l * scale.l, lab.a * scale.a, lab.b * scale.b]
        })
        .collect();

    let converted = PixelBuffer::from_parts(
        buffer.width(),
        buffer.height(),
        ColorSpace::Lab { scale },
        samples,
        buffer.alpha().map(<[f32]>::to_vec),
    );
    // from_parts only fails on length mismatch; the lengths above are
    // taken from the validated source buffer.
    converted.ok_or(PipelineError::UnsupportedFormat {
        stage: "convertColorSpace",
        expected: "rgb",
        found: buffer.color_space().to_string(),
    })
}

/// Map a sample from the given color space back to 8-bit sRGB.
///
/// Lab samples are un-scaled before conversion so a biased axis does
/// not tint the output; out-of-gamut results clamp per channel.
pub(crate) fn sample_to_rgb8(sample: [f32; 3], space: ColorSpace) -> [u8; 3] {
    let to_u8 = |c: f32| {
        let clamped = c.clamp(0.0, 1.0) * 255.0;
        // Rounding keeps pure channel values exact (1.0 -> 255).
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            clamped.round() as u8
        }
    };
    match space {
        ColorSpace::Rgb => [to_u8(sample[0]), to_u8(sample[1]), to_u8(sample[2])],
        ColorSpace::Lab { scale } => {
            let lab = Lab::new(
                sample[0] / scale.l,
                sample[1] / scale.a,
                sample[2] / scale.b,
            );
            let rgb: Srgb = lab.into_color();
            [to_u8(rgb.red), to_u8(rgb.green), to_u8(rgb.blue)]
        }
    }
}

/// The largest possible Euclidean distance between two samples in the
/// given color space, used to normalize merge distances into `[0, 1]`.
pub(crate) fn distance_divisor(space: ColorSpace) -> f32 {
    match space {
        ColorSpace::Rgb => 3.0_f32.sqrt(),
        ColorSpace::Lab { scale } => {
            let l = L_SPAN * scale.l;
            let a = AB_SPAN * scale.a;
            let b = AB_SPAN * scale.b;
            b.mul_add(b, l.mul_add(l, a * a)).sqrt()
        }
    }
}

/// Squared Euclidean distance between two samples.
pub(crate) fn distance_squared(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dl = a[0] - b[0];
    let da = a[1] - b[1];
    let db = a[2] - b[2];
    db.mul_add(db, dl.mul_add(dl, da * da))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn solid_buffer(rgba: [u8; 4]) -> PixelBuffer {
        PixelBuffer::from_rgba(&RgbaImage::from_pixel(2, 2, image::Rgba(rgba)))
    }

    #[test]
    fn red_converts_to_expected_lab() {
        let converted = to_lab(&solid_buffer([255, 0, 0, 255]), LabScale::IDENTITY).unwrap();
        let [l, a, b] = converted.get(0, 0);
        // CIE Lab for sRGB red (D65): approximately (53.2, 80.1, 67.2).
        assert!((l - 53.2).abs() < 1.0, "L = {l}");
        assert!((a - 80.1).abs() < 1.5, "a = {a}");
        assert!((b - 67.2).abs() < 1.5, "b = {b}");
        assert_eq!(
            converted.color_space(),
            ColorSpace::Lab {
                scale: LabScale::IDENTITY
            },
        );
    }

    #[test]
    fn white_and_black_pin_the_l_axis() {
        let white = to_lab(&solid_buffer([255, 255, 255, 255]), LabScale::IDENTITY).unwrap();
        let black = to_lab(&solid_buffer([0, 0, 0, 255]), LabScale::IDENTITY).unwrap();
        assert!((white.get(0, 0)[0] - 100.0).abs() < 0.5);
        assert!(black.get(0, 0)[0].abs() < 0.5);
    }

    #[test]
    fn scale_multiplies_each_axis() {
        let plain = to_lab(&solid_buffer([30, 180, 90, 255]), LabScale::IDENTITY).unwrap();
        let scaled = to_lab(
            &solid_buffer([30, 180, 90, 255]),
            LabScale::new(0.5, 2.0, 3.0),
        )
        .unwrap();
        let p = plain.get(1, 1);
        let s = scaled.get(1, 1);
        assert!((s[0] - p[0] * 0.5).abs() < 1e-4);
        assert!((s[1] - p[1] * 2.0).abs() < 1e-4);
        assert!((s[2] - p[2] * 3.0).abs() < 1e-4);
    }

    #[test]
    fn alpha_passes_through() {
        let buffer = solid_buffer([10, 20, 30, 128]);
        let converted = to_lab(&buffer, LabScale::IDENTITY).unwrap();
        assert_eq!(converted.alpha(), buffer.alpha());
    }

    #[test]
    fn converting_a_lab_buffer_is_unsupported() {
        let converted = to_lab(&solid_buffer([1, 2, 3, 255]), LabScale::IDENTITY).unwrap();
        let result = to_lab(&converted, LabScale::IDENTITY);
        assert!(matches!(
            result,
            Err(PipelineError::UnsupportedFormat { stage, .. }) if stage == "convertColorSpace"
        ));
    }

    #[test]
    fn round_trip_through_rgb8_preserves_primaries() {
        for rgba in [[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255]] {
            let converted = to_lab(&solid_buffer(rgba), LabScale::new(0.65, 1.0, 1.0)).unwrap();
            let back = sample_to_rgb8(converted.get(0, 0), converted.color_space());
            for (expected, actual) in rgba[..3].iter().zip(back) {
                assert!(
                    expected.abs_diff(actual) <= 2,
                    "expected {rgba:?}, got {back:?}",
                );
            }
        }
    }

    #[test]
    fn divisor_scales_with_the_space() {
        let identity = distance_divisor(ColorSpace::Lab {
            scale: LabScale::IDENTITY,
        });
        let doubled = distance_divisor(ColorSpace::Lab {
            scale: LabScale::new(2.0, 2.0, 2.0),
        });
        assert!((doubled - identity * 2.0).abs() < 1e-3);
        assert!((distance_divisor(ColorSpace::Rgb) - 3.0_f32.sqrt()).abs() < 1e-6);
    }
}
