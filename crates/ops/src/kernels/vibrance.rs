use std::f32::consts::PI;

use super::LUMA;
use crate::region::{Region, SAMPLE_MAX};

/// Saturation matrix for `amount` percent around the luminance axis.
pub(super) fn saturation_transform(amount: f64) -> [[f32; 3]; 3] {
    let saturation = (1.0 + amount.clamp(-100.0, 100.0) / 100.0) as f32;
    let mut transform = [[0.0; 3]; 3];
    for (row_index, row) in transform.iter_mut().enumerate() {
        for (column, value) in row.iter_mut().enumerate() {
            let identity = if row_index == column { 1.0 } else { 0.0 };
            *value = saturation * identity + (1.0 - saturation) * LUMA[column];
        }
    }
    transform
}

/// Weight of the correction for a pixel: strongest on skin-distant hues,
/// and, when saturating, fading out on already saturated pixels.
fn hue_mask(r: f32, g: f32, b: f32, saturation_increase: bool) -> f32 {
    let x = r - 0.5 * (g + b);
    let y = 0.866 * (g - b);
    let mut hue = x.atan2(y) + PI;
    if hue > 4.0 * PI / 3.0 {
        hue -= 4.0 * PI / 3.0;
    } else if hue > 2.0 * PI / 3.0 {
        hue -= 2.0 * PI / 3.0;
    }
    let mut mask = 0.5 + 0.5 * (1.0 - (PI / 6.0 - hue).abs() / (PI / 3.0));
    if saturation_increase {
        let min = r.min(g).min(b);
        let max = r.max(g).max(b);
        let saturation = if max > 0.0 { 1.0 - min / max } else { 0.0 };
        mask *= 1.0 - saturation * saturation;
    }
    mask
}

pub(super) fn apply(region: &mut Region, transform: &[[f32; 3]; 3], saturation_increase: bool) {
    for pixel in region.pixels_mut() {
        let (r, g, b) = (pixel[0], pixel[1], pixel[2]);
        let mask = hue_mask(r, g, b, saturation_increase);
        for (channel, row) in pixel.iter_mut().zip(transform.iter()) {
            let mixed = row[0] * r + row[1] * g + row[2] * b;
            *channel = ((1.0 - mask) * *channel + mixed * mask).clamp(0.0, SAMPLE_MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tile_protocol::PixelRect;

    fn single_pixel(rgb: [u16; 3]) -> Region {
        Region::from_u16(PixelRect::new(0, 0, 1, 1), &rgb).expect("region")
    }

    #[test]
    fn zero_amount_is_identity_matrix() {
        let transform = saturation_transform(0.0);
        for (row_index, row) in transform.iter().enumerate() {
            for (column, value) in row.iter().enumerate() {
                let expected = if row_index == column { 1.0 } else { 0.0 };
                assert!((value - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn grey_pixels_are_unchanged() {
        let transform = saturation_transform(80.0);
        let mut region = single_pixel([20000, 20000, 20000]);
        apply(&mut region, &transform, true);
        for value in &region.samples {
            assert!((value - 20000.0).abs() < 0.5);
        }
    }

    #[test]
    fn desaturation_moves_channels_toward_grey() {
        let transform = saturation_transform(-60.0);
        let mut region = single_pixel([40000, 10000, 10000]);
        apply(&mut region, &transform, false);
        assert!(region.samples[0] < 40000.0);
        assert!(region.samples[1] > 10000.0);
    }
}
