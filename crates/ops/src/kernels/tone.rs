use tile_protocol::ComputeError;

use crate::kind::ToneMapperParams;
use crate::mask_cache::{MaskCache, MaskKey};
use crate::region::{Region, SAMPLE_MAX};

/// Local tone mapping against a blurred luminance mask.
///
/// The mask carries the large-scale lighting; shadows are lifted and
/// highlights compressed according to it, while `detail` re-amplifies the
/// pixel's deviation from the mask.
pub(super) fn apply(
    region: &mut Region,
    params: &ToneMapperParams,
    sigma: f32,
    masks: &MaskCache,
) -> Result<(), ComputeError> {
    let luma = super::luminance_plane(region);
    let key = MaskKey::new(region.rect, &luma, sigma);
    let mask = masks.get_or_build(key, || luma.gaussian_blur(sigma));

    let shadows = params.shadows.clamp(0.0, 10.0) as f32 * 0.25;
    let highlights = params.highlights.clamp(0.0, 1.0) as f32 * 0.5;
    let detail_exponent = 1.0 + params.detail.clamp(0.0, 10.0) as f32 * 0.2;

    for (index, pixel) in region.pixels_mut().enumerate() {
        let y = luma.values[index];
        if y <= 0.0 {
            continue;
        }
        let m = mask.values[index];
        let level = (m / SAMPLE_MAX).clamp(0.0, 1.0);
        let gain = (1.0 + shadows * (1.0 - level).powi(2) - highlights * level * level).max(0.05);
        let ratio = (y + 1.0) / (m + 1.0);
        let mapped = (m * gain * ratio.powf(detail_exponent)).min(SAMPLE_MAX);
        let scale = mapped / y;
        if !scale.is_finite() {
            return Err(ComputeError::Numeric {
                operation: "tone_mapper",
                message: format!("gain {scale} at luminance {y}"),
            });
        }
        for channel in pixel.iter_mut() {
            *channel = (*channel * scale).clamp(0.0, SAMPLE_MAX);
        }
    }
    Ok(())
}
