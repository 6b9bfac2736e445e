use crate::kind::{ZoneMapperParams, ZoneScale};
use crate::region::{Region, SAMPLE_MAX};

const TABLE_LEN: usize = 0x10000;

/// Piecewise linear transfer curve through the zone control points.
pub(super) fn build_table(params: &ZoneMapperParams) -> Vec<u16> {
    let points = params.control_points();
    let mut segment = 0;
    (0..TABLE_LEN)
        .map(|index| {
            let x = index as f64 / (TABLE_LEN - 1) as f64;
            while segment + 2 < points.len() && x > points[segment + 1].0 {
                segment += 1;
            }
            let (x0, y0) = points[segment];
            let (x1, y1) = points[(segment + 1).min(points.len() - 1)];
            let y = if x1 > x0 {
                y0 + (x - x0).clamp(0.0, x1 - x0) / (x1 - x0) * (y1 - y0)
            } else {
                y0
            };
            (y * SAMPLE_MAX as f64 + 0.5).clamp(0.0, SAMPLE_MAX as f64) as u16
        })
        .collect()
}

pub(super) fn apply(region: &mut Region, table: &[u16], scale: ZoneScale) {
    match scale {
        ZoneScale::Rgb => {
            for pixel in region.pixels_mut() {
                for channel in pixel.iter_mut() {
                    *channel = super::lookup(table, *channel);
                }
            }
        }
        ZoneScale::Luminosity => {
            for pixel in region.pixels_mut() {
                let luma = super::luminance(pixel);
                if luma <= 0.0 {
                    continue;
                }
                let ratio = super::lookup(table, luma) / luma;
                for channel in pixel.iter_mut() {
                    *channel = (*channel * ratio).min(SAMPLE_MAX);
                }
            }
        }
    }
}
