use crate::kind::ColorBalanceParams;
use crate::region::Region;

const TABLE_LEN: usize = 0x10000;

/// Offset curve through (0, 0), (midpoint, peak), (1, 0) as a quadratic
/// bezier, evaluated at `x`.
fn offset_at(x: f64, midpoint: f64, peak: f64) -> f64 {
    let a = 1.0 - 2.0 * midpoint;
    let b = 2.0 * midpoint;
    let s = if a.abs() < 1e-9 {
        x / b
    } else {
        (-b + (b * b + 4.0 * a * x).max(0.0).sqrt()) / (2.0 * a)
    };
    let s = s.clamp(0.0, 1.0);
    2.0 * s * (1.0 - s) * peak
}

pub(super) fn build_tables(params: &ColorBalanceParams) -> [Box<[u16]>; 3] {
    let midpoint = params.midpoint.clamp(0.0, 1.0);
    let peaks = [
        params.red / 2.0 - params.blue / 4.0 - params.green / 4.0,
        params.green / 2.0 - params.red / 4.0 - params.blue / 4.0,
        params.blue / 2.0 - params.red / 4.0 - params.green / 4.0,
    ];
    peaks.map(|peak| {
        (0..TABLE_LEN)
            .map(|index| {
                let x = index as f64 / (TABLE_LEN - 1) as f64;
                let shifted = index as f64 + 10.0 * 255.0 * offset_at(x, midpoint, peak);
                shifted.clamp(0.0, 65535.0) as u16
            })
            .collect()
    })
}

pub(super) fn apply(region: &mut Region, tables: &[Box<[u16]>; 3]) {
    for pixel in region.pixels_mut() {
        for (channel, table) in pixel.iter_mut().zip(tables.iter()) {
            *channel = super::lookup(table, *channel);
        }
    }
}
