use crate::region::{Plane, Region, SAMPLE_MAX};

/// Splits RGB into luminance Y and two chroma planes S, T.
fn to_yst(region: &Region) -> [Plane; 3] {
    let (width, height) = (region.width(), region.height());
    let mut planes = [(); 3].map(|_| Plane {
        width,
        height,
        values: Vec::with_capacity(width * height),
    });
    for pixel in region.pixels() {
        let (r, g, b) = (pixel[0], pixel[1], pixel[2]);
        planes[0].values.push((r + g + b) / 3.0);
        planes[1].values.push((r - b) / 2.0);
        planes[2].values.push((r - 2.0 * g + b) / 4.0);
    }
    planes
}

fn median_filter(plane: &Plane, radius: u32) -> Plane {
    let radius = radius as isize;
    let mut window = Vec::with_capacity(((2 * radius + 1) * (2 * radius + 1)) as usize);
    let mut values = Vec::with_capacity(plane.values.len());
    for y in 0..plane.height as isize {
        for x in 0..plane.width as isize {
            window.clear();
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    window.push(plane.at(x + dx, y + dy));
                }
            }
            let middle = window.len() / 2;
            let (_, median, _) = window.select_nth_unstable_by(middle, f32::total_cmp);
            values.push(*median);
        }
    }
    Plane {
        width: plane.width,
        height: plane.height,
        values,
    }
}

/// Median-filters chroma only; luminance detail is left untouched.
pub(super) fn apply(region: &mut Region, radius: u32) {
    let [luma, s, t] = to_yst(region);
    let s = median_filter(&s, radius);
    let t = median_filter(&t, radius);
    for (index, pixel) in region.pixels_mut().enumerate() {
        let (y, s, t) = (luma.values[index], s.values[index], t.values[index]);
        pixel[0] = (y + 2.0 * t / 3.0 + s).clamp(0.0, SAMPLE_MAX);
        pixel[1] = (y - 4.0 * t / 3.0).clamp(0.0, SAMPLE_MAX);
        pixel[2] = (y + 2.0 * t / 3.0 - s).clamp(0.0, SAMPLE_MAX);
    }
}
