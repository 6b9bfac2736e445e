use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Zones of the zone mapper, endpoints included.
pub const ZONE_POINTS: usize = 17;

/// Largest context an area operation may request, in pixels.
pub const MAX_MARGIN: u32 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneMapperParams {
    /// Shadow lift, 0..=10.
    pub shadows: f64,
    /// Highlight compression, 0..=1.
    pub highlights: f64,
    /// Local contrast boost, 0..=10.
    pub detail: f64,
    /// Mask radius, 8..=64.
    pub depth: f64,
    /// Mask softness, 0.1..=1.
    pub fuzz: f64,
}

impl Default for ToneMapperParams {
    fn default() -> Self {
        Self {
            shadows: 3.0,
            highlights: 0.2,
            detail: 1.5,
            depth: 64.0,
            fuzz: 0.1,
        }
    }
}

impl ToneMapperParams {
    pub(crate) fn mask_sigma(&self) -> f32 {
        (self.depth.clamp(8.0, 64.0) / 4.0 * (1.0 + self.fuzz.clamp(0.1, 1.0))) as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorBalanceParams {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    /// Tonal position of the correction, 0..=1.
    pub midpoint: f64,
}

impl ColorBalanceParams {
    pub const HIGHLIGHTS_MIDPOINT: f64 = 0.62;
    pub const MIDTONES_MIDPOINT: f64 = 0.18;
    pub const SHADOWS_MIDPOINT: f64 = 0.04;
}

impl Default for ColorBalanceParams {
    fn default() -> Self {
        Self {
            red: 0.0,
            green: 0.0,
            blue: 0.0,
            midpoint: Self::MIDTONES_MIDPOINT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseReductionParams {
    /// Denoise strength, 1..=10.
    pub level: u32,
}

impl Default for NoiseReductionParams {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl NoiseReductionParams {
    /// Median window is `2 * radius + 1`, never smaller than 3.
    pub(crate) fn radius(&self) -> u32 {
        self.level.clamp(1, 10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneScale {
    #[default]
    Luminosity,
    Rgb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneMapperParams {
    /// Output zone per input zone in 0..=1; negative means unset.
    pub points: Vec<f64>,
    pub scale: ZoneScale,
}

impl Default for ZoneMapperParams {
    fn default() -> Self {
        Self {
            points: vec![-1.0; ZONE_POINTS],
            scale: ZoneScale::Luminosity,
        }
    }
}

impl ZoneMapperParams {
    /// Control points on the linear 0..=1 axis, endpoints defaulted to 0 and 1.
    pub(crate) fn control_points(&self) -> Vec<(f64, f64)> {
        let count = self.points.len();
        if count < 2 {
            return vec![(0.0, 0.0), (1.0, 1.0)];
        }
        let mut points = self.points.clone();
        if points[0] < 0.0 {
            points[0] = 0.0;
        }
        if points[count - 1] < 0.0 {
            points[count - 1] = 1.0;
        }
        points
            .iter()
            .enumerate()
            .filter(|(_, value)| **value >= 0.0)
            .map(|(index, value)| {
                let x = (2f64.powf(index as f64 * 8.0 / (count - 1) as f64) - 1.0) / 255.0;
                let y = (2f64.powf(value.min(1.0) * 8.0) - 1.0) / 255.0;
                (x, y)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VibranceParams {
    /// Saturation change in percent, -100..=100.
    pub amount: f64,
}

/// The closed set of editing operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationKind {
    ToneMapper(ToneMapperParams),
    ColorBalance(ColorBalanceParams),
    NoiseReduction(NoiseReductionParams),
    ZoneMapper(ZoneMapperParams),
    Vibrance(VibranceParams),
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::ToneMapper(_) => "tone_mapper",
            OperationKind::ColorBalance(_) => "color_balance",
            OperationKind::NoiseReduction(_) => "noise_reduction",
            OperationKind::ZoneMapper(_) => "zone_mapper",
            OperationKind::Vibrance(_) => "vibrance",
        }
    }

    /// Pixels of upstream context needed around a tile.
    pub fn margin(&self) -> u32 {
        match self {
            OperationKind::ToneMapper(params) => {
                ((params.mask_sigma() * 3.0).ceil() as u32).min(MAX_MARGIN)
            }
            OperationKind::NoiseReduction(params) => params.radius(),
            OperationKind::ColorBalance(_)
            | OperationKind::ZoneMapper(_)
            | OperationKind::Vibrance(_) => 0,
        }
    }

    /// True when the operation leaves every pixel unchanged.
    pub fn is_neutral(&self) -> bool {
        match self {
            OperationKind::ToneMapper(_) | OperationKind::NoiseReduction(_) => false,
            OperationKind::ColorBalance(params) => {
                params.red == 0.0 && params.green == 0.0 && params.blue == 0.0
            }
            OperationKind::ZoneMapper(params) => {
                let count = params.points.len();
                params.points.iter().enumerate().all(|(index, value)| {
                    *value < 0.0
                        || (index == 0 && *value == 0.0)
                        || (index + 1 == count && *value == 1.0)
                })
            }
            OperationKind::Vibrance(params) => params.amount == 0.0,
        }
    }

    /// Stable hash of the parameters, used to key prepared kernels.
    pub fn parameter_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.name().hash(&mut hasher);
        let mut feed = |value: f64| value.to_bits().hash(&mut hasher);
        match self {
            OperationKind::ToneMapper(params) => {
                for value in [
                    params.shadows,
                    params.highlights,
                    params.detail,
                    params.depth,
                    params.fuzz,
                ] {
                    feed(value);
                }
            }
            OperationKind::ColorBalance(params) => {
                for value in [params.red, params.green, params.blue, params.midpoint] {
                    feed(value);
                }
            }
            OperationKind::NoiseReduction(params) => feed(params.level as f64),
            OperationKind::ZoneMapper(params) => {
                params.points.iter().copied().for_each(&mut feed);
                feed(match params.scale {
                    ZoneScale::Luminosity => 0.0,
                    ZoneScale::Rgb => 1.0,
                });
            }
            OperationKind::Vibrance(params) => feed(params.amount),
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_zone_points_map_identity_endpoints() {
        let points = ZoneMapperParams::default().control_points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], (0.0, 0.0));
        assert!((points[1].0 - 1.0).abs() < 1e-12);
        assert!((points[1].1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn neutral_defaults_match_operation_semantics() {
        assert!(OperationKind::ColorBalance(ColorBalanceParams::default()).is_neutral());
        assert!(OperationKind::ZoneMapper(ZoneMapperParams::default()).is_neutral());
        assert!(OperationKind::Vibrance(VibranceParams::default()).is_neutral());
        assert!(!OperationKind::NoiseReduction(NoiseReductionParams::default()).is_neutral());
        assert!(!OperationKind::ToneMapper(ToneMapperParams::default()).is_neutral());
    }

    #[test]
    fn parameter_hash_tracks_changes() {
        let base = OperationKind::Vibrance(VibranceParams { amount: 10.0 });
        let same = OperationKind::Vibrance(VibranceParams { amount: 10.0 });
        let changed = OperationKind::Vibrance(VibranceParams { amount: 11.0 });
        assert_eq!(base.parameter_hash(), same.parameter_hash());
        assert_ne!(base.parameter_hash(), changed.parameter_hash());
    }

    #[test]
    fn margins_cover_area_operations_only() {
        let tone = OperationKind::ToneMapper(ToneMapperParams::default());
        assert_eq!(tone.margin(), 53);
        let noise = OperationKind::NoiseReduction(NoiseReductionParams { level: 4 });
        assert_eq!(noise.margin(), 4);
        assert_eq!(
            OperationKind::Vibrance(VibranceParams { amount: 30.0 }).margin(),
            0
        );
    }

    #[test]
    fn operation_kind_round_trips_through_tagged_json() {
        let kind = OperationKind::ColorBalance(ColorBalanceParams {
            red: 1.5,
            ..ColorBalanceParams::default()
        });
        let json = serde_json::to_string(&kind).expect("serialize");
        assert!(json.contains("\"operation\":\"color_balance\""));
        let parsed: OperationKind = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, kind);
    }
}
