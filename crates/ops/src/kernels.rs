use std::sync::Arc;

use tile_protocol::ComputeError;

use crate::kind::{OperationKind, ToneMapperParams, ZoneScale};
use crate::mask_cache::MaskCache;
use crate::region::{Plane, Region};

mod color_balance;
mod noise;
mod tone;
mod vibrance;
mod zone;

/// Rec. 709 luminance weights.
pub(crate) const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

pub(crate) fn luminance(pixel: &[f32]) -> f32 {
    LUMA[0] * pixel[0] + LUMA[1] * pixel[1] + LUMA[2] * pixel[2]
}

pub(crate) fn luminance_plane(region: &Region) -> Plane {
    Plane {
        width: region.width(),
        height: region.height(),
        values: region.pixels().map(luminance).collect(),
    }
}

/// An operation with its parameter-derived tables built.
///
/// Tables are shared through `Arc`, so cloning into a snapshot is cheap.
#[derive(Debug, Clone)]
pub enum PreparedOperation {
    ToneMapper {
        params: ToneMapperParams,
        sigma: f32,
    },
    ColorBalance {
        tables: Arc<[Box<[u16]>; 3]>,
    },
    NoiseReduction {
        radius: u32,
    },
    ZoneMapper {
        table: Arc<[u16]>,
        scale: ZoneScale,
    },
    Vibrance {
        transform: [[f32; 3]; 3],
        saturation_increase: bool,
    },
}

impl PreparedOperation {
    pub fn prepare(kind: &OperationKind) -> Self {
        match kind {
            OperationKind::ToneMapper(params) => PreparedOperation::ToneMapper {
                params: *params,
                sigma: params.mask_sigma(),
            },
            OperationKind::ColorBalance(params) => PreparedOperation::ColorBalance {
                tables: Arc::new(color_balance::build_tables(params)),
            },
            OperationKind::NoiseReduction(params) => PreparedOperation::NoiseReduction {
                radius: params.radius(),
            },
            OperationKind::ZoneMapper(params) => PreparedOperation::ZoneMapper {
                table: zone::build_table(params).into(),
                scale: params.scale,
            },
            OperationKind::Vibrance(params) => {
                let transform = vibrance::saturation_transform(params.amount);
                PreparedOperation::Vibrance {
                    transform,
                    saturation_increase: transform[0][0] > 1.0,
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PreparedOperation::ToneMapper { .. } => "tone_mapper",
            PreparedOperation::ColorBalance { .. } => "color_balance",
            PreparedOperation::NoiseReduction { .. } => "noise_reduction",
            PreparedOperation::ZoneMapper { .. } => "zone_mapper",
            PreparedOperation::Vibrance { .. } => "vibrance",
        }
    }

    pub fn margin(&self) -> u32 {
        match self {
            PreparedOperation::ToneMapper { params, .. } => {
                OperationKind::ToneMapper(*params).margin()
            }
            PreparedOperation::NoiseReduction { radius } => *radius,
            PreparedOperation::ColorBalance { .. }
            | PreparedOperation::ZoneMapper { .. }
            | PreparedOperation::Vibrance { .. } => 0,
        }
    }

    pub(crate) fn apply(&self, region: &mut Region, masks: &MaskCache) -> Result<(), ComputeError> {
        match self {
            PreparedOperation::ToneMapper { params, sigma } => {
                tone::apply(region, params, *sigma, masks)
            }
            PreparedOperation::ColorBalance { tables } => {
                color_balance::apply(region, tables);
                Ok(())
            }
            PreparedOperation::NoiseReduction { radius } => {
                noise::apply(region, *radius);
                Ok(())
            }
            PreparedOperation::ZoneMapper { table, scale } => {
                zone::apply(region, table, *scale);
                Ok(())
            }
            PreparedOperation::Vibrance {
                transform,
                saturation_increase,
            } => {
                vibrance::apply(region, transform, *saturation_increase);
                Ok(())
            }
        }
    }
}

pub(crate) fn lookup(table: &[u16], value: f32) -> f32 {
    let index = value.round().clamp(0.0, (table.len() - 1) as f32) as usize;
    table[index] as f32
}
