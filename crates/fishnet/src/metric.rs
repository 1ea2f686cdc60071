//! Per-feature metric calculation for the area and line branches.

use crate::engine::{GeometryEngine, MeasureKind};
use crate::error::Result;
use crate::layer::{FieldDef, FieldKind, GeometryKind, Layer, Value};

/// Square metres to acres.
pub const ACRES_PER_SQUARE_METER: f64 = 0.000247;
/// Metres in a statute mile.
pub const METERS_PER_MILE: f64 = 1609.344;

/// A measured metric. Point layers have none: their density comes from the
/// spatial join count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Acres,
    Miles,
}

impl Metric {
    pub fn for_kind(kind: GeometryKind) -> Option<Metric> {
        match kind {
            GeometryKind::Polygon => Some(Metric::Acres),
            GeometryKind::Line => Some(Metric::Miles),
            GeometryKind::Point => None,
        }
    }

    pub fn measure_kind(self) -> MeasureKind {
        match self {
            Metric::Acres => MeasureKind::Area,
            Metric::Miles => MeasureKind::Length,
        }
    }

    /// Convert a raw planar measurement in metres (or square metres).
    pub fn from_raw(self, raw: f64) -> f64 {
        match self {
            Metric::Acres => raw * ACRES_PER_SQUARE_METER,
            Metric::Miles => raw / METERS_PER_MILE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Metric::Acres => "acreage",
            Metric::Miles => "length",
        }
    }
}

/// Add a `Double` field called `field` and fill it with the metric of each
/// feature. Geometry is left untouched.
pub fn calculate_metric<E: GeometryEngine + ?Sized>(
    engine: &E,
    layer: &mut Layer,
    metric: Metric,
    field: &str,
) -> Result<()> {
    let idx = layer.add_field(FieldDef::new(field, FieldKind::Double))?;
    let kind = metric.measure_kind();

    for feature in &mut layer.features {
        let raw = engine.measure(feature, kind)?;
        feature.values[idx] = Value::Double(metric.from_raw(raw));
    }

    Ok(())
}
