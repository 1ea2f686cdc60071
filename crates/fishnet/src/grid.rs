//! Fishnet template construction.

use crate::error::{Result, ValidationError};
use crate::layer::{FieldDef, FieldKind, Layer, LinearUnit, ShapeType, Value};
use geo_types::{coord, Rect};

/// Stable per-cell identifier written by [`build_fishnet`].
pub const CELL_ID: &str = "CELL_ID";

/// Regular grid of rectangular cells anchored at the lower-left `origin`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FishnetSpec {
    pub origin: (f64, f64),
    pub cell_width: f64,
    pub cell_height: f64,
    pub rows: u32,
    pub cols: u32,
    pub linear_unit: LinearUnit,
}

/// Build a polygon layer of `rows * cols` cells, row-major from the origin.
/// Cell fids and `CELL_ID` both count from 1.
pub fn build_fishnet(name: &str, spec: &FishnetSpec) -> Result<Layer> {
    if spec.rows == 0 || spec.cols == 0 {
        return Err(ValidationError::InvalidFishnet(format!(
            "need at least one row and column, got {}x{}",
            spec.rows, spec.cols
        ))
        .into());
    }
    let sizes_ok = [spec.cell_width, spec.cell_height]
        .iter()
        .all(|s| s.is_finite() && *s > 0.0);
    if !sizes_ok || !spec.origin.0.is_finite() || !spec.origin.1.is_finite() {
        return Err(ValidationError::InvalidFishnet(format!(
            "cell size {}x{} at ({}, {}) is not usable",
            spec.cell_width, spec.cell_height, spec.origin.0, spec.origin.1
        ))
        .into());
    }

    let mut layer = Layer::new(name, ShapeType::Polygon).with_linear_unit(spec.linear_unit);
    layer.fields.push(FieldDef::new(CELL_ID, FieldKind::Integer));

    let (x0, y0) = spec.origin;
    for row in 0..spec.rows {
        for col in 0..spec.cols {
            let min_x = x0 + f64::from(col) * spec.cell_width;
            let min_y = y0 + f64::from(row) * spec.cell_height;
            let cell = Rect::new(
                coord! { x: min_x, y: min_y },
                coord! { x: min_x + spec.cell_width, y: min_y + spec.cell_height },
            );
            let id = i64::from(row) * i64::from(spec.cols) + i64::from(col) + 1;
            layer.push(cell.to_polygon().into(), vec![Value::Integer(id)]);
        }
    }

    log::info!(
        "Built fishnet {name}: {} x {} cells of {} x {} {}",
        spec.rows,
        spec.cols,
        spec.cell_width,
        spec.cell_height,
        spec.linear_unit
    );
    Ok(layer)
}
