//! Fishnet: folds vector layers into a fixed reference grid.
//!
//! Each run takes one input layer (polygons, lines or points) and adds one
//! numeric field to a new version of the accumulating grid:
//!
//! - polygons: acres of the layer inside each cell (`area * 0.000247`)
//! - lines: miles of the layer inside each cell (`length / 1609.344`)
//! - points: number of single-part points inside each cell
//!
//! Building blocks, leaf first:
//!
//! - [`engine`]: the geometry operations the pipeline needs, as a trait.
//!   [`planar::PlanarEngine`] implements it on top of `geo`.
//! - [`metric`]: acreage and length per feature.
//! - [`fields`]: field-name rules, field maps, renames, bookkeeping cleanup.
//! - [`aggregate`]: the pipeline itself.
//!
//! Layers are persisted through a [`store::LayerStore`]; the bundled
//! [`store::GeoJsonStore`] keeps one `.geojson` file per layer.
//!
//! Projected coordinates are assumed to be in metres. Layers that declare
//! feet or degrees are rejected for the area and line branches.

pub mod aggregate;
pub mod engine;
pub mod error;
pub mod exclude;
pub mod fields;
pub mod geojson;
pub mod grid;
pub mod layer;
pub mod metric;
pub mod planar;
pub mod store;

pub use aggregate::{FishnetAggregator, FoldPlan, LayerJob, RunConfig, RunReport, Stage};
pub use engine::{GeometryEngine, JoinSpec, MeasureKind, TiePolicy};
pub use error::{FishnetError, Result, ValidationError};
pub use layer::{Feature, FieldDef, FieldKind, GeometryKind, Layer, LinearUnit, ShapeType, Value};
pub use planar::PlanarEngine;
pub use store::{GeoJsonStore, LayerStore, MemoryStore};
