//! Geometry engine adapter.
//!
//! The pipeline never touches coordinates directly; every geometric step
//! goes through a [`GeometryEngine`]. [`crate::planar::PlanarEngine`] is the
//! bundled implementation.

use crate::error::Result;
use crate::fields::FieldMap;
use crate::layer::{Feature, Layer};

/// Count of source features matched per target, injected by every spatial join.
pub const JOIN_COUNT: &str = "Join_Count";
/// Object id of the target feature, injected by every spatial join.
pub const TARGET_FID: &str = "TARGET_FID";
/// Object id of the multipart feature a single part came from.
pub const ORIG_FID: &str = "ORIG_FID";

/// Which raw measurement to take from a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureKind {
    Area,
    Length,
}

/// Spatial predicate of a join. Only intersection is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinPredicate {
    #[default]
    Intersects,
}

/// How a source feature touching several targets is attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TiePolicy {
    /// Only the intersecting target with the lowest fid receives it.
    #[default]
    LowestFid,
    /// Every intersecting target receives it.
    All,
}

/// Parameters of a one-to-one, keep-all spatial join.
#[derive(Debug, Clone, Default)]
pub struct JoinSpec {
    pub predicate: JoinPredicate,
    pub ties: TiePolicy,
    /// Source fields copied onto the targets, in output order.
    pub field_maps: Vec<FieldMap>,
}

impl JoinSpec {
    pub fn with_field_map(mut self, map: FieldMap) -> Self {
        self.field_maps.push(map);
        self
    }

    pub fn with_ties(mut self, ties: TiePolicy) -> Self {
        self.ties = ties;
        self
    }
}

/// Geometry operations the aggregation pipeline consumes.
///
/// Every operation is synchronous and returns a new layer; inputs are
/// never modified. Failures surface as `FishnetError::GeometryOperation`.
pub trait GeometryEngine {
    /// Merge every feature into a single feature with internal boundaries removed.
    fn dissolve(&self, layer: &Layer, out_name: &str) -> Result<Layer>;

    /// One output feature per (input feature, grid cell) overlap, carrying
    /// the attributes of both.
    fn intersect_with_grid(&self, layer: &Layer, grid: &Layer, out_name: &str) -> Result<Layer>;

    /// One representative point per feature.
    fn to_points(&self, layer: &Layer, out_name: &str) -> Result<Layer>;

    /// One feature per part of every multipart feature.
    fn explode_to_single_parts(&self, layer: &Layer, out_name: &str) -> Result<Layer>;

    /// Planar area or length in the layer's linear unit.
    fn measure(&self, feature: &Feature, kind: MeasureKind) -> Result<f64>;

    /// Keep every target; prepend `Join_Count` and `TARGET_FID`, then the
    /// target fields, then one field per entry of `spec.field_maps`.
    fn spatial_join(
        &self,
        target: &Layer,
        source: &Layer,
        spec: &JoinSpec,
        out_name: &str,
    ) -> Result<Layer>;
}

impl<T: GeometryEngine + ?Sized> GeometryEngine for &T {
    fn dissolve(&self, layer: &Layer, out_name: &str) -> Result<Layer> {
        (**self).dissolve(layer, out_name)
    }

    fn intersect_with_grid(&self, layer: &Layer, grid: &Layer, out_name: &str) -> Result<Layer> {
        (**self).intersect_with_grid(layer, grid, out_name)
    }

    fn to_points(&self, layer: &Layer, out_name: &str) -> Result<Layer> {
        (**self).to_points(layer, out_name)
    }

    fn explode_to_single_parts(&self, layer: &Layer, out_name: &str) -> Result<Layer> {
        (**self).explode_to_single_parts(layer, out_name)
    }

    fn measure(&self, feature: &Feature, kind: MeasureKind) -> Result<f64> {
        (**self).measure(feature, kind)
    }

    fn spatial_join(
        &self,
        target: &Layer,
        source: &Layer,
        spec: &JoinSpec,
        out_name: &str,
    ) -> Result<Layer> {
        (**self).spatial_join(target, source, spec, out_name)
    }
}
