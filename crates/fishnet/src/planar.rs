//! Planar geometry engine built on `geo`, with `rstar` for cell lookup.
//!
//! All measurements are Euclidean in the layer's projected plane. Callers
//! are expected to hand in metre-based projections; see
//! [`crate::aggregate`] for the unit check.

use crate::engine::{
    GeometryEngine, JoinSpec, MeasureKind, TiePolicy, JOIN_COUNT, ORIG_FID, TARGET_FID,
};
use crate::error::{FishnetError, Result};
use crate::layer::{Feature, FieldDef, FieldKind, Layer, ShapeType, Value};
use geo::{Area, BooleanOps, BoundingRect, Centroid, CoordsIter, Euclidean, Intersects, Length};
use geo_types::{Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point};
use log::debug;
use rstar::{RTree, RTreeObject, AABB};
use smallvec::SmallVec;
use std::collections::BTreeSet;

#[derive(Clone)]
struct IndexedBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedBox {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn envelope_of(geom: &Geometry<f64>) -> Option<AABB<[f64; 2]>> {
    geom.bounding_rect().map(|r| {
        AABB::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y])
    })
}

/// R-tree over the envelopes of every feature of `layer`. Empty geometries are skipped.
fn index_layer(layer: &Layer) -> RTree<IndexedBox> {
    let boxes = layer
        .features
        .iter()
        .enumerate()
        .filter_map(|(idx, f)| envelope_of(&f.geometry).map(|env| IndexedBox { idx, env }))
        .collect();
    RTree::bulk_load(boxes)
}

/// Indices of features whose envelope touches `geom`'s, ascending.
fn candidates(tree: &RTree<IndexedBox>, geom: &Geometry<f64>) -> SmallVec<[usize; 8]> {
    let mut out = SmallVec::new();
    if let Some(env) = envelope_of(geom) {
        for hit in tree.locate_in_envelope_intersecting(&env) {
            out.push(hit.idx);
        }
    }
    out.sort_unstable();
    out
}

fn ensure_finite(operation: &'static str, layer: &Layer) -> Result<()> {
    for feature in &layer.features {
        if feature
            .geometry
            .coords_iter()
            .any(|c| !c.x.is_finite() || !c.y.is_finite())
        {
            return Err(FishnetError::geometry(
                operation,
                format!(
                    "feature {} of '{}' has non-finite coordinates",
                    feature.fid, layer.name
                ),
            ));
        }
    }
    Ok(())
}

fn as_multi_polygon(geom: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geom {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Some(mp.clone()),
        Geometry::Rect(r) => Some(MultiPolygon::new(vec![r.to_polygon()])),
        Geometry::Triangle(t) => Some(MultiPolygon::new(vec![t.to_polygon()])),
        _ => None,
    }
}

fn as_multi_line(geom: &Geometry<f64>) -> Option<MultiLineString<f64>> {
    match geom {
        Geometry::Line(l) => Some(MultiLineString::new(vec![LineString::from(vec![
            l.start, l.end,
        ])])),
        Geometry::LineString(ls) => Some(MultiLineString::new(vec![ls.clone()])),
        Geometry::MultiLineString(mls) => Some(mls.clone()),
        _ => None,
    }
}

fn as_points(geom: &Geometry<f64>) -> Option<Vec<Point<f64>>> {
    match geom {
        Geometry::Point(p) => Some(vec![*p]),
        Geometry::MultiPoint(mp) => Some(mp.0.clone()),
        _ => None,
    }
}

fn wrong_geometry(operation: &'static str, layer: &Layer, feature: &Feature) -> FishnetError {
    FishnetError::geometry(
        operation,
        format!(
            "feature {} of {} layer '{}' has an incompatible geometry",
            feature.fid, layer.shape, layer.name
        ),
    )
}

/// Direction-insensitive key of a segment, with -0.0 folded into 0.0.
fn segment_key(a: Coord<f64>, b: Coord<f64>) -> [u64; 4] {
    let (p, q) = if (a.x, a.y) <= (b.x, b.y) { (a, b) } else { (b, a) };
    [
        (p.x + 0.0).to_bits(),
        (p.y + 0.0).to_bits(),
        (q.x + 0.0).to_bits(),
        (q.y + 0.0).to_bits(),
    ]
}

/// Name not yet used by `fields`: `name`, then `name_1`, `name_2`, ...
fn unique_name(fields: &[FieldDef], name: &str) -> String {
    if !fields.iter().any(|f| f.is_named(name)) {
        return name.to_string();
    }
    (1..)
        .map(|n| format!("{name}_{n}"))
        .find(|candidate| !fields.iter().any(|f| f.is_named(candidate)))
        .unwrap_or_else(|| name.to_string())
}

fn push_unique(fields: &mut Vec<FieldDef>, def: &FieldDef) {
    let name = unique_name(fields, &def.name);
    fields.push(FieldDef {
        name,
        alias: def.alias.clone(),
        kind: def.kind,
    });
}

/// Geometry engine over the `geo` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanarEngine;

impl PlanarEngine {
    pub fn new() -> Self {
        Self
    }

    fn dissolve_polygons(&self, layer: &Layer) -> Result<Option<Geometry<f64>>> {
        let mut merged: Option<MultiPolygon<f64>> = None;
        for feature in &layer.features {
            let mp = as_multi_polygon(&feature.geometry)
                .ok_or_else(|| wrong_geometry("dissolve", layer, feature))?;
            merged = Some(match merged {
                None => mp,
                Some(acc) => acc.union(&mp),
            });
        }
        Ok(merged.map(Geometry::MultiPolygon))
    }

    fn dissolve_lines(&self, layer: &Layer) -> Result<Option<Geometry<f64>>> {
        let mut seen = BTreeSet::new();
        let mut lines = Vec::new();
        let mut run: Vec<Coord<f64>> = Vec::new();

        let flush = |run: &mut Vec<Coord<f64>>, lines: &mut Vec<LineString<f64>>| {
            let done = std::mem::take(run);
            if done.len() >= 2 {
                lines.push(LineString::from(done));
            }
        };

        for feature in &layer.features {
            let mls = as_multi_line(&feature.geometry)
                .ok_or_else(|| wrong_geometry("dissolve", layer, feature))?;
            for ls in mls.iter() {
                for segment in ls.lines() {
                    if segment.start == segment.end {
                        continue;
                    }
                    if seen.insert(segment_key(segment.start, segment.end)) {
                        if run.last() != Some(&segment.start) {
                            flush(&mut run, &mut lines);
                            run.push(segment.start);
                        }
                        run.push(segment.end);
                    } else {
                        flush(&mut run, &mut lines);
                    }
                }
                flush(&mut run, &mut lines);
            }
        }

        if layer.is_empty() {
            return Ok(None);
        }
        Ok(Some(MultiLineString::new(lines).into()))
    }

    fn dissolve_points(&self, layer: &Layer) -> Result<Option<Geometry<f64>>> {
        let mut seen = BTreeSet::new();
        let mut points = Vec::new();
        for feature in &layer.features {
            let pts = as_points(&feature.geometry)
                .ok_or_else(|| wrong_geometry("dissolve", layer, feature))?;
            for p in pts {
                if seen.insert([(p.x() + 0.0).to_bits(), (p.y() + 0.0).to_bits()]) {
                    points.push(p);
                }
            }
        }
        if layer.is_empty() {
            return Ok(None);
        }
        Ok(Some(MultiPoint::from(points).into()))
    }

    /// Part of `feature` inside `cell`, or `None` when they do not overlap.
    fn clip_to_cell(
        &self,
        layer: &Layer,
        feature: &Feature,
        cell: &MultiPolygon<f64>,
    ) -> Result<Option<Geometry<f64>>> {
        let piece = match layer.shape {
            ShapeType::Polygon => {
                let mp = as_multi_polygon(&feature.geometry)
                    .ok_or_else(|| wrong_geometry("intersect", layer, feature))?;
                let piece = cell.intersection(&mp);
                if piece.0.is_empty() || piece.unsigned_area() == 0.0 {
                    return Ok(None);
                }
                Geometry::MultiPolygon(piece)
            }
            ShapeType::Polyline => {
                let mls = as_multi_line(&feature.geometry)
                    .ok_or_else(|| wrong_geometry("intersect", layer, feature))?;
                let clipped = cell.clip(&mls, false);
                let kept: Vec<LineString<f64>> =
                    clipped.into_iter().filter(|ls| ls.0.len() >= 2).collect();
                if kept.is_empty() {
                    return Ok(None);
                }
                Geometry::MultiLineString(MultiLineString::new(kept))
            }
            ShapeType::Point | ShapeType::Multipoint => {
                let pts = as_points(&feature.geometry)
                    .ok_or_else(|| wrong_geometry("intersect", layer, feature))?;
                let inside: Vec<Point<f64>> =
                    pts.into_iter().filter(|p| cell.intersects(p)).collect();
                match inside.len() {
                    0 => return Ok(None),
                    1 => Geometry::Point(inside[0]),
                    _ => Geometry::MultiPoint(MultiPoint::from(inside)),
                }
            }
        };
        Ok(Some(piece))
    }
}

impl GeometryEngine for PlanarEngine {
    fn dissolve(&self, layer: &Layer, out_name: &str) -> Result<Layer> {
        ensure_finite("dissolve", layer)?;

        let (shape, merged) = match layer.shape {
            ShapeType::Polygon => (ShapeType::Polygon, self.dissolve_polygons(layer)?),
            ShapeType::Polyline => (ShapeType::Polyline, self.dissolve_lines(layer)?),
            ShapeType::Point | ShapeType::Multipoint => {
                (ShapeType::Multipoint, self.dissolve_points(layer)?)
            }
        };

        let mut out = Layer::new(out_name, shape).with_linear_unit(layer.linear_unit);
        if let Some(geometry) = merged {
            out.push(geometry, Vec::new());
        }
        debug!("dissolve: {} features -> {}", layer.len(), out.len());
        Ok(out)
    }

    fn intersect_with_grid(&self, layer: &Layer, grid: &Layer, out_name: &str) -> Result<Layer> {
        if grid.shape != ShapeType::Polygon {
            return Err(FishnetError::geometry(
                "intersect",
                format!("grid '{}' must be a polygon layer, not {}", grid.name, grid.shape),
            ));
        }
        ensure_finite("intersect", layer)?;
        ensure_finite("intersect", grid)?;

        let cells = grid
            .features
            .iter()
            .map(|cell| {
                as_multi_polygon(&cell.geometry).ok_or_else(|| wrong_geometry("intersect", grid, cell))
            })
            .collect::<Result<Vec<_>>>()?;
        let tree = index_layer(grid);

        let mut fields = layer.fields.clone();
        for def in &grid.fields {
            push_unique(&mut fields, def);
        }
        let mut out = Layer::new(out_name, layer.shape).with_linear_unit(layer.linear_unit);
        out.fields = fields;

        for feature in &layer.features {
            for cell_idx in candidates(&tree, &feature.geometry) {
                let Some(piece) = self.clip_to_cell(layer, feature, &cells[cell_idx])? else {
                    continue;
                };
                let mut values = feature.values.clone();
                values.extend(grid.features[cell_idx].values.iter().cloned());
                out.push(piece, values);
            }
        }

        debug!(
            "intersect: {} features x {} cells -> {} pieces",
            layer.len(),
            grid.len(),
            out.len()
        );
        Ok(out)
    }

    fn to_points(&self, layer: &Layer, out_name: &str) -> Result<Layer> {
        ensure_finite("to_points", layer)?;

        let mut out = layer.empty_like(out_name);
        out.shape = ShapeType::Point;
        for feature in &layer.features {
            let point = feature.geometry.centroid().ok_or_else(|| {
                FishnetError::geometry(
                    "to_points",
                    format!("feature {} of '{}' has an empty geometry", feature.fid, layer.name),
                )
            })?;
            out.features.push(Feature {
                fid: feature.fid,
                geometry: point.into(),
                values: feature.values.clone(),
            });
        }
        Ok(out)
    }

    fn explode_to_single_parts(&self, layer: &Layer, out_name: &str) -> Result<Layer> {
        ensure_finite("explode", layer)?;

        let mut out = layer.empty_like(out_name);
        if out.shape == ShapeType::Multipoint {
            out.shape = ShapeType::Point;
        }
        let orig = FieldDef::new(unique_name(&out.fields, ORIG_FID), FieldKind::Integer);
        out.fields.push(orig);

        for feature in &layer.features {
            let parts: Vec<Geometry<f64>> = match &feature.geometry {
                Geometry::MultiPoint(mp) => mp.iter().map(|p| (*p).into()).collect(),
                Geometry::MultiLineString(mls) => mls.iter().cloned().map(Geometry::from).collect(),
                Geometry::MultiPolygon(mp) => mp.iter().cloned().map(Geometry::from).collect(),
                Geometry::GeometryCollection(gc) => gc.iter().cloned().collect(),
                single => vec![single.clone()],
            };
            for part in parts {
                let mut values = feature.values.clone();
                values.push(Value::Integer(feature.fid as i64));
                out.push(part, values);
            }
        }

        debug!("explode: {} features -> {} parts", layer.len(), out.len());
        Ok(out)
    }

    fn measure(&self, feature: &Feature, kind: MeasureKind) -> Result<f64> {
        let value = match (kind, &feature.geometry) {
            (
                MeasureKind::Area,
                g @ (Geometry::Polygon(_)
                | Geometry::MultiPolygon(_)
                | Geometry::Rect(_)
                | Geometry::Triangle(_)),
            ) => g.unsigned_area(),
            (MeasureKind::Length, Geometry::Line(l)) => {
                LineString::from(vec![l.start, l.end]).length::<Euclidean>()
            }
            (MeasureKind::Length, Geometry::LineString(ls)) => ls.length::<Euclidean>(),
            (MeasureKind::Length, Geometry::MultiLineString(mls)) => mls.length::<Euclidean>(),
            (kind, _) => {
                return Err(FishnetError::geometry(
                    "measure",
                    format!("cannot take {kind:?} of feature {}", feature.fid),
                ))
            }
        };

        if !value.is_finite() {
            return Err(FishnetError::geometry(
                "measure",
                format!("feature {} measured {value}", feature.fid),
            ));
        }
        Ok(value)
    }

    fn spatial_join(
        &self,
        target: &Layer,
        source: &Layer,
        spec: &JoinSpec,
        out_name: &str,
    ) -> Result<Layer> {
        ensure_finite("spatial_join", target)?;
        ensure_finite("spatial_join", source)?;

        // Output schema: bookkeeping, target fields, mapped fields.
        let mut fields = vec![
            FieldDef::new(JOIN_COUNT, FieldKind::Integer),
            FieldDef::new(TARGET_FID, FieldKind::Integer),
        ];
        for def in &target.fields {
            push_unique(&mut fields, def);
        }
        let mut inputs = Vec::with_capacity(spec.field_maps.len());
        for map in &spec.field_maps {
            if fields.iter().any(|f| f.is_named(&map.output.name)) {
                return Err(FishnetError::geometry(
                    "spatial_join",
                    format!("mapped field '{}' clashes with a target field", map.output.name),
                ));
            }
            inputs.push(source.require_field(&map.input)?);
            fields.push(map.output.clone());
        }

        // Source indices matched by each target, ascending.
        let mut matches: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); target.len()];
        match spec.ties {
            TiePolicy::All => {
                let tree = index_layer(source);
                for (t, cell) in target.features.iter().enumerate() {
                    for s in candidates(&tree, &cell.geometry) {
                        if source.features[s].geometry.intersects(&cell.geometry) {
                            matches[t].push(s);
                        }
                    }
                }
            }
            TiePolicy::LowestFid => {
                let tree = index_layer(target);
                for (s, feature) in source.features.iter().enumerate() {
                    let owner = candidates(&tree, &feature.geometry)
                        .into_iter()
                        .filter(|&t| target.features[t].geometry.intersects(&feature.geometry))
                        .min_by_key(|&t| target.features[t].fid);
                    if let Some(t) = owner {
                        matches[t].push(s);
                    }
                }
            }
        }

        let mut out = Layer::new(out_name, target.shape).with_linear_unit(target.linear_unit);
        out.fields = fields;
        for (cell, matched) in target.features.iter().zip(&matches) {
            let mut values = Vec::with_capacity(out.fields.len());
            values.push(Value::Integer(matched.len() as i64));
            values.push(Value::Integer(cell.fid as i64));
            values.extend(cell.values.iter().cloned());
            for (map, &idx) in spec.field_maps.iter().zip(&inputs) {
                let value = if matched.is_empty() {
                    map.fill.clone()
                } else {
                    map.merge
                        .merge(matched.iter().map(|&s| &source.features[s].values[idx]))
                };
                values.push(value.coerce(map.output.kind));
            }
            out.features.push(Feature {
                fid: cell.fid,
                geometry: cell.geometry.clone(),
                values,
            });
        }

        debug!(
            "spatial_join: {} sources onto {} targets ({} matched)",
            source.len(),
            target.len(),
            matches.iter().filter(|m| !m.is_empty()).count()
        );
        Ok(out)
    }
}
