//! GeoJSON encoding of layers.
//!
//! A layer is one `FeatureCollection`. The schema travels in a foreign
//! member so field order, aliases and storage kinds survive a round trip:
//!
//! ```json
//! {
//!   "type": "FeatureCollection",
//!   "fishnet": {
//!     "name": "grid",
//!     "shapeType": "Polygon",
//!     "linearUnit": "meter",
//!     "fields": [{ "name": "CELL_ID", "alias": "CELL_ID", "kind": "integer" }]
//!   },
//!   "features": [
//!     { "type": "Feature", "id": 1, "geometry": { ... }, "properties": { "CELL_ID": 1 } }
//!   ]
//! }
//! ```
//!
//! Plain GeoJSON without the `fishnet` member is accepted: the shape comes
//! from the first geometry and fields are inferred from the properties.
//! Altitudes are dropped, non-integer ids fall back to the feature's
//! position, and features with a null geometry are skipped.

use crate::error::{FishnetError, Result};
use crate::layer::{Feature, FieldDef, FieldKind, Layer, LinearUnit, ShapeType, Value};
use geo_types::{Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct CollectionDoc {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fishnet: Option<LayerMeta>,
    features: Vec<FeatureDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayerMeta {
    name: String,
    #[serde(rename = "shapeType")]
    shape_type: String,
    #[serde(rename = "linearUnit", default)]
    linear_unit: Option<String>,
    fields: Vec<FieldDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FieldDoc {
    name: String,
    #[serde(default)]
    alias: Option<String>,
    kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct FeatureDoc {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<serde_json::Value>,
    geometry: Option<GeometryDoc>,
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
}

/// `[x, y]` or `[x, y, z, ...]`; only x and y are kept.
type Position = Vec<f64>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
enum GeometryDoc {
    Point(Position),
    MultiPoint(Vec<Position>),
    LineString(Vec<Position>),
    MultiLineString(Vec<Vec<Position>>),
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

fn bad(path: &Path, reason: impl Into<String>) -> FishnetError {
    FishnetError::Format {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn coord(position: &[f64]) -> Option<Coord<f64>> {
    match position {
        [x, y, ..] => Some(Coord { x: *x, y: *y }),
        _ => None,
    }
}

fn ring(positions: Vec<Position>) -> Option<LineString<f64>> {
    positions
        .iter()
        .map(|p| coord(p))
        .collect::<Option<Vec<_>>>()
        .map(LineString::from)
}

fn polygon(rings: Vec<Vec<Position>>) -> Option<Polygon<f64>> {
    let mut rings = rings.into_iter();
    let exterior = ring(rings.next()?)?;
    let interiors = rings.map(ring).collect::<Option<Vec<_>>>()?;
    Some(Polygon::new(exterior, interiors))
}

fn coords_of(ls: &LineString<f64>) -> Vec<Position> {
    ls.0.iter().map(|c| vec![c.x, c.y]).collect()
}

fn rings_of(poly: &Polygon<f64>) -> Vec<Vec<Position>> {
    std::iter::once(poly.exterior())
        .chain(poly.interiors())
        .map(coords_of)
        .collect()
}

impl GeometryDoc {
    fn into_geometry(self) -> Option<Geometry<f64>> {
        let geom = match self {
            GeometryDoc::Point(p) => Point::from(coord(&p)?).into(),
            GeometryDoc::MultiPoint(pts) => MultiPoint::from(
                pts.iter()
                    .map(|p| coord(p).map(Point::from))
                    .collect::<Option<Vec<_>>>()?,
            )
            .into(),
            GeometryDoc::LineString(coords) => ring(coords)?.into(),
            GeometryDoc::MultiLineString(lines) => MultiLineString::new(
                lines.into_iter().map(ring).collect::<Option<Vec<_>>>()?,
            )
            .into(),
            GeometryDoc::Polygon(rings) => polygon(rings)?.into(),
            GeometryDoc::MultiPolygon(polys) => MultiPolygon::new(
                polys.into_iter().map(polygon).collect::<Option<Vec<_>>>()?,
            )
            .into(),
        };
        Some(geom)
    }

    fn from_geometry(geom: &Geometry<f64>) -> Option<Self> {
        let doc = match geom {
            Geometry::Point(p) => GeometryDoc::Point(vec![p.x(), p.y()]),
            Geometry::MultiPoint(mp) => {
                GeometryDoc::MultiPoint(mp.iter().map(|p| vec![p.x(), p.y()]).collect())
            }
            Geometry::Line(l) => GeometryDoc::LineString(vec![
                vec![l.start.x, l.start.y],
                vec![l.end.x, l.end.y],
            ]),
            Geometry::LineString(ls) => GeometryDoc::LineString(coords_of(ls)),
            Geometry::MultiLineString(mls) => {
                GeometryDoc::MultiLineString(mls.iter().map(coords_of).collect())
            }
            Geometry::Polygon(p) => GeometryDoc::Polygon(rings_of(p)),
            Geometry::MultiPolygon(mp) => {
                GeometryDoc::MultiPolygon(mp.iter().map(rings_of).collect())
            }
            Geometry::Rect(r) => GeometryDoc::Polygon(rings_of(&r.to_polygon())),
            Geometry::Triangle(t) => GeometryDoc::Polygon(rings_of(&t.to_polygon())),
            Geometry::GeometryCollection(_) => return None,
        };
        Some(doc)
    }

    fn shape(&self) -> ShapeType {
        match self {
            GeometryDoc::Point(_) => ShapeType::Point,
            GeometryDoc::MultiPoint(_) => ShapeType::Multipoint,
            GeometryDoc::LineString(_) | GeometryDoc::MultiLineString(_) => ShapeType::Polyline,
            GeometryDoc::Polygon(_) | GeometryDoc::MultiPolygon(_) => ShapeType::Polygon,
        }
    }
}

fn json_to_value(json: &serde_json::Value, kind: FieldKind) -> Value {
    let raw = match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map(Value::Double).unwrap_or(Value::Null),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    };
    raw.coerce(kind)
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Double(d) => serde_json::Value::from(*d),
        Value::Text(s) => serde_json::Value::from(s.as_str()),
    }
}

/// Widen kinds seen across features: integer < double < text.
fn infer_kind(seen: Option<FieldKind>, json: &serde_json::Value) -> Option<FieldKind> {
    let this = match json {
        serde_json::Value::Null => return seen,
        serde_json::Value::Bool(_) => FieldKind::Integer,
        serde_json::Value::Number(n) if n.is_i64() => FieldKind::Integer,
        serde_json::Value::Number(_) => FieldKind::Double,
        _ => FieldKind::Text,
    };
    let rank = |k: FieldKind| match k {
        FieldKind::Integer => 0,
        FieldKind::Double => 1,
        FieldKind::Text => 2,
    };
    Some(match seen {
        Some(prev) if rank(prev) >= rank(this) => prev,
        _ => this,
    })
}

/// Decode a layer from GeoJSON bytes. `path` is used for naming and errors.
pub fn parse_layer_bytes(bytes: &[u8], path: &Path) -> Result<Layer> {
    let doc: CollectionDoc =
        serde_json::from_slice(bytes).map_err(|e| bad(path, e.to_string()))?;
    if doc.kind != "FeatureCollection" {
        return Err(bad(path, format!("expected FeatureCollection, got {}", doc.kind)));
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (name, shape, linear_unit, fields) = match &doc.fishnet {
        Some(meta) => {
            let shape: ShapeType = meta.shape_type.parse()?;
            let unit = match meta.linear_unit.as_deref() {
                Some(u) => u.parse::<LinearUnit>().map_err(|e| bad(path, e))?,
                None => LinearUnit::Unknown,
            };
            let fields = meta
                .fields
                .iter()
                .map(|f| {
                    let kind: FieldKind = f.kind.parse().map_err(|e: String| bad(path, e))?;
                    Ok(FieldDef {
                        name: f.name.clone(),
                        alias: f.alias.clone().unwrap_or_else(|| f.name.clone()),
                        kind,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            (meta.name.clone(), shape, unit, fields)
        }
        None => {
            let shape = doc
                .features
                .iter()
                .find_map(|f| f.geometry.as_ref())
                .map(GeometryDoc::shape)
                .ok_or_else(|| bad(path, "cannot infer shape type of an empty collection"))?;
            let mut kinds: BTreeMap<&str, Option<FieldKind>> = BTreeMap::new();
            for feature in &doc.features {
                for (key, json) in &feature.properties {
                    let slot = kinds.entry(key.as_str()).or_default();
                    *slot = infer_kind(*slot, json);
                }
            }
            let fields = kinds
                .into_iter()
                .map(|(name, kind)| FieldDef::new(name, kind.unwrap_or(FieldKind::Text)))
                .collect();
            (stem, shape, LinearUnit::Unknown, fields)
        }
    };

    let mut layer = Layer {
        name,
        shape,
        linear_unit,
        fields,
        features: Vec::with_capacity(doc.features.len()),
    };

    let mut skipped = 0usize;
    for (index, feature) in doc.features.into_iter().enumerate() {
        let Some(geometry) = feature.geometry else {
            skipped += 1;
            continue;
        };
        let geometry = geometry
            .into_geometry()
            .ok_or_else(|| bad(path, format!("feature {index} has no usable geometry")))?;
        let values = layer
            .fields
            .iter()
            .map(|def| {
                feature
                    .properties
                    .get(&def.name)
                    .map(|json| json_to_value(json, def.kind))
                    .unwrap_or(Value::Null)
            })
            .collect();
        let fid = feature
            .id
            .as_ref()
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(index as u64 + 1);
        layer.features.push(Feature {
            fid,
            geometry,
            values,
        });
    }

    if skipped > 0 {
        warn!(
            "Skipped {skipped} feature(s) without geometry in {}",
            path.display()
        );
    }
    Ok(layer)
}

/// Encode a layer as a GeoJSON document.
pub fn to_geojson_bytes(layer: &Layer, path: &Path) -> Result<Vec<u8>> {
    let features = layer
        .features
        .iter()
        .map(|feature| {
            let geometry = GeometryDoc::from_geometry(&feature.geometry).ok_or_else(|| {
                bad(path, format!("feature {} holds a geometry collection", feature.fid))
            })?;
            let properties = layer
                .fields
                .iter()
                .zip(&feature.values)
                .map(|(def, value)| (def.name.clone(), value_to_json(value)))
                .collect();
            Ok(FeatureDoc {
                kind: "Feature".to_string(),
                id: Some(serde_json::Value::from(feature.fid)),
                geometry: Some(geometry),
                properties,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let doc = CollectionDoc {
        kind: "FeatureCollection".to_string(),
        fishnet: Some(LayerMeta {
            name: layer.name.clone(),
            shape_type: layer.shape.as_str().to_string(),
            linear_unit: Some(layer.linear_unit.as_str().to_string()),
            fields: layer
                .fields
                .iter()
                .map(|f| FieldDoc {
                    name: f.name.clone(),
                    alias: Some(f.alias.clone()),
                    kind: f.kind.as_str().to_string(),
                })
                .collect(),
        }),
        features,
    };

    serde_json::to_vec(&doc).map_err(|e| bad(path, e.to_string()))
}

pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Layer> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            FishnetError::LayerNotFound(path.display().to_string())
        } else {
            FishnetError::Storage {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    parse_layer_bytes(&bytes, path)
}

/// Write through a sibling temp file and rename, so readers never see a half-written layer.
pub fn write_file<P: AsRef<Path>>(path: P, layer: &Layer) -> Result<()> {
    let path = path.as_ref();
    let bytes = to_geojson_bytes(layer, path)?;
    let io_err = |source| FishnetError::Storage {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".partial");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = BufWriter::new(File::create(&tmp).map_err(io_err)?);
        file.write_all(&bytes).map_err(io_err)?;
        file.flush().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;

    Ok(())
}
