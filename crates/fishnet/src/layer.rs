//! Feature collections: schema, attribute values and geometry.
//!
//! A [`Layer`] is a named, typed table of features. Values are stored
//! row-wise and kept parallel to the layer's field list, so schema edits
//! (`add_field`, `delete_fields`) always rewrite every row.

use crate::error::{FishnetError, Result, ValidationError};
use geo_types::Geometry;
use std::fmt;
use std::str::FromStr;

/// Attribute value held by one feature in one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Double(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the value; text and nulls have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            Value::Null | Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Coerce into the storage type of `kind`. Lossy conversions round.
    pub fn coerce(self, kind: FieldKind) -> Value {
        match (kind, self) {
            (_, Value::Null) => Value::Null,
            (FieldKind::Integer, Value::Double(d)) => Value::Integer(d.round() as i64),
            (FieldKind::Integer, Value::Text(s)) => {
                s.trim().parse().map(Value::Integer).unwrap_or(Value::Null)
            }
            (FieldKind::Double, Value::Integer(i)) => Value::Double(i as f64),
            (FieldKind::Double, Value::Text(s)) => {
                s.trim().parse().map(Value::Double).unwrap_or(Value::Null)
            }
            (FieldKind::Text, Value::Integer(i)) => Value::Text(i.to_string()),
            (FieldKind::Text, Value::Double(d)) => Value::Text(d.to_string()),
            (_, v) => v,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("<null>"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Double,
    Text,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::Integer => "integer",
            FieldKind::Double => "double",
            FieldKind::Text => "text",
        }
    }
}

impl FromStr for FieldKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "integer" | "long" | "short" => Ok(FieldKind::Integer),
            "double" | "float" => Ok(FieldKind::Double),
            "text" | "string" => Ok(FieldKind::Text),
            other => Err(format!("unknown field kind '{other}'")),
        }
    }
}

/// A field definition. `alias` is the display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub alias: String,
    pub kind: FieldKind,
}

impl FieldDef {
    /// Field whose alias equals its name.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            alias: name.clone(),
            name,
            kind,
        }
    }

    /// Field names compare case-insensitively, like shapefile and geodatabase columns.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// One row of a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Stable object id. Grid cells keep theirs across every run.
    pub fid: u64,
    pub geometry: Geometry<f64>,
    /// Parallel to [`Layer::fields`].
    pub values: Vec<Value>,
}

/// Geometry type of a layer as reported by `describe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeType {
    Polygon,
    Polyline,
    Point,
    Multipoint,
}

impl ShapeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ShapeType::Polygon => "Polygon",
            ShapeType::Polyline => "Polyline",
            ShapeType::Point => "Point",
            ShapeType::Multipoint => "Multipoint",
        }
    }

    /// Branch tag used to pick the metric and join strategy.
    pub fn kind(self) -> GeometryKind {
        match self {
            ShapeType::Polygon => GeometryKind::Polygon,
            ShapeType::Polyline => GeometryKind::Line,
            ShapeType::Point | ShapeType::Multipoint => GeometryKind::Point,
        }
    }
}

impl fmt::Display for ShapeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShapeType {
    type Err = FishnetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "polygon" => Ok(ShapeType::Polygon),
            "line" | "polyline" => Ok(ShapeType::Polyline),
            "point" => Ok(ShapeType::Point),
            "multipoint" => Ok(ShapeType::Multipoint),
            _ => Err(FishnetError::UnsupportedGeometryType(s.to_string())),
        }
    }
}

/// Aggregation branch. Polygons yield acres, lines miles, points counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    Polygon,
    Line,
    Point,
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GeometryKind::Polygon => "polygon",
            GeometryKind::Line => "line",
            GeometryKind::Point => "point",
        })
    }
}

/// Linear unit of the layer's projected coordinate system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinearUnit {
    Meter,
    Foot,
    Degree,
    #[default]
    Unknown,
}

impl LinearUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            LinearUnit::Meter => "meter",
            LinearUnit::Foot => "foot",
            LinearUnit::Degree => "degree",
            LinearUnit::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LinearUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinearUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "meter" | "metre" | "m" => Ok(LinearUnit::Meter),
            "foot" | "feet" | "ft" | "foot_us" => Ok(LinearUnit::Foot),
            "degree" | "deg" => Ok(LinearUnit::Degree),
            "unknown" | "" => Ok(LinearUnit::Unknown),
            other => Err(format!("unknown linear unit '{other}'")),
        }
    }
}

/// A named feature collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub shape: ShapeType,
    pub linear_unit: LinearUnit,
    pub fields: Vec<FieldDef>,
    pub features: Vec<Feature>,
}

impl Layer {
    pub fn new(name: impl Into<String>, shape: ShapeType) -> Self {
        Self {
            name: name.into(),
            shape,
            linear_unit: LinearUnit::Unknown,
            fields: Vec::new(),
            features: Vec::new(),
        }
    }

    pub fn with_linear_unit(mut self, unit: LinearUnit) -> Self {
        self.linear_unit = unit;
        self
    }

    /// Same schema and metadata, no rows.
    pub fn empty_like(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: self.shape,
            linear_unit: self.linear_unit,
            fields: self.fields.clone(),
            features: Vec::new(),
        }
    }

    pub fn describe(&self) -> ShapeType {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.is_named(name))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_index(name).is_some()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.is_named(name))
    }

    /// Index of `name`, or `FieldNotFound`.
    pub fn require_field(&self, name: &str) -> Result<usize> {
        self.field_index(name).ok_or_else(|| FishnetError::FieldNotFound {
            layer: self.name.clone(),
            field: name.to_string(),
        })
    }

    /// Append a field; existing rows get `Null`.
    pub fn add_field(&mut self, def: FieldDef) -> Result<usize> {
        if self.has_field(&def.name) {
            return Err(ValidationError::FieldExists {
                field: def.name,
                grid: self.name.clone(),
            }
            .into());
        }
        self.fields.push(def);
        for feature in &mut self.features {
            feature.values.push(Value::Null);
        }
        Ok(self.fields.len() - 1)
    }

    /// Drop every listed field that is present. Returns how many were removed.
    pub fn delete_fields(&mut self, names: &[&str]) -> usize {
        let mut removed = 0;
        for name in names {
            if let Some(idx) = self.field_index(name) {
                self.fields.remove(idx);
                for feature in &mut self.features {
                    feature.values.remove(idx);
                }
                removed += 1;
            }
        }
        removed
    }

    /// Next unused object id.
    pub fn next_fid(&self) -> u64 {
        self.features.iter().map(|f| f.fid).max().unwrap_or(0) + 1
    }

    /// Append a feature with a fresh fid. `values` must match the schema width.
    pub fn push(&mut self, geometry: Geometry<f64>, values: Vec<Value>) -> u64 {
        debug_assert_eq!(values.len(), self.fields.len());
        let fid = self.next_fid();
        self.features.push(Feature {
            fid,
            geometry,
            values,
        });
        fid
    }

    pub fn value(&self, row: usize, field: &str) -> Option<&Value> {
        let idx = self.field_index(field)?;
        self.features.get(row).map(|f| &f.values[idx])
    }

    /// Value of `field` on the feature with object id `fid`.
    pub fn value_by_fid(&self, fid: u64, field: &str) -> Option<&Value> {
        let idx = self.field_index(field)?;
        self.features
            .iter()
            .find(|f| f.fid == fid)
            .map(|f| &f.values[idx])
    }

    pub fn set_value(&mut self, row: usize, field: &str, value: Value) -> Result<()> {
        let idx = self.require_field(field)?;
        let kind = self.fields[idx].kind;
        if let Some(feature) = self.features.get_mut(row) {
            feature.values[idx] = value.coerce(kind);
        }
        Ok(())
    }

    /// Field names in schema order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}
