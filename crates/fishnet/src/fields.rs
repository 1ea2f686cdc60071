//! Field reconciliation: name validation, field maps, renames and
//! bookkeeping cleanup.
//!
//! Layers cannot rename a field in place. A rename copies the values into
//! a newly named field through a [`FieldMappings`] rebuild and then drops
//! the old field; [`rename_field`] does both in one call.

use crate::engine::{JOIN_COUNT, TARGET_FID};
use crate::error::{Result, ValidationError};
use crate::layer::{Feature, FieldDef, FieldKind, Layer, Value};

/// Longest field name a grid column may carry.
pub const MAX_FIELD_NAME_LEN: usize = 10;

/// Fields a spatial join injects that carry no meaning on the final grid.
pub const BOOKKEEPING_FIELDS: [&str; 2] = [JOIN_COUNT, TARGET_FID];

/// Names owned by the storage layer itself.
const RESERVED_NAMES: [&str; 4] = ["FID", "OID", "OBJECTID", "SHAPE"];

fn check_chars(what: &'static str, value: &str) -> std::result::Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { what });
    }
    if let Some(found) = value.chars().find(|c| c.is_ascii_punctuation()) {
        return Err(ValidationError::Punctuation {
            what,
            value: value.to_string(),
            found,
        });
    }
    if value.chars().any(char::is_whitespace) {
        return Err(ValidationError::Whitespace {
            what,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Metric field names: 1..=10 characters, no punctuation, no whitespace.
pub fn validate_field_name(name: &str) -> std::result::Result<(), ValidationError> {
    if name.chars().count() > MAX_FIELD_NAME_LEN {
        return Err(ValidationError::FieldNameTooLong {
            name: name.to_string(),
            max: MAX_FIELD_NAME_LEN,
        });
    }
    check_chars("field name", name)?;
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(ValidationError::ReservedFieldName(name.to_string()));
    }
    Ok(())
}

/// Grid version suffixes: non-empty, no punctuation, no whitespace.
pub fn validate_suffix(suffix: &str) -> std::result::Result<(), ValidationError> {
    check_chars("fishnet suffix", suffix)
}

/// How several matched source values collapse into one output value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeRule {
    /// Value of the first matched source feature.
    #[default]
    First,
    /// Sum of the numeric values; `Null` if none are numeric.
    Sum,
}

impl MergeRule {
    pub fn merge<'a>(self, mut values: impl Iterator<Item = &'a Value>) -> Value {
        match self {
            MergeRule::First => values.next().cloned().unwrap_or(Value::Null),
            MergeRule::Sum => values
                .filter_map(Value::as_f64)
                .fold(None, |acc: Option<f64>, v| Some(acc.unwrap_or(0.0) + v))
                .map(Value::Double)
                .unwrap_or(Value::Null),
        }
    }
}

/// Derives one output field from one input field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMap {
    pub input: String,
    pub output: FieldDef,
    pub merge: MergeRule,
    /// Value for targets with no matched source.
    pub fill: Value,
}

impl FieldMap {
    /// Copy `source_field` into a `Double` field called `target_name`; name
    /// and alias are both `target_name`.
    pub fn join(source_field: &str, target_name: &str) -> Self {
        Self {
            input: source_field.to_string(),
            output: FieldDef::new(target_name, FieldKind::Double),
            merge: MergeRule::First,
            fill: Value::Null,
        }
    }

    /// Pass a field through unchanged.
    pub fn identity(def: &FieldDef) -> Self {
        Self {
            input: def.name.clone(),
            output: def.clone(),
            merge: MergeRule::First,
            fill: Value::Null,
        }
    }

    pub fn with_kind(mut self, kind: FieldKind) -> Self {
        self.output.kind = kind;
        self
    }

    pub fn with_merge(mut self, merge: MergeRule) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_fill(mut self, fill: Value) -> Self {
        self.fill = fill;
        self
    }
}

/// An ordered set of field maps that rebuilds a layer's schema.
#[derive(Debug, Clone, Default)]
pub struct FieldMappings {
    maps: Vec<FieldMap>,
}

impl FieldMappings {
    /// One identity map per field of `layer`.
    pub fn from_layer(layer: &Layer) -> Self {
        Self {
            maps: layer.fields.iter().map(FieldMap::identity).collect(),
        }
    }

    pub fn add(&mut self, map: FieldMap) {
        self.maps.push(map);
    }

    pub fn maps(&self) -> &[FieldMap] {
        &self.maps
    }

    /// Materialise a new layer whose fields are the map outputs. Geometry
    /// and fids are carried over unchanged.
    pub fn apply(&self, layer: &Layer, out_name: &str) -> Result<Layer> {
        let mut out = Layer::new(out_name, layer.shape).with_linear_unit(layer.linear_unit);

        let mut inputs = Vec::with_capacity(self.maps.len());
        for map in &self.maps {
            if out.has_field(&map.output.name) {
                return Err(ValidationError::FieldExists {
                    field: map.output.name.clone(),
                    grid: out_name.to_string(),
                }
                .into());
            }
            inputs.push(layer.require_field(&map.input)?);
            out.fields.push(map.output.clone());
        }

        out.features = layer
            .features
            .iter()
            .map(|feature| Feature {
                fid: feature.fid,
                geometry: feature.geometry.clone(),
                values: self
                    .maps
                    .iter()
                    .zip(&inputs)
                    .map(|(map, &idx)| feature.values[idx].clone().coerce(map.output.kind))
                    .collect(),
            })
            .collect();

        Ok(out)
    }
}

/// Copy `from` into the new field `to`, then drop `from`.
pub fn rename_field(layer: &Layer, from: &str, to: FieldDef) -> Result<Layer> {
    layer.require_field(from)?;
    if !to.is_named(from) && layer.has_field(&to.name) {
        return Err(ValidationError::FieldExists {
            field: to.name,
            grid: layer.name.clone(),
        }
        .into());
    }

    let mut mappings = FieldMappings::from_layer(layer);
    mappings.maps.retain(|m| !m.output.is_named(from) || !to.is_named(from));
    mappings.add(FieldMap {
        input: from.to_string(),
        output: to.clone(),
        merge: MergeRule::First,
        fill: Value::Null,
    });

    let mut out = mappings.apply(layer, &layer.name)?;
    if !to.is_named(from) {
        out.delete_fields(&[from]);
    }
    Ok(out)
}

/// Remove join bookkeeping fields that are present; others are ignored.
pub fn strip_bookkeeping_fields(layer: &mut Layer, names: &[&str]) -> usize {
    let removed = layer.delete_fields(names);
    if removed > 0 {
        log::debug!("Removed {removed} bookkeeping field(s) from {}", layer.name);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FishnetError;
    use crate::layer::ShapeType;
    use geo_types::Point;

    fn joined() -> Layer {
        let mut layer = Layer::new("grid_x", ShapeType::Polygon);
        layer.fields = vec![
            FieldDef::new(JOIN_COUNT, FieldKind::Integer),
            FieldDef::new(TARGET_FID, FieldKind::Integer),
            FieldDef::new("CELL_ID", FieldKind::Integer),
        ];
        layer.push(
            Point::new(0.0, 0.0).into(),
            vec![Value::Integer(2), Value::Integer(1), Value::Integer(10)],
        );
        layer.push(
            Point::new(1.0, 0.0).into(),
            vec![Value::Integer(0), Value::Integer(2), Value::Integer(11)],
        );
        layer
    }

    #[test]
    fn field_names_longer_than_ten_are_rejected() {
        assert!(validate_field_name("acres2018").is_ok());
        assert!(validate_field_name("abcdefghij").is_ok());
        assert!(matches!(
            validate_field_name("abcdefghijk"),
            Err(ValidationError::FieldNameTooLong { max: 10, .. })
        ));
    }

    #[test]
    fn punctuation_and_whitespace_are_rejected() {
        assert!(matches!(
            validate_field_name("park_ac"),
            Err(ValidationError::Punctuation { found: '_', .. })
        ));
        assert!(matches!(
            validate_suffix("v2.1"),
            Err(ValidationError::Punctuation { found: '.', .. })
        ));
        assert!(matches!(
            validate_suffix("v 2"),
            Err(ValidationError::Whitespace { .. })
        ));
        assert!(matches!(
            validate_suffix(""),
            Err(ValidationError::Empty { .. })
        ));
        assert!(matches!(
            validate_field_name("Shape"),
            Err(ValidationError::ReservedFieldName(_))
        ));
    }

    #[test]
    fn reserved_names_point_at_storage() {
        let err = validate_field_name("OBJECTID").unwrap_err();
        assert_eq!(
            err.to_string(),
            "field name 'OBJECTID' is reserved by layer storage"
        );
    }

    #[test]
    fn join_map_sets_name_and_alias() {
        let map = FieldMap::join("acres", "parkac");
        assert_eq!(map.output.name, "parkac");
        assert_eq!(map.output.alias, "parkac");
        assert_eq!(map.output.kind, FieldKind::Double);
    }

    #[test]
    fn merge_rules_collapse_matches() {
        let values = [Value::Double(1.5), Value::Null, Value::Integer(2)];
        assert_eq!(MergeRule::First.merge(values.iter()), Value::Double(1.5));
        assert_eq!(MergeRule::Sum.merge(values.iter()), Value::Double(3.5));
        assert_eq!(MergeRule::Sum.merge([Value::Null].iter()), Value::Null);
        assert_eq!(MergeRule::First.merge(std::iter::empty()), Value::Null);
    }

    #[test]
    fn rename_leaves_no_residual_field() {
        let layer = joined();
        let out = rename_field(&layer, JOIN_COUNT, FieldDef::new("trees", FieldKind::Double))
            .unwrap();
        assert_eq!(out.field_names(), vec![TARGET_FID, "CELL_ID", "trees"]);
        assert_eq!(out.value(0, "trees"), Some(&Value::Double(2.0)));
        assert_eq!(out.features[1].fid, layer.features[1].fid);
    }

    #[test]
    fn rename_onto_existing_field_fails() {
        let layer = joined();
        let err = rename_field(&layer, JOIN_COUNT, FieldDef::new("cell_id", FieldKind::Double))
            .unwrap_err();
        assert!(matches!(
            err,
            FishnetError::Validation(ValidationError::FieldExists { .. })
        ));
    }

    #[test]
    fn strip_removes_only_present_bookkeeping() {
        let mut layer = joined();
        layer.delete_fields(&[TARGET_FID]);
        assert_eq!(strip_bookkeeping_fields(&mut layer, &BOOKKEEPING_FIELDS), 1);
        assert_eq!(layer.field_names(), vec!["CELL_ID"]);
    }
}
