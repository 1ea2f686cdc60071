//! Ordered attribute exclusion for cleaning input layers before they are
//! folded into a fishnet.
//!
//! Each rule is applied to whatever survived the previous rules. Removed
//! records are kept in a separate layer tagged with the rule's reason, and
//! every round reports how many records it took out.

use crate::error::Result;
use crate::layer::{FieldDef, FieldKind, Layer, Value};
use log::info;
use serde::{Deserialize, Serialize};

pub const REASON: &str = "REASON";
pub const ACTION: &str = "ACTION";

/// `field` equals any of `equals` (compared as text).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    pub field: String,
    pub equals: Vec<String>,
}

/// A record is excluded when any clause matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub reason: String,
    pub clauses: Vec<Clause>,
}

impl ExclusionRule {
    /// Single-field rule.
    pub fn field_equals(reason: &str, field: &str, values: &[&str]) -> Self {
        Self {
            reason: reason.to_string(),
            clauses: vec![Clause {
                field: field.to_string(),
                equals: values.iter().map(|v| v.to_string()).collect(),
            }],
        }
    }
}

/// One line of the exclusion log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRound {
    pub round: u32,
    pub reason: String,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct ExclusionOutcome {
    pub kept: Layer,
    pub removed: Layer,
    pub stats: Vec<ExclusionRound>,
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Apply `rules` in order to `layer`.
pub fn exclude_records(layer: &Layer, rules: &[ExclusionRule]) -> Result<ExclusionOutcome> {
    // Resolve every clause up front so a typo fails before any round runs.
    let resolved = rules
        .iter()
        .map(|rule| {
            rule.clauses
                .iter()
                .map(|c| Ok((layer.require_field(&c.field)?, c)))
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    let mut kept = layer.clone();
    let mut removed = layer.empty_like(format!("{}_removed", layer.name));
    removed.add_field(FieldDef::new(REASON, FieldKind::Text))?;
    removed.add_field(FieldDef::new(ACTION, FieldKind::Text))?;
    let mut stats = Vec::with_capacity(rules.len());

    for (round, (rule, clauses)) in rules.iter().zip(&resolved).enumerate() {
        let (hit, miss): (Vec<_>, Vec<_>) = std::mem::take(&mut kept.features)
            .into_iter()
            .partition(|feature| {
                clauses.iter().any(|(idx, clause)| {
                    text_of(&feature.values[*idx])
                        .map(|v| clause.equals.iter().any(|e| *e == v))
                        .unwrap_or(false)
                })
            });
        kept.features = miss;

        let count = hit.len();
        for mut feature in hit {
            feature.values.push(Value::Text(rule.reason.clone()));
            feature.values.push(Value::Text("None".to_string()));
            removed.features.push(feature);
        }

        let round = round as u32 + 1;
        info!("Round {round}: excluded {count} record(s) for {}", rule.reason);
        stats.push(ExclusionRound {
            round,
            reason: rule.reason.clone(),
            count,
        });
    }

    info!(
        "Exclusion of {} complete: {} kept, {} removed",
        layer.name,
        kept.len(),
        removed.len()
    );
    Ok(ExclusionOutcome {
        kept,
        removed,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FishnetError;
    use crate::layer::ShapeType;
    use geo_types::Point;

    fn holdings() -> Layer {
        let mut layer = Layer::new("holdings", ShapeType::Point);
        layer.fields = vec![
            FieldDef::new("ACCESS_TYP", FieldKind::Text),
            FieldDef::new("SPEC_USE", FieldKind::Text),
        ];
        let rows = [
            ("Open Access", ""),
            ("No Public Access", ""),
            ("Open Access", "Golf Course"),
            ("Restricted Access", "Cemetery"),
            ("Open Access", "Planned Park"),
            ("Open Access", "HOA"),
        ];
        for (i, (access, use_)) in rows.iter().enumerate() {
            layer.push(
                Point::new(i as f64, 0.0).into(),
                vec![Value::Text(access.to_string()), Value::Text(use_.to_string())],
            );
        }
        layer
    }

    fn rules() -> Vec<ExclusionRule> {
        vec![
            ExclusionRule::field_equals("No Public Access", "ACCESS_TYP", &["No Public Access"]),
            ExclusionRule::field_equals("Restricted Access", "ACCESS_TYP", &["Restricted Access"]),
            ExclusionRule::field_equals(
                "Special Use",
                "SPEC_USE",
                &["Golf Course", "Cemetery", "HOA", "School JUA"],
            ),
            ExclusionRule::field_equals("Planned Park", "SPEC_USE", &["Planned Park"]),
        ]
    }

    #[test]
    fn rounds_remove_in_order_and_tag_reasons() {
        let out = exclude_records(&holdings(), &rules()).unwrap();
        assert_eq!(out.kept.len(), 1);
        assert_eq!(out.removed.len(), 5);

        let counts: Vec<_> = out.stats.iter().map(|s| (s.round, s.count)).collect();
        // The cemetery row is restricted access, so round 2 claims it first.
        assert_eq!(counts, vec![(1, 1), (2, 1), (3, 2), (4, 1)]);

        let cemetery = out
            .removed
            .features
            .iter()
            .position(|f| f.values[1] == Value::Text("Cemetery".into()))
            .unwrap();
        assert_eq!(
            out.removed.value(cemetery, REASON),
            Some(&Value::Text("Restricted Access".into()))
        );
        assert_eq!(out.removed.value(cemetery, ACTION), Some(&Value::Text("None".into())));
    }

    #[test]
    fn unknown_field_fails_before_any_round() {
        let rules = vec![ExclusionRule::field_equals("x", "CFF", &["2"])];
        let err = exclude_records(&holdings(), &rules).unwrap_err();
        assert!(matches!(err, FishnetError::FieldNotFound { field, .. } if field == "CFF"));
    }

    #[test]
    fn rules_deserialize_from_json() {
        let rule: ExclusionRule = serde_json::from_str(
            r#"{ "reason": "Unknown Access",
                 "clauses": [{ "field": "ACCESS_TYP", "equals": ["Unknown Access"] }] }"#,
        )
        .unwrap();
        assert_eq!(rule.clauses[0].field, "ACCESS_TYP");
    }
}
