//! Parameter model: typed values, coercion from untyped client input, and
//! the wire form sent to the worker.

use crate::types::ParameterKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One step's parameter values, keyed by parameter key.
pub type SettingMap = BTreeMap<ParameterKey, ParameterValue>;

/// The value of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    Bool(bool),
    /// A single integer or an inclusive integer range.
    IntRange(i64, Option<i64>),
    Text(String),
    /// One choice out of a fixed set, stored by its key.
    EnumChoice(String),
}

/// The declared type of a parameter. Coercion is total: any JSON value maps
/// to some value of the declared kind, falling back to a neutral default
/// rather than failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Bool,
    IntRange,
    Text,
    EnumChoice,
}

impl ParameterKind {
    /// Coerces an untyped client-provided value into this kind.
    pub fn coerce(&self, raw: &Value) -> ParameterValue {
        match self {
            ParameterKind::Bool => ParameterValue::Bool(truthy(raw)),
            ParameterKind::IntRange => match raw {
                Value::Array(items) => {
                    let lo = items.first().map(as_int).unwrap_or(0);
                    let hi = items.get(1).map(as_int);
                    ParameterValue::IntRange(lo, hi)
                }
                other => ParameterValue::IntRange(as_int(other), None),
            },
            ParameterKind::Text => ParameterValue::Text(as_text(raw)),
            ParameterKind::EnumChoice => ParameterValue::EnumChoice(as_text(raw)),
        }
    }
}

fn truthy(raw: &Value) -> bool {
    match raw {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => s == "true" || s == "1",
        _ => false,
    }
}

fn as_int(raw: &Value) -> i64 {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        Value::Bool(b) => *b as i64,
        _ => 0,
    }
}

fn as_text(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl ParameterValue {
    /// The JSON form sent to the worker: a bare scalar, or a two-element
    /// array for a real range.
    pub fn to_wire(&self) -> Value {
        match self {
            ParameterValue::Bool(b) => Value::Bool(*b),
            ParameterValue::IntRange(lo, None) => Value::from(*lo),
            ParameterValue::IntRange(lo, Some(hi)) => Value::from(vec![*lo, *hi]),
            ParameterValue::Text(s) | ParameterValue::EnumChoice(s) => Value::from(s.clone()),
        }
    }
}

/// Declaration of one step parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub key: ParameterKey,
    pub kind: ParameterKind,
    pub default: ParameterValue,
    pub title: String,
    /// Client-side only; never sent to the worker and irrelevant for
    /// re-run decisions.
    pub frontend_only: bool,
    /// Affects presentation only (e.g. colors); still persisted but not
    /// relevant to the worker.
    pub ui_only: bool,
    /// Valid keys for [`ParameterKind::EnumChoice`] parameters.
    pub choices: Vec<String>,
}

impl ParameterDef {
    pub fn new(key: impl Into<ParameterKey>, kind: ParameterKind, default: ParameterValue) -> Self {
        let key = key.into();
        Self {
            title: key.clone(),
            key,
            kind,
            default,
            frontend_only: false,
            ui_only: false,
            choices: Vec::new(),
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn frontend_only(mut self) -> Self {
        self.frontend_only = true;
        self
    }

    pub fn ui_only(mut self) -> Self {
        self.ui_only = true;
        self
    }

    pub fn with_choices(mut self, choices: Vec<String>) -> Self {
        self.choices = choices;
        self
    }

    /// True when a change to this parameter can alter the worker's result.
    pub fn server_relevant(&self) -> bool {
        !self.frontend_only && !self.ui_only
    }
}

/// Projects a full setting map down to the server-relevant subset, in the
/// wire form the worker expects.
pub fn wire_parameters(defs: &[ParameterDef], settings: &SettingMap) -> BTreeMap<String, Value> {
    defs.iter()
        .filter(|d| d.server_relevant())
        .filter_map(|d| settings.get(&d.key).map(|v| (d.key.clone(), v.to_wire())))
        .collect()
}

/// The server-relevant subset of a setting map, used to decide whether a
/// step actually needs to re-run.
pub fn server_relevant_settings(defs: &[ParameterDef], settings: &SettingMap) -> SettingMap {
    defs.iter()
        .filter(|d| d.server_relevant())
        .filter_map(|d| settings.get(&d.key).map(|v| (d.key.clone(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_is_total() {
        for raw in [json!(null), json!({}), json!([]), json!("x"), json!(2.5)] {
            for kind in [
                ParameterKind::Bool,
                ParameterKind::IntRange,
                ParameterKind::Text,
                ParameterKind::EnumChoice,
            ] {
                // must never panic, whatever the input
                let _ = kind.coerce(&raw);
            }
        }
    }

    #[test]
    fn test_coerce_int_range() {
        assert_eq!(
            ParameterKind::IntRange.coerce(&json!([3, 8])),
            ParameterValue::IntRange(3, Some(8))
        );
        assert_eq!(
            ParameterKind::IntRange.coerce(&json!("42")),
            ParameterValue::IntRange(42, None)
        );
        assert_eq!(
            ParameterKind::IntRange.coerce(&json!(null)),
            ParameterValue::IntRange(0, None)
        );
    }

    #[test]
    fn test_coerce_bool_truthiness() {
        assert_eq!(ParameterKind::Bool.coerce(&json!(1)), ParameterValue::Bool(true));
        assert_eq!(ParameterKind::Bool.coerce(&json!("true")), ParameterValue::Bool(true));
        assert_eq!(ParameterKind::Bool.coerce(&json!(0.0)), ParameterValue::Bool(false));
        assert_eq!(ParameterKind::Bool.coerce(&json!("no")), ParameterValue::Bool(false));
    }

    #[test]
    fn test_wire_form() {
        assert_eq!(ParameterValue::IntRange(5, None).to_wire(), json!(5));
        assert_eq!(ParameterValue::IntRange(1, Some(9)).to_wire(), json!([1, 9]));
        assert_eq!(ParameterValue::EnumChoice("otsu".into()).to_wire(), json!("otsu"));
    }

    #[test]
    fn test_wire_parameters_skips_client_side() {
        let defs = vec![
            ParameterDef::new("threshold", ParameterKind::IntRange, ParameterValue::IntRange(0, None)),
            ParameterDef::new("color", ParameterKind::Text, ParameterValue::Text("red".into())).ui_only(),
            ParameterDef::new("zoom", ParameterKind::IntRange, ParameterValue::IntRange(1, None)).frontend_only(),
        ];
        let mut settings = SettingMap::new();
        settings.insert("threshold".into(), ParameterValue::IntRange(12, None));
        settings.insert("color".into(), ParameterValue::Text("blue".into()));
        settings.insert("zoom".into(), ParameterValue::IntRange(3, None));

        let wire = wire_parameters(&defs, &settings);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire["threshold"], json!(12));
    }
}
