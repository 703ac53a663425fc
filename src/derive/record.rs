use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

use crate::error::DeriveError;

use super::layout::Layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// Number, or a comma-separated list of numbers kept as text.
    Numeric,
    Integer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Number(f64),
}

impl FieldValue {
    pub fn default_for(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Text => FieldValue::Text(String::new()),
            FieldKind::Numeric => FieldValue::Number(0.0),
            FieldKind::Integer => FieldValue::Integer(0),
        }
    }

    /// Applies the field kind to an extracted value. Absent or empty values
    /// become the kind's default.
    pub fn shape(kind: FieldKind, raw: Option<String>) -> Self {
        let Some(raw) = raw.filter(|s| !s.is_empty()) else {
            return Self::default_for(kind);
        };
        match kind {
            FieldKind::Text => FieldValue::Text(raw),
            FieldKind::Numeric => match raw.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => FieldValue::Number(n),
                _ => FieldValue::Text(raw),
            },
            FieldKind::Integer => match raw.trim().parse::<i64>() {
                Ok(n) => FieldValue::Integer(n),
                Err(_) => FieldValue::Text(raw),
            },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(n) => Some(*n as f64),
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Text form used by string comparisons; whole floats keep a `.0`.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(n) => n.to_string(),
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e16 => format!("{:.1}", n),
            FieldValue::Number(n) => n.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FieldValue::Text(s) if s.is_empty())
    }

    fn is_numeric(&self) -> bool {
        match self {
            FieldValue::Integer(_) | FieldValue::Number(_) => true,
            FieldValue::Text(s) => {
                let parts: Vec<&str> = s.split(',').map(str::trim).collect();
                !parts.is_empty()
                    && parts
                        .iter()
                        .all(|p| !p.is_empty() && p.parse::<f64>().is_ok())
            }
        }
    }

    fn to_value(&self) -> Value {
        match self {
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Integer(n) => Value::from(*n),
            FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Integer(n) => serializer.serialize_i64(*n),
            FieldValue::Number(n) => serializer.serialize_f64(*n),
        }
    }
}

/// Fixed-order output record. Serializes as a JSON object in field order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRecord {
    fields: Vec<(String, FieldValue)>,
}

impl CanonicalRecord {
    pub fn from_fields(fields: Vec<(String, FieldValue)>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Rendered field, `""` when the field is not part of the record.
    pub fn text(&self, name: &str) -> String {
        self.get(name).map(FieldValue::render).unwrap_or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect();
        Value::Object(map)
    }

    /// Checks field count, order and numeric content against `layout`.
    pub fn validate(&self, layout: &Layout) -> Result<(), DeriveError> {
        if self.fields.len() != layout.fields.len() {
            return Err(DeriveError::FieldCount {
                expected: layout.fields.len(),
                got: self.fields.len(),
            });
        }
        for (position, ((name, value), def)) in self.fields.iter().zip(&layout.fields).enumerate() {
            if name != &def.name {
                return Err(DeriveError::FieldOrder {
                    position,
                    expected: def.name.clone(),
                    got: name.clone(),
                });
            }
            if def.kind != FieldKind::Text && !value.is_numeric() {
                return Err(DeriveError::NotNumeric {
                    field: name.clone(),
                    value: value.render(),
                });
            }
        }
        Ok(())
    }
}

impl Serialize for CanonicalRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::layout::{FieldDef, Layout};
    use crate::derive::rules::Rule;

    fn layout() -> Layout {
        Layout::new(
            "test",
            vec![
                FieldDef::new("EL_A", FieldKind::Text, Rule::Blank),
                FieldDef::new("EL_B", FieldKind::Numeric, Rule::Blank),
                FieldDef::new("EL_C", FieldKind::Integer, Rule::Blank),
            ],
        )
    }

    #[test]
    fn shaping_applies_defaults() {
        assert_eq!(FieldValue::shape(FieldKind::Text, None), FieldValue::Text(String::new()));
        assert_eq!(FieldValue::shape(FieldKind::Numeric, Some(String::new())), FieldValue::Number(0.0));
        assert_eq!(FieldValue::shape(FieldKind::Numeric, Some("30.00000".into())), FieldValue::Number(30.0));
        assert_eq!(FieldValue::shape(FieldKind::Numeric, Some("1,2.5".into())), FieldValue::Text("1,2.5".into()));
        assert_eq!(FieldValue::shape(FieldKind::Integer, Some("823".into())), FieldValue::Integer(823));
    }

    #[test]
    fn render_keeps_float_marker() {
        assert_eq!(FieldValue::Number(30.0).render(), "30.0");
        assert_eq!(FieldValue::Number(0.25).render(), "0.25");
        assert_eq!(FieldValue::Integer(1).render(), "1");
    }

    #[test]
    fn validation_checks_order_and_numbers() {
        let layout = layout();
        let ok = CanonicalRecord::from_fields(vec![
            ("EL_A".into(), FieldValue::Text("x".into())),
            ("EL_B".into(), FieldValue::Text("1, 2,3.5".into())),
            ("EL_C".into(), FieldValue::Integer(0)),
        ]);
        assert!(ok.validate(&layout).is_ok());

        let swapped = CanonicalRecord::from_fields(vec![
            ("EL_B".into(), FieldValue::Number(0.0)),
            ("EL_A".into(), FieldValue::Text(String::new())),
            ("EL_C".into(), FieldValue::Integer(0)),
        ]);
        assert!(matches!(swapped.validate(&layout), Err(DeriveError::FieldOrder { position: 0, .. })));

        let short = CanonicalRecord::from_fields(vec![("EL_A".into(), FieldValue::Text(String::new()))]);
        assert!(matches!(short.validate(&layout), Err(DeriveError::FieldCount { expected: 3, got: 1 })));

        let bad = CanonicalRecord::from_fields(vec![
            ("EL_A".into(), FieldValue::Text(String::new())),
            ("EL_B".into(), FieldValue::Text("1,,2".into())),
            ("EL_C".into(), FieldValue::Integer(0)),
        ]);
        assert!(matches!(bad.validate(&layout), Err(DeriveError::NotNumeric { .. })));
    }

    #[test]
    fn serializes_in_declared_order() {
        let rec = CanonicalRecord::from_fields(vec![
            ("EL_Z".into(), FieldValue::Number(30.0)),
            ("EL_A".into(), FieldValue::Integer(1)),
        ]);
        assert_eq!(serde_json::to_string(&rec).unwrap(), r#"{"EL_Z":30.0,"EL_A":1}"#);
        assert_eq!(rec.to_value()["EL_A"], 1);
    }
}
