//! Destination fan-out of tagged records.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::MediationConfig;
use crate::derive::record::{CanonicalRecord, FieldValue};

/// A literal compared for equality, or a `<op><value>` expression such as
/// `">0"` or `"!=PREPAID"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Bool(bool),
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    /// Field name to condition. Empty means unconditional.
    #[serde(default)]
    pub conditions: BTreeMap<String, Condition>,
}

impl RoutingRule {
    pub fn matches(&self, tag: &CanonicalRecord) -> bool {
        self.conditions
            .iter()
            .all(|(field, cond)| evaluate_condition(tag.get(field), cond))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Ge,
    Le,
    Gt,
    Lt,
    Ne,
    Eq,
}

// Two-character operators first so ">=" is not read as ">".
const OPS: [(&str, Op); 6] = [
    (">=", Op::Ge),
    ("<=", Op::Le),
    (">", Op::Gt),
    ("<", Op::Lt),
    ("!=", Op::Ne),
    ("==", Op::Eq),
];

fn split_op(expr: &str) -> Option<(Op, &str)> {
    let expr = expr.trim();
    OPS.iter()
        .find_map(|(sym, op)| expr.strip_prefix(sym).map(|rest| (*op, rest.trim())))
}

fn compare(op: Op, lhs: f64, rhs: f64) -> bool {
    match op {
        Op::Ge => lhs >= rhs,
        Op::Le => lhs <= rhs,
        Op::Gt => lhs > rhs,
        Op::Lt => lhs < rhs,
        Op::Ne => lhs != rhs,
        Op::Eq => lhs == rhs,
    }
}

/// A missing field never matches. Numeric comparison is tried first; only
/// `==` and `!=` fall back to comparing text.
pub fn evaluate_condition(value: Option<&FieldValue>, cond: &Condition) -> bool {
    let Some(value) = value else {
        return false;
    };
    match cond {
        Condition::Bool(b) => match value {
            FieldValue::Text(s) => s.trim().eq_ignore_ascii_case(if *b { "true" } else { "false" }),
            _ => value.as_f64() == Some(if *b { 1.0 } else { 0.0 }),
        },
        Condition::Number(n) => value.as_f64() == Some(*n),
        Condition::Text(expr) => {
            let (op, rhs) = split_op(expr).unwrap_or((Op::Eq, expr.trim()));
            if let (Some(lhs), Ok(rhs)) = (value.as_f64(), rhs.parse::<f64>()) {
                return compare(op, lhs, rhs);
            }
            let lhs = value.render();
            match op {
                Op::Eq => lhs.trim() == rhs,
                Op::Ne => lhs.trim() != rhs,
                _ => false,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub name: String,
    pub dir: PathBuf,
}

fn partition(tag: &CanonicalRecord, config: &MediationConfig) -> PathBuf {
    let usage = if tag.get("EL_GROUP_USAGE") == Some(&FieldValue::Integer(1)) {
        "group_usage"
    } else {
        "single_usage"
    };
    let rec_type = tag.text("EL_REC_TYPE");
    let listed = config
        .dwh_structure
        .get(usage)
        .is_some_and(|types| types.iter().any(|t| *t == rec_type));
    let leaf = if listed { rec_type.as_str() } else { "OTHER" };
    PathBuf::from(usage).join(leaf)
}

/// Every destination whose rule matches `tag`, in rule order.
pub fn route(tag: &CanonicalRecord, config: &MediationConfig) -> Vec<Destination> {
    let mut out = Vec::new();
    for rule in &config.routing_rules {
        if !rule.matches(tag) {
            continue;
        }
        if rule.name == config.ecommerce_excluded_destination && tag.text("EL_REC_TYPE") == "ECOMMERCE" {
            info!("Skipping {} for ECOMMERCE record", rule.name);
            continue;
        }
        let mut dir = config.output_dir(&rule.name);
        if rule.name == config.partitioned_destination {
            dir.push(partition(tag, config));
        }
        debug!("routed to {} ({:?})", rule.name, dir);
        out.push(Destination {
            name: rule.name.clone(),
            dir,
        });
    }
    out
}

/// Document written to each destination.
pub fn routed_document(original: &Value, tag: &CanonicalRecord) -> Value {
    json!({ "original": original, "CBL_TAG": tag.to_value() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(fields: &[(&str, FieldValue)]) -> CanonicalRecord {
        CanonicalRecord::from_fields(fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    #[test]
    fn condition_table() {
        let n = FieldValue::Number(30.0);
        let cases = [
            (Some(&n), Condition::Text(">0".into()), true),
            (Some(&n), Condition::Text(">= 30".into()), true),
            (Some(&n), Condition::Text("<30".into()), false),
            (Some(&n), Condition::Text("<=30.0".into()), true),
            (Some(&n), Condition::Text("!=30".into()), false),
            (Some(&n), Condition::Text("==30".into()), true),
            (Some(&n), Condition::Number(30.0), true),
            (Some(&n), Condition::Text("30".into()), true),
            (None, Condition::Text(">0".into()), false),
            (None, Condition::Text("!=x".into()), false),
        ];
        for (value, cond, expected) in cases {
            assert_eq!(evaluate_condition(value, &cond), expected, "{:?}", cond);
        }

        let post = text("POSTPAID");
        assert!(evaluate_condition(Some(&post), &Condition::Text("POSTPAID".into())));
        assert!(evaluate_condition(Some(&post), &Condition::Text("!=PREPAID".into())));
        assert!(!evaluate_condition(Some(&post), &Condition::Text(">1".into())));
        assert!(evaluate_condition(Some(&FieldValue::Integer(1)), &Condition::Bool(true)));
        assert!(evaluate_condition(Some(&text("False")), &Condition::Bool(false)));
    }

    #[test]
    fn rules_deserialize_from_config_shapes() {
        let rule: RoutingRule = serde_json::from_str(
            r#"{"name": "BILLING", "conditions": {"EL_SUCCESS": 1, "EL_PRE_POST": "POSTPAID", "EL_X": true}}"#,
        )
        .unwrap();
        assert_eq!(rule.conditions["EL_SUCCESS"], Condition::Number(1.0));
        assert_eq!(rule.conditions["EL_PRE_POST"], Condition::Text("POSTPAID".into()));
        assert_eq!(rule.conditions["EL_X"], Condition::Bool(true));

        let bare: RoutingRule = serde_json::from_str(r#"{"name": "CRM"}"#).unwrap();
        assert!(bare.conditions.is_empty());
    }

    #[test]
    fn default_rules_fan_out() {
        let cfg = MediationConfig::default();
        let postpaid = tag(&[
            ("EL_PRE_POST", text("POSTPAID")),
            ("EL_SUCCESS", FieldValue::Integer(1)),
            ("EL_REC_TYPE", text("VOICE")),
            ("EL_DEBIT_AMOUNT", FieldValue::Number(2.5)),
            ("EL_GROUP_USAGE", FieldValue::Integer(0)),
        ]);
        let names: Vec<String> = route(&postpaid, &cfg).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["CRM", "BILLING", "LMS", "RA", "DWH"]);

        let prepaid_free = tag(&[
            ("EL_PRE_POST", text("PREPAID")),
            ("EL_SUCCESS", FieldValue::Integer(1)),
            ("EL_REC_TYPE", text("DATA")),
            ("EL_DEBIT_AMOUNT", FieldValue::Number(0.0)),
            ("EL_GROUP_USAGE", FieldValue::Integer(1)),
        ]);
        let dests = route(&prepaid_free, &cfg);
        let names: Vec<&str> = dests.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["CRM", "RA", "DWH"]);
        assert_eq!(dests[2].dir, PathBuf::from("./out/DWH/group_usage/DATA"));
    }

    #[test]
    fn ecommerce_skips_lms_and_unlisted_types_go_to_other() {
        let cfg = MediationConfig::default();
        let ecommerce = tag(&[
            ("EL_SUCCESS", FieldValue::Integer(1)),
            ("EL_REC_TYPE", text("ECOMMERCE")),
            ("EL_DEBIT_AMOUNT", FieldValue::Number(9.0)),
        ]);
        let dests = route(&ecommerce, &cfg);
        assert!(dests.iter().all(|d| d.name != "LMS"));

        let unknown = tag(&[("EL_REC_TYPE", text("UNKNOWN"))]);
        let dwh = route(&unknown, &cfg).into_iter().find(|d| d.name == "DWH").unwrap();
        assert_eq!(dwh.dir, PathBuf::from("./out/DWH/single_usage/OTHER"));
    }

    #[test]
    fn routed_document_wraps_original() {
        let t = tag(&[("EL_SUCCESS", FieldValue::Integer(1))]);
        let doc = routed_document(&json!({"payload": {}}), &t);
        assert_eq!(doc["CBL_TAG"]["EL_SUCCESS"], 1);
        assert!(doc["original"]["payload"].is_object());
    }
}
