//! Schema-free record tree.
//!
//! Decoded records arrive as nested JSON in which attributes are lists of
//! `{varName, varValue}` pairs and children live under `recordExtensions`
//! or `recordSubExtensions`. [`normalize_value`] collapses those shapes and
//! [`GenericNode`] gives them one uniform, read-only form.

use serde_json::{Map, Number, Value};

const PROPERTY_KEY: &str = "recordProperty";
const ELEMENTS_KEY: &str = "recordElements";
const CHILD_KEYS: [&str; 2] = ["recordExtensions", "recordSubExtensions"];

#[derive(Debug, Clone, PartialEq)]
pub enum Attr {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
    List(Vec<Attr>),
    /// Map-valued attribute; looked up like a child block tagged with its key.
    Block(GenericNode),
}

impl Attr {
    fn from_value(key: &str, value: &Value) -> Self {
        match value {
            Value::Null => Attr::Null,
            Value::Bool(b) => Attr::Bool(*b),
            Value::Number(n) => Attr::Number(n.clone()),
            Value::String(s) => Attr::Text(s.clone()),
            Value::Array(items) => Attr::List(items.iter().map(|v| Attr::from_value(key, v)).collect()),
            Value::Object(map) => {
                let mut node = GenericNode::from_map(map);
                if node.tag.is_none() {
                    node.tag = Some(key.to_string());
                }
                Attr::Block(node)
            }
        }
    }

    /// Scalar rendered as text. Lists and blocks have no scalar form.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Attr::Text(s) => Some(s.clone()),
            Attr::Number(n) => Some(n.to_string()),
            Attr::Bool(b) => Some(b.to_string()),
            Attr::Null | Attr::List(_) | Attr::Block(_) => None,
        }
    }

    fn blocks(&self) -> Box<dyn Iterator<Item = &GenericNode> + '_> {
        match self {
            Attr::Block(node) => Box::new(std::iter::once(node)),
            Attr::List(items) => Box::new(items.iter().flat_map(Attr::blocks)),
            _ => Box::new(std::iter::empty()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenericNode {
    pub tag: Option<String>,
    pub attributes: Vec<(String, Attr)>,
    pub children: Vec<GenericNode>,
}

impl GenericNode {
    /// Builds a node from an already-normalized value. Non-object values
    /// produce an empty node.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => Self::default(),
        }
    }

    fn from_map(map: &Map<String, Value>) -> Self {
        let mut node = GenericNode::default();
        for (key, value) in map {
            if key == PROPERTY_KEY {
                node.tag = value.as_str().map(str::to_string);
            } else if key == ELEMENTS_KEY {
                node.push_elements(value);
            } else if CHILD_KEYS.contains(&key.as_str()) {
                match value {
                    Value::Array(items) => node
                        .children
                        .extend(items.iter().filter(|v| v.is_object()).map(Self::from_value)),
                    Value::Object(child) => node.children.push(Self::from_map(child)),
                    _ => {}
                }
            } else {
                node.attributes.push((key.clone(), Attr::from_value(key, value)));
            }
        }
        node
    }

    fn push_elements(&mut self, value: &Value) {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    self.attributes.push((k.clone(), Attr::from_value(k, v)));
                }
            }
            // lists that did not collapse (mixed shapes): keep what is addressable
            Value::Array(items) => {
                for item in items {
                    if let Value::Object(map) = item {
                        for (k, v) in map {
                            self.attributes.push((k.clone(), Attr::from_value(k, v)));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    pub fn is_tagged(&self, tag: &str) -> bool {
        self.tag.as_deref() == Some(tag)
    }

    pub fn get(&self, key: &str) -> Option<&Attr> {
        self.attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Scalar attribute as text, `None` when absent or empty.
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(Attr::as_text)
            .filter(|s| !s.is_empty())
    }

    /// First non-empty scalar among several historical spellings.
    pub fn first_text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.text(k))
    }

    /// Direct sub-blocks: children and map-valued attributes, in order.
    pub fn blocks(&self) -> impl Iterator<Item = &GenericNode> {
        self.children
            .iter()
            .chain(self.attributes.iter().flat_map(|(_, a)| a.blocks()))
    }

    pub fn blocks_tagged<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a GenericNode> + 'a {
        self.blocks().filter(move |b| b.is_tagged(tag))
    }

    pub fn first_block(&self, tag: &str) -> Option<&GenericNode> {
        self.blocks().find(|b| b.is_tagged(tag))
    }
}

/// Depth-first search over attributes and children; every node carrying
/// `tag`, including `node` itself, in traversal order.
pub fn find_all<'a>(node: &'a GenericNode, tag: &str) -> Vec<&'a GenericNode> {
    let mut found = Vec::new();
    collect(node, tag, &mut found);
    found
}

fn collect<'a>(node: &'a GenericNode, tag: &str, found: &mut Vec<&'a GenericNode>) {
    if node.is_tagged(tag) {
        found.push(node);
    }
    for (_, attr) in &node.attributes {
        for block in attr.blocks() {
            collect(block, tag, found);
        }
    }
    for child in &node.children {
        collect(child, tag, found);
    }
}

pub fn find_first<'a>(node: &'a GenericNode, tag: &str) -> Option<&'a GenericNode> {
    find_all(node, tag).into_iter().next()
}

#[derive(Debug, Clone, Copy)]
pub enum Step<'a> {
    /// First direct sub-block with this tag.
    Block(&'a str),
    /// Child at this position.
    Index(usize),
}

/// Walks `steps` from `node`; `None` as soon as a step does not resolve.
pub fn safe_path<'n>(node: &'n GenericNode, steps: &[Step]) -> Option<&'n GenericNode> {
    steps.iter().try_fold(node, |cur, step| match step {
        Step::Block(tag) => cur.first_block(tag),
        Step::Index(i) => cur.children.get(*i),
    })
}

/// [`safe_path`] followed by a scalar attribute lookup.
pub fn safe_text(node: &GenericNode, steps: &[Step], key: &str) -> Option<String> {
    safe_path(node, steps)?.text(key)
}

fn is_var_pair(map: &Map<String, Value>) -> bool {
    map.len() == 2 && map.contains_key("varName") && map.contains_key("varValue")
}

fn untag_pair(value: Value) -> Value {
    match value {
        Value::Array(mut items)
            if items.len() == 2 && items[0].is_string() && items[1].is_object() =>
        {
            items.pop().unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn collapse_single_key_maps(items: Vec<Value>) -> Value {
    let collapsible = !items.is_empty()
        && items
            .iter()
            .all(|v| matches!(v, Value::Object(m) if m.len() == 1));
    if !collapsible {
        return Value::Array(items);
    }

    let mut merged = Map::new();
    for item in items {
        let Value::Object(map) = item else { continue };
        for (k, v) in map {
            match merged.get_mut(&k) {
                Some(Value::Array(acc)) => acc.push(v),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, v]);
                }
                None => {
                    merged.insert(k, v);
                }
            }
        }
    }
    Value::Object(merged)
}

/// Collapses decoder shapes into the uniform tree form. Only `*Elements`
/// lists and lists made purely of var-pairs are merged into maps, so the
/// lists that merging produces are left alone on a second pass and applying
/// it twice is the same as applying it once.
pub fn normalize_value(value: Value) -> Value {
    let value = untag_pair(value);
    match value {
        Value::Object(map) if is_var_pair(&map) => {
            let mut map = map;
            let name = match map.remove("varName") {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => String::new(),
            };
            let v = map.remove("varValue").map(normalize_value).unwrap_or(Value::Null);
            let mut out = Map::new();
            out.insert(name, v);
            Value::Object(out)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                let v = normalize_value(v);
                let v = match v {
                    Value::Array(items) if k.ends_with("Elements") => collapse_single_key_maps(items),
                    other => other,
                };
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let pairs = !items.is_empty()
                && items
                    .iter()
                    .all(|v| matches!(v, Value::Object(m) if is_var_pair(m)));
            let items: Vec<Value> = items.into_iter().map(normalize_value).collect();
            if pairs {
                collapse_single_key_maps(items)
            } else {
                Value::Array(items)
            }
        }
        other => other,
    }
}

/// Normalizes a raw decoded record into its tree.
pub fn normalize(raw: &Value) -> GenericNode {
    GenericNode::from_value(&normalize_value(raw.clone()))
}

/// Finds the record root inside an input document.
pub fn locate_generic_record(doc: &Value) -> Option<&Value> {
    let candidates = [
        doc.pointer("/original/payload/genericRecord"),
        doc.pointer("/payload/genericRecord"),
        doc.get("genericRecord"),
    ];
    if let Some(found) = candidates.into_iter().flatten().find(|v| !v.is_null()) {
        return Some(found);
    }
    let looks_like_record = doc
        .as_object()
        .is_some_and(|m| m.contains_key(ELEMENTS_KEY) || m.contains_key("recordType"));
    looks_like_record.then_some(doc)
}

/// Splits an input document into record documents. Accepts a `records` map
/// or list (as written by the decoder), a bare list, or a single record.
pub fn record_documents(doc: &Value) -> Vec<&Value> {
    fn unwrap_numbered(v: &Value) -> &Value {
        match v.as_object() {
            Some(m) if m.len() == 1 && !m.contains_key("payload") => {
                m.values().next().filter(|inner| inner.is_object()).unwrap_or(v)
            }
            _ => v,
        }
    }

    match doc.get("records") {
        Some(Value::Object(map)) => map.values().collect(),
        Some(Value::Array(items)) => items.iter().map(unwrap_numbered).collect(),
        _ => match doc {
            Value::Array(items) => items.iter().collect(),
            _ => vec![doc],
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn raw_record() -> Value {
        json!(["genericRecord", {
            "recordType": "OCSChargingRecord",
            "recordElements": [
                {"varName": "sessionId", "varValue": "abc"},
                {"varName": "resultCode", "varValue": "2001"}
            ],
            "recordExtensions": [
                {
                    "recordProperty": "listOfMscc",
                    "recordSubExtensions": [
                        {
                            "recordProperty": "mscc",
                            "recordElements": [{"varName": "ratingGroup", "varValue": "100"}],
                            "recordSubExtensions": [
                                {"recordProperty": "subscriptionInfo",
                                 "recordElements": [{"varName": "bundleName", "varValue": "B1"}]},
                                {"recordProperty": "subscriptionInfo",
                                 "recordElements": [{"varName": "bundleName", "varValue": "B2"}]}
                            ]
                        }
                    ]
                }
            ]
        }])
    }

    #[test]
    fn collapses_var_pairs_and_tagged_pairs() {
        let normalized = normalize_value(raw_record());
        assert_eq!(normalized["recordType"], "OCSChargingRecord");
        assert_eq!(normalized["recordElements"], json!({"sessionId": "abc", "resultCode": "2001"}));
    }

    #[test]
    fn repeated_keys_accumulate() {
        let normalized = normalize_value(json!([
            {"varName": "alternateId", "varValue": "a"},
            {"varName": "alternateId", "varValue": "b"},
            {"varName": "alternateId", "varValue": "c"},
            {"varName": "other", "varValue": "x"}
        ]));
        assert_eq!(normalized, json!({"alternateId": ["a", "b", "c"], "other": "x"}));
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_value(raw_record());
        let twice = normalize_value(once.clone());
        assert_eq!(once, twice);
        assert_eq!(GenericNode::from_value(&once), GenericNode::from_value(&twice));
    }

    #[test]
    fn repeated_nested_keys_survive_a_second_pass() {
        let repeated = json!([{"x": {"a": 1}}, {"x": {"b": 2}}]);
        let once = normalize_value(repeated.clone());
        assert_eq!(once, repeated);
        assert_eq!(normalize_value(once.clone()), once);

        let elements = json!({"recordElements": [
            {"varName": "x", "varValue": {"a": 1}},
            {"varName": "x", "varValue": {"b": 2}}
        ]});
        let once = normalize_value(elements);
        assert_eq!(once, json!({"recordElements": {"x": [{"a": 1}, {"b": 2}]}}));
        assert_eq!(normalize_value(once.clone()), once);
    }

    #[test]
    fn tree_shape() {
        let tree = normalize(&raw_record());
        assert_eq!(tree.tag, None);
        assert_eq!(tree.text("recordType").as_deref(), Some("OCSChargingRecord"));
        assert_eq!(tree.text("sessionId").as_deref(), Some("abc"));
        assert_eq!(tree.children.len(), 1);
        assert!(tree.children[0].is_tagged("listOfMscc"));
    }

    #[test]
    fn find_all_returns_every_sibling_in_order() {
        let tree = normalize(&raw_record());
        let subs = find_all(&tree, "subscriptionInfo");
        let names: Vec<_> = subs.iter().filter_map(|s| s.text("bundleName")).collect();
        assert_eq!(names, vec!["B1", "B2"]);
        assert!(find_all(&tree, "bucketInfo").is_empty());
    }

    #[test]
    fn map_attributes_are_searchable_blocks() {
        let tree = normalize(&json!({
            "recordProperty": "chargingServiceInfo",
            "recordElements": {
                "chargingServiceType": "DATA",
                "additionalBalanceInfo": {"usageType": "MAIN", "bucketInfo": {"bucketName": "n"}}
            }
        }));
        let abi = find_all(&tree, "additionalBalanceInfo");
        assert_eq!(abi.len(), 1);
        assert_eq!(abi[0].text("usageType").as_deref(), Some("MAIN"));
        assert_eq!(safe_text(&tree, &[Step::Block("additionalBalanceInfo"), Step::Block("bucketInfo")], "bucketName").as_deref(), Some("n"));
    }

    #[test]
    fn safe_path_never_panics() {
        let tree = normalize(&raw_record());
        let steps = [Step::Block("listOfMscc"), Step::Block("mscc")];
        assert_eq!(safe_text(&tree, &steps, "ratingGroup").as_deref(), Some("100"));
        assert!(safe_path(&tree, &[Step::Index(7)]).is_none());
        assert!(safe_path(&tree, &[Step::Block("listOfMscc"), Step::Block("nothing")]).is_none());
        assert!(safe_text(&tree, &steps, "missing").is_none());
    }

    #[test]
    fn locates_record_in_wrappers() {
        let inner = json!({"recordType": "OCSChargingRecord"});
        let routed = json!({"original": {"payload": {"genericRecord": inner.clone()}}, "CBL_TAG": {}});
        let plain = json!({"payload": {"genericRecord": inner.clone()}});
        assert_eq!(locate_generic_record(&routed), Some(&inner));
        assert_eq!(locate_generic_record(&plain), Some(&inner));
        assert_eq!(locate_generic_record(&inner), Some(&inner));
        assert_eq!(locate_generic_record(&json!({"other": 1})), None);
    }

    #[test]
    fn splits_decoded_documents() {
        let doc = json!({
            "header": {"fileLength": 10},
            "records": [
                {"record1": {"payload": {"genericRecord": {"recordType": "a"}}}},
                {"record2": {"payload": {"genericRecord": {"recordType": "b"}}}}
            ]
        });
        let docs = record_documents(&doc);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["payload"]["genericRecord"]["recordType"], "b");

        let collapsed = normalize_value(doc);
        assert_eq!(record_documents(&collapsed).len(), 2);
    }
}
