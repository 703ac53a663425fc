use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::debug;

use crate::error::SchemaError;

/// The usage-record family every framer run decodes against.
pub const DEFAULT_SCHEMA_TEXT: &str = include_str!("../schema/sps_record.asn");
pub const DEFAULT_ROOT_TYPE: &str = "SPSRecord";

/// (class, number) as it appears on the wire.
pub type TagKey = (u8, u32);
pub(crate) const SYNTH_CHOICE_BASE: u32 = 0xFFFF_FF00;

#[inline]
pub(crate) fn is_synth_choice_tag(t: u32) -> bool {
    t >= SYNTH_CHOICE_BASE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: String,
    pub optional: bool,
    pub is_sequence_of: bool,
    pub is_set_of: bool,
}

/// Tag-indexed view of an ASN.1 module: enough to walk BER values of one
/// record family without generated code.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Asn1Schema {
    pub(crate) choices: HashMap<String, HashMap<TagKey, (String, String)>>,
    pub(crate) sequences: HashMap<String, HashMap<TagKey, FieldSpec>>,
    pub(crate) sets: HashMap<String, HashMap<TagKey, FieldSpec>>,

    pub(crate) seq_of_types: HashMap<String, String>,
    pub(crate) set_of_types: HashMap<String, String>,

    pub(crate) primitives: HashMap<String, String>,
    pub(crate) aliases: HashMap<String, String>,

    pub(crate) type_outer_tag: HashMap<String, TagKey>,
}

#[inline]
fn tag_class_from_word(word: Option<&str>) -> u8 {
    match word.map(|s| s.to_ascii_uppercase()).as_deref() {
        Some("APPLICATION") => 1,
        Some("UNIVERSAL") => 0,
        Some("PRIVATE") => 3,
        // bare [n] and CONTEXT spellings
        _ => 2,
    }
}

fn parse_tag_number(s: &str) -> Result<u32, SchemaError> {
    s.parse::<u32>()
        .map_err(|_| SchemaError::TagNumber(s.to_string()))
}

impl Asn1Schema {
    pub fn parse(schema_text: &str) -> Result<Self, SchemaError> {
        let snacc_directive_re = Regex::new(r"(?is)--\s*snacc\b.*?--")?;
        let comment_strip_re = Regex::new(r"(?m)--.*?$")?;
        let no_snacc = snacc_directive_re.replace_all(schema_text, " ");
        let stripped = comment_strip_re.replace_all(&no_snacc, "");

        let type_assign_re = Regex::new(
            r"(?s)([\w-]+)\s*::=\s*(?:\[\s*(?:(APPLICATION|UNIVERSAL|PRIVATE|CONTEXT|CONTEXT-SPECIFIC)\s+)?(\d+)\s*\]\s*)?(?:IMPLICIT|EXPLICIT)?\s*(CHOICE|SEQUENCE|SET|ENUMERATED|INTEGER|OCTET STRING|BIT STRING|IA5String|UTF8String|BOOLEAN|NULL|TBCD-STRING|OBJECT IDENTIFIER|[\w-]+)\s*(?:OF\s+([\w-]+))?\s*(?:\(([^)]*)\))?\s*(\{.*?\})?",
        )?;
        let alias_re = Regex::new(r"(?m)^\s*([\w-]+)\s*::=\s*([\w-]+)\s*$")?;
        let choice_tagged_re = Regex::new(
            r"([\w-]+)\s*\[\s*(?:(APPLICATION|UNIVERSAL|PRIVATE|CONTEXT|CONTEXT-SPECIFIC)\s+)?(\d+)\s*\]\s*([\w-]+)",
        )?;
        let choice_untagged_re = Regex::new(r"([\w-]+)\s+([\w-]+)")?;
        let field_re = Regex::new(
            r"(?m)^\s*([\w-]+)\s*(?:\[\s*(?:(APPLICATION|UNIVERSAL|PRIVATE|CONTEXT|CONTEXT-SPECIFIC)\s+)?(\d+)\s*\])?\s*(?:IMPLICIT|EXPLICIT)?\s+((?:SET|SEQUENCE)\s+OF\s+[\w-]+|[\w-]+)\s*(?:DEFAULT\s+[^,\n]+)?\s*(OPTIONAL)?",
        )?;
        let components_of_re = Regex::new(r"(?m)^\s*COMPONENTS\s+OF\s+([\w-]+)")?;

        let mut schema = Asn1Schema::default();

        for cap in alias_re.captures_iter(&stripped) {
            let lhs = cap[1].to_string();
            let rhs = cap[2].to_string();
            let is_keyword = matches!(
                rhs.to_ascii_uppercase().as_str(),
                "CHOICE" | "SEQUENCE" | "SET" | "ENUMERATED" | "INTEGER" | "OCTET" | "BIT"
                    | "IA5STRING" | "UTF8STRING" | "BOOLEAN" | "NULL" | "OBJECT" | "IDENTIFIER"
                    | "BEGIN" | "END"
            );
            if !is_keyword && lhs != rhs {
                schema.aliases.insert(lhs, rhs);
            }
        }

        struct Def {
            type_name: String,
            type_kind: String,
            of_type: Option<String>,
            body: String,
        }
        let mut defs: Vec<Def> = Vec::new();

        for caps in type_assign_re.captures_iter(&stripped) {
            let type_name = caps[1].to_string();
            let type_kind = caps[4].trim().to_string();

            if let Some(tag_num) = caps.get(3) {
                let cls = tag_class_from_word(caps.get(2).map(|m| m.as_str()));
                schema
                    .type_outer_tag
                    .insert(type_name.clone(), (cls, parse_tag_number(tag_num.as_str())?));
            }

            if !matches!(type_kind.as_str(), "CHOICE" | "SEQUENCE" | "SET") {
                schema.primitives.insert(type_name.clone(), type_kind.clone());
            }

            defs.push(Def {
                type_name,
                type_kind,
                of_type: caps.get(5).map(|m| m.as_str().to_string()),
                body: caps.get(7).map(|m| m.as_str()).unwrap_or("").to_string(),
            });
        }

        let mut components_queue: Vec<(String, String)> = Vec::new();

        for d in defs {
            match d.type_kind.as_str() {
                "SEQUENCE" | "SET" => {
                    let is_set = d.type_kind == "SET";
                    if let Some(elem) = d.of_type {
                        if is_set {
                            schema.set_of_types.insert(d.type_name, elem);
                        } else {
                            schema.seq_of_types.insert(d.type_name, elem);
                        }
                        continue;
                    }

                    let mut fields: HashMap<TagKey, FieldSpec> = HashMap::new();
                    for c in field_re.captures_iter(&d.body) {
                        let type_spec = c[4].trim().to_string();
                        let (is_sequence_of, is_set_of, element_type) =
                            if let Some(rest) = type_spec.strip_prefix("SEQUENCE OF ") {
                                (true, false, rest.trim().to_string())
                            } else if let Some(rest) = type_spec.strip_prefix("SET OF ") {
                                (false, true, rest.trim().to_string())
                            } else {
                                (false, false, type_spec)
                            };

                        let key: TagKey = match c.get(3) {
                            Some(tag) => (
                                tag_class_from_word(c.get(2).map(|m| m.as_str())),
                                parse_tag_number(tag.as_str())?,
                            ),
                            None => match schema.tag_for_type(&element_type) {
                                Some(tk) => tk,
                                None => continue,
                            },
                        };

                        fields.insert(
                            key,
                            FieldSpec {
                                name: c[1].to_string(),
                                field_type: element_type,
                                optional: c.get(5).is_some(),
                                is_sequence_of,
                                is_set_of,
                            },
                        );
                    }

                    for c in components_of_re.captures_iter(&d.body) {
                        components_queue.push((d.type_name.clone(), c[1].to_string()));
                    }

                    if is_set {
                        schema.sets.insert(d.type_name, fields);
                    } else {
                        schema.sequences.insert(d.type_name, fields);
                    }
                }
                "CHOICE" => {
                    let mut alts: HashMap<TagKey, (String, String)> = HashMap::new();

                    for c in choice_tagged_re.captures_iter(&d.body) {
                        let cls = tag_class_from_word(c.get(2).map(|m| m.as_str()));
                        let tag = parse_tag_number(&c[3])?;
                        alts.insert((cls, tag), (c[1].to_string(), c[4].to_string()));
                    }

                    if alts.is_empty() {
                        let mut idx: u32 = 0;
                        for c in choice_untagged_re.captures_iter(&d.body) {
                            let field_name = &c[1];
                            if field_name == "isPdu" || field_name == "TRUE" {
                                continue;
                            }
                            alts.insert(
                                (3u8, SYNTH_CHOICE_BASE + idx),
                                (field_name.to_string(), c[2].to_string()),
                            );
                            idx += 1;
                        }
                    }

                    schema.choices.insert(d.type_name, alts);
                }
                _ => {}
            }
        }

        for (target, source) in components_queue {
            let source_fields = schema
                .sequences
                .get(&source)
                .or_else(|| schema.sets.get(&source))
                .cloned();

            if let Some(src) = source_fields {
                if let Some(tgt) = schema.sequences.get_mut(&target) {
                    tgt.extend(src);
                } else if let Some(tgt) = schema.sets.get_mut(&target) {
                    tgt.extend(src);
                }
            }
        }

        debug!(
            choices = schema.choices.len(),
            sequences = schema.sequences.len(),
            primitives = schema.primitives.len(),
            "parsed ASN.1 schema"
        );
        Ok(schema)
    }

    /// Schema for the bundled record family.
    pub fn bundled() -> Result<Self, SchemaError> {
        Self::parse(DEFAULT_SCHEMA_TEXT)
    }

    pub fn load_compiled(path: &Path) -> Result<Self, SchemaError> {
        let file = File::open(path)?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }

    pub fn save_compiled(&self, path: &Path) -> Result<(), SchemaError> {
        let file = File::create(path)?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }

    #[inline]
    pub(crate) fn resolve_alias<'a>(&'a self, mut t: &'a str) -> &'a str {
        for _ in 0..32 {
            match self.aliases.get(t) {
                Some(next) => t = next,
                None => break,
            }
        }
        t
    }

    #[inline]
    pub fn knows_type(&self, t: &str) -> bool {
        let rt = self.resolve_alias(t);
        self.choices.contains_key(rt)
            || self.sequences.contains_key(rt)
            || self.sets.contains_key(rt)
            || self.seq_of_types.contains_key(rt)
            || self.set_of_types.contains_key(rt)
            || self.primitives.contains_key(rt)
    }

    #[inline]
    pub(crate) fn tag_for_type(&self, t: &str) -> Option<TagKey> {
        let rt = self.resolve_alias(t);
        if let Some(tk) = self.type_outer_tag.get(rt) {
            return Some(*tk);
        }
        self.universal_tag_for_type(rt)
    }

    /// Primitive keyword a (possibly aliased) type finally resolves to.
    pub(crate) fn primitive_kind<'a>(&'a self, t: &'a str) -> &'a str {
        let rt = self.resolve_alias(t);
        self.primitives.get(rt).map(|s| s.as_str()).unwrap_or(rt)
    }

    pub(crate) fn is_structured(&self, t: &str) -> bool {
        let rt = self.resolve_alias(t);
        self.choices.contains_key(rt)
            || self.sequences.contains_key(rt)
            || self.sets.contains_key(rt)
            || self.seq_of_types.contains_key(rt)
            || self.set_of_types.contains_key(rt)
    }

    #[inline]
    pub(crate) fn universal_tag_for_type(&self, t: &str) -> Option<TagKey> {
        let rt = self.resolve_alias(t);

        if self.sequences.contains_key(rt) || self.seq_of_types.contains_key(rt) {
            return Some((0u8, 16u32));
        }
        if self.sets.contains_key(rt) || self.set_of_types.contains_key(rt) {
            return Some((0u8, 17u32));
        }
        if self.choices.contains_key(rt) {
            return None;
        }

        match self.primitive_kind(rt) {
            "INTEGER" => Some((0u8, 2u32)),
            "OCTET STRING" => Some((0u8, 4u32)),
            "BIT STRING" => Some((0u8, 3u32)),
            "BOOLEAN" => Some((0u8, 1u32)),
            "NULL" => Some((0u8, 5u32)),
            "ENUMERATED" => Some((0u8, 10u32)),
            "IA5String" => Some((0u8, 22u32)),
            "UTF8String" => Some((0u8, 12u32)),
            "OBJECT IDENTIFIER" => Some((0u8, 6u32)),
            "TBCD-STRING" => Some((0u8, 4u32)),
            "GraphicString" => Some((0u8, 25u32)),
            "VisibleString" => Some((0u8, 26u32)),
            _ => None,
        }
    }
}
