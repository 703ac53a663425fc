use serde_json::{Map, Number, Value};
use std::collections::HashMap;

use crate::ber::{hex_decode, hex_encode, parse_tlv, write_tlv, Tlv};
use crate::error::CodecError;
use crate::schema::{is_synth_choice_tag, Asn1Schema, FieldSpec, TagKey};

/// Decodes and re-encodes top-level values of one record type.
///
/// `decode_with_length` may not know how many bytes it consumed; the framer
/// then measures the value by re-encoding it.
pub trait RecordDecoder {
    fn decode_with_length(&self, data: &[u8]) -> Result<(Value, Option<usize>), CodecError>;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
}

/// Schema-driven BER decoder producing JSON values.
///
/// CHOICE values come out as `[alternative, value]` pairs, SEQUENCE/SET as
/// objects in wire order, SEQUENCE OF as arrays. Text strings become JSON
/// strings, INTEGER/ENUMERATED numbers, everything else lowercase hex.
pub struct SchemaCodec {
    schema: Asn1Schema,
    root_type: String,
}

impl SchemaCodec {
    pub fn new(schema: Asn1Schema, root_type: impl Into<String>) -> Self {
        Self {
            schema,
            root_type: root_type.into(),
        }
    }

    pub fn schema(&self) -> &Asn1Schema {
        &self.schema
    }

    pub fn root_type(&self) -> &str {
        &self.root_type
    }

    fn choice_alt_matches_tlv(&self, alt_type: &str, tlv: &Tlv) -> bool {
        let rt = self.schema.resolve_alias(alt_type);

        if let Some((cls, tag)) = self.schema.type_outer_tag.get(rt) {
            return tlv.tag_class == *cls && tlv.tag_num == *tag;
        }

        if let Some(sub_alts) = self.schema.choices.get(rt) {
            if sub_alts.contains_key(&(tlv.tag_class, tlv.tag_num)) {
                return true;
            }
        }

        if self.schema.sequences.contains_key(rt) || self.schema.seq_of_types.contains_key(rt) {
            return tlv.tag_class == 0 && tlv.constructed && tlv.tag_num == 16;
        }
        if self.schema.sets.contains_key(rt) || self.schema.set_of_types.contains_key(rt) {
            return tlv.tag_class == 0 && tlv.constructed && tlv.tag_num == 17;
        }

        matches!(
            self.schema.universal_tag_for_type(rt),
            Some((cls, tag)) if tlv.tag_class == cls && tlv.tag_num == tag
        )
    }

    #[inline]
    fn tlv_matches_root(&self, tlv: &Tlv) -> bool {
        let rt = self.schema.resolve_alias(&self.root_type);

        if let Some((cls, num)) = self.schema.type_outer_tag.get(rt) {
            return tlv.tag_class == *cls
                && tlv.tag_num == *num
                && (tlv.constructed || !self.schema.is_structured(rt));
        }

        if let Some(alts) = self.schema.choices.get(rt) {
            // a primitive TLV can never carry a structured alternative
            if let Some((_, alt_type)) = alts.get(&(tlv.tag_class, tlv.tag_num)) {
                return tlv.constructed || !self.schema.is_structured(alt_type);
            }
            return alts.iter().any(|((cls, tag), (_, ftype))| {
                *cls == 3u8 && is_synth_choice_tag(*tag) && self.choice_alt_matches_tlv(ftype, tlv)
            });
        }

        if self.schema.sequences.contains_key(rt) || self.schema.seq_of_types.contains_key(rt) {
            return tlv.tag_class == 0 && tlv.constructed && tlv.tag_num == 16;
        }
        if self.schema.sets.contains_key(rt) || self.schema.set_of_types.contains_key(rt) {
            return tlv.tag_class == 0 && tlv.constructed && tlv.tag_num == 17;
        }

        self.schema.primitives.contains_key(rt)
    }

    fn decode_type(&self, data: &[u8], type_name: &str) -> Value {
        let rt = self.schema.resolve_alias(type_name);

        if let Some(elem) = self
            .schema
            .seq_of_types
            .get(rt)
            .or_else(|| self.schema.set_of_types.get(rt))
        {
            return self.decode_sequence_of(data, elem);
        }
        if let Some(alts) = self.schema.choices.get(rt) {
            return self.decode_choice(data, alts);
        }
        if let Some(fields) = self.schema.sequences.get(rt).or_else(|| self.schema.sets.get(rt)) {
            return self.decode_sequence(data, fields);
        }

        self.decode_primitive(data, rt)
    }

    fn decode_primitive(&self, data: &[u8], type_name: &str) -> Value {
        match self.schema.primitive_kind(type_name) {
            "IA5String" | "UTF8String" | "VisibleString" | "GraphicString" | "PrintableString"
            | "NumericString" => Value::String(String::from_utf8_lossy(data).into_owned()),
            "INTEGER" | "ENUMERATED" if !data.is_empty() && data.len() <= 8 => {
                let mut v: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
                for &b in data {
                    v = (v << 8) | b as i64;
                }
                Value::Number(Number::from(v))
            }
            "BOOLEAN" if data.len() == 1 => Value::Bool(data[0] != 0),
            "NULL" if data.is_empty() => Value::Null,
            _ => Value::String(hex_encode(data)),
        }
    }

    fn decode_sequence(&self, data: &[u8], field_spec: &HashMap<TagKey, FieldSpec>) -> Value {
        let mut obj = Map::new();
        let mut offset = 0usize;

        let mut itoa_buf = itoa::Buffer::new();
        let mut itoa_buf2 = itoa::Buffer::new();

        while offset < data.len() {
            let Some((tlv, new_off)) = parse_tlv(data, offset) else {
                break;
            };
            if new_off <= offset {
                break;
            }

            match field_spec.get(&(tlv.tag_class, tlv.tag_num)) {
                Some(field) => {
                    let resolved = self.schema.resolve_alias(&field.field_type);
                    let value = if field.is_sequence_of || field.is_set_of {
                        self.decode_sequence_of(tlv.value, &field.field_type)
                    } else if self.schema.choices.contains_key(resolved) {
                        // the field tag wraps the chosen alternative
                        self.decode_type(tlv.raw, &field.field_type)
                    } else if tlv.constructed {
                        self.decode_type(tlv.value, &field.field_type)
                    } else {
                        self.decode_primitive(tlv.value, &field.field_type)
                    };
                    obj.insert(field.name.clone(), value);
                }
                None => {
                    let key = format!(
                        "unknown_tag_{}_{}",
                        itoa_buf.format(tlv.tag_class as u32),
                        itoa_buf2.format(tlv.tag_num)
                    );
                    obj.insert(key, Value::String(hex_encode(tlv.value)));
                }
            }

            offset = new_off;
        }

        Value::Object(obj)
    }

    fn decode_sequence_of(&self, data: &[u8], element_type: &str) -> Value {
        let mut items = Vec::new();
        let mut offset = 0usize;

        let is_choice = self
            .schema
            .choices
            .contains_key(self.schema.resolve_alias(element_type));

        while offset < data.len() {
            let Some((tlv, new_off)) = parse_tlv(data, offset) else {
                break;
            };
            if new_off <= offset {
                break;
            }

            items.push(if is_choice {
                self.decode_type(tlv.raw, element_type)
            } else if tlv.constructed {
                self.decode_type(tlv.value, element_type)
            } else {
                self.decode_primitive(tlv.value, element_type)
            });

            offset = new_off;
        }

        Value::Array(items)
    }

    fn decode_choice(&self, data: &[u8], alts: &HashMap<TagKey, (String, String)>) -> Value {
        let Some((outer, _)) = parse_tlv(data, 0) else {
            return Value::Null;
        };

        let mut candidates: [Option<Tlv>; 2] = [Some(outer.clone()), None];
        if outer.constructed {
            candidates[1] = parse_tlv(outer.value, 0).map(|(inner, _)| inner);
        }

        for cand in candidates.iter().flatten() {
            if let Some((field_name, type_name)) = alts.get(&(cand.tag_class, cand.tag_num)) {
                let value = if cand.constructed || self.schema.is_structured(type_name) {
                    self.decode_type(cand.value, type_name)
                } else {
                    self.decode_primitive(cand.value, type_name)
                };
                return tagged_pair(field_name, value);
            }
        }

        let mut synth_keys: Vec<u32> = alts
            .keys()
            .filter(|(cls, tag)| *cls == 3u8 && is_synth_choice_tag(*tag))
            .map(|(_, tag)| *tag)
            .collect();
        synth_keys.sort_unstable();

        for k in synth_keys {
            let Some((fname, ftype)) = alts.get(&(3u8, k)) else {
                continue;
            };
            let f_rt = self.schema.resolve_alias(ftype);

            for cand in candidates.iter().flatten() {
                if self.choice_alt_matches_tlv(ftype, cand) {
                    let value = if self.schema.choices.contains_key(f_rt)
                        && !self.schema.type_outer_tag.contains_key(f_rt)
                    {
                        self.decode_type(cand.raw, ftype)
                    } else if cand.constructed {
                        self.decode_type(cand.value, ftype)
                    } else {
                        self.decode_primitive(cand.value, ftype)
                    };
                    return tagged_pair(fname, value);
                }
            }
        }

        tagged_pair("unknown_alternative", Value::String(hex_encode(outer.raw)))
    }

    fn encode_value(&self, type_name: &str, value: &Value) -> Result<Vec<u8>, CodecError> {
        let rt = self.schema.resolve_alias(type_name);
        if let Some(alts) = self.schema.choices.get(rt) {
            return self.encode_choice(rt, alts, value);
        }
        let (cls, num) = self
            .schema
            .tag_for_type(rt)
            .ok_or_else(|| unencodable("untagged type", type_name))?;
        let content = self.encode_content(rt, value)?;
        let mut out = Vec::with_capacity(content.len() + 4);
        write_tlv(&mut out, cls, self.schema.is_structured(rt), num, &content);
        Ok(out)
    }

    /// Encodes `value` under an implicit `tag`, or explicitly wrapped when the
    /// type is a CHOICE.
    fn encode_tagged(&self, tag: TagKey, type_name: &str, value: &Value) -> Result<Vec<u8>, CodecError> {
        let rt = self.schema.resolve_alias(type_name);
        let mut out = Vec::new();
        if self.schema.choices.contains_key(rt) {
            let inner = self.encode_value(rt, value)?;
            write_tlv(&mut out, tag.0, true, tag.1, &inner);
        } else {
            let content = self.encode_content(rt, value)?;
            write_tlv(&mut out, tag.0, self.schema.is_structured(rt), tag.1, &content);
        }
        Ok(out)
    }

    fn encode_choice(
        &self,
        type_name: &str,
        alts: &HashMap<TagKey, (String, String)>,
        value: &Value,
    ) -> Result<Vec<u8>, CodecError> {
        let (alt_name, alt_value) = match value {
            Value::Array(pair) if pair.len() == 2 => match &pair[0] {
                Value::String(name) => (name.as_str(), &pair[1]),
                _ => return Err(unencodable("CHOICE pair without a name", type_name)),
            },
            Value::Object(map) if map.len() == 1 => match map.iter().next() {
                Some((name, v)) => (name.as_str(), v),
                None => return Err(unencodable("empty CHOICE", type_name)),
            },
            _ => return Err(unencodable("non-CHOICE value", type_name)),
        };

        let Some((tag, (_, alt_type))) = alts.iter().find(|(_, (name, _))| name == alt_name) else {
            return Err(CodecError::NoAlternative(type_name.to_string()));
        };

        if tag.0 == 3 && is_synth_choice_tag(tag.1) {
            self.encode_value(alt_type, alt_value)
        } else {
            self.encode_tagged(*tag, alt_type, alt_value)
        }
    }

    fn encode_content(&self, type_name: &str, value: &Value) -> Result<Vec<u8>, CodecError> {
        let rt = self.schema.resolve_alias(type_name);

        if let Some(elem) = self
            .schema
            .seq_of_types
            .get(rt)
            .or_else(|| self.schema.set_of_types.get(rt))
        {
            return self.encode_items(elem, value);
        }
        if let Some(fields) = self.schema.sequences.get(rt).or_else(|| self.schema.sets.get(rt)) {
            let Value::Object(map) = value else {
                return Err(unencodable("non-object value", type_name));
            };
            let mut out = Vec::new();
            for (name, v) in map {
                match fields.iter().find(|(_, f)| &f.name == name) {
                    Some((tag, field)) if field.is_sequence_of || field.is_set_of => {
                        let content = self.encode_items(&field.field_type, v)?;
                        write_tlv(&mut out, tag.0, true, tag.1, &content);
                    }
                    Some((tag, field)) => {
                        out.extend(self.encode_tagged(*tag, &field.field_type, v)?);
                    }
                    None => match parse_unknown_key(name) {
                        Some((cls, num)) => {
                            let bytes = v
                                .as_str()
                                .and_then(hex_decode)
                                .ok_or_else(|| unencodable(name, type_name))?;
                            write_tlv(&mut out, cls, false, num, &bytes);
                        }
                        None => return Err(unencodable(name, type_name)),
                    },
                }
            }
            return Ok(out);
        }

        self.encode_primitive(rt, value)
    }

    fn encode_items(&self, element_type: &str, value: &Value) -> Result<Vec<u8>, CodecError> {
        let Value::Array(items) = value else {
            return Err(unencodable("non-array value", element_type));
        };
        let mut out = Vec::new();
        for item in items {
            out.extend(self.encode_value(element_type, item)?);
        }
        Ok(out)
    }

    fn encode_primitive(&self, type_name: &str, value: &Value) -> Result<Vec<u8>, CodecError> {
        let kind = self.schema.primitive_kind(type_name);
        match (kind, value) {
            (
                "IA5String" | "UTF8String" | "VisibleString" | "GraphicString" | "PrintableString"
                | "NumericString",
                Value::String(s),
            ) => Ok(s.as_bytes().to_vec()),
            ("INTEGER" | "ENUMERATED", Value::Number(n)) => n
                .as_i64()
                .map(encode_integer)
                .ok_or_else(|| unencodable("non-integer number", type_name)),
            ("BOOLEAN", Value::Bool(b)) => Ok(vec![if *b { 0xFF } else { 0x00 }]),
            (_, Value::Null) => Ok(Vec::new()),
            (_, Value::String(s)) => {
                hex_decode(s).ok_or_else(|| unencodable("non-hex string", type_name))
            }
            _ => Err(unencodable("value of wrong shape", type_name)),
        }
    }
}

impl RecordDecoder for SchemaCodec {
    fn decode_with_length(&self, data: &[u8]) -> Result<(Value, Option<usize>), CodecError> {
        let (tlv, end) = parse_tlv(data, 0).ok_or(CodecError::Truncated(0))?;
        if end == 0 || !self.tlv_matches_root(&tlv) {
            return Err(CodecError::UnexpectedTag {
                class: tlv.tag_class,
                number: tlv.tag_num,
                type_name: self.root_type.clone(),
            });
        }

        let rt = self.schema.resolve_alias(&self.root_type);
        let value = if self.schema.type_outer_tag.contains_key(rt) {
            self.decode_type(tlv.value, rt)
        } else if self.schema.choices.contains_key(rt) {
            self.decode_type(tlv.raw, rt)
        } else {
            self.decode_type(tlv.value, rt)
        };

        if let Value::Array(pair) = &value {
            if pair.first().and_then(Value::as_str) == Some("unknown_alternative") {
                return Err(CodecError::NoAlternative(self.root_type.clone()));
            }
        }
        Ok((value, Some(end)))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        self.encode_value(&self.root_type, value)
    }
}

fn tagged_pair(name: &str, value: Value) -> Value {
    Value::Array(vec![Value::String(name.to_string()), value])
}

fn unencodable(what: &str, type_name: &str) -> CodecError {
    CodecError::Unencodable {
        what: what.to_string(),
        type_name: type_name.to_string(),
    }
}

fn parse_unknown_key(key: &str) -> Option<(u8, u32)> {
    let rest = key.strip_prefix("unknown_tag_")?;
    let (cls, num) = rest.split_once('_')?;
    Some((cls.parse().ok()?, num.parse().ok()?))
}

fn encode_integer(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}
