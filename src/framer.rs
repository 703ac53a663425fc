use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::codec::RecordDecoder;

/// First bytes of the top-level and sub-record tags the feed is known to
/// carry. A decode failure on one of these is worth a warning; anything else
/// is padding or garbage between records.
const KNOWN_TAG_PREFIXES: &[&[u8]] = &[
    &[0xA0],
    &[0xA1],
    &[0xA2],
    &[0xA3],
    &[0xA4],
    &[0xA5],
    &[0xA6],
    &[0xBF, 0x81, 0x48],
    &[0x31],
];

/// Informational header written ahead of decoded records.
pub const FILE_HEADER_LENGTH: usize = 54;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedRecord {
    pub index: usize,
    pub consumed_length: usize,
    pub root: Value,
}

#[inline]
fn starts_with_known_tag(data: &[u8]) -> bool {
    KNOWN_TAG_PREFIXES.iter().any(|p| data.starts_with(p))
}

/// Splits `data` into consecutive top-level values.
///
/// The cursor strictly advances on every iteration, so the loop runs at most
/// `data.len()` times. A value that fails to decode is dropped and the scan
/// resumes one byte further on.
pub fn frame<D: RecordDecoder + ?Sized>(decoder: &D, data: &[u8]) -> Vec<DecodedRecord> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let slice = &data[offset..];

        let attempt = decoder.decode_with_length(slice).and_then(|(value, consumed)| {
            let consumed = match consumed {
                Some(n) => n,
                // Only exact for canonically encoded producers.
                None => decoder.encode(&value)?.len(),
            };
            Ok((value, consumed))
        });

        match attempt {
            Ok((root, consumed)) if consumed > 0 && consumed <= slice.len() => {
                records.push(DecodedRecord {
                    index: records.len() + 1,
                    consumed_length: consumed,
                    root,
                });
                offset += consumed;
            }
            Ok((_, consumed)) => {
                warn!(
                    "Decoder reported unusable length {} at offset {}",
                    consumed, offset
                );
                offset += 1;
            }
            Err(e) => {
                if starts_with_known_tag(slice) {
                    warn!("Decoding failed at offset {}: {}", offset, e);
                } else {
                    debug!("Skipping unknown tag {:02x} at offset {}", slice[0], offset);
                }
                offset += 1;
            }
        }
    }

    records
}

/// Decoded-file document: `{header, records: [{recordN: {header, payload}}]}`.
pub fn decoded_document(file_length: usize, records: &[DecodedRecord]) -> Value {
    let records: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                format!("record{}", r.index): {
                    "header": { "recordLength": r.consumed_length },
                    "payload": { "genericRecord": r.root }
                }
            })
        })
        .collect();

    json!({
        "header": {
            "fileLength": file_length,
            "headerLength": FILE_HEADER_LENGTH
        },
        "records": records
    })
}
