use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while reading or compiling the record-family ASN.1 schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid schema pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid tag number '{0}' in schema")]
    TagNumber(String),
    #[error("root-type '{0}' does not appear in parsed schema")]
    UnknownRootType(String),
    #[error("compiled schema cache failure: {0}")]
    Cache(#[from] bincode::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures while decoding or re-encoding one BER value.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no complete TLV at offset {0}")]
    Truncated(usize),
    #[error("tag {class}/{number} does not start a '{type_name}' value")]
    UnexpectedTag {
        class: u8,
        number: u32,
        type_name: String,
    },
    #[error("no CHOICE alternative of '{0}' matches the encoded tag")]
    NoAlternative(String),
    #[error("cannot encode {what} as '{type_name}'")]
    Unencodable { what: String, type_name: String },
}

/// Failures while deriving or validating a canonical output record.
#[derive(Debug, Error)]
pub enum DeriveError {
    #[error("no genericRecord found in input")]
    MissingRecord,
    #[error("keys mismatch: expected {expected} fields, got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("field order mismatch at position {position}: expected {expected}, got {got}")]
    FieldOrder {
        position: usize,
        expected: String,
        got: String,
    },
    #[error("field {field} not numeric or numeric-list: {value}")]
    NotNumeric { field: String, value: String },
    #[error("layout {0} is not defined")]
    UnknownLayout(String),
    #[error("record category could not be determined")]
    UnknownCategory,
}

/// Failures in the file-level pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed input {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("dedup store failure: {0}")]
    Dedup(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
