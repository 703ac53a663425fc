//! Field derivation: one engine driven by per-(category, projection) field
//! tables.

pub mod decode;
pub mod layout;
pub mod money;
pub mod record;
pub mod rules;
pub mod view;

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use tracing::debug;

use crate::config::MediationConfig;
use crate::error::DeriveError;
use crate::filter::service_type;
use crate::tree::{locate_generic_record, normalize, GenericNode};

use self::layout::layout_for;
use self::record::{CanonicalRecord, FieldValue};
use self::view::RecordView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Data,
    Voice,
    Sms,
    Mms,
    Ussd,
    Ecommerce,
    /// Data usage charged against an active group.
    Group,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Data,
        Category::Voice,
        Category::Sms,
        Category::Mms,
        Category::Ussd,
        Category::Ecommerce,
        Category::Group,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Category::Data => "DATA",
            Category::Voice => "VOICE",
            Category::Sms => "SMS",
            Category::Mms => "MMS",
            Category::Ussd => "USSD",
            Category::Ecommerce => "ECOMMERCE",
            Category::Group => "GROUP",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.label().eq_ignore_ascii_case(label.trim()))
    }

    /// Category of a record from its TAG projection. An `UNKNOWN` record
    /// type falls back to the raw service family; active group usage turns
    /// DATA into GROUP.
    pub fn detect(tree: &GenericNode, tag: &CanonicalRecord) -> Option<Self> {
        let rec_type = tag.text("EL_REC_TYPE");
        let category = Self::from_label(&rec_type).or_else(|| Self::from_label(service_type(tree)))?;
        let grouped = tag.get("EL_GROUP_USAGE") == Some(&FieldValue::Integer(1));
        Some(match category {
            Category::Data if grouped => Category::Group,
            other => other,
        })
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| format!("unknown category '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Projection {
    /// Routing enrichment attached to every routed record.
    Tag,
    Billing,
    Warehouse,
    /// Loyalty feed: one usage line per record.
    Lms,
    /// Customer-care view of a call.
    Crm,
}

impl Projection {
    pub const ALL: [Projection; 5] = [
        Projection::Tag,
        Projection::Billing,
        Projection::Warehouse,
        Projection::Lms,
        Projection::Crm,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Projection::Tag => "TAG",
            Projection::Billing => "BILLING",
            Projection::Warehouse => "WAREHOUSE",
            Projection::Lms => "LMS",
            Projection::Crm => "CRM",
        }
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Projection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown projection '{}'", s))
    }
}

/// Derives the canonical record of `tree` for one (category, projection).
/// Every declared field is present; absent values take their kind's default.
pub fn derive(
    tree: &GenericNode,
    config: &MediationConfig,
    category: Category,
    projection: Projection,
    source: &str,
) -> Result<CanonicalRecord, DeriveError> {
    let layout = layout_for(category, projection)
        .ok_or_else(|| DeriveError::UnknownLayout(format!("{}/{}", category, projection)))?;
    let view = RecordView::new(tree, config, source);
    let fields = layout
        .fields
        .iter()
        .map(|f| (f.name.clone(), FieldValue::shape(f.kind, f.rule.eval(&view))))
        .collect();
    let record = CanonicalRecord::from_fields(fields);
    record.validate(layout)?;
    debug!("derived {} ({} fields)", layout.name, record.len());
    Ok(record)
}

/// The TAG projection does not depend on the category.
pub fn derive_tag(
    tree: &GenericNode,
    config: &MediationConfig,
    source: &str,
) -> Result<CanonicalRecord, DeriveError> {
    derive(tree, config, Category::Data, Projection::Tag, source)
}

/// Locates, normalizes and derives one input document. Without an explicit
/// category the record's own is detected.
pub fn derive_document(
    doc: &Value,
    config: &MediationConfig,
    category: Option<Category>,
    projection: Projection,
    source: &str,
) -> Result<(Category, CanonicalRecord), DeriveError> {
    let raw = locate_generic_record(doc).ok_or(DeriveError::MissingRecord)?;
    let tree = normalize(raw);
    let category = match category {
        Some(c) => c,
        None => {
            let tag = derive_tag(&tree, config, source)?;
            Category::detect(&tree, &tag).ok_or(DeriveError::UnknownCategory)?
        }
    };
    let record = derive(&tree, config, category, projection, source)?;
    Ok((category, record))
}
