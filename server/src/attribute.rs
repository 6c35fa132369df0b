use enumset::{EnumSet, EnumSetType};
use serde::{Deserialize, Serialize};

use crate::error::WikiError;

/// Predicate that encodes tree structure instead of a stored attribute.
pub const PARENT_PREDICATE: &str = "parent";
/// Predicate holding the markdown source of an entry.
pub const TEXT_PREDICATE: &str = "text";
/// Predicate used as the display name of an entry.
pub const NAME_PREDICATE: &str = "name";

/// Bit positions match the integer persisted in the ledger: 1, 2, 4.
#[derive(EnumSetType, Debug)]
pub enum AttrFlag {
    Interesting,
    Inheritable,
    Date,
}

pub type AttrFlags = EnumSet<AttrFlag>;

pub fn flags_to_bits(flags: AttrFlags) -> i64 {
    flags.as_u64() as i64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeData {
    pub value: String,
    pub flags: AttrFlags,
}

impl AttributeData {
    pub fn new(value: impl Into<String>, flags: AttrFlags) -> Self {
        Self { value: value.into(), flags }
    }

    pub fn plain(value: impl Into<String>) -> Self {
        Self::new(value, EnumSet::empty())
    }
}

/// An attribute occurrence together with the ledger row backing it.
/// `idx` is `None` while the occurrence has not been written yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedAttributeData {
    pub idx: Option<i64>,
    pub data: AttributeData,
}

impl IndexedAttributeData {
    pub fn persisted(idx: i64, data: AttributeData) -> Self {
        Self { idx: Some(idx), data }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub predicate: String,
    pub data: AttributeData,
}

impl Attribute {
    pub fn new(predicate: impl Into<String>, data: AttributeData) -> Self {
        Self { predicate: predicate.into(), data }
    }
}

/// Wire shape of a single attribute in a save request.
#[derive(Debug, Deserialize, Serialize)]
pub struct AttributePayload {
    pub value: String,
    #[serde(rename = "isInteresting")]
    pub is_interesting: bool,
    #[serde(rename = "isInheritable")]
    pub is_inheritable: bool,
    #[serde(rename = "isDate")]
    pub is_date: bool,
}

impl AttributePayload {
    pub fn flags(&self) -> AttrFlags {
        let mut flags = AttrFlags::empty();
        if self.is_interesting { flags.insert(AttrFlag::Interesting); }
        if self.is_inheritable { flags.insert(AttrFlag::Inheritable); }
        if self.is_date { flags.insert(AttrFlag::Date); }
        flags
    }

    pub fn into_attribute(self, predicate: &str) -> Attribute {
        let flags = self.flags();
        Attribute::new(predicate, AttributeData::new(self.value, flags))
    }
}

/// Parse the body of a save request: a JSON object mapping each predicate to
/// an [`AttributePayload`]. Every sub-field is required.
pub fn parse_save_body(body: &serde_json::Value) -> Result<Vec<Attribute>, WikiError> {
    let object = body
        .as_object()
        .ok_or_else(|| WikiError::Validation("expected an object of attributes".to_string()))?;
    let mut attributes = Vec::with_capacity(object.len());
    for (predicate, raw) in object {
        if predicate.is_empty() {
            return Err(WikiError::Validation("empty predicate".to_string()));
        }
        let payload: AttributePayload = serde_json::from_value(raw.clone())
            .map_err(|e| WikiError::Validation(format!("attribute '{}': {}", predicate, e)))?;
        attributes.push(payload.into_attribute(predicate));
    }
    Ok(attributes)
}
