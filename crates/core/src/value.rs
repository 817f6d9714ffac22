//! Property values.
//!
//! Small values are stored inline in the property record's 8-byte payload;
//! strings and arrays spill into dynamic-record chains in the `.strings` /
//! `.arrays` sibling files. The split is a storage concern: this type is
//! what the kernel API and the command stream carry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value attached to a node or relationship under a property key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Boolean, stored inline.
    Bool(bool),
    /// 64-bit signed integer, stored inline.
    Long(i64),
    /// 64-bit float, stored inline.
    Double(f64),
    /// UTF-8 string; spills to a dynamic chain when longer than the inline
    /// payload.
    String(String),
    /// Array of longs; always stored in a dynamic chain.
    LongArray(Vec<i64>),
    /// Array of strings; always stored in a dynamic chain.
    StringArray(Vec<String>),
}

impl PropertyValue {
    /// Discriminant used in the property record's type field.
    pub fn type_tag(&self) -> u8 {
        match self {
            PropertyValue::Bool(_) => 1,
            PropertyValue::Long(_) => 2,
            PropertyValue::Double(_) => 3,
            PropertyValue::String(_) => 4,
            PropertyValue::LongArray(_) => 5,
            PropertyValue::StringArray(_) => 6,
        }
    }

    /// True when the value fits the record's inline payload and needs no
    /// dynamic chain.
    pub fn is_inline(&self) -> bool {
        match self {
            PropertyValue::Bool(_) | PropertyValue::Long(_) | PropertyValue::Double(_) => true,
            PropertyValue::String(s) => s.len() <= 8,
            PropertyValue::LongArray(_) | PropertyValue::StringArray(_) => false,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Long(v) => write!(f, "{}", v),
            PropertyValue::Double(v) => write!(f, "{}", v),
            PropertyValue::String(v) => write!(f, "{:?}", v),
            PropertyValue::LongArray(v) => write!(f, "{:?}", v),
            PropertyValue::StringArray(v) => write!(f, "{:?}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_classification() {
        assert!(PropertyValue::Bool(true).is_inline());
        assert!(PropertyValue::Long(-1).is_inline());
        assert!(PropertyValue::from("short").is_inline());
        assert!(!PropertyValue::from("definitely longer than eight").is_inline());
        assert!(!PropertyValue::LongArray(vec![1]).is_inline());
    }

    #[test]
    fn type_tags_are_distinct() {
        let values = [
            PropertyValue::Bool(true),
            PropertyValue::Long(0),
            PropertyValue::Double(0.0),
            PropertyValue::from(""),
            PropertyValue::LongArray(vec![]),
            PropertyValue::StringArray(vec![]),
        ];
        let mut tags: Vec<_> = values.iter().map(|v| v.type_tag()).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), values.len());
    }
}
