//! Annotation values, validation, and the merge policy
//!
//! Annotations are free-form key/value metadata attached to a stored identity
//! (sample rate, original filename, derived frequency bounds, timing fields).
//! Values are restricted to a closed set of kinds: scalars (number, string,
//! bytes, bool, date/time, explicit null), homogeneous numeric arrays, and
//! nested lists/maps of those.
//!
//! The merge policy is used when two nodes are considered "the same" (e.g.
//! tagging every node during a cross-store import): arrays and lists
//! concatenate, unequal strings join with `;`, maps merge recursively, and
//! anything else must already be equal.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LineageError, Result};

/// Keys carrying this prefix belong to transform metadata, never to
/// user annotations.
pub const TRANSFORM_PREFIX: &str = "transform_";

/// A single annotation (or transform parameter) value.
///
/// `Null` is an explicit sentinel, distinguishable from an absent key when
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnnotationValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    /// Homogeneous numeric array (the ndarray of the record format).
    Array(Vec<f64>),
    List(Vec<AnnotationValue>),
    Map(BTreeMap<String, AnnotationValue>),
}

/// An annotation map as stored per identity.
pub type Annotations = BTreeMap<String, AnnotationValue>;

impl AnnotationValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AnnotationValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric coercion: ints read back as floats too.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            AnnotationValue::Float(v) => Some(*v),
            AnnotationValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AnnotationValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AnnotationValue]> {
        match self {
            AnnotationValue::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AnnotationValue::Null)
    }
}

impl fmt::Display for AnnotationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "<unprintable>"),
        }
    }
}

impl From<bool> for AnnotationValue {
    fn from(v: bool) -> Self {
        AnnotationValue::Bool(v)
    }
}

impl From<i64> for AnnotationValue {
    fn from(v: i64) -> Self {
        AnnotationValue::Int(v)
    }
}

impl From<f64> for AnnotationValue {
    fn from(v: f64) -> Self {
        AnnotationValue::Float(v)
    }
}

impl From<&str> for AnnotationValue {
    fn from(v: &str) -> Self {
        AnnotationValue::Str(v.to_string())
    }
}

impl From<String> for AnnotationValue {
    fn from(v: String) -> Self {
        AnnotationValue::Str(v)
    }
}

impl From<Vec<f64>> for AnnotationValue {
    fn from(v: Vec<f64>) -> Self {
        AnnotationValue::Array(v)
    }
}

/// Recursively check a single annotation value.
///
/// The value kinds themselves are closed by construction; what remains to
/// enforce is structural legality: floats and array elements must be finite
/// (non-finite values have no stable persisted form), and nested map keys may
/// not use the reserved transform prefix.
pub fn check_annotation_value(value: &AnnotationValue) -> Result<()> {
    match value {
        AnnotationValue::Float(v) => {
            if !v.is_finite() {
                return Err(LineageError::InvalidAnnotation(format!(
                    "non-finite float {} is not a permitted annotation value",
                    v
                )));
            }
        }
        AnnotationValue::Array(values) => {
            if let Some(v) = values.iter().find(|v| !v.is_finite()) {
                return Err(LineageError::InvalidAnnotation(format!(
                    "numeric array contains non-finite element {}",
                    v
                )));
            }
        }
        AnnotationValue::List(values) => {
            for element in values {
                check_annotation_value(element)?;
            }
        }
        AnnotationValue::Map(map) => {
            for (key, element) in map {
                check_annotation_key(key)?;
                check_annotation_value(element)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn check_annotation_key(key: &str) -> Result<()> {
    if key.starts_with(TRANSFORM_PREFIX) {
        return Err(LineageError::InvalidAnnotation(format!(
            "annotation key {:?} uses the reserved {:?} prefix",
            key, TRANSFORM_PREFIX
        )));
    }
    Ok(())
}

/// Validate a whole annotation map. The first violation aborts the call, so
/// callers never persist a partially valid set.
pub fn check_annotations(annotations: &Annotations) -> Result<()> {
    for (key, value) in annotations {
        check_annotation_key(key)?;
        check_annotation_value(value)?;
    }
    Ok(())
}

/// Merge two values stored under the same key.
///
/// Arrays and lists concatenate, maps merge recursively, unequal strings join
/// with `;`. Any other pair must already be equal.
pub fn merge_annotation(
    key: &str,
    a: &AnnotationValue,
    b: &AnnotationValue,
) -> Result<AnnotationValue> {
    use AnnotationValue::*;

    match (a, b) {
        (Map(ma), Map(mb)) => Ok(Map(merge_annotations(ma, mb)?)),
        (Array(va), Array(vb)) => {
            let mut merged = va.clone();
            merged.extend_from_slice(vb);
            Ok(Array(merged))
        }
        (List(va), List(vb)) => {
            let mut merged = va.clone();
            merged.extend_from_slice(vb);
            Ok(List(merged))
        }
        (Str(sa), Str(sb)) => {
            if sa == sb {
                Ok(Str(sa.clone()))
            } else {
                Ok(Str(format!("{};{}", sa, sb)))
            }
        }
        _ => {
            if a == b {
                Ok(a.clone())
            } else {
                Err(LineageError::AnnotationConflict {
                    key: key.to_string(),
                    left: a.to_string(),
                    right: b.to_string(),
                })
            }
        }
    }
}

/// Merge two annotation maps. Disjoint keys are kept as-is; shared keys go
/// through [`merge_annotation`].
pub fn merge_annotations(a: &Annotations, b: &Annotations) -> Result<Annotations> {
    let mut merged = Annotations::new();
    for (key, value) in a {
        match b.get(key) {
            Some(other) => {
                merged.insert(key.clone(), merge_annotation(key, value, other)?);
            }
            None => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    for (key, value) in b {
        if !merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    Ok(merged)
}
