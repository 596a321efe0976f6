//! Error types for the lineage store and reconstruction engine
//!
//! Read-only writes are *not* errors: stores report them by returning
//! `Ok(false)` from their `put_*` methods. `LineageError` is reserved for
//! hard failures — invariant violations, dead-end reconstructions, merge
//! conflicts, and I/O.

use std::fmt;
use std::io;

use crate::store::Id;

/// Crate-wide error type.
#[derive(Debug)]
pub enum LineageError {
    /// A reconstruction reached an identity with no data and no usable parents.
    NotFound(Id),
    /// Root discovery revisited a node on its own ancestry path.
    CorruptGraph(Id),
    /// Component reconstruction was asked for a root that is not an ancestor.
    UnrelatedRoot { id: Id, root_id: Id },
    /// Annotation merge failed: same key, incompatible values.
    AnnotationConflict {
        key: String,
        left: String,
        right: String,
    },
    /// An annotation value or key violated the validation rules.
    InvalidAnnotation(String),
    /// Transform metadata carried no `transform_type` field.
    MissingKind,
    /// `transform_type` held a tag no registry entry recognizes.
    UnknownKind(String),
    /// Two buffers that must match in duration did not.
    DurationMismatch(String),
    /// A transform parameter was missing or out of range.
    BadParameter(String),
    Io(io::Error),
    /// A store record failed to encode or decode.
    Encoding(String),
}

impl fmt::Display for LineageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineageError::NotFound(id) => {
                write!(f, "identity {} not in store and not reconstructible", id)
            }
            LineageError::CorruptGraph(id) => {
                write!(f, "lineage graph contains a cycle through identity {}", id)
            }
            LineageError::UnrelatedRoot { id, root_id } => {
                write!(f, "{} is not a root of identity {}", root_id, id)
            }
            LineageError::AnnotationConflict { key, left, right } => {
                write!(
                    f,
                    "cannot merge annotation key {:?}: {} != {}",
                    key, left, right
                )
            }
            LineageError::InvalidAnnotation(msg) => write!(f, "invalid annotation: {}", msg),
            LineageError::MissingKind => {
                write!(f, "transform metadata is missing the transform_type field")
            }
            LineageError::UnknownKind(tag) => write!(f, "unknown transform kind {:?}", tag),
            LineageError::DurationMismatch(msg) => write!(f, "duration mismatch: {}", msg),
            LineageError::BadParameter(msg) => write!(f, "bad transform parameter: {}", msg),
            LineageError::Io(err) => write!(f, "store I/O error: {}", err),
            LineageError::Encoding(msg) => write!(f, "store encoding error: {}", msg),
        }
    }
}

impl std::error::Error for LineageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LineageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for LineageError {
    fn from(err: io::Error) -> Self {
        LineageError::Io(err)
    }
}

impl From<serde_json::Error> for LineageError {
    fn from(err: serde_json::Error) -> Self {
        LineageError::Encoding(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LineageError>;
