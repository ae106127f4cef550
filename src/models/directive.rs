// Task directives: durable descriptions of asynchronous work

//! # Task Directives
//!
//! A directive is the payload stored in the task queue. It names the records
//! involved by durable identifier only; processors re-load every record when the
//! directive is delivered, because the record may have changed or disappeared
//! in the meantime.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::record::{ObjectTypeId, RecordRef};

/// Implemented by every directive payload type
pub trait TaskDirective: Serialize + DeserializeOwned + Send + Sync {
    /// Human readable name shown in queue listings
    fn display_name(&self) -> Option<&str> {
        None
    }
}

/// Serialized record reference inside a directive
///
/// Both parts are optional so that a payload written by an older or broken
/// producer still deserializes; [`DirectiveRef::record_ref`] then reports it as
/// unusable instead of failing the whole decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveRef {
    #[serde(default)]
    pub object_type: Option<ObjectTypeId>,
    #[serde(default)]
    pub id: Option<i64>,
}

impl DirectiveRef {
    pub fn record_ref(&self) -> Option<RecordRef> {
        match (self.object_type, self.id) {
            (Some(object_type), Some(id)) if id > 0 => Some(RecordRef::new(object_type, id)),
            _ => None,
        }
    }
}

impl From<RecordRef> for DirectiveRef {
    fn from(reference: RecordRef) -> Self {
        Self {
            object_type: Some(reference.object_type),
            id: Some(reference.id),
        }
    }
}

/// Directive referencing a single record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDirective {
    #[serde(default)]
    pub display_name: Option<String>,
    pub record: DirectiveRef,
}

impl ObjectDirective {
    pub fn new(record: RecordRef, display_name: impl Into<String>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            record: record.into(),
        }
    }
}

impl TaskDirective for ObjectDirective {
    fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }
}

/// Directive with no record references, used by scheduled jobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyDirective {
    #[serde(default)]
    pub display_name: Option<String>,
}

impl TaskDirective for EmptyDirective {
    fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_ref_rejects_partial_references() {
        let missing_id = DirectiveRef {
            object_type: Some(102),
            id: None,
        };
        let bad_id = DirectiveRef {
            object_type: Some(102),
            id: Some(0),
        };
        assert_eq!(missing_id.record_ref(), None);
        assert_eq!(bad_id.record_ref(), None);
        assert_eq!(
            DirectiveRef::from(RecordRef::new(102, 4)).record_ref(),
            Some(RecordRef::new(102, 4))
        );
    }

    #[test]
    fn test_object_directive_tolerates_missing_fields() {
        let directive: ObjectDirective =
            serde_json::from_value(serde_json::json!({ "record": {} })).unwrap();
        assert!(directive.record.record_ref().is_none());
        assert!(directive.display_name().is_none());
    }
}
