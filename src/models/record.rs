// Repository records and their property values

//! # Record Model
//!
//! A [`Record`] is the engine's view of one repository object: its durable
//! [`RecordRef`], class, workflow state, property values and attached files.
//! Records are always loaded fresh from the repository before use; a
//! `RecordRef` is the only thing that survives across task deliveries.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ObjectTypeId = i32;
pub type ClassId = i32;
pub type PropertyId = i32;
pub type StateId = i32;
pub type UserId = i64;

/// Identifiers with a fixed meaning in every repository
pub mod builtin {
    use super::{ClassId, ObjectTypeId, PropertyId};

    pub const DOCUMENT_OBJECT_TYPE: ObjectTypeId = 0;
    pub const ASSIGNMENT_OBJECT_TYPE: ObjectTypeId = 10;
    /// Value list holding user accounts; lookups into it reference users
    pub const USER_LIST: ObjectTypeId = -6;

    pub const GENERIC_ASSIGNMENT_CLASS: ClassId = -100;

    pub const IS_TEMPLATE_PROPERTY: PropertyId = 37;
    pub const ASSIGNED_TO_PROPERTY: PropertyId = 44;
}

/// Durable reference to a record: object type plus id within that type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub object_type: ObjectTypeId,
    pub id: i64,
}

impl RecordRef {
    pub fn new(object_type: ObjectTypeId, id: i64) -> Self {
        Self { object_type, id }
    }

    /// Reference to a user account
    pub fn user(id: UserId) -> Self {
        Self::new(builtin::USER_LIST, id)
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}-{})", self.object_type, self.id)
    }
}

/// A typed property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum PropertyValue {
    Null,
    Text(String),
    Integer(i64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Lookup(RecordRef),
    MultiLookup(Vec<RecordRef>),
}

impl PropertyValue {
    /// Empty values compare equal to `Null`
    pub fn is_empty(&self) -> bool {
        match self {
            PropertyValue::Null => true,
            PropertyValue::Text(text) => text.is_empty(),
            PropertyValue::MultiLookup(refs) => refs.is_empty(),
            _ => false,
        }
    }

    /// Every record referenced by this value
    pub fn lookups(&self) -> &[RecordRef] {
        match self {
            PropertyValue::Lookup(reference) => std::slice::from_ref(reference),
            PropertyValue::MultiLookup(refs) => refs,
            _ => &[],
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Equality with repository semantics
    ///
    /// Text compares case-insensitively, a multi-lookup "equals" any reference it
    /// contains, integers and booleans compare by value and empty equals `Null`.
    pub fn matches(&self, expected: &PropertyValue) -> bool {
        if expected.is_empty() || self.is_empty() {
            return expected.is_empty() && self.is_empty();
        }
        match (self, expected) {
            (PropertyValue::Text(a), PropertyValue::Text(b)) => a.to_lowercase() == b.to_lowercase(),
            (PropertyValue::MultiLookup(refs), PropertyValue::Lookup(b)) => refs.contains(b),
            (PropertyValue::Lookup(a), PropertyValue::MultiLookup(refs)) => refs.contains(a),
            (PropertyValue::MultiLookup(a), PropertyValue::MultiLookup(b)) => {
                a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
            }
            _ => self.compare(expected) == Some(Ordering::Equal),
        }
    }

    /// Ordering between values of the same kind
    pub fn compare(&self, other: &PropertyValue) -> Option<Ordering> {
        match (self, other) {
            (PropertyValue::Integer(a), PropertyValue::Integer(b)) => Some(a.cmp(b)),
            (PropertyValue::Boolean(a), PropertyValue::Boolean(b)) => Some(a.cmp(b)),
            (PropertyValue::Timestamp(a), PropertyValue::Timestamp(b)) => Some(a.cmp(b)),
            (PropertyValue::Text(a), PropertyValue::Text(b)) => {
                Some(a.to_lowercase().cmp(&b.to_lowercase()))
            }
            (PropertyValue::Lookup(a), PropertyValue::Lookup(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "(empty)"),
            PropertyValue::Text(text) => write!(f, "{}", text),
            PropertyValue::Integer(value) => write!(f, "{}", value),
            PropertyValue::Boolean(value) => write!(f, "{}", value),
            PropertyValue::Timestamp(value) => write!(f, "{}", value.to_rfc3339()),
            PropertyValue::Lookup(reference) => write!(f, "{}", reference),
            PropertyValue::MultiLookup(refs) => {
                let parts: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// A file attached to a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFile {
    pub title: String,
    pub extension: String,
    #[serde(default)]
    pub size: u64,
    /// Where the content can be fetched from, when it lives outside the repository
    #[serde(default)]
    pub source_url: Option<String>,
}

impl RecordFile {
    pub fn file_name(&self) -> String {
        if self.extension.is_empty() {
            self.title.clone()
        } else {
            format!("{}.{}", self.title, self.extension)
        }
    }
}

/// Current version of a repository object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub reference: RecordRef,
    #[serde(default = "default_version")]
    pub version: u64,
    pub class: ClassId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub state: Option<StateId>,
    #[serde(default)]
    pub properties: BTreeMap<PropertyId, PropertyValue>,
    #[serde(default)]
    pub files: Vec<RecordFile>,
    /// Actor currently holding the edit lock, if any
    #[serde(default)]
    pub checked_out_to: Option<String>,
    #[serde(default)]
    pub version_comment: Option<String>,
    #[serde(default)]
    pub modified_by: Option<UserId>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_version() -> u64 {
    1
}

impl Record {
    pub fn new(reference: RecordRef, class: ClassId, title: impl Into<String>) -> Self {
        Self {
            reference,
            version: 1,
            class,
            title: title.into(),
            external_id: None,
            state: None,
            properties: BTreeMap::new(),
            files: Vec::new(),
            checked_out_to: None,
            version_comment: None,
            modified_by: None,
            modified_at: Utc::now(),
        }
    }

    /// Builder-style property setter
    pub fn with_property(mut self, property: PropertyId, value: PropertyValue) -> Self {
        self.properties.insert(property, value);
        self
    }

    pub fn with_state(mut self, state: StateId) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_file(mut self, file: RecordFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn property(&self, property: PropertyId) -> Option<&PropertyValue> {
        self.properties.get(&property)
    }

    /// First record referenced by a lookup property
    pub fn lookup(&self, property: PropertyId) -> Option<RecordRef> {
        self.property(property)
            .and_then(|value| value.lookups().first().copied())
    }

    pub fn is_checked_out(&self) -> bool {
        self.checked_out_to.is_some()
    }

    /// True if any lookup property references `target`
    pub fn references(&self, target: &RecordRef) -> bool {
        self.properties
            .values()
            .any(|value| value.lookups().contains(target))
    }
}

/// Changes applied to a locked record in one save
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyChanges {
    pub set: BTreeMap<PropertyId, PropertyValue>,
    pub remove: BTreeSet<PropertyId>,
    pub class: Option<ClassId>,
    pub title: Option<String>,
    pub files: Option<Vec<RecordFile>>,
    pub comment: Option<String>,
    pub modified_by: Option<UserId>,
}

impl PropertyChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, property: PropertyId, value: PropertyValue) -> Self {
        self.remove.remove(&property);
        self.set.insert(property, value);
        self
    }

    pub fn remove(mut self, property: PropertyId) -> Self {
        self.set.remove(&property);
        self.remove.insert(property);
        self
    }

    pub fn class(mut self, class: ClassId) -> Self {
        self.class = Some(class);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn files(mut self, files: Vec<RecordFile>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn modified_by(mut self, user: UserId) -> Self {
        self.modified_by = Some(user);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.remove.is_empty()
            && self.class.is_none()
            && self.title.is_none()
            && self.files.is_none()
    }

    /// Apply to a record in place, bumping its version
    pub fn apply_to(&self, record: &mut Record) {
        for property in &self.remove {
            record.properties.remove(property);
        }
        for (property, value) in &self.set {
            record.properties.insert(*property, value.clone());
        }
        if let Some(class) = self.class {
            record.class = class;
        }
        if let Some(title) = &self.title {
            record.title = title.clone();
        }
        if let Some(files) = &self.files {
            record.files = files.clone();
        }
        record.version_comment = self.comment.clone();
        record.modified_by = self.modified_by;
        record.modified_at = Utc::now();
        record.version += 1;
    }
}

/// A record to be created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub object_type: ObjectTypeId,
    pub class: ClassId,
    pub title: String,
    #[serde(default)]
    pub properties: BTreeMap<PropertyId, PropertyValue>,
    #[serde(default)]
    pub files: Vec<RecordFile>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<UserId>,
    /// Comment on the first version
    #[serde(default)]
    pub comment: Option<String>,
}

impl NewRecord {
    pub fn new(object_type: ObjectTypeId, class: ClassId, title: impl Into<String>) -> Self {
        Self {
            object_type,
            class,
            title: title.into(),
            properties: BTreeMap::new(),
            files: Vec::new(),
            external_id: None,
            created_by: None,
            comment: None,
        }
    }

    pub fn with_property(mut self, property: PropertyId, value: PropertyValue) -> Self {
        self.properties.insert(property, value);
        self
    }
}

/// Schema information about an object type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectTypeInfo {
    pub id: ObjectTypeId,
    pub name: String,
    /// Lookup property other records use to reference objects of this type
    pub default_property: PropertyId,
    #[serde(default)]
    pub can_have_files: bool,
}
