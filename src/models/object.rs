//! Represents a logical entry (directory, file, version, preview) in a bucket.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Kind of a hierarchy entry. The numeric values are part of the listing
/// filter contract (`0` means "all types" and is not a variant).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(try_from = "i32", into = "i32")]
#[repr(i32)]
pub enum ObjectType {
    Dir = 1,
    #[default]
    File = 2,
    Version = 3,
    /// Renditions such as thumbnails, playlists or pdf previews.
    Preview = 4,
}

impl TryFrom<i32> for ObjectType {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dir),
            2 => Ok(Self::File),
            3 => Ok(Self::Version),
            4 => Ok(Self::Preview),
            other => Err(format!("unknown object type {other}")),
        }
    }
}

impl From<ObjectType> for i32 {
    fn from(value: ObjectType) -> Self {
        value as i32
    }
}

/// Lifecycle state. Values are ordered: transitions only ever increase them.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, sqlx::Type,
)]
#[serde(try_from = "i32", into = "i32")]
#[repr(i32)]
pub enum ObjectStatus {
    #[default]
    Active = 1,
    Recycled = 2,
    Deleted = 3,
}

impl TryFrom<i32> for ObjectStatus {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Active),
            2 => Ok(Self::Recycled),
            3 => Ok(Self::Deleted),
            other => Err(format!("unknown object status {other}")),
        }
    }
}

impl From<ObjectStatus> for i32 {
    fn from(value: ObjectStatus) -> Self {
        value as i32
    }
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Recycled => write!(f, "RECYCLED"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

/// A single hierarchy entry.
///
/// The record stores metadata only; content lives in the chunk referenced by
/// `data_id`. A negative `pid` in a create batch is a forward reference to
/// another entry of the same batch (see `services::handler::resolve_forward_refs`).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    #[serde(default)]
    pub id: i64,

    /// Parent entry; 0 is the bucket root.
    #[serde(default)]
    pub pid: i64,

    /// Last modification, unix seconds.
    #[serde(default)]
    pub mtime: i64,

    /// Referenced chunk; 0 when the entry has no content.
    #[serde(default)]
    pub data_id: i64,

    #[serde(default, rename = "type")]
    pub typ: ObjectType,

    #[serde(default)]
    pub status: ObjectStatus,

    /// Unique among the entries sharing `pid`.
    pub name: String,

    #[serde(default)]
    pub size: i64,

    /// Extension attributes, opaque to the core.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ext: String,
}

/// Columns that `update_object_fields` may touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectField {
    Name,
    Pid,
    Status,
}

impl ObjectField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Pid => "pid",
            Self::Status => "status",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order_is_lifecycle_order() {
        assert!(ObjectStatus::Active < ObjectStatus::Recycled);
        assert!(ObjectStatus::Recycled < ObjectStatus::Deleted);
    }

    #[test]
    fn test_object_json_uses_numeric_enums() {
        let obj = ObjectInfo {
            id: 9,
            name: "a.txt".into(),
            typ: ObjectType::Preview,
            ..Default::default()
        };
        let value = serde_json::to_value(&obj).unwrap();
        assert_eq!(value["type"], 4);
        assert_eq!(value["status"], 1);

        let back: ObjectInfo = serde_json::from_value(value).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let res: Result<ObjectInfo, _> =
            serde_json::from_str(r#"{"name":"x","type":9}"#);
        assert!(res.is_err());
    }
}
