//! Represents a logical bucket: the partition key for objects and data.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A storage bucket.
///
/// Buckets isolate both chunk data and object metadata. They are created
/// explicitly through `put_buckets`; no operation creates one implicitly.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct BucketInfo {
    /// Bucket identifier, passed as the partition key on every call.
    pub id: i64,

    /// Unique bucket name.
    pub name: String,

    /// Owner of the bucket.
    #[serde(default)]
    pub uid: i64,

    /// Free-form bucket kind, interpreted by the surrounding service.
    #[serde(default)]
    pub kind: i32,
}
