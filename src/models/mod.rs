//! Core data model of the store.
//!
//! Buckets partition everything. Data chunks carry content fingerprints and
//! are addressed by `(bucket, id, sn)`; objects form the hierarchy and point
//! at chunks by id. Both map to database rows via `sqlx::FromRow` and
//! serialize as JSON via `serde`.

pub mod bucket;
pub mod data;
pub mod object;
pub mod options;

pub use bucket::BucketInfo;
pub use data::{DataInfo, EMPTY_DATA_ID};
pub use object::{ObjectField, ObjectInfo, ObjectStatus, ObjectType};
pub use options::{Brief, ListOptions, Options, OrderBy, OrderField, ReadSpec};
