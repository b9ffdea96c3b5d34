//! Content-addressed object storage core.
//!
//! Logical objects (directories, files, versions, previews) live in a
//! metadata store; their bytes live as chunks in a data store. The two are
//! joined by chunk ids handed out through a two-phase dedup protocol and
//! reconciled by a background garbage collector.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
