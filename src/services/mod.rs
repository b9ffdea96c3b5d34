//! Storage core and its collaborators.

pub mod access;
pub mod data_adapter;
pub mod gc;
pub mod handler;
pub mod idgen;
pub mod layers;
pub mod listing;
pub mod metadata_adapter;
