//! HTTP surface over the storage handler.

pub mod data_handlers;
pub mod health_handlers;
pub mod object_handlers;

use crate::{
    errors::AppError,
    services::{access::Ctx, handler::Handler},
};
use axum::{extract::FromRequestParts, http::request::Parts};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

/// Header carrying the calling user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<dyn Handler>,
    /// Metadata pool, probed by `/readyz`.
    pub db: Arc<SqlitePool>,
    /// Chunk root, probed by `/readyz`.
    pub storage_dir: PathBuf,
}

impl<S> FromRequestParts<S> for Ctx
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let uid = match parts.headers.get(USER_ID_HEADER) {
            None => 0,
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok())
                .ok_or_else(|| AppError::bad_request(format!("invalid {USER_ID_HEADER} header")))?,
        };
        Ok(Ctx::new(uid))
    }
}
