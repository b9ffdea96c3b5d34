//! HTTP handlers for chunk bytes and chunk metadata.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::{DataInfo, ReadSpec},
    services::access::Ctx,
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// Optional range of `GET /{bkt}/data/{id}/{sn}`.
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub offset: Option<u64>,
    pub size: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdResponse {
    pub id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SizeResponse {
    pub size: u64,
}

/// POST `/{bkt}/data/ref`: dedup lookup, one id (or 0) per descriptor.
pub async fn ref_data(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(bkt_id): Path<i64>,
    Json(chunks): Json<Vec<DataInfo>>,
) -> Result<Json<Vec<i64>>, AppError> {
    let ids = state.handler.ref_data(&ctx, bkt_id, &chunks).await?;
    Ok(Json(ids))
}

/// PUT `/{bkt}/data/{id}/{sn}`: upload one slice; id 0 assigns a new one.
pub async fn put_data(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((bkt_id, data_id, sn)): Path<(i64, i64, i32)>,
    body: Bytes,
) -> Result<Json<IdResponse>, AppError> {
    let id = state
        .handler
        .put_data(&ctx, bkt_id, data_id, sn, body)
        .await?;
    Ok(Json(IdResponse { id }))
}

/// GET `/{bkt}/data/{id}/{sn}`: whole slice, or `?offset=[&size=]`.
pub async fn get_data(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((bkt_id, data_id, sn)): Path<(i64, i64, i32)>,
    Query(range): Query<RangeQuery>,
) -> Result<Response, AppError> {
    let read = ReadSpec::from_parts(range.offset, range.size)?;
    let bytes = state
        .handler
        .get_data(&ctx, bkt_id, data_id, sn, read)
        .await?;

    let mut response = Response::new(Body::from(bytes));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// GET `/{bkt}/data/{id}/{sn}/size`: stored length without the bytes.
pub async fn file_size(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((bkt_id, data_id, sn)): Path<(i64, i64, i32)>,
) -> Result<Json<SizeResponse>, AppError> {
    let size = state.handler.file_size(&ctx, bkt_id, data_id, sn).await?;
    Ok(Json(SizeResponse { size }))
}

/// POST `/{bkt}/datainfo`: commit chunk metadata.
pub async fn put_data_info(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(bkt_id): Path<i64>,
    Json(chunks): Json<Vec<DataInfo>>,
) -> Result<impl IntoResponse, AppError> {
    let ids = state.handler.put_data_info(&ctx, bkt_id, chunks).await?;
    Ok((StatusCode::CREATED, Json(ids)))
}

/// GET `/{bkt}/datainfo/{id}`
pub async fn get_data_info(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((bkt_id, data_id)): Path<(i64, i64)>,
) -> Result<Json<DataInfo>, AppError> {
    let info = state.handler.get_data_info(&ctx, bkt_id, data_id).await?;
    Ok(Json(info))
}
