//! HTTP handlers for bucket and object operations.
//! Request bodies are JSON; everything is delegated to the `Handler`.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::{BucketInfo, Brief, ListOptions, ObjectInfo},
    services::access::Ctx,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

/// Object as rendered to clients, trimmed according to `brief`.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ObjectView {
    Full(ObjectInfo),
    Id { id: i64 },
}

impl ObjectView {
    pub fn render(mut obj: ObjectInfo, brief: Brief) -> Self {
        match brief {
            Brief::Full => Self::Full(obj),
            Brief::WithoutExt => {
                obj.ext.clear();
                Self::Full(obj)
            }
            Brief::IdOnly => Self::Id { id: obj.id },
        }
    }
}

fn render_all(objects: Vec<ObjectInfo>, brief: i32) -> Vec<ObjectView> {
    let brief = Brief::from(brief);
    objects
        .into_iter()
        .map(|o| ObjectView::render(o, brief))
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct GetObjectsReq {
    pub ids: Vec<i64>,
    #[serde(default)]
    pub brief: i32,
}

#[derive(Debug, Serialize)]
pub struct ListObjectsResp {
    pub objects: Vec<ObjectView>,
    pub total: i64,
    pub delim: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameReq {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct MoveReq {
    pub pid: i64,
}

/// PUT `/buckets`: create buckets.
pub async fn put_buckets(
    State(state): State<AppState>,
    ctx: Ctx,
    Json(buckets): Json<Vec<BucketInfo>>,
) -> Result<StatusCode, AppError> {
    state.handler.put_buckets(&ctx, &buckets).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/buckets`
pub async fn list_buckets(
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<Vec<BucketInfo>>, AppError> {
    Ok(Json(state.handler.list_buckets(&ctx).await?))
}

/// POST `/{bkt}/objects`: create a batch; negative `pid`s are forward
/// references into the same batch. Returns the assigned ids in order.
pub async fn put_objects(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(bkt_id): Path<i64>,
    Json(objects): Json<Vec<ObjectInfo>>,
) -> Result<impl IntoResponse, AppError> {
    let ids = state.handler.put(&ctx, bkt_id, objects).await?;
    Ok((StatusCode::CREATED, Json(ids)))
}

/// POST `/{bkt}/objects/get`: fetch by id; unknown ids are left out.
pub async fn get_objects(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(bkt_id): Path<i64>,
    Json(req): Json<GetObjectsReq>,
) -> Result<Json<Vec<ObjectView>>, AppError> {
    let objects = state.handler.get(&ctx, bkt_id, &req.ids).await?;
    Ok(Json(render_all(objects, req.brief)))
}

/// GET `/{bkt}/objects/{pid}/children`: one page of active children.
pub async fn list_objects(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((bkt_id, pid)): Path<(i64, i64)>,
    Query(opt): Query<ListOptions>,
) -> Result<Json<ListObjectsResp>, AppError> {
    let page = state.handler.list(&ctx, bkt_id, pid, &opt).await?;
    Ok(Json(ListObjectsResp {
        objects: render_all(page.objects, opt.brief),
        total: page.total,
        delim: page.delim,
    }))
}

/// PUT `/{bkt}/objects/{id}/name`
pub async fn rename_object(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((bkt_id, id)): Path<(i64, i64)>,
    Json(req): Json<RenameReq>,
) -> Result<StatusCode, AppError> {
    state.handler.rename(&ctx, bkt_id, id, &req.name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT `/{bkt}/objects/{id}/pid`
pub async fn move_object(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((bkt_id, id)): Path<(i64, i64)>,
    Json(req): Json<MoveReq>,
) -> Result<StatusCode, AppError> {
    state.handler.move_to(&ctx, bkt_id, id, req.pid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/{bkt}/objects/{id}/recycle`
pub async fn recycle_object(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((bkt_id, id)): Path<(i64, i64)>,
) -> Result<StatusCode, AppError> {
    state.handler.recycle(&ctx, bkt_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE `/{bkt}/objects/{id}`: marks the object deleted; bytes are left
/// to the collector.
pub async fn delete_object(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((bkt_id, id)): Path<(i64, i64)>,
) -> Result<StatusCode, AppError> {
    state.handler.delete(&ctx, bkt_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
