//! Route table of the storage service.
//!
//! ## Structure
//! - **Buckets**
//!   - `PUT    /buckets`: create buckets
//!   - `GET    /buckets`: list buckets
//!
//! - **Chunks** (`{bkt}` is the numeric bucket id)
//!   - `POST   /{bkt}/data/ref`: dedup lookup
//!   - `PUT    /{bkt}/data/{id}/{sn}`: upload a slice
//!   - `GET    /{bkt}/data/{id}/{sn}`: read a slice, `?offset=&size=` for ranges
//!   - `GET    /{bkt}/data/{id}/{sn}/size`: stored slice length
//!   - `POST   /{bkt}/datainfo`: commit chunk metadata
//!   - `GET    /{bkt}/datainfo/{id}`: chunk metadata
//!
//! - **Objects**
//!   - `POST   /{bkt}/objects`: create a batch
//!   - `POST   /{bkt}/objects/get`: fetch by ids
//!   - `GET    /{bkt}/objects/{pid}/children`: list one directory level
//!   - `PUT    /{bkt}/objects/{id}/name`: rename
//!   - `PUT    /{bkt}/objects/{id}/pid`: move
//!   - `POST   /{bkt}/objects/{id}/recycle`: move to the recycle bin
//!   - `DELETE /{bkt}/objects/{id}`: mark deleted

use crate::handlers::{
    AppState,
    data_handlers::{file_size, get_data, get_data_info, put_data, put_data_info, ref_data},
    health_handlers::{healthz, readyz},
    object_handlers::{
        delete_object, get_objects, list_buckets, list_objects, move_object, put_buckets,
        put_objects, recycle_object, rename_object,
    },
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
};

/// Build the router. State (`AppState`) is supplied by the caller.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/buckets", put(put_buckets).get(list_buckets))
        // Chunk routes
        .route("/{bkt}/data/ref", post(ref_data))
        // Slices are buffered whole; their size is bounded by the client's
        // chunking, not by the default body limit.
        .route(
            "/{bkt}/data/{id}/{sn}",
            put(put_data)
                .layer(DefaultBodyLimit::disable())
                .get(get_data),
        )
        .route("/{bkt}/data/{id}/{sn}/size", get(file_size))
        .route("/{bkt}/datainfo", post(put_data_info))
        .route("/{bkt}/datainfo/{id}", get(get_data_info))
        // Object routes
        .route("/{bkt}/objects", post(put_objects))
        .route("/{bkt}/objects/get", post(get_objects))
        .route("/{bkt}/objects/{id}", delete(delete_object))
        .route("/{bkt}/objects/{id}/children", get(list_objects))
        .route("/{bkt}/objects/{id}/name", put(rename_object))
        .route("/{bkt}/objects/{id}/pid", put(move_object))
        .route("/{bkt}/objects/{id}/recycle", post(recycle_object))
}
