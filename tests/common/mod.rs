#![allow(dead_code)]

use dedup_store::{
    services::{
        access::{AccessControl, AllowAll, Ctx},
        data_adapter::{DataAdapter, FsDataAdapter},
        handler::{Handler, RwHandler},
        idgen::SnowflakeIdSource,
        metadata_adapter::{MetadataAdapter, SqliteMetadataAdapter},
    },
};
use std::sync::Arc;
use tempfile::TempDir;

pub const BKT: i64 = 1;

/// A handler over an in-memory database and a temporary chunk directory.
pub struct TestStore {
    pub handler: Arc<dyn Handler>,
    pub meta: Arc<dyn MetadataAdapter>,
    pub data: Arc<dyn DataAdapter>,
    pub sqlite: SqliteMetadataAdapter,
    pub dir: TempDir,
}

pub async fn store() -> TestStore {
    store_with(Arc::new(AllowAll), |data| data).await
}

/// Build a store, letting the caller wrap the data adapter.
pub async fn store_with(
    acl: Arc<dyn AccessControl>,
    wrap: impl FnOnce(Arc<dyn DataAdapter>) -> Arc<dyn DataAdapter>,
) -> TestStore {
    let dir = TempDir::new().unwrap();
    let sqlite = SqliteMetadataAdapter::in_memory(acl.clone()).await.unwrap();
    let meta: Arc<dyn MetadataAdapter> = Arc::new(sqlite.clone());
    let data = wrap(Arc::new(FsDataAdapter::new(dir.path(), acl)));
    let ids = Arc::new(SnowflakeIdSource::new(1).unwrap());
    let handler: Arc<dyn Handler> = Arc::new(RwHandler::new(meta.clone(), data.clone(), ids));

    // Seeded directly so read-only stores get a bucket too.
    sqlx::query("INSERT INTO bkt (id, name) VALUES (?, ?)")
        .bind(BKT)
        .bind("default")
        .execute(&*sqlite.db)
        .await
        .unwrap();

    TestStore {
        handler,
        meta,
        data,
        sqlite,
        dir,
    }
}

pub fn ctx() -> Ctx {
    Ctx::new(42)
}
