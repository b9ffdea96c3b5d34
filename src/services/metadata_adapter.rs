//! src/services/metadata_adapter.rs
//!
//! Durable structured storage for buckets, chunk metadata and the object
//! hierarchy, backed by SQLite. Batches are written inside one transaction so
//! readers never observe half a batch.

use crate::{
    errors::{CoreError, CoreResult},
    models::{
        BucketInfo, DataInfo, ListOptions, ObjectField, ObjectInfo, ObjectStatus, OrderBy,
        OrderField,
    },
    services::{
        access::{Access, AccessControl, Ctx},
        listing::{Cursor, glob_pattern, group_common_prefixes},
    },
};
use async_trait::async_trait;
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
};
use std::{collections::HashMap, str::FromStr, sync::Arc};
use tracing::{debug, info};

const OBJ_COLUMNS: &str = "id, pid, mtime, data_id, typ, status, name, size, ext";
const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

/// One page of `list_objects`.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    /// Matching children, ignoring the continuation token.
    pub total: i64,
    /// Token for the next page; empty when the listing is exhausted.
    pub delim: String,
}

/// Durable metadata storage consumed by the handler.
#[async_trait]
pub trait MetadataAdapter: Send + Sync {
    async fn put_buckets(&self, ctx: &Ctx, buckets: &[BucketInfo]) -> CoreResult<()>;

    async fn list_buckets(&self, ctx: &Ctx) -> CoreResult<Vec<BucketInfo>>;

    /// Look up existing chunks by fingerprint; 0 where nothing matches.
    async fn ref_data(&self, ctx: &Ctx, bkt_id: i64, chunks: &[DataInfo]) -> CoreResult<Vec<i64>>;

    async fn put_data(&self, ctx: &Ctx, bkt_id: i64, chunks: &[DataInfo]) -> CoreResult<()>;

    async fn get_data(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<DataInfo>;

    async fn put_objects(&self, ctx: &Ctx, bkt_id: i64, objects: &[ObjectInfo])
    -> CoreResult<Vec<i64>>;

    /// Missing ids are omitted; the rest follow the request order.
    async fn get_objects(&self, ctx: &Ctx, bkt_id: i64, ids: &[i64]) -> CoreResult<Vec<ObjectInfo>>;

    async fn list_objects(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        pid: i64,
        opt: &ListOptions,
    ) -> CoreResult<ListPage>;

    /// Update the named columns of `obj.id` from `obj`. A status update never
    /// moves an object backward through its lifecycle.
    async fn update_object_fields(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        fields: &[ObjectField],
        obj: &ObjectInfo,
    ) -> CoreResult<()>;

    /// `(id, slices)` of every committed chunk record. Used by garbage
    /// collection.
    async fn list_data_ids(&self, ctx: &Ctx, bkt_id: i64) -> CoreResult<Vec<(i64, i32)>>;

    /// `(object id, data id)` for every non-deleted object with content.
    /// Used by garbage collection.
    async fn referenced_data_ids(&self, ctx: &Ctx, bkt_id: i64) -> CoreResult<Vec<(i64, i64)>>;

    async fn close(&self);
}

/// SQLite-backed `MetadataAdapter`.
#[derive(Clone)]
pub struct SqliteMetadataAdapter {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    acl: Arc<dyn AccessControl>,
}

impl SqliteMetadataAdapter {
    pub fn new(db: Arc<SqlitePool>, acl: Arc<dyn AccessControl>) -> Self {
        Self { db, acl }
    }

    /// Open (creating if missing) the database at `url`.
    pub async fn connect(url: &str, acl: Arc<dyn AccessControl>) -> CoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool), acl))
    }

    /// Private in-memory database with the schema applied.
    ///
    /// Pinned to one connection that never expires, since every SQLite
    /// in-memory connection is its own database.
    pub async fn in_memory(acl: Arc<dyn AccessControl>) -> CoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let adapter = Self::new(Arc::new(pool), acl);
        adapter.migrate().await?;
        Ok(adapter)
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn migrate(&self) -> CoreResult<()> {
        let statements = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    async fn object_status(&self, bkt_id: i64, id: i64) -> CoreResult<Option<ObjectStatus>> {
        let status = sqlx::query_scalar::<_, ObjectStatus>(
            "SELECT status FROM obj WHERE bkt_id = ? AND id = ?",
        )
        .bind(bkt_id)
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(status)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("foreign key")
    )
}

fn map_write_err(err: sqlx::Error, bkt_id: i64) -> CoreError {
    if is_unique_violation(&err) {
        let detail = match &err {
            sqlx::Error::Database(db_err) => db_err.message().to_string(),
            other => other.to_string(),
        };
        CoreError::Conflict(detail)
    } else if is_foreign_key_violation(&err) {
        CoreError::BucketNotFound(bkt_id)
    } else {
        CoreError::Sqlx(err)
    }
}

/// Append the WHERE clause shared by the page and count queries.
fn push_list_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    bkt_id: i64,
    pid: i64,
    opt: &ListOptions,
) -> CoreResult<()> {
    builder.push(" WHERE bkt_id = ");
    builder.push_bind(bkt_id);
    builder.push(" AND pid = ");
    builder.push_bind(pid);
    builder.push(" AND status = ");
    builder.push_bind(ObjectStatus::Active);

    if !opt.word.is_empty() {
        builder.push(" AND name GLOB ");
        builder.push_bind(glob_pattern(&opt.word));
    }
    match opt.typ {
        0 => {}
        1..=4 => {
            builder.push(" AND typ = ");
            builder.push_bind(opt.typ);
        }
        other => {
            return Err(CoreError::InvalidInput(format!(
                "unknown type filter {other}"
            )));
        }
    }
    Ok(())
}

/// Append the keyset condition selecting rows strictly after `cursor`.
fn push_cursor(builder: &mut QueryBuilder<'_, Sqlite>, order: &OrderBy, cursor: Cursor) {
    let op = if order.desc { " < " } else { " > " };
    if order.field == OrderField::Id {
        builder.push(" AND id");
        builder.push(op);
        builder.push_bind(cursor.id);
        return;
    }

    let column = order.field.column();
    builder.push(format!(" AND ({column}{op}"));
    match cursor.text {
        Some(text) => {
            builder.push_bind(text.clone());
            builder.push(format!(" OR ({column} = "));
            builder.push_bind(text);
        }
        None => {
            let value = cursor.int.unwrap_or_default();
            builder.push_bind(value);
            builder.push(format!(" OR ({column} = "));
            builder.push_bind(value);
        }
    }
    builder.push(format!(" AND id{op}"));
    builder.push_bind(cursor.id);
    builder.push("))");
}

#[async_trait]
impl MetadataAdapter for SqliteMetadataAdapter {
    async fn put_buckets(&self, ctx: &Ctx, buckets: &[BucketInfo]) -> CoreResult<()> {
        for bkt in buckets {
            self.acl.check(ctx, bkt.id, Access::Write)?;
        }
        let mut tx = self.db.begin().await?;
        for bkt in buckets {
            sqlx::query("INSERT INTO bkt (id, name, uid, kind) VALUES (?, ?, ?, ?)")
                .bind(bkt.id)
                .bind(&bkt.name)
                .bind(bkt.uid)
                .bind(bkt.kind)
                .execute(&mut *tx)
                .await
                .map_err(|err| map_write_err(err, bkt.id))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_buckets(&self, _ctx: &Ctx) -> CoreResult<Vec<BucketInfo>> {
        let buckets =
            sqlx::query_as::<_, BucketInfo>("SELECT id, name, uid, kind FROM bkt ORDER BY id")
                .fetch_all(&*self.db)
                .await?;
        Ok(buckets)
    }

    /// Full check when an MD5 is supplied (size + CRC32 + MD5), pre-check on
    /// size + header CRC32 otherwise.
    async fn ref_data(&self, ctx: &Ctx, bkt_id: i64, chunks: &[DataInfo]) -> CoreResult<Vec<i64>> {
        self.acl.check(ctx, bkt_id, Access::Read)?;
        let mut tx = self.db.begin().await?;
        let mut ids = Vec::with_capacity(chunks.len());
        for d in chunks {
            let found = if d.is_full_check() {
                sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM data
                     WHERE bkt_id = ? AND size = ? AND crc32 = ? AND md5 = ?
                     ORDER BY id LIMIT 1",
                )
                .bind(bkt_id)
                .bind(d.size)
                .bind(d.crc32)
                .bind(&d.md5)
                .fetch_optional(&mut *tx)
                .await?
            } else {
                sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM data
                     WHERE bkt_id = ? AND size = ? AND hdr_crc32 = ?
                     ORDER BY id LIMIT 1",
                )
                .bind(bkt_id)
                .bind(d.size)
                .bind(d.hdr_crc32)
                .fetch_optional(&mut *tx)
                .await?
            };
            ids.push(found.unwrap_or(0));
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn put_data(&self, ctx: &Ctx, bkt_id: i64, chunks: &[DataInfo]) -> CoreResult<()> {
        self.acl.check(ctx, bkt_id, Access::Write)?;
        let mut tx = self.db.begin().await?;
        for d in chunks {
            sqlx::query(
                r#"
                INSERT INTO data (bkt_id, id, size, hdr_crc32, crc32, md5, slices)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(bkt_id, id) DO UPDATE SET
                    size = excluded.size,
                    hdr_crc32 = excluded.hdr_crc32,
                    crc32 = excluded.crc32,
                    md5 = excluded.md5,
                    slices = excluded.slices
                "#,
            )
            .bind(bkt_id)
            .bind(d.id)
            .bind(d.size)
            .bind(d.hdr_crc32)
            .bind(d.crc32)
            .bind(&d.md5)
            .bind(d.slices)
            .execute(&mut *tx)
            .await
            .map_err(|err| map_write_err(err, bkt_id))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_data(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<DataInfo> {
        self.acl.check(ctx, bkt_id, Access::Read)?;
        sqlx::query_as::<_, DataInfo>(
            "SELECT id, size, hdr_crc32, crc32, md5, slices
             FROM data WHERE bkt_id = ? AND id = ?",
        )
        .bind(bkt_id)
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => CoreError::DataNotFound { bkt_id, id, sn: -1 },
            other => CoreError::Sqlx(other),
        })
    }

    async fn put_objects(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        objects: &[ObjectInfo],
    ) -> CoreResult<Vec<i64>> {
        self.acl.check(ctx, bkt_id, Access::Write)?;
        let mut tx = self.db.begin().await?;
        for o in objects {
            sqlx::query(
                "INSERT INTO obj (bkt_id, id, pid, mtime, data_id, typ, status, name, size, ext)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(bkt_id)
            .bind(o.id)
            .bind(o.pid)
            .bind(o.mtime)
            .bind(o.data_id)
            .bind(o.typ)
            .bind(o.status)
            .bind(&o.name)
            .bind(o.size)
            .bind(&o.ext)
            .execute(&mut *tx)
            .await
            .map_err(|err| map_write_err(err, bkt_id))?;
        }
        tx.commit().await?;
        Ok(objects.iter().map(|o| o.id).collect())
    }

    async fn get_objects(&self, ctx: &Ctx, bkt_id: i64, ids: &[i64]) -> CoreResult<Vec<ObjectInfo>> {
        self.acl.check(ctx, bkt_id, Access::Read)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {OBJ_COLUMNS} FROM obj WHERE bkt_id = "
        ));
        builder.push_bind(bkt_id);
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows: Vec<ObjectInfo> = builder.build_query_as().fetch_all(&*self.db).await?;
        let mut by_id: HashMap<i64, ObjectInfo> = rows.into_iter().map(|o| (o.id, o)).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Keyset-paginated listing of active children of `pid`.
    ///
    /// The page is fetched with one extra row to detect whether another page
    /// exists. With a separator, rows are folded into common prefixes after
    /// fetching; a page ending inside a group resumes after the whole group
    /// when ordering by name.
    async fn list_objects(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        pid: i64,
        opt: &ListOptions,
    ) -> CoreResult<ListPage> {
        self.acl.check(ctx, bkt_id, Access::Read)?;
        let order = OrderBy::parse(&opt.order)?;
        let cursor = if opt.delim.is_empty() {
            None
        } else {
            Some(Cursor::decode(&opt.delim, &order)?)
        };
        let limit = opt.page_size();

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM obj");
        push_list_filters(&mut count, bkt_id, pid, opt)?;
        let total: i64 = count.build_query_scalar().fetch_one(&*self.db).await?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {OBJ_COLUMNS} FROM obj"));
        push_list_filters(&mut builder, bkt_id, pid, opt)?;
        if let Some(cursor) = cursor {
            push_cursor(&mut builder, &order, cursor);
        }
        let dir = order.direction();
        if order.field == OrderField::Id {
            builder.push(format!(" ORDER BY id {dir}"));
        } else {
            builder.push(format!(" ORDER BY {} {dir}, id {dir}", order.field.column()));
        }
        builder.push(" LIMIT ");
        builder.push_bind(limit + 1);

        let mut rows: Vec<ObjectInfo> = builder.build_query_as().fetch_all(&*self.db).await?;
        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);
        let mut next = if has_more {
            rows.last().map(|last| Cursor::after(&order, last))
        } else {
            None
        };

        let objects = match opt.separator.as_deref().filter(|s| !s.is_empty()) {
            Some(separator) => {
                let (grouped, tail) = group_common_prefixes(rows, pid, separator);
                if let (Some(prefix), true, OrderField::Name) = (tail, next.is_some(), order.field) {
                    next = Some(Cursor::after_prefix(&order, &prefix));
                }
                grouped
            }
            None => rows,
        };

        debug!(bkt_id, pid, total, returned = objects.len(), "listed objects");
        Ok(ListPage {
            objects,
            total,
            delim: next.map(|c| c.encode()).unwrap_or_default(),
        })
    }

    async fn update_object_fields(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        fields: &[ObjectField],
        obj: &ObjectInfo,
    ) -> CoreResult<()> {
        self.acl.check(ctx, bkt_id, Access::Write)?;
        if fields.is_empty() {
            return Err(CoreError::InvalidInput("no fields to update".into()));
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE obj SET ");
        let mut assignments = builder.separated(", ");
        for field in fields {
            assignments.push(format!("{} = ", field.column()));
            match field {
                ObjectField::Name => assignments.push_bind_unseparated(obj.name.clone()),
                ObjectField::Pid => assignments.push_bind_unseparated(obj.pid),
                ObjectField::Status => assignments.push_bind_unseparated(obj.status),
            };
        }
        builder.push(" WHERE bkt_id = ");
        builder.push_bind(bkt_id);
        builder.push(" AND id = ");
        builder.push_bind(obj.id);
        let guards_status = fields.contains(&ObjectField::Status);
        if guards_status {
            builder.push(" AND status <= ");
            builder.push_bind(obj.status);
        }

        let result = builder
            .build()
            .execute(&*self.db)
            .await
            .map_err(|err| map_write_err(err, bkt_id))?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.object_status(bkt_id, obj.id).await? {
            None => Err(CoreError::ObjectNotFound { bkt_id, id: obj.id }),
            Some(current) if guards_status && current > obj.status => {
                Err(CoreError::InvalidTransition {
                    id: obj.id,
                    from: current.to_string(),
                    to: obj.status.to_string(),
                })
            }
            Some(_) => Ok(()),
        }
    }

    async fn list_data_ids(&self, ctx: &Ctx, bkt_id: i64) -> CoreResult<Vec<(i64, i32)>> {
        self.acl.check(ctx, bkt_id, Access::Read)?;
        let ids = sqlx::query_as::<_, (i64, i32)>(
            "SELECT id, slices FROM data WHERE bkt_id = ? ORDER BY id",
        )
        .bind(bkt_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(ids)
    }

    async fn referenced_data_ids(&self, ctx: &Ctx, bkt_id: i64) -> CoreResult<Vec<(i64, i64)>> {
        self.acl.check(ctx, bkt_id, Access::Read)?;
        let refs = sqlx::query_as::<_, (i64, i64)>(
            "SELECT id, data_id FROM obj
             WHERE bkt_id = ? AND data_id != 0 AND status < ?
             ORDER BY id",
        )
        .bind(bkt_id)
        .bind(ObjectStatus::Deleted)
        .fetch_all(&*self.db)
        .await?;
        Ok(refs)
    }

    async fn close(&self) {
        self.db.close().await;
    }
}
