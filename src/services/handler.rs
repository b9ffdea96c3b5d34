//! src/services/handler.rs
//!
//! The request-level handler contract and its core implementation.
//!
//! `RwHandler` composes an identifier source, a data adapter and a metadata
//! adapter. It owns the only business logic of the store: content dedup,
//! id assignment (including in-batch forward references) and the split
//! between chunk bytes and chunk/object metadata. It keeps no state between
//! calls and takes no locks; serialization is the adapters' job.

use crate::{
    errors::{CoreError, CoreResult},
    models::{
        BucketInfo, DataInfo, EMPTY_DATA_ID, ListOptions, ObjectField, ObjectInfo, ObjectStatus,
        Options, ReadSpec,
    },
    services::{
        access::Ctx,
        data_adapter::DataAdapter,
        idgen::IdentifierSource,
        metadata_adapter::{ListPage, MetadataAdapter},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::{collections::HashSet, sync::Arc};
use tracing::debug;

/// Batched, context-carrying storage handler.
///
/// Batch calls process and return entries in input order and either fully
/// succeed or fail as a whole.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Release adapter resources.
    async fn close(&self);

    /// Forward tuning options to the data adapter.
    fn configure(&self, opt: Options);

    async fn put_buckets(&self, ctx: &Ctx, buckets: &[BucketInfo]) -> CoreResult<()>;

    async fn list_buckets(&self, ctx: &Ctx) -> CoreResult<Vec<BucketInfo>>;

    /// Dedup lookup. Without an MD5 this is a pre-check on size + header CRC
    /// and returns a candidate id; with size + CRC32 + MD5 a non-zero id is an
    /// existing chunk and the caller must skip uploading it. 0 means upload.
    async fn ref_data(&self, ctx: &Ctx, bkt_id: i64, chunks: &[DataInfo]) -> CoreResult<Vec<i64>>;

    /// Store one slice. `sn` is -1 for single content, 0.. for split uploads.
    /// `data_id == 0` assigns a new id. Returns the id used.
    async fn put_data(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        data_id: i64,
        sn: i32,
        buf: Bytes,
    ) -> CoreResult<i64>;

    async fn get_data(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        id: i64,
        sn: i32,
        read: ReadSpec,
    ) -> CoreResult<Bytes>;

    /// Commit chunk metadata, usually after the bytes were uploaded.
    async fn put_data_info(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        chunks: Vec<DataInfo>,
    ) -> CoreResult<Vec<i64>>;

    async fn get_data_info(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<DataInfo>;

    /// Stored length of a slice, for scans that only need existence and size.
    async fn file_size(&self, ctx: &Ctx, bkt_id: i64, data_id: i64, sn: i32) -> CoreResult<u64>;

    /// Create objects. A negative `pid` is `!index` of another entry in the
    /// same batch.
    async fn put(&self, ctx: &Ctx, bkt_id: i64, objects: Vec<ObjectInfo>) -> CoreResult<Vec<i64>>;

    async fn get(&self, ctx: &Ctx, bkt_id: i64, ids: &[i64]) -> CoreResult<Vec<ObjectInfo>>;

    async fn list(&self, ctx: &Ctx, bkt_id: i64, pid: i64, opt: &ListOptions)
    -> CoreResult<ListPage>;

    /// Fails with `Conflict` when a sibling already holds `name`.
    async fn rename(&self, ctx: &Ctx, bkt_id: i64, id: i64, name: &str) -> CoreResult<()>;

    async fn move_to(&self, ctx: &Ctx, bkt_id: i64, id: i64, pid: i64) -> CoreResult<()>;

    async fn recycle(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<()>;

    async fn delete(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<()>;
}

/// Replace every negative `pid` with the id of the batch entry it encodes.
///
/// `pid = !index`, so -1 points at entry 0 and -2 at entry 1. Must run after
/// every entry has its real id. An index outside the batch, or an entry
/// pointing at itself, rejects the whole batch.
pub fn resolve_forward_refs(objects: &mut [ObjectInfo]) -> CoreResult<()> {
    let ids: Vec<i64> = objects.iter().map(|o| o.id).collect();
    for (pos, obj) in objects.iter_mut().enumerate() {
        if obj.pid >= 0 {
            continue;
        }
        let index = !obj.pid as usize;
        if index >= ids.len() {
            return Err(CoreError::InvalidInput(format!(
                "forward reference {} points outside a batch of {}",
                obj.pid,
                ids.len()
            )));
        }
        if index == pos {
            return Err(CoreError::InvalidInput(format!(
                "entry {pos} references itself as parent"
            )));
        }
        obj.pid = ids[index];
    }
    Ok(())
}

fn check_sizes(chunks: &[DataInfo]) -> CoreResult<()> {
    match chunks.iter().position(|d| d.size < 0) {
        Some(pos) => Err(CoreError::InvalidInput(format!(
            "entry {pos} has negative size {}",
            chunks[pos].size
        ))),
        None => Ok(()),
    }
}

/// The core handler.
#[derive(Clone)]
pub struct RwHandler {
    meta: Arc<dyn MetadataAdapter>,
    data: Arc<dyn DataAdapter>,
    ids: Arc<dyn IdentifierSource>,
}

impl RwHandler {
    pub fn new(
        meta: Arc<dyn MetadataAdapter>,
        data: Arc<dyn DataAdapter>,
        ids: Arc<dyn IdentifierSource>,
    ) -> Self {
        Self { meta, data, ids }
    }

    /// Walk up from `pid` to the root and reject the move when `id` is on
    /// the way. A parent that cannot be fetched ends the walk.
    async fn check_not_ancestor(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        id: i64,
        pid: i64,
    ) -> CoreResult<()> {
        let mut seen = HashSet::new();
        let mut cur = pid;
        while cur > 0 && seen.insert(cur) {
            if cur == id {
                return Err(CoreError::InvalidInput(format!(
                    "cannot move `{id}` under its own descendant `{pid}`"
                )));
            }
            cur = match self.meta.get_objects(ctx, bkt_id, &[cur]).await?.first() {
                Some(parent) => parent.pid,
                None => break,
            };
        }
        Ok(())
    }

    async fn set_status(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        id: i64,
        status: ObjectStatus,
    ) -> CoreResult<()> {
        let patch = ObjectInfo {
            id,
            status,
            ..Default::default()
        };
        self.meta
            .update_object_fields(ctx, bkt_id, &[ObjectField::Status], &patch)
            .await
    }
}

#[async_trait]
impl Handler for RwHandler {
    async fn close(&self) {
        self.data.close().await;
        self.meta.close().await;
    }

    fn configure(&self, opt: Options) {
        self.data.configure(opt);
    }

    async fn put_buckets(&self, ctx: &Ctx, buckets: &[BucketInfo]) -> CoreResult<()> {
        if let Some(bad) = buckets.iter().find(|b| b.id <= 0 || b.name.is_empty()) {
            return Err(CoreError::InvalidInput(format!(
                "bucket needs a positive id and a name, got {} `{}`",
                bad.id, bad.name
            )));
        }
        self.meta.put_buckets(ctx, buckets).await
    }

    async fn list_buckets(&self, ctx: &Ctx) -> CoreResult<Vec<BucketInfo>> {
        self.meta.list_buckets(ctx).await
    }

    /// Empty content always resolves to `EMPTY_DATA_ID` without a lookup.
    async fn ref_data(&self, ctx: &Ctx, bkt_id: i64, chunks: &[DataInfo]) -> CoreResult<Vec<i64>> {
        check_sizes(chunks)?;
        let lookups: Vec<DataInfo> = chunks.iter().filter(|d| d.size > 0).cloned().collect();
        let found = if lookups.is_empty() {
            Vec::new()
        } else {
            self.meta.ref_data(ctx, bkt_id, &lookups).await?
        };
        let mut found = found.into_iter();

        let mut ids = Vec::with_capacity(chunks.len());
        for d in chunks {
            if d.size > 0 {
                ids.push(found.next().unwrap_or(0));
            } else {
                ids.push(EMPTY_DATA_ID);
            }
        }
        debug!(bkt_id, count = ids.len(), "resolved data refs");
        Ok(ids)
    }

    async fn put_data(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        data_id: i64,
        sn: i32,
        buf: Bytes,
    ) -> CoreResult<i64> {
        if sn < -1 {
            return Err(CoreError::InvalidInput(format!("invalid sn {sn}")));
        }
        if data_id < 0 {
            return Err(CoreError::InvalidInput(format!("invalid data id {data_id}")));
        }
        let id = match data_id {
            0 if buf.is_empty() => EMPTY_DATA_ID,
            0 => self.ids.new_id()?,
            id => id,
        };
        if id == EMPTY_DATA_ID {
            if !buf.is_empty() {
                return Err(CoreError::InvalidInput(
                    "the empty-content id cannot carry bytes".into(),
                ));
            }
            return Ok(id);
        }
        self.data.write(ctx, bkt_id, id, sn, &buf).await?;
        Ok(id)
    }

    async fn get_data(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        id: i64,
        sn: i32,
        read: ReadSpec,
    ) -> CoreResult<Bytes> {
        if id == EMPTY_DATA_ID {
            return Ok(Bytes::new());
        }
        match read {
            ReadSpec::WholeSlice => self.data.read(ctx, bkt_id, id, sn).await,
            ReadSpec::FromOffset(offset) => {
                self.data.read_range(ctx, bkt_id, id, sn, offset, None).await
            }
            ReadSpec::BoundedRange { offset, size } => {
                self.data
                    .read_range(ctx, bkt_id, id, sn, offset, Some(size))
                    .await
            }
        }
    }

    /// Ids assigned here are independent of `put_data`; callers committing
    /// freshly uploaded bytes pass the id `put_data` returned.
    async fn put_data_info(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        mut chunks: Vec<DataInfo>,
    ) -> CoreResult<Vec<i64>> {
        check_sizes(&chunks)?;
        let mut ids = Vec::with_capacity(chunks.len());
        for d in chunks.iter_mut() {
            if d.id == 0 {
                d.id = self.ids.new_id()?;
            }
            ids.push(d.id);
        }
        self.meta.put_data(ctx, bkt_id, &chunks).await?;
        Ok(ids)
    }

    async fn get_data_info(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<DataInfo> {
        self.meta.get_data(ctx, bkt_id, id).await
    }

    async fn file_size(&self, ctx: &Ctx, bkt_id: i64, data_id: i64, sn: i32) -> CoreResult<u64> {
        if data_id == EMPTY_DATA_ID {
            return Ok(0);
        }
        self.data.size(ctx, bkt_id, data_id, sn).await
    }

    async fn put(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        mut objects: Vec<ObjectInfo>,
    ) -> CoreResult<Vec<i64>> {
        if let Some(pos) = objects.iter().position(|o| o.name.is_empty()) {
            return Err(CoreError::InvalidInput(format!("entry {pos} has no name")));
        }
        let now = Utc::now().timestamp();
        for o in objects.iter_mut() {
            if o.id == 0 {
                o.id = self.ids.new_id()?;
            }
            if o.mtime == 0 {
                o.mtime = now;
            }
        }
        resolve_forward_refs(&mut objects)?;
        let ids = self.meta.put_objects(ctx, bkt_id, &objects).await?;
        debug!(bkt_id, count = ids.len(), "created objects");
        Ok(ids)
    }

    async fn get(&self, ctx: &Ctx, bkt_id: i64, ids: &[i64]) -> CoreResult<Vec<ObjectInfo>> {
        self.meta.get_objects(ctx, bkt_id, ids).await
    }

    async fn list(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        pid: i64,
        opt: &ListOptions,
    ) -> CoreResult<ListPage> {
        self.meta.list_objects(ctx, bkt_id, pid, opt).await
    }

    async fn rename(&self, ctx: &Ctx, bkt_id: i64, id: i64, name: &str) -> CoreResult<()> {
        if name.is_empty() {
            return Err(CoreError::InvalidInput("name must not be empty".into()));
        }
        let patch = ObjectInfo {
            id,
            name: name.to_string(),
            ..Default::default()
        };
        self.meta
            .update_object_fields(ctx, bkt_id, &[ObjectField::Name], &patch)
            .await
    }

    async fn move_to(&self, ctx: &Ctx, bkt_id: i64, id: i64, pid: i64) -> CoreResult<()> {
        if pid < 0 || pid == id {
            return Err(CoreError::InvalidInput(format!(
                "cannot move `{id}` under `{pid}`"
            )));
        }
        self.check_not_ancestor(ctx, bkt_id, id, pid).await?;
        let patch = ObjectInfo {
            id,
            pid,
            ..Default::default()
        };
        self.meta
            .update_object_fields(ctx, bkt_id, &[ObjectField::Pid], &patch)
            .await
    }

    async fn recycle(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<()> {
        self.set_status(ctx, bkt_id, id, ObjectStatus::Recycled).await
    }

    async fn delete(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<()> {
        self.set_status(ctx, bkt_id, id, ObjectStatus::Deleted).await
    }
}
