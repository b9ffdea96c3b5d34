//! src/services/data_adapter.rs
//!
//! Physical chunk storage. Chunks are addressed by `(bucket, data id, sn)`
//! and stored on local disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{id}_{sn}`.

use crate::{
    errors::{CoreError, CoreResult},
    models::Options,
    services::access::{Access, AccessControl, Ctx},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

/// One slice found on disk by `DataAdapter::scan`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredChunk {
    pub data_id: i64,
    pub sn: i32,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Durable chunk storage.
#[async_trait]
pub trait DataAdapter: Send + Sync {
    /// Store `buf` as slice `sn` of chunk `id`, replacing any previous bytes.
    async fn write(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32, buf: &[u8]) -> CoreResult<()>;

    /// Read a whole slice.
    async fn read(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32) -> CoreResult<Bytes>;

    /// Read from `offset`, up to `size` bytes or to the end when `size` is `None`.
    async fn read_range(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        id: i64,
        sn: i32,
        offset: u64,
        size: Option<u64>,
    ) -> CoreResult<Bytes>;

    /// Stored length of a slice, without reading it.
    async fn size(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32) -> CoreResult<u64>;

    /// Every slice stored for a bucket. Used by garbage collection.
    async fn scan(&self, ctx: &Ctx, bkt_id: i64) -> CoreResult<Vec<StoredChunk>>;

    /// Physically remove a slice. Used by garbage collection.
    async fn remove(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32) -> CoreResult<()>;

    fn configure(&self, opt: Options);

    async fn close(&self);
}

/// Filesystem-backed `DataAdapter`.
#[derive(Clone)]
pub struct FsDataAdapter {
    /// Base directory on disk where chunk slices are stored.
    base_path: PathBuf,
    acl: Arc<dyn AccessControl>,
    sync_writes: Arc<AtomicBool>,
}

impl FsDataAdapter {
    pub fn new(base_path: impl Into<PathBuf>, acl: Arc<dyn AccessControl>) -> Self {
        Self {
            base_path: base_path.into(),
            acl,
            sync_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn bucket_root(&self, bkt_id: i64) -> PathBuf {
        self.base_path.join(bkt_id.to_string())
    }

    /// Two-level shard directories derived from MD5(bucket/id), keeping the
    /// slices of one chunk together.
    fn chunk_shards(bkt_id: i64, id: i64) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bkt_id, id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn chunk_path(&self, bkt_id: i64, id: i64, sn: i32) -> PathBuf {
        let (shard_a, shard_b) = Self::chunk_shards(bkt_id, id);
        let mut path = self.bucket_root(bkt_id);
        path.push(shard_a);
        path.push(shard_b);
        path.push(format!("{}_{}", id, sn));
        path
    }

    fn map_not_found(err: io::Error, bkt_id: i64, id: i64, sn: i32) -> CoreError {
        if err.kind() == ErrorKind::NotFound {
            CoreError::DataNotFound { bkt_id, id, sn }
        } else {
            CoreError::Io(err)
        }
    }

    async fn open(&self, bkt_id: i64, id: i64, sn: i32) -> CoreResult<File> {
        File::open(self.chunk_path(bkt_id, id, sn))
            .await
            .map_err(|err| Self::map_not_found(err, bkt_id, id, sn))
    }
}

/// Parse `{id}_{sn}` file names; anything else (temp files) is skipped.
fn parse_chunk_name(name: &str) -> Option<(i64, i32)> {
    let (id, sn) = name.rsplit_once('_')?;
    Some((id.parse().ok()?, sn.parse().ok()?))
}

#[async_trait]
impl DataAdapter for FsDataAdapter {
    /// - Writes bytes to a temporary file next to the target.
    /// - Optionally fsyncs it.
    /// - Atomically renames it into place.
    async fn write(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32, buf: &[u8]) -> CoreResult<()> {
        self.acl.check(ctx, bkt_id, Access::Write)?;
        let file_path = self.chunk_path(bkt_id, id, sn);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            CoreError::Io(io::Error::new(
                ErrorKind::Other,
                "chunk path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(buf).await?;
            file.flush().await?;
            if self.sync_writes.load(Ordering::Relaxed) {
                file.sync_all().await?;
            }
            fs::rename(&tmp_path, &file_path).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(CoreError::Io(err));
        }
        debug!(bkt_id, id, sn, len = buf.len(), "wrote chunk slice");
        Ok(())
    }

    async fn read(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32) -> CoreResult<Bytes> {
        self.acl.check(ctx, bkt_id, Access::Read)?;
        let buf = fs::read(self.chunk_path(bkt_id, id, sn))
            .await
            .map_err(|err| Self::map_not_found(err, bkt_id, id, sn))?;
        Ok(Bytes::from(buf))
    }

    async fn read_range(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        id: i64,
        sn: i32,
        offset: u64,
        size: Option<u64>,
    ) -> CoreResult<Bytes> {
        self.acl.check(ctx, bkt_id, Access::Read)?;
        if size == Some(0) {
            return Err(CoreError::InvalidInput("zero-length read".into()));
        }
        let mut file = self.open(bkt_id, id, sn).await?;
        let len = file.metadata().await?.len();
        if offset > len {
            return Err(CoreError::InvalidInput(format!(
                "offset {offset} beyond slice length {len}"
            )));
        }
        let available = len - offset;
        let want = size.map_or(available, |s| s.min(available));

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; want as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn size(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32) -> CoreResult<u64> {
        self.acl.check(ctx, bkt_id, Access::Read)?;
        let meta = fs::metadata(self.chunk_path(bkt_id, id, sn))
            .await
            .map_err(|err| Self::map_not_found(err, bkt_id, id, sn))?;
        Ok(meta.len())
    }

    async fn scan(&self, ctx: &Ctx, bkt_id: i64) -> CoreResult<Vec<StoredChunk>> {
        self.acl.check(ctx, bkt_id, Access::Read)?;
        let mut found = Vec::new();
        let mut pending = vec![self.bucket_root(bkt_id)];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(CoreError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let name = entry.file_name();
                let Some((data_id, sn)) = name.to_str().and_then(parse_chunk_name) else {
                    continue;
                };
                found.push(StoredChunk {
                    data_id,
                    sn,
                    size: meta.len(),
                    modified: meta.modified()?.into(),
                });
            }
        }
        found.sort_by_key(|c| (c.data_id, c.sn));
        Ok(found)
    }

    async fn remove(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32) -> CoreResult<()> {
        self.acl.check(ctx, bkt_id, Access::Write)?;
        let file_path = self.chunk_path(bkt_id, id, sn);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed chunk file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("chunk file {} already missing", file_path.display());
            }
            Err(err) => return Err(CoreError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            prune_empty_dirs(parent, &self.bucket_root(bkt_id)).await;
        }
        Ok(())
    }

    fn configure(&self, opt: Options) {
        self.sync_writes.store(opt.sync_writes, Ordering::Relaxed);
    }

    async fn close(&self) {
        debug!("data adapter at {} closed", self.base_path.display());
    }
}

/// Remove empty shard directories up to, but excluding, `stop`.
async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(_) => {
                if let Some(parent) = current.parent() {
                    current = parent.to_path_buf();
                } else {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}
