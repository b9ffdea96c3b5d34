//! Garbage collection: reconciles stored chunk bytes against metadata.
//!
//! Chunk bytes and chunk/object metadata are written in separate steps, so
//! neither side can be checked on write. A reconciliation pass over a bucket
//! classifies two anomalies:
//!
//! - dirty data: bytes no metadata refers to, older than the grace window.
//!   These are reclaimed.
//! - corrupt metadata: a data record or a live object pointing at bytes that
//!   are not stored. These are reported and never deleted.

use crate::{
    errors::{CoreError, CoreResult},
    models::EMPTY_DATA_ID,
    services::{
        access::Ctx,
        data_adapter::{DataAdapter, StoredChunk},
        metadata_adapter::MetadataAdapter,
    },
};
use chrono::{DateTime, TimeDelta, Utc};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECLAIM_CONCURRENCY: usize = 8;

#[derive(Clone, Copy, Debug)]
pub struct GcPolicy {
    /// Minimum age before unreferenced bytes count as dirty. Covers the gap
    /// between `put_data` and the metadata commit that references it.
    pub grace: TimeDelta,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            grace: TimeDelta::hours(1),
        }
    }
}

/// Metadata pointing at missing bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CorruptRef {
    pub data_id: i64,
    /// The referencing object, or `None` for the data record itself.
    pub object_id: Option<i64>,
}

/// Findings of one pass over one bucket.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GcReport {
    pub bkt_id: i64,
    #[serde(skip)]
    pub dirty: Vec<StoredChunk>,
    pub corrupt: Vec<CorruptRef>,
    /// Unreferenced slices still inside the grace window.
    pub pending: usize,
}

impl GcReport {
    pub fn is_consistent(&self) -> bool {
        self.corrupt.is_empty()
    }

    /// Treat corruption findings as a hard failure.
    pub fn ensure_consistent(&self) -> CoreResult<()> {
        if self.is_consistent() {
            return Ok(());
        }
        Err(CoreError::Integrity(format!(
            "bucket `{}` has {} references to missing data",
            self.bkt_id,
            self.corrupt.len()
        )))
    }
}

/// Outcome of reclaiming dirty slices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub items_deleted: u64,
    pub bytes_reclaimed: u64,
    /// Slices referenced again between scan and reclaim.
    pub items_skipped: u64,
    pub errors: u64,
}

pub struct Reconciler {
    meta: Arc<dyn MetadataAdapter>,
    data: Arc<dyn DataAdapter>,
    policy: GcPolicy,
}

impl Reconciler {
    pub fn new(
        meta: Arc<dyn MetadataAdapter>,
        data: Arc<dyn DataAdapter>,
        policy: GcPolicy,
    ) -> Self {
        Self { meta, data, policy }
    }

    /// Every data id some metadata still points at.
    async fn protected_ids(&self, ctx: &Ctx, bkt_id: i64) -> CoreResult<HashSet<i64>> {
        let mut ids: HashSet<i64> = self
            .meta
            .list_data_ids(ctx, bkt_id)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.extend(
            self.meta
                .referenced_data_ids(ctx, bkt_id)
                .await?
                .into_iter()
                .map(|(_, data_id)| data_id),
        );
        Ok(ids)
    }

    /// Classify the stored slices and metadata references of one bucket as
    /// of `now`.
    pub async fn scan(&self, ctx: &Ctx, bkt_id: i64, now: DateTime<Utc>) -> CoreResult<GcReport> {
        let stored = self.data.scan(ctx, bkt_id).await?;
        let records = self.meta.list_data_ids(ctx, bkt_id).await?;
        let refs = self.meta.referenced_data_ids(ctx, bkt_id).await?;

        let present: HashSet<i64> = stored.iter().map(|c| c.data_id).collect();
        let slices: HashSet<(i64, i32)> = stored.iter().map(|c| (c.data_id, c.sn)).collect();
        let protected: HashSet<i64> = records
            .iter()
            .map(|(id, _)| *id)
            .chain(refs.iter().map(|(_, data_id)| *data_id))
            .collect();
        let cutoff = now - self.policy.grace;

        let mut report = GcReport {
            bkt_id,
            ..Default::default()
        };
        for chunk in stored {
            if protected.contains(&chunk.data_id) {
                continue;
            }
            if chunk.modified < cutoff {
                report.dirty.push(chunk);
            } else {
                report.pending += 1;
            }
        }

        // A record is intact only when every slice it declares is stored.
        let mut broken = HashSet::new();
        for (data_id, count) in records.iter().filter(|(id, _)| *id != EMPTY_DATA_ID) {
            let intact = expected_slices(*count).all(|sn| slices.contains(&(*data_id, sn)));
            if !intact {
                broken.insert(*data_id);
                report.corrupt.push(CorruptRef {
                    data_id: *data_id,
                    object_id: None,
                });
            }
        }
        let recorded: HashSet<i64> = records.iter().map(|(id, _)| *id).collect();
        let missing = |id: i64| {
            id != EMPTY_DATA_ID
                && (broken.contains(&id) || (!recorded.contains(&id) && !present.contains(&id)))
        };
        for (object_id, data_id) in refs.iter().filter(|(_, id)| missing(*id)) {
            report.corrupt.push(CorruptRef {
                data_id: *data_id,
                object_id: Some(*object_id),
            });
        }

        for finding in &report.corrupt {
            warn!(
                bkt_id,
                data_id = finding.data_id,
                object_id = ?finding.object_id,
                "metadata references missing data"
            );
        }
        debug!(
            bkt_id,
            dirty = report.dirty.len(),
            pending = report.pending,
            corrupt = report.corrupt.len(),
            "gc scan finished"
        );
        Ok(report)
    }

    /// Remove the dirty slices of `report`, skipping any chunk that gained a
    /// reference since the scan. Removal failures are counted, not raised.
    pub async fn reclaim(&self, ctx: &Ctx, report: &GcReport) -> CoreResult<GcStats> {
        let protected = self.protected_ids(ctx, report.bkt_id).await?;
        let mut stats = GcStats::default();

        let bkt_id = report.bkt_id;
        let mut victims: Vec<(i64, i32, u64)> = Vec::with_capacity(report.dirty.len());
        for chunk in &report.dirty {
            if protected.contains(&chunk.data_id) {
                stats.items_skipped += 1;
            } else {
                victims.push((chunk.data_id, chunk.sn, chunk.size));
            }
        }

        let data = Arc::clone(&self.data);
        let ctx = ctx.clone();
        let results: Vec<(u64, CoreResult<()>)> = stream::iter(victims)
            .map(move |(data_id, sn, size)| {
                let data = Arc::clone(&data);
                let ctx = ctx.clone();
                async move { (size, data.remove(&ctx, bkt_id, data_id, sn).await) }
            })
            .buffer_unordered(RECLAIM_CONCURRENCY)
            .collect()
            .await;

        for (size, res) in results {
            match res {
                Ok(()) => {
                    stats.items_deleted += 1;
                    stats.bytes_reclaimed += size;
                }
                Err(err) => {
                    warn!(bkt_id, error = %err, "failed to reclaim slice");
                    stats.errors += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Scan every bucket, optionally reclaiming dirty data.
    pub async fn run_all(
        &self,
        ctx: &Ctx,
        now: DateTime<Utc>,
        reclaim: bool,
    ) -> CoreResult<Vec<GcReport>> {
        let mut reports = Vec::new();
        for bkt in self.meta.list_buckets(ctx).await? {
            let report = self.scan(ctx, bkt.id, now).await?;
            if reclaim && !report.dirty.is_empty() {
                let stats = self.reclaim(ctx, &report).await?;
                info!(
                    bkt_id = bkt.id,
                    deleted = stats.items_deleted,
                    bytes = stats.bytes_reclaimed,
                    skipped = stats.items_skipped,
                    errors = stats.errors,
                    "reclaimed dirty data"
                );
            }
            reports.push(report);
        }
        Ok(reports)
    }
}

/// Slice numbers a record with `count` slices must have on disk.
fn expected_slices(count: i32) -> std::ops::Range<i32> {
    if count <= 0 { -1..0 } else { 0..count }
}

/// Run `run_all` every `every` until the task is aborted. With `reclaim`
/// unset the passes only report.
pub fn spawn_background(
    reconciler: Arc<Reconciler>,
    every: Duration,
    reclaim: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let ctx = Ctx::system();
            match reconciler.run_all(&ctx, Utc::now(), reclaim).await {
                Ok(reports) => {
                    let corrupt: usize = reports.iter().map(|r| r.corrupt.len()).sum();
                    debug!(buckets = reports.len(), corrupt, reclaim, "gc pass complete");
                }
                Err(err) => warn!(error = %err, "gc pass failed"),
            }
        }
    })
}
