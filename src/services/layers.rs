//! Composition of handler layers.
//!
//! Capabilities such as tracing, caching or policy checks wrap the core
//! handler. Each layer implements `Handler` itself and is stacked once, at
//! construction time, by `HandlerBuilder`.

use crate::{
    errors::CoreResult,
    models::{BucketInfo, DataInfo, ListOptions, ObjectInfo, Options, ReadSpec},
    services::{
        access::Ctx,
        handler::Handler,
        metadata_adapter::ListPage,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{Instrument, debug_span, info_span, warn};

/// Wraps an inner handler with an extra capability.
pub trait Layer: Send + Sync {
    fn wrap(&self, inner: Arc<dyn Handler>) -> Arc<dyn Handler>;
}

/// Builds a handler stack. Layers added first sit closest to the core.
pub struct HandlerBuilder {
    core: Arc<dyn Handler>,
    layers: Vec<Box<dyn Layer>>,
}

impl HandlerBuilder {
    pub fn new(core: Arc<dyn Handler>) -> Self {
        Self {
            core,
            layers: Vec::new(),
        }
    }

    pub fn layer(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn build(self) -> Arc<dyn Handler> {
        self.layers
            .iter()
            .fold(self.core, |inner, layer| layer.wrap(inner))
    }
}

/// Puts every handler call in a span carrying the request id and bucket,
/// and logs failures.
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceLayer;

impl Layer for TraceLayer {
    fn wrap(&self, inner: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(TracedHandler { inner })
    }
}

pub struct TracedHandler {
    inner: Arc<dyn Handler>,
}

fn log_failure<T>(op: &'static str, result: CoreResult<T>) -> CoreResult<T> {
    if let Err(err) = &result {
        warn!(op, error = %err, "handler call failed");
    }
    result
}

#[async_trait]
impl Handler for TracedHandler {
    async fn close(&self) {
        self.inner.close().await
    }

    fn configure(&self, opt: Options) {
        self.inner.configure(opt)
    }

    async fn put_buckets(&self, ctx: &Ctx, buckets: &[BucketInfo]) -> CoreResult<()> {
        let span = info_span!("put_buckets", request_id = %ctx.request_id, count = buckets.len());
        log_failure("put_buckets", self.inner.put_buckets(ctx, buckets).instrument(span).await)
    }

    async fn list_buckets(&self, ctx: &Ctx) -> CoreResult<Vec<BucketInfo>> {
        let span = debug_span!("list_buckets", request_id = %ctx.request_id);
        log_failure("list_buckets", self.inner.list_buckets(ctx).instrument(span).await)
    }

    async fn ref_data(&self, ctx: &Ctx, bkt_id: i64, chunks: &[DataInfo]) -> CoreResult<Vec<i64>> {
        let span = info_span!("ref", request_id = %ctx.request_id, bkt_id, count = chunks.len());
        log_failure("ref", self.inner.ref_data(ctx, bkt_id, chunks).instrument(span).await)
    }

    async fn put_data(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        data_id: i64,
        sn: i32,
        buf: Bytes,
    ) -> CoreResult<i64> {
        let span = info_span!(
            "put_data",
            request_id = %ctx.request_id,
            bkt_id,
            data_id,
            sn,
            len = buf.len()
        );
        log_failure(
            "put_data",
            self.inner
                .put_data(ctx, bkt_id, data_id, sn, buf)
                .instrument(span)
                .await,
        )
    }

    async fn get_data(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        id: i64,
        sn: i32,
        read: ReadSpec,
    ) -> CoreResult<Bytes> {
        let span = debug_span!("get_data", request_id = %ctx.request_id, bkt_id, id, sn, ?read);
        log_failure(
            "get_data",
            self.inner
                .get_data(ctx, bkt_id, id, sn, read)
                .instrument(span)
                .await,
        )
    }

    async fn put_data_info(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        chunks: Vec<DataInfo>,
    ) -> CoreResult<Vec<i64>> {
        let span =
            info_span!("put_data_info", request_id = %ctx.request_id, bkt_id, count = chunks.len());
        log_failure(
            "put_data_info",
            self.inner
                .put_data_info(ctx, bkt_id, chunks)
                .instrument(span)
                .await,
        )
    }

    async fn get_data_info(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<DataInfo> {
        let span = debug_span!("get_data_info", request_id = %ctx.request_id, bkt_id, id);
        log_failure(
            "get_data_info",
            self.inner.get_data_info(ctx, bkt_id, id).instrument(span).await,
        )
    }

    async fn file_size(&self, ctx: &Ctx, bkt_id: i64, data_id: i64, sn: i32) -> CoreResult<u64> {
        let span = debug_span!("file_size", request_id = %ctx.request_id, bkt_id, data_id, sn);
        log_failure(
            "file_size",
            self.inner
                .file_size(ctx, bkt_id, data_id, sn)
                .instrument(span)
                .await,
        )
    }

    async fn put(&self, ctx: &Ctx, bkt_id: i64, objects: Vec<ObjectInfo>) -> CoreResult<Vec<i64>> {
        let span = info_span!("put", request_id = %ctx.request_id, bkt_id, count = objects.len());
        log_failure("put", self.inner.put(ctx, bkt_id, objects).instrument(span).await)
    }

    async fn get(&self, ctx: &Ctx, bkt_id: i64, ids: &[i64]) -> CoreResult<Vec<ObjectInfo>> {
        let span = debug_span!("get", request_id = %ctx.request_id, bkt_id, count = ids.len());
        log_failure("get", self.inner.get(ctx, bkt_id, ids).instrument(span).await)
    }

    async fn list(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        pid: i64,
        opt: &ListOptions,
    ) -> CoreResult<ListPage> {
        let span = debug_span!("list", request_id = %ctx.request_id, bkt_id, pid, order = %opt.order);
        log_failure("list", self.inner.list(ctx, bkt_id, pid, opt).instrument(span).await)
    }

    async fn rename(&self, ctx: &Ctx, bkt_id: i64, id: i64, name: &str) -> CoreResult<()> {
        let span = info_span!("rename", request_id = %ctx.request_id, bkt_id, id);
        log_failure("rename", self.inner.rename(ctx, bkt_id, id, name).instrument(span).await)
    }

    async fn move_to(&self, ctx: &Ctx, bkt_id: i64, id: i64, pid: i64) -> CoreResult<()> {
        let span = info_span!("move_to", request_id = %ctx.request_id, bkt_id, id, pid);
        log_failure("move_to", self.inner.move_to(ctx, bkt_id, id, pid).instrument(span).await)
    }

    async fn recycle(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<()> {
        let span = info_span!("recycle", request_id = %ctx.request_id, bkt_id, id);
        log_failure("recycle", self.inner.recycle(ctx, bkt_id, id).instrument(span).await)
    }

    async fn delete(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<()> {
        let span = info_span!("delete", request_id = %ctx.request_id, bkt_id, id);
        log_failure("delete", self.inner.delete(ctx, bkt_id, id).instrument(span).await)
    }
}
