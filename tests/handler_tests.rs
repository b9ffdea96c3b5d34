mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{BKT, ctx, store, store_with};
use dedup_store::{
    errors::{CoreError, CoreResult},
    models::{
        BucketInfo, DataInfo, EMPTY_DATA_ID, ListOptions, ObjectInfo, ObjectStatus, ObjectType,
        Options, ReadSpec,
    },
    services::{
        access::{AllowAll, Ctx, ReadOnly},
        data_adapter::{DataAdapter, StoredChunk},
        handler::Handler,
        layers::{HandlerBuilder, Layer, TraceLayer},
        metadata_adapter::ListPage,
    },
};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

/// Data adapter that counts writes before delegating.
struct CountingData {
    inner: Arc<dyn DataAdapter>,
    writes: Arc<AtomicUsize>,
}

#[async_trait]
impl DataAdapter for CountingData {
    async fn write(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32, buf: &[u8]) -> CoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(ctx, bkt_id, id, sn, buf).await
    }

    async fn read(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32) -> CoreResult<Bytes> {
        self.inner.read(ctx, bkt_id, id, sn).await
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
        self.inner.read_range(ctx, bkt_id, id, sn, offset, size).await
    }

    async fn size(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32) -> CoreResult<u64> {
        self.inner.size(ctx, bkt_id, id, sn).await
    }

    async fn scan(&self, ctx: &Ctx, bkt_id: i64) -> CoreResult<Vec<StoredChunk>> {
        self.inner.scan(ctx, bkt_id).await
    }

    async fn remove(&self, ctx: &Ctx, bkt_id: i64, id: i64, sn: i32) -> CoreResult<()> {
        self.inner.remove(ctx, bkt_id, id, sn).await
    }

    fn configure(&self, opt: Options) {
        self.inner.configure(opt)
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

fn named(name: &str, pid: i64) -> ObjectInfo {
    ObjectInfo {
        pid,
        name: name.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_empty_content_never_touches_data_store() {
    let writes = Arc::new(AtomicUsize::new(0));
    let counter = writes.clone();
    let s = store_with(Arc::new(AllowAll), move |inner| -> Arc<dyn DataAdapter> {
        Arc::new(CountingData {
            inner,
            writes: counter,
        })
    })
    .await;
    let ctx = ctx();

    let refs = s
        .handler
        .ref_data(&ctx, BKT, &[DataInfo::from_bytes(b"")])
        .await
        .unwrap();
    assert_eq!(refs, vec![EMPTY_DATA_ID]);

    let id = s
        .handler
        .put_data(&ctx, BKT, 0, -1, Bytes::new())
        .await
        .unwrap();
    assert_eq!(id, EMPTY_DATA_ID);
    assert_eq!(writes.load(Ordering::SeqCst), 0);

    let bytes = s
        .handler
        .get_data(&ctx, BKT, EMPTY_DATA_ID, -1, ReadSpec::WholeSlice)
        .await
        .unwrap();
    assert!(bytes.is_empty());
    assert_eq!(
        s.handler.file_size(&ctx, BKT, EMPTY_DATA_ID, -1).await.unwrap(),
        0
    );

    let err = s
        .handler
        .put_data(&ctx, BKT, EMPTY_DATA_ID, -1, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));

    s.handler
        .put_data(&ctx, BKT, 0, -1, Bytes::from_static(b"x"))
        .await
        .unwrap();
    assert_eq!(writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dedup_pre_check_and_full_check() {
    let s = store().await;
    let ctx = ctx();

    let content = b"hello dedup ".repeat(1000);
    let info = DataInfo::from_bytes(&content);
    let pre = info.to_pre_check();

    // Nothing committed yet: both checks say upload.
    let refs = s
        .handler
        .ref_data(&ctx, BKT, &[pre.clone(), info.clone()])
        .await
        .unwrap();
    assert_eq!(refs, vec![0, 0]);

    let id = s
        .handler
        .put_data(&ctx, BKT, 0, -1, Bytes::from(content.clone()))
        .await
        .unwrap();
    let committed = s
        .handler
        .put_data_info(&ctx, BKT, vec![DataInfo { id, ..info.clone() }])
        .await
        .unwrap();
    assert_eq!(committed, vec![id]);

    let refs = s
        .handler
        .ref_data(&ctx, BKT, &[pre, info.clone()])
        .await
        .unwrap();
    assert_eq!(refs, vec![id, id]);

    // Same length and header, different tail: a pre-check candidate that the
    // full check rejects.
    let mut other = content.clone();
    let last = other.len() - 1;
    other[last] ^= 0xff;
    let other_info = DataInfo::from_bytes(&other);
    assert_eq!(other_info.hdr_crc32, info.hdr_crc32);
    let refs = s
        .handler
        .ref_data(&ctx, BKT, &[other_info.to_pre_check(), other_info])
        .await
        .unwrap();
    assert_eq!(refs, vec![id, 0]);

    let stored = s.handler.get_data_info(&ctx, BKT, id).await.unwrap();
    assert_eq!(stored.md5, info.md5);
    assert_eq!(stored.size, content.len() as i64);
}

#[tokio::test]
async fn test_dedup_is_scoped_to_bucket() {
    let s = store().await;
    let ctx = ctx();
    s.handler
        .put_buckets(
            &ctx,
            &[BucketInfo {
                id: 2,
                name: "second".into(),
                uid: 7,
                kind: 0,
            }],
        )
        .await
        .unwrap();

    let info = DataInfo {
        id: 0,
        ..DataInfo::from_bytes(b"shared bytes")
    };
    s.handler
        .put_data_info(&ctx, BKT, vec![info.clone()])
        .await
        .unwrap();

    let refs = s.handler.ref_data(&ctx, 2, &[info]).await.unwrap();
    assert_eq!(refs, vec![0]);
}

#[tokio::test]
async fn test_put_data_info_assigns_missing_ids() {
    let s = store().await;
    let ctx = ctx();
    let ids = s
        .handler
        .put_data_info(
            &ctx,
            BKT,
            vec![
                DataInfo::from_bytes(b"one"),
                DataInfo {
                    id: 77,
                    ..DataInfo::from_bytes(b"two")
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] > 0);
    assert_eq!(ids[1], 77);

    let err = s.handler.get_data_info(&ctx, BKT, 78).await.unwrap_err();
    assert!(matches!(err, CoreError::DataNotFound { .. }));
}

#[tokio::test]
async fn test_range_reads_match_whole_slice() {
    let s = store().await;
    let ctx = ctx();

    let content: Vec<u8> = (0..10_240u32).map(|i| (i % 251) as u8).collect();
    let id = s
        .handler
        .put_data(&ctx, BKT, 0, 0, Bytes::from(content.clone()))
        .await
        .unwrap();

    let whole = s
        .handler
        .get_data(&ctx, BKT, id, 0, ReadSpec::WholeSlice)
        .await
        .unwrap();
    assert_eq!(whole.as_ref(), content.as_slice());

    let bounded = s
        .handler
        .get_data(
            &ctx,
            BKT,
            id,
            0,
            ReadSpec::BoundedRange {
                offset: 100,
                size: 50,
            },
        )
        .await
        .unwrap();
    assert_eq!(bounded.as_ref(), &content[100..150]);

    let tail = s
        .handler
        .get_data(&ctx, BKT, id, 0, ReadSpec::FromOffset(10_000))
        .await
        .unwrap();
    assert_eq!(tail.as_ref(), &content[10_000..]);

    let truncated = s
        .handler
        .get_data(
            &ctx,
            BKT,
            id,
            0,
            ReadSpec::BoundedRange {
                offset: 10_200,
                size: 100,
            },
        )
        .await
        .unwrap();
    assert_eq!(truncated.len(), 40);

    assert_eq!(
        s.handler.file_size(&ctx, BKT, id, 0).await.unwrap(),
        content.len() as u64
    );

    let err = s
        .handler
        .get_data(&ctx, BKT, id, 0, ReadSpec::FromOffset(20_000))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));

    let err = s
        .handler
        .get_data(
            &ctx,
            BKT,
            id,
            0,
            ReadSpec::BoundedRange { offset: 0, size: 0 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));

    let err = s
        .handler
        .get_data(&ctx, BKT, id, 1, ReadSpec::WholeSlice)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DataNotFound { sn: 1, .. }));
}

#[tokio::test]
async fn test_put_data_rejects_bad_sn() {
    let s = store().await;
    let err = s
        .handler
        .put_data(&ctx(), BKT, 0, -2, Bytes::from_static(b"abc"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
}

#[tokio::test]
async fn test_forward_references_resolve_within_batch() {
    let s = store().await;
    let ctx = ctx();

    let batch = vec![
        ObjectInfo {
            typ: ObjectType::Dir,
            ..named("docs", 0)
        },
        named("readme.md", -1),
        ObjectInfo {
            typ: ObjectType::Version,
            ..named("readme.md.v1", -2)
        },
    ];
    let ids = s.handler.put(&ctx, BKT, batch).await.unwrap();
    assert_eq!(ids.len(), 3);

    let got = s.handler.get(&ctx, BKT, &ids).await.unwrap();
    assert_eq!(got[0].pid, 0);
    assert_eq!(got[1].pid, ids[0]);
    assert_eq!(got[2].pid, ids[1]);
    assert!(got.iter().all(|o| o.mtime > 0));

    // Out-of-range reference rejects the whole batch.
    let err = s
        .handler
        .put(&ctx, BKT, vec![named("a", 0), named("b", -5)])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
    let page = s
        .handler
        .list(&ctx, BKT, 0, &ListOptions::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn test_get_keeps_request_order_and_skips_unknown() {
    let s = store().await;
    let ctx = ctx();
    let ids = s
        .handler
        .put(&ctx, BKT, vec![named("a", 0), named("b", 0)])
        .await
        .unwrap();

    let got = s
        .handler
        .get(&ctx, BKT, &[ids[1], 12345, ids[0]])
        .await
        .unwrap();
    let names: Vec<_> = got.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["b", "a"]);
}

#[tokio::test]
async fn test_names_unique_among_siblings() {
    let s = store().await;
    let ctx = ctx();

    let ids = s
        .handler
        .put(&ctx, BKT, vec![named("a.txt", 0), named("b.txt", 0)])
        .await
        .unwrap();

    let err = s
        .handler
        .put(&ctx, BKT, vec![named("a.txt", 0)])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let err = s
        .handler
        .rename(&ctx, BKT, ids[1], "a.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    // Same name under another parent is fine.
    s.handler
        .put(&ctx, BKT, vec![named("a.txt", ids[0])])
        .await
        .unwrap();

    s.handler.rename(&ctx, BKT, ids[1], "c.txt").await.unwrap();
    let got = s.handler.get(&ctx, BKT, &[ids[1]]).await.unwrap();
    assert_eq!(got[0].name, "c.txt");

    let err = s.handler.rename(&ctx, BKT, 999, "z").await.unwrap_err();
    assert!(matches!(err, CoreError::ObjectNotFound { id: 999, .. }));
}

#[tokio::test]
async fn test_move_to_changes_parent() {
    let s = store().await;
    let ctx = ctx();
    let ids = s
        .handler
        .put(
            &ctx,
            BKT,
            vec![
                ObjectInfo {
                    typ: ObjectType::Dir,
                    ..named("dir", 0)
                },
                named("f", 0),
            ],
        )
        .await
        .unwrap();

    s.handler.move_to(&ctx, BKT, ids[1], ids[0]).await.unwrap();
    let page = s
        .handler
        .list(&ctx, BKT, ids[0], &ListOptions::default())
        .await
        .unwrap();
    assert_eq!(page.objects.len(), 1);
    assert_eq!(page.objects[0].id, ids[1]);

    let err = s.handler.move_to(&ctx, BKT, ids[0], ids[0]).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
}

#[tokio::test]
async fn test_move_under_own_descendant_rejected() {
    let s = store().await;
    let ctx = ctx();
    let dir = |name: &str, pid: i64| ObjectInfo {
        typ: ObjectType::Dir,
        ..named(name, pid)
    };
    // a/b/c
    let ids = s
        .handler
        .put(&ctx, BKT, vec![dir("a", 0), dir("b", -1), dir("c", -2)])
        .await
        .unwrap();

    for target in [ids[1], ids[2]] {
        let err = s.handler.move_to(&ctx, BKT, ids[0], target).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }
    let got = s.handler.get(&ctx, BKT, &[ids[0]]).await.unwrap();
    assert_eq!(got[0].pid, 0);

    // Moving up the tree is fine.
    s.handler.move_to(&ctx, BKT, ids[2], ids[0]).await.unwrap();
    s.handler.move_to(&ctx, BKT, ids[1], ids[2]).await.unwrap();
    let got = s.handler.get(&ctx, BKT, &[ids[1]]).await.unwrap();
    assert_eq!(got[0].pid, ids[2]);
}

#[tokio::test]
async fn test_negative_sizes_rejected() {
    let s = store().await;
    let ctx = ctx();
    let bad = DataInfo {
        size: -5,
        hdr_crc32: 1,
        ..Default::default()
    };
    let empty = DataInfo::default();

    let err = s
        .handler
        .ref_data(&ctx, BKT, &[empty.clone(), bad.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));

    let good = DataInfo {
        id: 77,
        ..DataInfo::from_bytes(b"fine")
    };
    let err = s
        .handler
        .put_data_info(&ctx, BKT, vec![good, bad])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
    // Nothing from the batch was committed.
    let err = s.handler.get_data_info(&ctx, BKT, 77).await.unwrap_err();
    assert!(matches!(err, CoreError::DataNotFound { .. }));

    assert_eq!(
        s.handler.ref_data(&ctx, BKT, &[empty]).await.unwrap(),
        vec![EMPTY_DATA_ID]
    );
}

#[tokio::test]
async fn test_status_only_moves_forward() {
    let s = store().await;
    let ctx = ctx();
    let ids = s
        .handler
        .put(&ctx, BKT, vec![named("a", 0), named("b", 0)])
        .await
        .unwrap();

    s.handler.recycle(&ctx, BKT, ids[0]).await.unwrap();
    // Repeating a transition is a no-op.
    s.handler.recycle(&ctx, BKT, ids[0]).await.unwrap();
    s.handler.delete(&ctx, BKT, ids[0]).await.unwrap();
    s.handler.delete(&ctx, BKT, ids[0]).await.unwrap();

    let err = s.handler.recycle(&ctx, BKT, ids[0]).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));

    let got = s.handler.get(&ctx, BKT, &ids).await.unwrap();
    assert_eq!(got[0].status, ObjectStatus::Deleted);
    assert_eq!(got[1].status, ObjectStatus::Active);

    let page = s
        .handler
        .list(&ctx, BKT, 0, &ListOptions::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.objects[0].id, ids[1]);

    let err = s.handler.delete(&ctx, BKT, 4242).await.unwrap_err();
    assert!(matches!(err, CoreError::ObjectNotFound { .. }));
}

#[tokio::test]
async fn test_unknown_bucket_rejected() {
    let s = store().await;
    let err = s
        .handler
        .put(&ctx(), 99, vec![named("a", 0)])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::BucketNotFound(99)));
}

#[tokio::test]
async fn test_bucket_names_unique() {
    let s = store().await;
    let ctx = ctx();
    let err = s
        .handler
        .put_buckets(
            &ctx,
            &[BucketInfo {
                id: 5,
                name: "default".into(),
                uid: 0,
                kind: 0,
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let buckets = s.handler.list_buckets(&ctx).await.unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].id, BKT);
}

#[tokio::test]
async fn test_read_only_store_rejects_writes() {
    let s = store_with(Arc::new(ReadOnly), |data| data).await;
    let ctx = ctx();

    let err = s
        .handler
        .put_data(&ctx, BKT, 0, -1, Bytes::from_static(b"abc"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));

    let err = s
        .handler
        .put(&ctx, BKT, vec![named("a", 0)])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));

    let page = s
        .handler
        .list(&ctx, BKT, 0, &ListOptions::default())
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

/// Layer that records its tag on `list_buckets` and delegates everything.
struct Tag {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Layer for Tag {
    fn wrap(&self, inner: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(Tagged {
            tag: self.tag,
            log: self.log.clone(),
            inner,
        })
    }
}

struct Tagged {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for Tagged {
    async fn close(&self) {
        self.inner.close().await
    }

    fn configure(&self, opt: Options) {
        self.inner.configure(opt)
    }

    async fn put_buckets(&self, ctx: &Ctx, buckets: &[BucketInfo]) -> CoreResult<()> {
        self.inner.put_buckets(ctx, buckets).await
    }

    async fn list_buckets(&self, ctx: &Ctx) -> CoreResult<Vec<BucketInfo>> {
        self.log.lock().unwrap().push(self.tag);
        self.inner.list_buckets(ctx).await
    }

    async fn ref_data(&self, ctx: &Ctx, bkt_id: i64, chunks: &[DataInfo]) -> CoreResult<Vec<i64>> {
        self.inner.ref_data(ctx, bkt_id, chunks).await
    }

    async fn put_data(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        data_id: i64,
        sn: i32,
        buf: Bytes,
    ) -> CoreResult<i64> {
        self.inner.put_data(ctx, bkt_id, data_id, sn, buf).await
    }

    async fn get_data(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        id: i64,
        sn: i32,
        read: ReadSpec,
    ) -> CoreResult<Bytes> {
        self.inner.get_data(ctx, bkt_id, id, sn, read).await
    }

    async fn put_data_info(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        chunks: Vec<DataInfo>,
    ) -> CoreResult<Vec<i64>> {
        self.inner.put_data_info(ctx, bkt_id, chunks).await
    }

    async fn get_data_info(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<DataInfo> {
        self.inner.get_data_info(ctx, bkt_id, id).await
    }

    async fn file_size(&self, ctx: &Ctx, bkt_id: i64, data_id: i64, sn: i32) -> CoreResult<u64> {
        self.inner.file_size(ctx, bkt_id, data_id, sn).await
    }

    async fn put(&self, ctx: &Ctx, bkt_id: i64, objects: Vec<ObjectInfo>) -> CoreResult<Vec<i64>> {
        self.inner.put(ctx, bkt_id, objects).await
    }

    async fn get(&self, ctx: &Ctx, bkt_id: i64, ids: &[i64]) -> CoreResult<Vec<ObjectInfo>> {
        self.inner.get(ctx, bkt_id, ids).await
    }

    async fn list(
        &self,
        ctx: &Ctx,
        bkt_id: i64,
        pid: i64,
        opt: &ListOptions,
    ) -> CoreResult<ListPage> {
        self.inner.list(ctx, bkt_id, pid, opt).await
    }

    async fn rename(&self, ctx: &Ctx, bkt_id: i64, id: i64, name: &str) -> CoreResult<()> {
        self.inner.rename(ctx, bkt_id, id, name).await
    }

    async fn move_to(&self, ctx: &Ctx, bkt_id: i64, id: i64, pid: i64) -> CoreResult<()> {
        self.inner.move_to(ctx, bkt_id, id, pid).await
    }

    async fn recycle(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<()> {
        self.inner.recycle(ctx, bkt_id, id).await
    }

    async fn delete(&self, ctx: &Ctx, bkt_id: i64, id: i64) -> CoreResult<()> {
        self.inner.delete(ctx, bkt_id, id).await
    }
}

#[tokio::test]
async fn test_layers_wrap_outward_in_insertion_order() {
    let s = store().await;
    let log = Arc::new(Mutex::new(Vec::new()));

    let handler = HandlerBuilder::new(s.handler.clone())
        .layer(Tag {
            tag: "inner",
            log: log.clone(),
        })
        .layer(TraceLayer)
        .layer(Tag {
            tag: "outer",
            log: log.clone(),
        })
        .build();

    let buckets = handler.list_buckets(&ctx()).await.unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
}
