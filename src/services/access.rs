//! Per-call context and the access-control seam consulted by the adapters.

use crate::errors::{CoreError, CoreResult};
use uuid::Uuid;

/// Caller context threaded through every handler and adapter call.
#[derive(Clone, Debug)]
pub struct Ctx {
    /// Calling user; 0 for internal callers such as the garbage collector.
    pub uid: i64,
    pub request_id: Uuid,
}

impl Ctx {
    pub fn new(uid: i64) -> Self {
        Self {
            uid,
            request_id: Uuid::new_v4(),
        }
    }

    /// Context used by background maintenance tasks.
    pub fn system() -> Self {
        Self::new(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Policy engine deciding whether a caller may touch a bucket.
pub trait AccessControl: Send + Sync {
    fn check(&self, ctx: &Ctx, bkt_id: i64, access: Access) -> CoreResult<()>;
}

/// Grants everything; the default when no policy engine is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check(&self, _ctx: &Ctx, _bkt_id: i64, _access: Access) -> CoreResult<()> {
        Ok(())
    }
}

/// Rejects writes for everyone. Useful for serving a replica.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadOnly;

impl AccessControl for ReadOnly {
    fn check(&self, _ctx: &Ctx, bkt_id: i64, access: Access) -> CoreResult<()> {
        match access {
            Access::Read => Ok(()),
            Access::Write => Err(CoreError::Forbidden(format!(
                "bucket `{bkt_id}` is read-only"
            ))),
        }
    }
}
