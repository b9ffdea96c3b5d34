//! Identifier source used for chunk and object ids.

use crate::errors::{CoreError, CoreResult};
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Produces process-wide unique, positive 64-bit ids.
pub trait IdentifierSource: Send + Sync {
    fn new_id(&self) -> CoreResult<i64>;
}

/// 2024-01-01T00:00:00Z in unix milliseconds.
const EPOCH_MS: i64 = 1_704_067_200_000;
const NODE_BITS: u32 = 10;
const SEQ_BITS: u32 = 12;
pub const MAX_NODE: u16 = (1 << NODE_BITS) - 1;

/// Snowflake-style generator: `millis << 22 | seq << 10 | node`.
///
/// Ids from one node are strictly increasing. When more than 4096 ids are
/// requested within a millisecond the sequence carries into the timestamp
/// bits, borrowing from the future instead of repeating a value.
#[derive(Debug)]
pub struct SnowflakeIdSource {
    node: i64,
    last: AtomicI64,
}

impl SnowflakeIdSource {
    pub fn new(node: u16) -> CoreResult<Self> {
        if node > MAX_NODE {
            return Err(CoreError::InvalidInput(format!(
                "node id {node} exceeds {MAX_NODE}"
            )));
        }
        Ok(Self {
            node: i64::from(node),
            last: AtomicI64::new(0),
        })
    }

    fn candidate(&self) -> i64 {
        let millis = Utc::now().timestamp_millis() - EPOCH_MS;
        (millis << (SEQ_BITS + NODE_BITS)) | self.node
    }
}

impl IdentifierSource for SnowflakeIdSource {
    fn new_id(&self) -> CoreResult<i64> {
        let candidate = self.candidate();
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                let bumped = if last == 0 { 0 } else { last + (1 << NODE_BITS) };
                Some(candidate.max(bumped))
            })
            .map_err(|_| CoreError::IdExhausted)?;
        let id = if prev == 0 {
            candidate
        } else {
            candidate.max(prev + (1 << NODE_BITS))
        };
        if id <= 0 {
            return Err(CoreError::IdExhausted);
        }
        Ok(id)
    }
}
