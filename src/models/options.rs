//! Request options: listing filters, read ranges and adapter tuning.

use crate::errors::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Default and upper bound for `ListOptions::count`.
pub const MAX_LIST_COUNT: i64 = 1000;

/// Filters and paging for `Handler::list`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ListOptions {
    /// Name filter; `*` and `?` are wildcards.
    pub word: String,
    /// Continuation token returned by the previous call, passed back verbatim.
    pub delim: String,
    /// 0: all, 1: dir, 2: file, 3: version, 4: preview.
    #[serde(rename = "type")]
    pub typ: i32,
    /// Page size; non-positive means the default.
    pub count: i64,
    /// `id`, `mtime`, `name`, `size` or `type`, prefixed with `+` (default) or `-`.
    pub order: String,
    /// Response trimming, only honoured by the transport layer.
    pub brief: i32,
    /// Groups children whose name contains it into one common-prefix entry.
    pub separator: Option<String>,
}

impl ListOptions {
    pub fn page_size(&self) -> i64 {
        if self.count <= 0 {
            MAX_LIST_COUNT
        } else {
            self.count.min(MAX_LIST_COUNT)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderField {
    Id,
    Mtime,
    Name,
    Size,
    Type,
}

impl OrderField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Mtime => "mtime",
            Self::Name => "name",
            Self::Size => "size",
            Self::Type => "typ",
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Mtime => "mtime",
            Self::Name => "name",
            Self::Size => "size",
            Self::Type => "type",
        }
    }
}

/// Parsed form of `ListOptions::order`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub field: OrderField,
    pub desc: bool,
}

impl OrderBy {
    pub fn parse(text: &str) -> CoreResult<Self> {
        let text = text.trim();
        let (desc, name) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        let field = match name {
            "" | "id" => OrderField::Id,
            "mtime" => OrderField::Mtime,
            "name" => OrderField::Name,
            "size" => OrderField::Size,
            "type" => OrderField::Type,
            other => {
                return Err(CoreError::InvalidInput(format!(
                    "unknown order field `{other}`"
                )));
            }
        };
        Ok(Self { field, desc })
    }

    /// Canonical text form, embedded in continuation tokens.
    pub fn canonical(&self) -> String {
        format!("{}{}", if self.desc { '-' } else { '+' }, self.field.keyword())
    }

    pub fn direction(&self) -> &'static str {
        if self.desc { "DESC" } else { "ASC" }
    }
}

/// Response trimming levels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Brief {
    #[default]
    Full,
    WithoutExt,
    IdOnly,
}

impl From<i32> for Brief {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::WithoutExt,
            2 => Self::IdOnly,
            _ => Self::Full,
        }
    }
}

/// Which part of a stored slice to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadSpec {
    WholeSlice,
    FromOffset(u64),
    BoundedRange { offset: u64, size: u64 },
}

impl ReadSpec {
    pub fn from_parts(offset: Option<u64>, size: Option<u64>) -> CoreResult<Self> {
        match (offset, size) {
            (None, None) => Ok(Self::WholeSlice),
            (Some(offset), None) => Ok(Self::FromOffset(offset)),
            (offset, Some(size)) => Ok(Self::BoundedRange {
                offset: offset.unwrap_or(0),
                size,
            }),
        }
    }
}

/// Tuning options forwarded to the data adapter.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Options {
    /// fsync every chunk before it is renamed into place.
    pub sync_writes: bool,
}
