//! Listing helpers shared by metadata adapters: wildcard translation,
//! continuation tokens and common-prefix grouping.

use crate::{
    errors::{CoreError, CoreResult},
    models::{ObjectInfo, ObjectStatus, ObjectType, OrderBy, OrderField},
};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Largest code point; sorts after every other UTF-8 string byte-wise.
const MAX_CHAR: char = '\u{10FFFF}';

/// Translate a `*`/`?` name filter to an SQLite `GLOB` pattern.
///
/// `GLOB` already uses `*` and `?`; only the character-class opener needs
/// escaping so `[` in a name matches literally.
pub fn glob_pattern(word: &str) -> String {
    word.replace('[', "[[]")
}

/// Position after the last row of a page, in the page's sort order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    /// Canonical order the token was minted for.
    pub order: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Cursor {
    /// Cursor positioned just after `obj`.
    pub fn after(order: &OrderBy, obj: &ObjectInfo) -> Self {
        let mut cursor = Self {
            order: order.canonical(),
            id: obj.id,
            int: None,
            text: None,
        };
        match order.field {
            OrderField::Id => {}
            OrderField::Mtime => cursor.int = Some(obj.mtime),
            OrderField::Size => cursor.int = Some(obj.size),
            OrderField::Type => cursor.int = Some(i64::from(i32::from(obj.typ))),
            OrderField::Name => cursor.text = Some(obj.name.clone()),
        }
        cursor
    }

    /// Cursor positioned after every name starting with `prefix`. Only
    /// meaningful when ordering by name.
    pub fn after_prefix(order: &OrderBy, prefix: &str) -> Self {
        let (text, id) = if order.desc {
            (prefix.to_string(), i64::MIN)
        } else {
            (format!("{prefix}{MAX_CHAR}"), i64::MAX)
        };
        Self {
            order: order.canonical(),
            id,
            int: None,
            text: Some(text),
        }
    }

    pub fn encode(&self) -> String {
        let raw = serde_json::to_vec(self).unwrap_or_default();
        general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode a token and check it belongs to `order`.
    pub fn decode(token: &str, order: &OrderBy) -> CoreResult<Self> {
        let raw = general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|err| CoreError::InvalidInput(format!("bad continuation token: {err}")))?;
        let cursor: Self = serde_json::from_slice(&raw)
            .map_err(|err| CoreError::InvalidInput(format!("bad continuation token: {err}")))?;
        if cursor.order != order.canonical() {
            return Err(CoreError::InvalidInput(format!(
                "continuation token was issued for order `{}`",
                cursor.order
            )));
        }
        let has_key = match order.field {
            OrderField::Id => true,
            OrderField::Name => cursor.text.is_some(),
            _ => cursor.int.is_some(),
        };
        if !has_key {
            return Err(CoreError::InvalidInput(
                "continuation token is missing its sort key".into(),
            ));
        }
        Ok(cursor)
    }
}

/// Compute the synthetic common prefix of `name`.
///
/// Returns `Some(prefix)` including the separator when `name` contains the
/// separator after its first character, otherwise `None`.
pub fn compute_common_prefix(name: &str, separator: &str) -> Option<String> {
    if separator.is_empty() {
        return None;
    }
    match name.find(separator) {
        Some(pos) if pos > 0 => Some(name[..pos + separator.len()].to_string()),
        _ => None,
    }
}

/// Collapse entries sharing a common prefix into one synthetic directory
/// entry (id 0), keeping first-seen order. Returns the grouped page and the
/// prefix the last input row was folded into, if any.
pub fn group_common_prefixes(
    rows: Vec<ObjectInfo>,
    pid: i64,
    separator: &str,
) -> (Vec<ObjectInfo>, Option<String>) {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(rows.len());
    let mut last_prefix = None;
    for obj in rows {
        match compute_common_prefix(&obj.name, separator) {
            Some(prefix) => {
                if seen.insert(prefix.clone()) {
                    out.push(ObjectInfo {
                        id: 0,
                        pid,
                        typ: ObjectType::Dir,
                        status: ObjectStatus::Active,
                        name: prefix.clone(),
                        ..Default::default()
                    });
                }
                last_prefix = Some(prefix);
            }
            None => {
                out.push(obj);
                last_prefix = None;
            }
        }
    }
    (out, last_prefix)
}
