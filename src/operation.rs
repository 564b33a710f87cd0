use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of edit an [`Operation`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Insert,
    Delete,
    Replace,
}

/// A single edit against a document snapshot.
///
/// `position` and `length` are character offsets into the content *as it exists
/// immediately before this operation applies*, with operation lists applied
/// left to right. Insert carries `length == 0`; Delete and Replace require
/// `position + length` to stay within the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub position: usize,
    pub length: usize,
    pub content: String,
}

impl Operation {
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Insert,
            position,
            length: 0,
            content: content.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self {
            kind: OperationKind::Delete,
            position,
            length,
            content: String::new(),
        }
    }

    pub fn replace(position: usize, length: usize, content: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Replace,
            position,
            length,
            content: content.into(),
        }
    }

    /// Characters this operation inserts.
    pub fn inserted_len(&self) -> usize {
        match self.kind {
            OperationKind::Delete => 0,
            OperationKind::Insert | OperationKind::Replace => self.content.chars().count(),
        }
    }

    /// Characters this operation removes.
    pub fn deleted_len(&self) -> usize {
        match self.kind {
            OperationKind::Insert => 0,
            OperationKind::Delete | OperationKind::Replace => self.length,
        }
    }

    /// True if applying this operation would leave the content unchanged.
    pub fn is_noop(&self) -> bool {
        self.inserted_len() == 0 && self.deleted_len() == 0
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OperationKind::Insert => write!(f, "insert {:?} at {}", self.content, self.position),
            OperationKind::Delete => write!(f, "delete {} at {}", self.length, self.position),
            OperationKind::Replace => {
                write!(f, "replace {} at {} with {:?}", self.length, self.position, self.content)
            }
        }
    }
}

/// Operation bounds do not fit the content they were applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeError {
    pub position: usize,
    pub length: usize,
    pub content_len: usize,
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "range {}..{} out of bounds for content of {} chars",
            self.position,
            self.position.saturating_add(self.length),
            self.content_len
        )
    }
}

impl std::error::Error for RangeError {}

/// A batch failed partway; no part of it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchApplyError {
    /// Index of the operation that failed within the batch.
    pub index: usize,
    /// The operation that failed.
    pub operation: Operation,
    pub cause: RangeError,
}

impl fmt::Display for BatchApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch aborted at operation {} ({}): {}",
            self.index, self.operation, self.cause
        )
    }
}

impl std::error::Error for BatchApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `chars`-th character. Caller checks bounds first.
fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map(|(i, _)| i).unwrap_or(s.len())
}

/// Apply one operation to `content`, producing the new content.
pub fn apply(content: &str, op: &Operation) -> Result<String, RangeError> {
    let total = char_len(content);
    let out_of_bounds = || RangeError {
        position: op.position,
        length: op.length,
        content_len: total,
    };

    match op.kind {
        OperationKind::Insert => {
            if op.length != 0 || op.position > total {
                return Err(out_of_bounds());
            }
            let at = byte_offset(content, op.position);
            let mut out = String::with_capacity(content.len() + op.content.len());
            out.push_str(&content[..at]);
            out.push_str(&op.content);
            out.push_str(&content[at..]);
            Ok(out)
        }
        OperationKind::Delete | OperationKind::Replace => {
            // checked_add: a decoded remote operation can carry arbitrary
            // position/length values.
            let op_end = match op.position.checked_add(op.length) {
                Some(end) if end <= total => end,
                _ => return Err(out_of_bounds()),
            };
            let start = byte_offset(content, op.position);
            let end = byte_offset(content, op_end);
            let replacement = if op.kind == OperationKind::Replace {
                op.content.as_str()
            } else {
                ""
            };
            let mut out =
                String::with_capacity(content.len() - (end - start) + replacement.len());
            out.push_str(&content[..start]);
            out.push_str(replacement);
            out.push_str(&content[end..]);
            Ok(out)
        }
    }
}

/// Fold [`apply`] over an ordered batch. All-or-nothing: a failure partway
/// returns the original content untouched.
pub fn apply_batch(content: &str, ops: &[Operation]) -> Result<String, BatchApplyError> {
    let mut current = content.to_string();
    for (index, op) in ops.iter().enumerate() {
        current = apply(&current, op).map_err(|cause| BatchApplyError {
            index,
            operation: op.clone(),
            cause,
        })?;
    }
    Ok(current)
}

/// Transform a point through the deletion component of a concurrent operation.
///
/// A point inside the deleted range clamps to the range start.
fn transform_point(p: usize, at: usize, deleted: usize, p_first_on_tie: bool) -> usize {
    if p < at || (p == at && p_first_on_tie) {
        return p;
    }
    if p >= at.saturating_add(deleted) {
        p - deleted
    } else {
        at
    }
}

/// Rebase `op` as if the server-accepted `other` (acting on the same base
/// content) had already been applied.
///
/// Two inserts at the same position are ordered by comparing user ids
/// lexicographically; the lower id is treated as having happened first, which
/// gives every client the same answer without coordination. A Delete/Replace
/// range whose text was displaced by an insert at its start always shifts past
/// the inserted text, regardless of user order; the range names existing text,
/// and the insert moved that text. An insert landing strictly inside a pending
/// Delete/Replace range truncates that range at the insertion point: a single
/// rebased operation cannot straddle the inserted text, and truncation never
/// destroys the other user's insert.
pub fn adjust_for_concurrent(
    op: &Operation,
    other: &Operation,
    op_user: &str,
    other_user: &str,
) -> Operation {
    let op_first_on_tie = op_user <= other_user;
    let deleted = other.deleted_len();
    let inserted = other.inserted_len();

    let mut adjusted = op.clone();

    // Deletion component first; positions below are then in post-delete
    // coordinates, where the insertion point is still `other.position`.
    match op.kind {
        OperationKind::Insert => {
            adjusted.position =
                transform_point(op.position, other.position, deleted, op_first_on_tie);
        }
        OperationKind::Delete | OperationKind::Replace => {
            let start =
                transform_point(op.position, other.position, deleted, op_first_on_tie);
            let end = transform_point(
                // Saturating: remote operations arrive unvalidated and are
                // rebased before the apply-time bounds check rejects them.
                op.position.saturating_add(op.length),
                other.position,
                deleted,
                // A concurrent edit exactly at the range end stays outside it.
                true,
            );
            adjusted.position = start;
            adjusted.length = end.saturating_sub(start);
        }
    }

    if inserted > 0 {
        let at = other.position;
        if at < adjusted.position {
            adjusted.position = adjusted.position.saturating_add(inserted);
        } else if at == adjusted.position {
            // Three cases at the insertion point. A range that still covers
            // text shifts past the insert unconditionally. A point insert
            // (Insert, or a Replace whose range the other side consumed)
            // stays ahead of a surviving range's replacement text, and falls
            // back to the user-id order against another point insert.
            if adjusted.length > 0 {
                adjusted.position = adjusted.position.saturating_add(inserted);
            } else {
                let overlap_start = op.position.max(other.position);
                let overlap_end = op
                    .position
                    .saturating_add(op.deleted_len())
                    .min(other.position.saturating_add(deleted));
                let other_range_survives =
                    deleted > overlap_end.saturating_sub(overlap_start);
                if !other_range_survives && !op_first_on_tie {
                    adjusted.position = adjusted.position.saturating_add(inserted);
                }
            }
        } else if at < adjusted.position.saturating_add(adjusted.length) {
            adjusted.length = at - adjusted.position;
        }
    }

    adjusted
}
