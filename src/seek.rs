// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Skip/seek of already-consumed documents on a freshly resumed cursor.
//!
//! Servers page by byte count, so resuming from a server token re-fetches
//! the page around the resume point and the head of the stream overlaps
//! documents the client already saw. This module drains that overlap before
//! the cursor joins the merge.

use std::cmp::Ordering;

use snafu::ensure;
use tracing::warn;

use crate::container::QueryExecutionInfo;
use crate::continuation::ResumeKey;
use crate::cursor::{CursorStatus, PartitionCursor};
use crate::error::{MalformedContinuationSnafu, Result};
use crate::metrics::{
    ORDERBY_FILTERED_ROWS_TOTAL, FILTER_REASON_OUT_OF_ORDER, FILTER_REASON_RESUME,
};
use crate::query::{SortKey, SortOrder};
use crate::rid::ResourceId;
use crate::value::Value;

/// Compares the resume tuple against a document's sort values, adjusted per
/// column for the sort direction. The first non-equal column decides.
///
/// `Less` means the document is strictly beyond the resume point.
pub(crate) fn compare_resume_point(
    sort_key: &SortKey,
    resume_values: &[Value],
    doc_values: &[Value],
) -> Ordering {
    for ((column, resume), doc) in sort_key
        .columns()
        .iter()
        .zip(resume_values)
        .zip(doc_values)
    {
        let ordering = column.order.adjust(resume.cmp(doc));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Whether the rid comparison must be flipped for this cursor.
///
/// A page carrying execution info selects the server-provided hints; a page
/// without one comes from a legacy server whose rid scan follows the first
/// sort direction.
fn reverse_rid_scan(info: Option<&QueryExecutionInfo>, sort_key: &SortKey) -> bool {
    match info {
        Some(info) => info.reverse_rid_enabled || info.reverse_index_scan,
        None => sort_key.columns()[0].order == SortOrder::Desc,
    }
}

/// Drains a freshly resumed cursor until its head is strictly beyond the
/// resume key.
///
/// Documents before the resume tuple are dropped. On a sort-key tie the rid
/// decides: smaller rids were already consumed, and of the documents with
/// the resume rid itself exactly `skip_count` occurrences are dropped.
/// The cursor may legitimately drain to exhaustion while skipping.
pub(crate) async fn seek_to_resume_point(
    cursor: &mut PartitionCursor,
    key: &ResumeKey,
    sort_key: &SortKey,
) -> Result<CursorStatus> {
    let resume_rid = ResourceId::parse(&key.rid)?;
    let mut remaining_skips = i64::from(key.skip_count);

    loop {
        match cursor.fill().await? {
            CursorStatus::Ready => {}
            status => return Ok(status),
        }
        // Safety: fill() returned Ready, so the cursor has a head.
        let head = cursor.head().unwrap();

        match compare_resume_point(sort_key, &key.sort_values, &head.sort_values) {
            Ordering::Less => break,
            Ordering::Greater => {
                // Not reachable when the server replays from its own token,
                // yet harmless to drop: anything before the resume tuple was
                // already consumed.
                warn!(
                    "Document {} of range {} arrived before the resume point",
                    head.rid,
                    cursor.range()
                );
                ORDERBY_FILTERED_ROWS_TOTAL
                    .with_label_values(&[FILTER_REASON_OUT_OF_ORDER])
                    .inc();
                match cursor.discard_head().await? {
                    CursorStatus::Ready => {}
                    status => return Ok(status),
                }
            }
            Ordering::Equal => {
                let rid = ResourceId::parse(&head.rid)?;
                ensure!(
                    rid.same_scope(&resume_rid),
                    MalformedContinuationSnafu {
                        reason: format!(
                            "document rid {} does not share the resume rid scope {}",
                            head.rid, key.rid
                        ),
                    }
                );
                let mut rid_ordering = rid.document().cmp(&resume_rid.document());
                if reverse_rid_scan(cursor.execution_info(), sort_key) {
                    rid_ordering = rid_ordering.reverse();
                }

                let drop_head = match rid_ordering {
                    Ordering::Less => true,
                    Ordering::Equal if remaining_skips > 0 => {
                        remaining_skips -= 1;
                        true
                    }
                    _ => false,
                };
                if !drop_head {
                    break;
                }
                ORDERBY_FILTERED_ROWS_TOTAL
                    .with_label_values(&[FILTER_REASON_RESUME])
                    .inc();
                match cursor.discard_head().await? {
                    CursorStatus::Ready => {}
                    status => return Ok(status),
                }
            }
        }
    }
    Ok(CursorStatus::Ready)
}
