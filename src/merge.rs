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

//! K-way merge of per-partition cursors into one globally sorted stream.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use snafu::{ensure, OptionExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::container::{DocumentContainerRef, OrderByRow};
use crate::continuation::{MergeToken, ResumeKey};
use crate::cursor::{CursorStatus, PartitionCursor};
use crate::error::{InternalInvariantSnafu, Result};
use crate::filter::synthesize_filters;
use crate::metrics::{
    ORDERBY_PARTITION_SPLITS_TOTAL, ORDERBY_STAGE_ELAPSED, STAGE_MERGE, STAGE_PRIME,
};
use crate::query::{QuerySpec, SortKey, TRUE_FILTER};
use crate::range::{map_ranges, PartitionRange};
use crate::seek::seek_to_resume_point;

/// Merges the cursors of all live partition ranges.
///
/// Cursors sit in a min-priority queue keyed by their heads, compared over
/// the sort key with the lower range `min` breaking ties. The tie break is
/// what makes the emitted continuation token unambiguous: among equal
/// tuples the leftmost partition is always consumed first, so a strict
/// filter is safe for every range left of the recorded target.
pub(crate) struct MergeStream {
    container: DocumentContainerRef,
    sort_key: Arc<SortKey>,
    fetch_page_size: usize,
    cancel: CancellationToken,
    /// Cursors with a head. Cursors in the heap **must** not be empty.
    heap: BinaryHeap<HeapEntry>,
    metrics: Metrics,
}

impl MergeStream {
    /// Builds one cursor per mapped range and primes them all.
    ///
    /// With a token, ranges are classified around the target and each group
    /// gets its synthesized filter substituted into the query text; without
    /// one every range runs the query with a `true` filter. Cursors whose
    /// range reports a split while priming are replaced by child cursors
    /// carrying the same resume key.
    pub(crate) async fn init(
        container: DocumentContainerRef,
        sort_key: Arc<SortKey>,
        query: &QuerySpec,
        active_ranges: &[PartitionRange],
        token: Option<&MergeToken>,
        fetch_page_size: usize,
        cancel: CancellationToken,
    ) -> Result<MergeStream> {
        let start = Instant::now();
        let mut stream = MergeStream {
            container,
            sort_key,
            fetch_page_size,
            cancel,
            heap: BinaryHeap::with_capacity(active_ranges.len()),
            metrics: Metrics::default(),
        };

        let cursors = match token {
            None => {
                let query = query.rewrite_with_filter(TRUE_FILTER)?;
                active_ranges
                    .iter()
                    .map(|range| stream.new_cursor(range.clone(), query.clone(), None))
                    .collect()
            }
            Some(token) => {
                let mapping = map_ranges(active_ranges, token)?;
                let filters = synthesize_filters(&stream.sort_key, &token.target().sort_values)?;
                let left_query = query.rewrite_with_filter(&filters.left)?;
                let target_query = query.rewrite_with_filter(&filters.target)?;
                let right_query = query.rewrite_with_filter(&filters.right)?;

                let mut cursors = Vec::with_capacity(active_ranges.len());
                for mapped in mapping.left {
                    cursors.push(stream.new_cursor(
                        mapped.range,
                        left_query.clone(),
                        mapped.resume_key,
                    ));
                }
                cursors.push(stream.new_cursor(
                    mapping.target.range,
                    target_query,
                    mapping.target.resume_key,
                ));
                for mapped in mapping.right {
                    cursors.push(stream.new_cursor(
                        mapped.range,
                        right_query.clone(),
                        mapped.resume_key,
                    ));
                }
                cursors
            }
        };

        stream.prime_and_enqueue(cursors).await?;
        stream.metrics.prime_cost += start.elapsed();
        Ok(stream)
    }

    /// Pops the minimum cursor, emits its head, and returns the result along
    /// with the merge token to resume right after it. `None` ends the
    /// stream; the token of the final result is also `None`.
    pub(crate) async fn next_result(&mut self) -> Result<Option<(OrderByRow, Option<MergeToken>)>> {
        let start = Instant::now();
        let Some(mut top) = self.heap.pop() else {
            return Ok(None);
        };

        let (row, status) = top.cursor.pop().await?;
        self.metrics.num_output_rows += 1;
        // The cursor the result was drawn from becomes the target of the
        // token, whether or not it stays live.
        let target_checkpoint = top.cursor.checkpoint();

        match status {
            CursorStatus::Ready => self.heap.push(top),
            CursorStatus::Exhausted => {
                debug!("Cursor for range {} is exhausted", top.cursor.range());
                self.metrics.num_exhausted_cursors += 1;
            }
            CursorStatus::Split => {
                let children = self.split_cursor(top.cursor).await?;
                self.prime_and_enqueue(children).await?;
            }
        }

        let token = self.build_token(target_checkpoint)?;
        self.metrics.scan_cost += start.elapsed();
        Ok(Some((row, token)))
    }

    fn new_cursor(
        &self,
        range: PartitionRange,
        query: QuerySpec,
        seed_key: Option<ResumeKey>,
    ) -> Box<PartitionCursor> {
        Box::new(PartitionCursor::new(
            range,
            query,
            self.container.clone(),
            self.fetch_page_size,
            self.sort_key.len(),
            seed_key,
            self.cancel.clone(),
        ))
    }

    /// Primes every pending cursor and pushes the ones that end up with a
    /// head. A cursor constructed with a resume key first seeks past it; a
    /// split while priming replaces the cursor with its children on the
    /// work list.
    async fn prime_and_enqueue(&mut self, cursors: Vec<Box<PartitionCursor>>) -> Result<()> {
        let mut pending: VecDeque<_> = cursors.into();
        while let Some(mut cursor) = pending.pop_front() {
            let status = match cursor.seed_key().cloned() {
                Some(key) => seek_to_resume_point(&mut cursor, &key, &self.sort_key).await?,
                None => cursor.fill().await?,
            };
            match status {
                CursorStatus::Ready => {
                    let sort_key = self.sort_key.clone();
                    self.heap.push(HeapEntry { cursor, sort_key });
                }
                CursorStatus::Exhausted => {
                    debug!("Cursor for range {} drained while priming", cursor.range());
                    self.metrics.num_exhausted_cursors += 1;
                }
                CursorStatus::Split => {
                    let children = self.split_cursor(cursor).await?;
                    pending.extend(children);
                }
            }
        }
        Ok(())
    }

    /// Replaces a gone cursor with one cursor per child range, every child
    /// carrying the resume key the parent last knew.
    async fn split_cursor(
        &mut self,
        cursor: Box<PartitionCursor>,
    ) -> Result<Vec<Box<PartitionCursor>>> {
        let range = cursor.range().clone();
        let seed_key = cursor.checkpoint();
        let children = self.container.child_ranges(&range).await?;
        ensure!(
            !children.is_empty(),
            InternalInvariantSnafu {
                reason: format!("range {range} is gone but resolved to no children"),
            }
        );
        debug!(
            "Range {} is gone, replacing it with {} child ranges",
            range,
            children.len()
        );
        ORDERBY_PARTITION_SPLITS_TOTAL.inc();
        self.metrics.num_splits += 1;

        Ok(children
            .into_iter()
            .map(|child| self.new_cursor(child, cursor.query().clone(), seed_key.clone()))
            .collect())
    }

    /// Assembles the merge token as of the result just emitted: the target
    /// cursor's entry first, then one entry per other live cursor. An empty
    /// heap means nothing is left to resume.
    fn build_token(&self, target: Option<ResumeKey>) -> Result<Option<MergeToken>> {
        if self.heap.is_empty() {
            return Ok(None);
        }
        let target = target.context(InternalInvariantSnafu {
            reason: "cursor emitted a result without a checkpoint",
        })?;
        let mut keys = Vec::with_capacity(self.heap.len() + 1);
        keys.push(target.clone());
        for entry in self.heap.iter() {
            if entry.cursor.range().id == target.range.id {
                continue;
            }
            if let Some(key) = entry.cursor.checkpoint() {
                keys.push(key);
            }
        }
        MergeToken::new(keys).map(Some)
    }
}

impl Drop for MergeStream {
    fn drop(&mut self) {
        debug!("Merge stream finished, metrics: {:?}", self.metrics);

        ORDERBY_STAGE_ELAPSED
            .with_label_values(&[STAGE_PRIME])
            .observe(self.metrics.prime_cost.as_secs_f64());
        ORDERBY_STAGE_ELAPSED
            .with_label_values(&[STAGE_MERGE])
            .observe(self.metrics.scan_cost.as_secs_f64());
    }
}

/// Local metrics of one merge stream.
#[derive(Debug, Default)]
struct Metrics {
    /// Cost of building and priming the cursors.
    prime_cost: Duration,
    /// Total cost of producing results.
    scan_cost: Duration,
    /// Number of emitted results.
    num_output_rows: usize,
    /// Number of cursors that drained.
    num_exhausted_cursors: usize,
    /// Number of partition splits handled.
    num_splits: usize,
}

/// A heap slot owning one cursor.
struct HeapEntry {
    cursor: Box<PartitionCursor>,
    sort_key: Arc<SortKey>,
}

impl HeapEntry {
    /// Compares the cursor heads over the sort key, lower range `min`
    /// breaking ties.
    ///
    /// # Panics
    /// Panics if either cursor has no head.
    fn compare_heads(&self, other: &HeapEntry) -> Ordering {
        let left = self.cursor.head().unwrap();
        let right = other.cursor.head().unwrap();
        for (column, (l, r)) in self
            .sort_key
            .columns()
            .iter()
            .zip(left.sort_values.iter().zip(&right.sort_values))
        {
            let ordering = column.order.adjust(l.cmp(r));
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        self.cursor.range().min.cmp(&other.cursor.range().min)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &HeapEntry) -> bool {
        self.compare_heads(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &HeapEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &HeapEntry) -> Ordering {
        // The std binary heap is a max heap; compare in reverse so the
        // smallest head is popped first.
        other.compare_heads(self)
    }
}
