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

//! A resumable, server-backed page enumerator for one partition range.

use std::collections::VecDeque;

use snafu::{ensure, OptionExt};
use tokio_util::sync::CancellationToken;

use crate::container::{DocumentContainerRef, FetchResponse, OrderByRow, QueryExecutionInfo};
use crate::continuation::ResumeKey;
use crate::error::{CancelledSnafu, InternalInvariantSnafu, Result};
use crate::metrics::{ORDERBY_FETCHED_PAGES_TOTAL, ORDERBY_FETCHED_ROWS_TOTAL};
use crate::query::QuerySpec;
use crate::range::PartitionRange;
use crate::value::Value;

/// Observable cursor state after an operation that may refill the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorStatus {
    /// The cursor has a head.
    Ready,
    /// The partition is drained; the cursor yields nothing more.
    Exhausted,
    /// The partition range is gone and must be replaced by its children.
    Split,
}

enum FetchStep {
    Fetched,
    Gone,
}

/// A cursor over one partition range.
///
/// The cursor buffers one or more fetched pages and exposes the next
/// not-yet-consumed document as its head. Fetches suspend at the transport
/// and race the stage's cancellation signal.
pub(crate) struct PartitionCursor {
    range: PartitionRange,
    query: QuerySpec,
    container: DocumentContainerRef,
    fetch_page_size: usize,
    arity: usize,
    cancel: CancellationToken,
    /// Resume key the cursor was constructed with, if any.
    seed_key: Option<ResumeKey>,
    buffer: VecDeque<OrderByRow>,
    /// Server token that fetched the currently buffered page.
    page_token: Option<String>,
    /// Server token that fetched the page of the last emitted document.
    emitted_page_token: Option<String>,
    /// Server token for the next fetch.
    next_token: Option<String>,
    /// Set when a fetched page announces no successor.
    no_more_pages: bool,
    /// Execution info of the most recent page that carried one.
    execution_info: Option<QueryExecutionInfo>,
    /// Sort values and rid of the last document handed to the merge.
    last_emitted: Option<(Vec<Value>, String)>,
    /// Consecutive emissions sharing the same sort values and rid.
    same_rid_run: u32,
}

impl PartitionCursor {
    pub(crate) fn new(
        range: PartitionRange,
        query: QuerySpec,
        container: DocumentContainerRef,
        fetch_page_size: usize,
        arity: usize,
        seed_key: Option<ResumeKey>,
        cancel: CancellationToken,
    ) -> PartitionCursor {
        let next_token = seed_key.as_ref().and_then(|key| key.server_token.clone());
        PartitionCursor {
            range,
            query,
            container,
            fetch_page_size,
            arity,
            cancel,
            seed_key,
            buffer: VecDeque::new(),
            page_token: None,
            emitted_page_token: None,
            next_token,
            no_more_pages: false,
            execution_info: None,
            last_emitted: None,
            same_rid_run: 0,
        }
    }

    pub(crate) fn range(&self) -> &PartitionRange {
        &self.range
    }

    pub(crate) fn query(&self) -> &QuerySpec {
        &self.query
    }

    pub(crate) fn seed_key(&self) -> Option<&ResumeKey> {
        self.seed_key.as_ref()
    }

    pub(crate) fn head(&self) -> Option<&OrderByRow> {
        self.buffer.front()
    }

    pub(crate) fn execution_info(&self) -> Option<&QueryExecutionInfo> {
        self.execution_info.as_ref()
    }

    /// Fetches pages until a document is buffered, the partition is drained,
    /// or the range reports a split.
    pub(crate) async fn fill(&mut self) -> Result<CursorStatus> {
        while self.buffer.is_empty() && !self.no_more_pages {
            match self.fetch_page().await? {
                FetchStep::Fetched => {}
                FetchStep::Gone => return Ok(CursorStatus::Split),
            }
        }
        if self.buffer.is_empty() {
            Ok(CursorStatus::Exhausted)
        } else {
            Ok(CursorStatus::Ready)
        }
    }

    /// Consumes the head and hands it to the merge, fetching ahead so the
    /// cursor ends up with a new head, drained, or split.
    pub(crate) async fn pop(&mut self) -> Result<(OrderByRow, CursorStatus)> {
        let row = self.buffer.pop_front().context(InternalInvariantSnafu {
            reason: "pop on a cursor without a head",
        })?;
        match &self.last_emitted {
            Some((values, rid)) if *rid == row.rid && *values == row.sort_values => {
                self.same_rid_run += 1;
            }
            Some(_) => self.same_rid_run = 0,
            // The first emission may continue a tie run that was interrupted
            // by a resume: the skip count of the seed key tells how many
            // occurrences of its rid were already consumed.
            None => {
                self.same_rid_run = match &self.seed_key {
                    Some(seed) if seed.rid == row.rid && seed.sort_values == row.sort_values => {
                        seed.skip_count
                    }
                    _ => 0,
                };
            }
        }
        self.last_emitted = Some((row.sort_values.clone(), row.rid.clone()));
        self.emitted_page_token = self.page_token.clone();

        let status = self.fill().await?;
        Ok((row, status))
    }

    /// Drops the head without counting it as emitted. Used while seeking past
    /// a resume point.
    pub(crate) async fn discard_head(&mut self) -> Result<CursorStatus> {
        self.buffer.pop_front().context(InternalInvariantSnafu {
            reason: "discard on a cursor without a head",
        })?;
        self.fill().await
    }

    /// The latest resume key of this cursor, suitable for the merge token and
    /// for seeding split children.
    ///
    /// A cursor that has emitted resumes at its last emitted document: the
    /// persisted skip count is the number of emitted documents carrying that
    /// rid, all of which a resume must drop again, and the server token
    /// replays the page they came from. A cursor that has not emitted
    /// resumes at its head with nothing to drop, and falls back to the key
    /// it was constructed with while it has no head yet.
    pub(crate) fn checkpoint(&self) -> Option<ResumeKey> {
        if let Some((sort_values, rid)) = &self.last_emitted {
            Some(ResumeKey {
                range: self.range.clone(),
                sort_values: sort_values.clone(),
                rid: rid.clone(),
                skip_count: self.same_rid_run + 1,
                server_token: self.emitted_page_token.clone(),
            })
        } else if let Some(head) = self.head() {
            // An unconsumed head resumes with nothing to drop, unless the
            // head itself is the resume point this cursor was seeded with
            // mid-tie; then the seed's skip count still applies.
            let skip_count = match &self.seed_key {
                Some(seed) if seed.rid == head.rid && seed.sort_values == head.sort_values => {
                    seed.skip_count
                }
                _ => 0,
            };
            Some(ResumeKey {
                range: self.range.clone(),
                sort_values: head.sort_values.clone(),
                rid: head.rid.clone(),
                skip_count,
                server_token: self.page_token.clone(),
            })
        } else {
            self.seed_key.clone()
        }
    }

    async fn fetch_page(&mut self) -> Result<FetchStep> {
        let token = self.next_token.clone();
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return CancelledSnafu.fail(),
            response = self.container.fetch_page(
                &self.range,
                &self.query,
                token.as_deref(),
                self.fetch_page_size,
            ) => response,
        };

        let page = match response {
            Ok(FetchResponse::Gone) => return Ok(FetchStep::Gone),
            Ok(FetchResponse::Page(page)) => page,
            // Containers may also surface the range-gone condition as an
            // error; it is consumed here either way.
            Err(e) if e.is_partition_gone() => return Ok(FetchStep::Gone),
            Err(e) => return Err(e),
        };
        for row in &page.rows {
            ensure!(
                row.sort_values.len() == self.arity,
                InternalInvariantSnafu {
                    reason: format!(
                        "document {} carries {} sort values, expected {}",
                        row.rid,
                        row.sort_values.len(),
                        self.arity
                    ),
                }
            );
        }

        ORDERBY_FETCHED_PAGES_TOTAL.inc();
        ORDERBY_FETCHED_ROWS_TOTAL.inc_by(page.rows.len() as u64);

        self.page_token = token;
        self.no_more_pages = page.next_token.is_none();
        self.next_token = page.next_token;
        if page.execution_info.is_some() {
            self.execution_info = page.execution_info;
        }
        self.buffer.extend(page.rows);
        Ok(FetchStep::Fetched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_util::{rows_of, MockContainer};

    fn cursor_over(container: &Arc<MockContainer>, range: PartitionRange) -> PartitionCursor {
        PartitionCursor::new(
            range,
            MockContainer::query(),
            container.clone(),
            2,
            1,
            None,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_cursor_pages_through_range() {
        let range = PartitionRange::new("a", 0, 100);
        let container = Arc::new(MockContainer::new());
        container.add_range(range.clone(), rows_of(&[(1, "db.coll.1"), (2, "db.coll.2"), (3, "db.coll.3")]));

        let mut cursor = cursor_over(&container, range);
        assert_eq!(CursorStatus::Ready, cursor.fill().await.unwrap());

        let mut seen = Vec::new();
        loop {
            let (row, status) = cursor.pop().await.unwrap();
            seen.push(row.rid);
            match status {
                CursorStatus::Ready => {}
                CursorStatus::Exhausted => break,
                CursorStatus::Split => unreachable!(),
            }
        }
        assert_eq!(vec!["db.coll.1", "db.coll.2", "db.coll.3"], seen);
        // Two documents per page plus the final partial page.
        assert_eq!(2, container.fetch_count());
    }

    #[tokio::test]
    async fn test_checkpoint_flavors() {
        let range = PartitionRange::new("a", 0, 100);
        let container = Arc::new(MockContainer::new());
        container.add_range(range.clone(), rows_of(&[(1, "db.coll.1"), (2, "db.coll.2")]));

        let mut cursor = cursor_over(&container, range);
        assert!(cursor.checkpoint().is_none());

        // Primed but nothing emitted: the checkpoint names the head and
        // skips nothing.
        cursor.fill().await.unwrap();
        let checkpoint = cursor.checkpoint().unwrap();
        assert_eq!("db.coll.1", checkpoint.rid);
        assert_eq!(0, checkpoint.skip_count);

        // After an emission the checkpoint names the emitted document and
        // skips its single occurrence.
        let (row, _) = cursor.pop().await.unwrap();
        assert_eq!("db.coll.1", row.rid);
        let checkpoint = cursor.checkpoint().unwrap();
        assert_eq!("db.coll.1", checkpoint.rid);
        assert_eq!(1, checkpoint.skip_count);
    }

    #[tokio::test]
    async fn test_checkpoint_counts_repeated_rids() {
        let range = PartitionRange::new("a", 0, 100);
        let container = Arc::new(MockContainer::new());
        container.add_range(
            range.clone(),
            rows_of(&[(7, "db.coll.9"), (7, "db.coll.9"), (7, "db.coll.9")]),
        );

        let mut cursor = cursor_over(&container, range);
        cursor.fill().await.unwrap();
        cursor.pop().await.unwrap();
        cursor.pop().await.unwrap();
        let checkpoint = cursor.checkpoint().unwrap();
        assert_eq!(2, checkpoint.skip_count);
    }

    #[tokio::test]
    async fn test_cursor_reports_split() {
        let range = PartitionRange::new("a", 0, 100);
        let container = Arc::new(MockContainer::new());
        container.add_range(range.clone(), rows_of(&[(1, "db.coll.1")]));
        container.mark_gone(&range);

        let mut cursor = cursor_over(&container, range);
        assert_eq!(CursorStatus::Split, cursor.fill().await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_fetch() {
        let range = PartitionRange::new("a", 0, 100);
        let container = Arc::new(MockContainer::new());
        container.add_range(range.clone(), rows_of(&[(1, "db.coll.1")]));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut cursor = PartitionCursor::new(
            range,
            MockContainer::query(),
            container.clone(),
            2,
            1,
            None,
            cancel,
        );
        let err = cursor.fill().await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Cancelled { .. }));
    }
}
