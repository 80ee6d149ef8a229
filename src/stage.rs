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

//! The pull-style facade of the cross-partition ORDER BY stage.

use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tokio_util::sync::CancellationToken;

use crate::container::{DocumentContainerRef, OrderByRow};
use crate::continuation::MergeToken;
use crate::error::{InternalInvariantSnafu, Result};
use crate::merge::MergeStream;
use crate::query::{OrderByColumn, QuerySpec, SortKey};
use crate::range::PartitionRange;

/// Hard ceiling on the configured page size.
pub const MAX_PAGE_SIZE: usize = 10_000;

/// Stage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Maximum number of results per emitted page.
    pub page_size: usize,
    /// Page size hint passed to the container on every fetch.
    pub fetch_page_size: usize,
}

impl Default for StageConfig {
    fn default() -> StageConfig {
        StageConfig {
            page_size: 100,
            fetch_page_size: 1000,
        }
    }
}

impl StageConfig {
    fn validate(&self) -> Result<()> {
        ensure!(
            self.page_size >= 1 && self.page_size <= MAX_PAGE_SIZE,
            InternalInvariantSnafu {
                reason: format!(
                    "page size {} is outside [1, {}]",
                    self.page_size, MAX_PAGE_SIZE
                ),
            }
        );
        ensure!(
            self.fetch_page_size >= 1,
            InternalInvariantSnafu {
                reason: "fetch page size must be at least 1",
            }
        );
        Ok(())
    }
}

/// One emitted page: a bounded run of globally sorted results plus the
/// continuation token as of the last result in it. An absent token marks
/// completion.
#[derive(Debug)]
pub struct StagePage {
    pub rows: Vec<OrderByRow>,
    pub continuation: Option<MergeToken>,
}

enum StageState {
    Created,
    Running(MergeStream),
    Finished,
    Faulted,
}

/// The cross-partition ORDER BY execution stage.
///
/// Owns one cursor per live partition range and presents their union as a
/// single sorted stream of pages. The stage is single-owner: `advance`
/// takes `&mut self`, so no two operations of one instance overlap.
pub struct OrderByStage {
    container: DocumentContainerRef,
    query: QuerySpec,
    sort_key: Arc<SortKey>,
    ranges: Vec<PartitionRange>,
    token: Option<MergeToken>,
    config: StageConfig,
    cancel: CancellationToken,
    state: StageState,
}

impl std::fmt::Debug for OrderByStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderByStage")
            .field("query", &self.query)
            .field("ranges", &self.ranges)
            .field("token", &self.token)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OrderByStage {
    /// Creates a stage over the given ranges, optionally resuming from a
    /// serialized continuation token.
    ///
    /// Construction performs no network traffic: the sort key, the config,
    /// the query text, and the token are validated right here, so a
    /// malformed continuation fails before any partition is contacted.
    pub fn new(
        container: DocumentContainerRef,
        query: QuerySpec,
        sort_key: Vec<OrderByColumn>,
        ranges: Vec<PartitionRange>,
        continuation: Option<&str>,
        config: StageConfig,
        cancel: CancellationToken,
    ) -> Result<OrderByStage> {
        let sort_key = Arc::new(SortKey::new(sort_key)?);
        config.validate()?;
        ensure!(
            query.has_filter_placeholder(),
            InternalInvariantSnafu {
                reason: "query text carries no order-by filter placeholder",
            }
        );
        let token = continuation
            .map(|text| MergeToken::parse(text, sort_key.len()))
            .transpose()?;

        Ok(OrderByStage {
            container,
            query,
            sort_key,
            ranges,
            token,
            config,
            cancel,
            state: StageState::Created,
        })
    }

    /// Produces the next page, or `None` at the end of the stream.
    ///
    /// A returned error is terminal for this instance; whether the last
    /// issued token survives it is answered by
    /// [Error::is_resumable](crate::error::Error::is_resumable).
    pub async fn advance(&mut self) -> Result<Option<StagePage>> {
        match self.state {
            StageState::Finished => return Ok(None),
            StageState::Faulted => {
                return InternalInvariantSnafu {
                    reason: "advance on a faulted stage",
                }
                .fail()
            }
            StageState::Created | StageState::Running(_) => {}
        }

        if matches!(self.state, StageState::Created) {
            let merge = MergeStream::init(
                self.container.clone(),
                self.sort_key.clone(),
                &self.query,
                &self.ranges,
                self.token.as_ref(),
                self.config.fetch_page_size,
                self.cancel.clone(),
            )
            .await;
            match merge {
                Ok(merge) => self.state = StageState::Running(merge),
                Err(e) => {
                    self.state = StageState::Faulted;
                    return Err(e);
                }
            }
        }

        // Safety: the state machine above leaves the stage running.
        let StageState::Running(merge) = &mut self.state else {
            unreachable!()
        };
        match Self::collect_page(merge, self.config.page_size).await {
            Ok((rows, continuation, finished)) => {
                if finished {
                    self.state = StageState::Finished;
                    if rows.is_empty() {
                        return Ok(None);
                    }
                }
                Ok(Some(StagePage { rows, continuation }))
            }
            Err(e) => {
                self.state = StageState::Faulted;
                Err(e)
            }
        }
    }

    /// Adapts the stage into a stream of pages.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<StagePage>> {
        try_stream! {
            while let Some(page) = self.advance().await? {
                yield page;
            }
        }
    }

    async fn collect_page(
        merge: &mut MergeStream,
        page_size: usize,
    ) -> Result<(Vec<OrderByRow>, Option<MergeToken>, bool)> {
        let mut rows = Vec::with_capacity(page_size);
        let mut continuation = None;
        while rows.len() < page_size {
            match merge.next_result().await? {
                None => return Ok((rows, None, true)),
                Some((row, token)) => {
                    rows.push(row);
                    let finished = token.is_none();
                    continuation = token;
                    if finished {
                        return Ok((rows, None, true));
                    }
                }
            }
        }
        Ok((rows, continuation, false))
    }
}
