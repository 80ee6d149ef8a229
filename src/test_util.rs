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

//! Test utilities: a scripted in-memory document container.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::container::{
    DocumentContainer, FetchResponse, OrderByRow, Page, QueryExecutionInfo,
};
use crate::continuation::MergeToken;
use crate::error::Result;
use crate::query::{QuerySpec, SortKey, FORMATTABLE_ORDER_BY_FILTER};
use crate::range::PartitionRange;
use crate::seek::compare_resume_point;
use crate::value::Value;

/// Builds rows with a single numeric sort value each.
pub(crate) fn rows_of(rows: &[(i64, &str)]) -> Vec<OrderByRow> {
    rows.iter()
        .map(|(value, rid)| OrderByRow {
            payload: serde_json::json!({ "_rid": rid }),
            sort_values: vec![Value::from(*value)],
            rid: rid.to_string(),
        })
        .collect()
}

pub(crate) fn rid_sequence(rows: &[OrderByRow]) -> Vec<String> {
    rows.iter().map(|row| row.rid.clone()).collect()
}

struct ScriptedRange {
    range: PartitionRange,
    docs: Vec<OrderByRow>,
    /// Document offset at which fetches report the range gone.
    gone_at: Option<usize>,
    /// Resume filter a compliant server would apply after a query rewrite.
    filter: Option<ScriptedFilter>,
    /// Bumped whenever the served document list changes, so that stale
    /// server tokens fall back to a conservative replay from the start.
    epoch: usize,
}

struct ScriptedFilter {
    resume_values: Vec<Value>,
    inclusive: bool,
}

/// An in-memory [DocumentContainer] serving pre-programmed pages.
///
/// Server tokens are `epoch:offset` pairs; a token from another epoch (or
/// another range, such as a parent token handed to a split child) replays
/// from the start, the way a conservative server would.
pub(crate) struct MockContainer {
    ranges: Mutex<HashMap<String, ScriptedRange>>,
    children: Mutex<HashMap<String, Vec<PartitionRange>>>,
    sort_key: Mutex<Option<SortKey>>,
    execution_info: Mutex<Option<QueryExecutionInfo>>,
    fetches: AtomicUsize,
}

impl MockContainer {
    pub(crate) fn new() -> MockContainer {
        MockContainer {
            ranges: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            sort_key: Mutex::new(None),
            execution_info: Mutex::new(None),
            fetches: AtomicUsize::new(0),
        }
    }

    /// A query spec with the filter placeholder, as the stage expects it.
    pub(crate) fn query() -> QuerySpec {
        QuerySpec::new(format!(
            "SELECT * FROM c WHERE {FORMATTABLE_ORDER_BY_FILTER} ORDER BY c.x"
        ))
    }

    pub(crate) fn add_range(&self, range: PartitionRange, docs: Vec<OrderByRow>) {
        self.ranges.lock().unwrap().insert(
            range.id.clone(),
            ScriptedRange {
                range,
                docs,
                gone_at: None,
                filter: None,
                epoch: 0,
            },
        );
    }

    /// Every fetch of the range reports it gone.
    pub(crate) fn mark_gone(&self, range: &PartitionRange) {
        self.mark_gone_at(range, 0);
    }

    /// Fetches starting at or past the given document offset report the
    /// range gone.
    pub(crate) fn mark_gone_at(&self, range: &PartitionRange, offset: usize) {
        self.ranges
            .lock()
            .unwrap()
            .get_mut(&range.id)
            .expect("unknown range")
            .gone_at = Some(offset);
    }

    pub(crate) fn set_children(&self, range: &PartitionRange, children: Vec<PartitionRange>) {
        self.children
            .lock()
            .unwrap()
            .insert(range.id.clone(), children);
    }

    pub(crate) fn set_execution_info(&self, info: QueryExecutionInfo) {
        *self.execution_info.lock().unwrap() = Some(info);
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(AtomicOrdering::Relaxed)
    }

    /// Emulates a compliant server for a resumed query: ranges left of the
    /// token's target only serve documents strictly beyond the resume
    /// values, ranges right of it serve the tie as well, and the target
    /// range serves everything.
    pub(crate) fn apply_resume_filter(&self, token: &MergeToken, sort_key: &SortKey) {
        let target = token.target();
        *self.sort_key.lock().unwrap() = Some(sort_key.clone());
        let mut ranges = self.ranges.lock().unwrap();
        for scripted in ranges.values_mut() {
            scripted.epoch += 1;
            scripted.filter = if scripted.range.id == target.range.id {
                None
            } else {
                Some(ScriptedFilter {
                    resume_values: target.sort_values.clone(),
                    inclusive: scripted.range.max > target.range.min,
                })
            };
        }
    }
}

#[async_trait]
impl DocumentContainer for MockContainer {
    async fn fetch_page(
        &self,
        range: &PartitionRange,
        _query: &QuerySpec,
        server_token: Option<&str>,
        page_size: usize,
    ) -> Result<FetchResponse> {
        self.fetches.fetch_add(1, AtomicOrdering::Relaxed);
        let ranges = self.ranges.lock().unwrap();
        let scripted = ranges.get(&range.id).expect("unknown range");

        let start = server_token
            .and_then(|token| {
                let (epoch, offset) = token.split_once(':')?;
                (epoch.parse::<usize>().ok()? == scripted.epoch)
                    .then(|| offset.parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);

        if let Some(gone_at) = scripted.gone_at {
            if start >= gone_at {
                return Ok(FetchResponse::Gone);
            }
        }

        let visible: Vec<&OrderByRow> = match &scripted.filter {
            None => scripted.docs.iter().collect(),
            Some(filter) => {
                let sort_key = self.sort_key.lock().unwrap();
                let sort_key = sort_key.as_ref().expect("filter without a sort key");
                scripted
                    .docs
                    .iter()
                    .filter(|doc| {
                        let ordering = compare_resume_point(
                            sort_key,
                            &filter.resume_values,
                            &doc.sort_values,
                        );
                        ordering == Ordering::Less
                            || (filter.inclusive && ordering == Ordering::Equal)
                    })
                    .collect()
            }
        };

        let end = (start + page_size).min(visible.len());
        let rows = visible
            .get(start.min(visible.len())..end)
            .unwrap_or(&[])
            .iter()
            .map(|row| (*row).clone())
            .collect();
        let next_token = (end < visible.len()).then(|| format!("{}:{}", scripted.epoch, end));

        Ok(FetchResponse::Page(Page {
            rows,
            next_token,
            execution_info: *self.execution_info.lock().unwrap(),
        }))
    }

    async fn child_ranges(&self, range: &PartitionRange) -> Result<Vec<PartitionRange>> {
        Ok(self
            .children
            .lock()
            .unwrap()
            .get(&range.id)
            .expect("no children scripted for range")
            .clone())
    }
}
