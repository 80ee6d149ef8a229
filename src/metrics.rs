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

//! Order-by stage metrics.

use lazy_static::lazy_static;
use prometheus::*;

/// Reason label for filtered rows.
pub const FILTER_REASON: &str = "reason";
/// Rows dropped while seeking past a resume point.
pub const FILTER_REASON_RESUME: &str = "resume";
/// Rows that arrived before the resume point against the expected server
/// order.
pub const FILTER_REASON_OUT_OF_ORDER: &str = "out_of_order";

/// Stage label for elapsed time.
pub const STAGE_TYPE: &str = "stage";
pub const STAGE_PRIME: &str = "prime";
pub const STAGE_MERGE: &str = "merge";

lazy_static! {
    /// Pages fetched from partitions.
    pub static ref ORDERBY_FETCHED_PAGES_TOTAL: IntCounter = register_int_counter!(
        "documentdb_orderby_fetched_pages_total",
        "order by fetched pages total",
    )
    .unwrap();
    /// Documents fetched from partitions.
    pub static ref ORDERBY_FETCHED_ROWS_TOTAL: IntCounter = register_int_counter!(
        "documentdb_orderby_fetched_rows_total",
        "order by fetched rows total",
    )
    .unwrap();
    /// Documents discarded before entering the merge.
    pub static ref ORDERBY_FILTERED_ROWS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "documentdb_orderby_filtered_rows_total",
        "order by filtered rows total",
        &[FILTER_REASON]
    )
    .unwrap();
    /// Partition splits observed while the merge was running.
    pub static ref ORDERBY_PARTITION_SPLITS_TOTAL: IntCounter = register_int_counter!(
        "documentdb_orderby_partition_splits_total",
        "order by partition splits total",
    )
    .unwrap();
    /// Elapsed time of the stage phases.
    pub static ref ORDERBY_STAGE_ELAPSED: HistogramVec = register_histogram_vec!(
        "documentdb_orderby_stage_elapsed",
        "order by stage elapsed",
        &[STAGE_TYPE]
    )
    .unwrap();
}
