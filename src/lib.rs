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

//! Cross-partition ORDER BY query execution for the DocumentDB client.
//!
//! A logical `SELECT … ORDER BY …` query is answered by many physical
//! partitions, each returning its own locally sorted stream. This crate
//! merges those streams into a single globally sorted stream, paginates it,
//! and encodes the merge state into a continuation token compact enough to
//! resume across process restarts with no duplicates and no gaps. Partition
//! splits observed mid-query are absorbed by replacing the affected cursor
//! with one cursor per child range.
//!
//! The entry point is [stage::OrderByStage]; everything server-facing sits
//! behind the [container::DocumentContainer] trait.

pub mod container;
pub mod continuation;
mod cursor;
pub mod error;
pub mod filter;
mod merge;
pub mod metrics;
pub mod query;
pub mod range;
pub mod rid;
mod seek;
pub mod stage;
#[cfg(test)]
pub(crate) mod test_util;
pub mod value;

pub use crate::container::{
    DocumentContainer, DocumentContainerRef, FetchResponse, OrderByRow, Page, QueryExecutionInfo,
};
pub use crate::continuation::{MergeToken, ResumeKey};
pub use crate::error::{Error, Result};
pub use crate::query::{OrderByColumn, QuerySpec, SortOrder};
pub use crate::range::PartitionRange;
pub use crate::stage::{OrderByStage, StageConfig, StagePage};
