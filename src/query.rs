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

//! Sort key and query spec types shared by the execution stage.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{InternalInvariantSnafu, Result};

/// Placeholder the rewritten query text carries at every position where a
/// resume filter must be substituted before the query is sent to a server.
pub const FORMATTABLE_ORDER_BY_FILTER: &str = "{documentdb-formattableorderbyquery-filter}";

/// Filter substituted when there is no resume state to encode.
pub const TRUE_FILTER: &str = "true";

/// Direction of one ORDER BY conjunct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    /// Adjusts a raw value comparison for this direction.
    pub fn adjust(&self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

impl Display for SortOrder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Asc => write!(f, "ASC"),
            SortOrder::Desc => write!(f, "DESC"),
        }
    }
}

/// One `(expression, direction)` pair of the query's ORDER BY clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByColumn {
    pub expression: String,
    pub order: SortOrder,
}

impl OrderByColumn {
    pub fn new(expression: impl Into<String>, order: SortOrder) -> Self {
        Self {
            expression: expression.into(),
            order,
        }
    }
}

/// The ordered, non-empty list of ORDER BY conjuncts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    columns: Vec<OrderByColumn>,
}

impl SortKey {
    pub fn new(columns: Vec<OrderByColumn>) -> Result<SortKey> {
        ensure!(
            !columns.is_empty(),
            InternalInvariantSnafu {
                reason: "sort key must not be empty",
            }
        );
        Ok(SortKey { columns })
    }

    pub fn columns(&self) -> &[OrderByColumn] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// The rewritten query shipped to every partition, plus its bound parameters.
///
/// The text must contain [FORMATTABLE_ORDER_BY_FILTER]; parameters ride along
/// untouched and are bound by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub text: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl QuerySpec {
    pub fn new(text: impl Into<String>) -> QuerySpec {
        QuerySpec {
            text: text.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Whether the text carries the filter placeholder.
    pub fn has_filter_placeholder(&self) -> bool {
        self.text.contains(FORMATTABLE_ORDER_BY_FILTER)
    }

    /// Substitutes every filter placeholder with the given boolean fragment.
    pub fn rewrite_with_filter(&self, filter: &str) -> Result<QuerySpec> {
        ensure!(
            self.has_filter_placeholder(),
            InternalInvariantSnafu {
                reason: format!(
                    "query text does not contain the {} placeholder",
                    FORMATTABLE_ORDER_BY_FILTER
                ),
            }
        );
        Ok(QuerySpec {
            text: self.text.replace(FORMATTABLE_ORDER_BY_FILTER, filter),
            parameters: self.parameters.clone(),
        })
    }
}
