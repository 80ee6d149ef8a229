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

//! Synthesis of the three per-partition resume filters.

use itertools::Itertools;
use snafu::ensure;

use crate::error::{InternalInvariantSnafu, Result};
use crate::query::{SortKey, SortOrder, TRUE_FILTER};
use crate::value::Value;

/// The boolean fragments substituted into the query text for the three range
/// groups around the resume target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeFilters {
    /// Strictly beyond the resume tuple; for ranges left of the target.
    pub left: String,
    /// Always `true`: the target partition is positioned by its server token.
    pub target: String,
    /// At or beyond the resume tuple; for ranges right of the target.
    pub right: String,
}

/// Builds the resume filters for a sort key and the target resume values.
///
/// The multi-column filter is the lexicographic "beyond the resume tuple"
/// predicate expanded over all prefixes of the sort key. The naive
/// conjunction of per-column bounds is wrong: it drops rows whose first
/// column is already past the resume value while a later column is not.
pub fn synthesize_filters(sort_key: &SortKey, resume_values: &[Value]) -> Result<ResumeFilters> {
    ensure!(
        resume_values.len() == sort_key.len(),
        InternalInvariantSnafu {
            reason: format!(
                "{} resume values for a sort key of arity {}",
                resume_values.len(),
                sort_key.len()
            ),
        }
    );

    if sort_key.len() == 1 {
        let column = &sort_key.columns()[0];
        let value = resume_values[0].sql_literal();
        return Ok(ResumeFilters {
            left: format!("{} {} {}", column.expression, strict_op(column.order), value),
            target: TRUE_FILTER.to_string(),
            right: format!(
                "{} {} {}",
                column.expression,
                inclusive_op(column.order),
                value
            ),
        });
    }

    Ok(ResumeFilters {
        left: disjunction(sort_key, resume_values, false),
        target: TRUE_FILTER.to_string(),
        right: disjunction(sort_key, resume_values, true),
    })
}

/// One disjunct per sort-key prefix: equality on the leading columns, an
/// inequality on the last. Only the full prefix of the right-hand filter
/// relaxes its inequality to the inclusive form.
fn disjunction(sort_key: &SortKey, resume_values: &[Value], inclusive_tail: bool) -> String {
    let arity = sort_key.len();
    (1..=arity)
        .map(|prefix_len| {
            let conjuncts = sort_key.columns()[..prefix_len]
                .iter()
                .zip(resume_values)
                .enumerate()
                .map(|(pos, (column, value))| {
                    let op = if pos + 1 < prefix_len {
                        "="
                    } else if inclusive_tail && prefix_len == arity {
                        inclusive_op(column.order)
                    } else {
                        strict_op(column.order)
                    };
                    format!("{} {} {}", column.expression, op, value.sql_literal())
                })
                .join(" AND ");
            format!("({conjuncts})")
        })
        .join(" OR ")
}

fn strict_op(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Asc => ">",
        SortOrder::Desc => "<",
    }
}

fn inclusive_op(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Asc => ">=",
        SortOrder::Desc => "<=",
    }
}
