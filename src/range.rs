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

//! Partition key ranges and the classification of active ranges around the
//! resume target.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt};

use crate::continuation::{MergeToken, ResumeKey};
use crate::error::{InternalInvariantSnafu, MalformedContinuationSnafu, Result};

/// A half-open interval `[min, max)` of partition key hashes owned by one
/// physical partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionRange {
    /// Opaque partition identifier.
    pub id: String,
    pub min: u64,
    pub max: u64,
}

impl PartitionRange {
    pub fn new(id: impl Into<String>, min: u64, max: u64) -> PartitionRange {
        PartitionRange {
            id: id.into(),
            min,
            max,
        }
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.min <= hash && hash < self.max
    }

    /// Whether `other` lies entirely within this range.
    pub fn contains_range(&self, other: &PartitionRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

impl Display for PartitionRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}, {})", self.id, self.min, self.max)
    }
}

impl PartialOrd for PartitionRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PartitionRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.min
            .cmp(&other.min)
            .then_with(|| self.max.cmp(&other.max))
    }
}

/// An active range paired with the resume key it starts from, if any.
#[derive(Debug, Clone)]
pub struct MappedRange {
    pub range: PartitionRange,
    pub resume_key: Option<ResumeKey>,
}

/// The three disjoint groups of active ranges around the resume target.
#[derive(Debug)]
pub struct RangeMapping {
    pub left: Vec<MappedRange>,
    pub target: MappedRange,
    pub right: Vec<MappedRange>,
}

/// Classifies the active ranges against a merge token.
///
/// The token's first entry names the target partition. Its range resolves to
/// the active range containing the entry's `min`, which covers an unchanged
/// range, a parent that absorbed it, and the leftmost child after a split.
/// Remaining active ranges classify positionally against the resolved target
/// range: everything ending at or before the target's `min` is left of it,
/// everything else is right of it.
///
/// Non-target token entries attach to their exact active range. Children of
/// the target entry's range inherit the target's resume key so each of them
/// can drop its share of the already-consumed tie block; every other range
/// unknown to the token starts without a resume key.
pub fn map_ranges(active: &[PartitionRange], token: &MergeToken) -> Result<RangeMapping> {
    ensure_disjoint_cover(active)?;

    let target_key = token.target();
    let target_pos = active
        .iter()
        .position(|r| r.contains(target_key.range.min))
        .with_context(|| MalformedContinuationSnafu {
            reason: format!(
                "target partition range {} not found in the active ranges",
                target_key.range
            ),
        })?;
    let target_range = &active[target_pos];

    let mut keys_by_range = HashMap::with_capacity(token.keys().len());
    for key in &token.keys()[1..] {
        keys_by_range.insert((key.range.min, key.range.max), key);
    }

    let mut left = Vec::new();
    let mut right = Vec::new();
    for (pos, range) in active.iter().enumerate() {
        if pos == target_pos {
            continue;
        }
        let resume_key = if let Some(key) = keys_by_range.get(&(range.min, range.max)) {
            Some((*key).clone())
        } else if target_key.range.contains_range(range) {
            Some(target_key.clone())
        } else {
            None
        };
        let mapped = MappedRange {
            range: range.clone(),
            resume_key,
        };
        if range.max <= target_range.min {
            left.push(mapped);
        } else {
            right.push(mapped);
        }
    }

    Ok(RangeMapping {
        left,
        target: MappedRange {
            range: target_range.clone(),
            resume_key: Some(target_key.clone()),
        },
        right,
    })
}

fn ensure_disjoint_cover(active: &[PartitionRange]) -> Result<()> {
    ensure!(
        !active.is_empty(),
        InternalInvariantSnafu {
            reason: "no active partition ranges",
        }
    );
    for range in active {
        ensure!(
            range.min < range.max,
            InternalInvariantSnafu {
                reason: format!("empty partition range {range}"),
            }
        );
    }
    for window in active.windows(2) {
        ensure!(
            window[0].max <= window[1].min,
            InternalInvariantSnafu {
                reason: format!(
                    "active ranges {} and {} are not sorted and disjoint",
                    window[0], window[1]
                ),
            }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn key(range: &PartitionRange, rid: &str) -> ResumeKey {
        ResumeKey {
            range: range.clone(),
            sort_values: vec![Value::from(1i64)],
            rid: rid.to_string(),
            skip_count: 0,
            server_token: Some(format!("token-{}", range.id)),
        }
    }

    fn token(keys: Vec<ResumeKey>) -> MergeToken {
        MergeToken::new(keys).unwrap()
    }

    #[test]
    fn test_map_unchanged_ranges() {
        let a = PartitionRange::new("a", 0, 100);
        let b = PartitionRange::new("b", 100, 200);
        let c = PartitionRange::new("c", 200, 300);
        let active = vec![a.clone(), b.clone(), c.clone()];
        let token = token(vec![key(&b, "db.coll.2"), key(&a, "db.coll.1"), key(&c, "db.coll.3")]);

        let mapping = map_ranges(&active, &token).unwrap();
        assert_eq!(b, mapping.target.range);
        assert_eq!(1, mapping.left.len());
        assert_eq!(a, mapping.left[0].range);
        assert_eq!("db.coll.1", mapping.left[0].resume_key.as_ref().unwrap().rid);
        assert_eq!(1, mapping.right.len());
        assert_eq!(c, mapping.right[0].range);
    }

    #[test]
    fn test_map_split_target_children() {
        // The target range [100, 200) split into two children after the token
        // was written.
        let a = PartitionRange::new("a", 0, 100);
        let b = PartitionRange::new("b", 100, 200);
        let b1 = PartitionRange::new("b1", 100, 150);
        let b2 = PartitionRange::new("b2", 150, 200);
        let active = vec![a.clone(), b1.clone(), b2.clone()];
        let token = token(vec![key(&b, "db.coll.2"), key(&a, "db.coll.1")]);

        let mapping = map_ranges(&active, &token).unwrap();
        assert_eq!(b1, mapping.target.range);
        assert_eq!("db.coll.2", mapping.target.resume_key.as_ref().unwrap().rid);
        // The right sibling inherits the target's resume key.
        assert_eq!(1, mapping.right.len());
        assert_eq!(b2, mapping.right[0].range);
        assert_eq!(
            "db.coll.2",
            mapping.right[0].resume_key.as_ref().unwrap().rid
        );
        assert_eq!(1, mapping.left.len());
    }

    #[test]
    fn test_map_split_sibling_ranges_start_fresh() {
        // A non-target range split; its children carry no resume key.
        let a = PartitionRange::new("a", 0, 100);
        let a1 = PartitionRange::new("a1", 0, 50);
        let a2 = PartitionRange::new("a2", 50, 100);
        let b = PartitionRange::new("b", 100, 200);
        let active = vec![a1.clone(), a2.clone(), b.clone()];
        let token = token(vec![key(&b, "db.coll.2"), key(&a, "db.coll.1")]);

        let mapping = map_ranges(&active, &token).unwrap();
        assert_eq!(b, mapping.target.range);
        assert_eq!(2, mapping.left.len());
        assert!(mapping.left.iter().all(|m| m.resume_key.is_none()));
    }

    #[test]
    fn test_map_target_absorbed_by_parent() {
        let parent = PartitionRange::new("p", 0, 200);
        let child = PartitionRange::new("c", 100, 200);
        let active = vec![parent.clone()];
        let token = token(vec![key(&child, "db.coll.2")]);

        let mapping = map_ranges(&active, &token).unwrap();
        assert_eq!(parent, mapping.target.range);
    }

    #[test]
    fn test_map_missing_target_is_malformed() {
        let active = vec![PartitionRange::new("a", 0, 100)];
        let gone = PartitionRange::new("z", 500, 600);
        let token = token(vec![key(&gone, "db.coll.1")]);
        let err = map_ranges(&active, &token).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::MalformedContinuation { .. }
        ));
    }

    #[test]
    fn test_map_rejects_overlapping_ranges() {
        let a = PartitionRange::new("a", 0, 150);
        let b = PartitionRange::new("b", 100, 200);
        let token = token(vec![key(&a, "db.coll.1")]);
        let err = map_ranges(&[a, b], &token).unwrap_err();
        assert!(matches!(err, crate::error::Error::InternalInvariant { .. }));
    }
}
