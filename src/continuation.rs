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

//! The array-shaped continuation token and its per-partition resume keys.

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};

use crate::error::{InternalInvariantSnafu, MalformedContinuationSnafu, Result, SerializeTokenSnafu};
use crate::range::PartitionRange;
use crate::rid::ResourceId;
use crate::value::Value;

/// Per-partition state captured in the continuation token.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeKey {
    /// Range the key belonged to when the token was written.
    pub range: PartitionRange,
    /// Sort-key values of the resume point, one per ORDER BY conjunct.
    pub sort_values: Vec<Value>,
    /// Rid of the resume point.
    pub rid: String,
    /// Number of documents with the resume rid a resume must skip.
    pub skip_count: u32,
    /// Server continuation that re-fetches the page around the resume point.
    pub server_token: Option<String>,
}

/// The global continuation: a non-empty ordered list of resume keys whose
/// first element names the target partition. The order of the remaining
/// elements is not observable.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeToken {
    keys: Vec<ResumeKey>,
}

impl MergeToken {
    pub fn new(keys: Vec<ResumeKey>) -> Result<MergeToken> {
        ensure!(
            !keys.is_empty(),
            InternalInvariantSnafu {
                reason: "continuation token must carry at least one resume key",
            }
        );
        Ok(MergeToken { keys })
    }

    /// The resume key of the target partition.
    pub fn target(&self) -> &ResumeKey {
        // Safety: the constructor and the parser reject empty tokens.
        &self.keys[0]
    }

    pub fn keys(&self) -> &[ResumeKey] {
        &self.keys
    }

    /// Parses a serialized token, validating it against the query's sort-key
    /// arity. Performs no network traffic.
    pub fn parse(text: &str, sort_key_len: usize) -> Result<MergeToken> {
        let reprs: Vec<ResumeKeyRepr> =
            serde_json::from_str(text).map_err(|e| {
                MalformedContinuationSnafu {
                    reason: format!("not an array of resume keys: {e}"),
                }
                .build()
            })?;
        ensure!(
            !reprs.is_empty(),
            MalformedContinuationSnafu {
                reason: "continuation token is empty",
            }
        );

        let mut keys = Vec::with_capacity(reprs.len());
        for repr in reprs {
            ensure!(
                repr.order_by_items.len() == sort_key_len,
                MalformedContinuationSnafu {
                    reason: format!(
                        "resume key for range {} carries {} sort values, expected {}",
                        repr.range,
                        repr.order_by_items.len(),
                        sort_key_len
                    ),
                }
            );
            // Rejects unparseable rids before any partition is contacted.
            ResourceId::parse(&repr.rid)?;
            keys.push(ResumeKey {
                range: repr.range,
                sort_values: repr
                    .order_by_items
                    .into_iter()
                    .map(|item| item.item.map(Value::from_json).unwrap_or(Value::Undefined))
                    .collect(),
                rid: repr.rid,
                skip_count: repr.skip_count,
                server_token: repr.server_token,
            });
        }
        Ok(MergeToken { keys })
    }

    /// Serializes the token as a JSON array.
    pub fn to_json(&self) -> Result<String> {
        let reprs: Vec<ResumeKeyRepr> = self
            .keys
            .iter()
            .map(|key| ResumeKeyRepr {
                range: key.range.clone(),
                order_by_items: key
                    .sort_values
                    .iter()
                    .map(|value| OrderByItemRepr {
                        item: value.to_json(),
                    })
                    .collect(),
                rid: key.rid.clone(),
                skip_count: key.skip_count,
                server_token: key.server_token.clone(),
            })
            .collect();
        serde_json::to_string(&reprs).context(SerializeTokenSnafu)
    }
}

/// Wire form of one sort value. An absent `item` encodes an undefined value.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct OrderByItemRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeKeyRepr {
    range: PartitionRange,
    order_by_items: Vec<OrderByItemRepr>,
    rid: String,
    skip_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn sample_key() -> ResumeKey {
        ResumeKey {
            range: PartitionRange::new("a", 0, 128),
            sort_values: vec![Value::from("x"), Value::Undefined],
            rid: "db.coll.7".to_string(),
            skip_count: 2,
            server_token: Some("page-3".to_string()),
        }
    }

    #[test]
    fn test_round_trip() {
        let token = MergeToken::new(vec![sample_key()]).unwrap();
        let text = token.to_json().unwrap();
        let parsed = MergeToken::parse(&text, 2).unwrap();
        assert_eq!(token, parsed);
    }

    #[test]
    fn test_undefined_is_an_absent_item() {
        let token = MergeToken::new(vec![sample_key()]).unwrap();
        let text = token.to_json().unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        let items = json[0]["orderByItems"].as_array().unwrap();
        assert_eq!(serde_json::json!({ "item": "x" }), items[0]);
        assert_eq!(serde_json::json!({}), items[1]);
    }

    #[test]
    fn test_parse_rejects_non_array() {
        let err = MergeToken::parse("{\"rid\": \"db.coll.1\"}", 1).unwrap_err();
        assert!(matches!(err, Error::MalformedContinuation { .. }));
    }

    #[test]
    fn test_parse_rejects_empty_array() {
        let err = MergeToken::parse("[]", 1).unwrap_err();
        assert!(matches!(err, Error::MalformedContinuation { .. }));
    }

    #[test]
    fn test_parse_rejects_arity_mismatch() {
        let token = MergeToken::new(vec![sample_key()]).unwrap();
        let text = token.to_json().unwrap();
        let err = MergeToken::parse(&text, 1).unwrap_err();
        assert!(matches!(err, Error::MalformedContinuation { .. }));
    }

    #[test]
    fn test_parse_rejects_bad_rid() {
        let mut key = sample_key();
        key.rid = "not-a-rid".to_string();
        let text = MergeToken::new(vec![key]).unwrap().to_json().unwrap();
        let err = MergeToken::parse(&text, 2).unwrap_err();
        assert!(matches!(err, Error::MalformedContinuation { .. }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = MergeToken::parse("not json", 1).unwrap_err();
        assert!(matches!(err, Error::MalformedContinuation { .. }));
    }
}
