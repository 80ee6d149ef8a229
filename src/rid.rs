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

//! Parsed form of the opaque per-document resource id.

use snafu::ensure;

use crate::error::{MalformedContinuationSnafu, Result};

/// A document resource id split into its `database.collection.document`
/// sub-ids.
///
/// The document part admits a total order; the database and collection parts
/// must agree for any two documents returned by the same query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    database: String,
    collection: String,
    document: u64,
}

impl ResourceId {
    /// Parses an opaque rid string.
    pub fn parse(rid: &str) -> Result<ResourceId> {
        let mut parts = rid.splitn(3, '.');
        let (database, collection, document) = match (parts.next(), parts.next(), parts.next()) {
            (Some(db), Some(coll), Some(doc)) => (db, coll, doc),
            _ => {
                return MalformedContinuationSnafu {
                    reason: format!("invalid rid {rid:?}"),
                }
                .fail()
            }
        };
        ensure!(
            !database.is_empty() && !collection.is_empty(),
            MalformedContinuationSnafu {
                reason: format!("invalid rid {rid:?}"),
            }
        );
        let document = document.parse::<u64>().map_err(|_| {
            MalformedContinuationSnafu {
                reason: format!("invalid document id in rid {rid:?}"),
            }
            .build()
        })?;

        Ok(ResourceId {
            database: database.to_string(),
            collection: collection.to_string(),
            document,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn document(&self) -> u64 {
        self.document
    }

    /// Whether both rids belong to the same database and collection.
    pub fn same_scope(&self, other: &ResourceId) -> bool {
        self.database == other.database && self.collection == other.collection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rid() {
        let rid = ResourceId::parse("db1.coll1.42").unwrap();
        assert_eq!("db1", rid.database());
        assert_eq!("coll1", rid.collection());
        assert_eq!(42, rid.document());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for rid in ["", "db1", "db1.coll1", "db1.coll1.x", ".coll1.1", "db1..1"] {
            assert!(ResourceId::parse(rid).is_err(), "{rid:?}");
        }
    }

    #[test]
    fn test_scope_and_order() {
        let a = ResourceId::parse("db1.coll1.1").unwrap();
        let b = ResourceId::parse("db1.coll1.2").unwrap();
        let c = ResourceId::parse("db1.coll2.1").unwrap();
        assert!(a.same_scope(&b));
        assert!(!a.same_scope(&c));
        assert!(a.document() < b.document());
    }
}
