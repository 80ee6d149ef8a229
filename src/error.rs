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

use snafu::{Location, Snafu};

/// Boxed error carried by faults raised inside the document container.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display(
        "Malformed continuation token, reason: {}, location: {}",
        reason,
        location
    ))]
    MalformedContinuation { reason: String, location: Location },

    #[snafu(display("Partition key range {} is gone, location: {}", range_id, location))]
    PartitionGone { range_id: String, location: Location },

    #[snafu(display(
        "Failed to fetch page for partition range {}, location: {}, source: {}",
        range_id,
        location,
        source
    ))]
    Fetch {
        range_id: String,
        #[snafu(source(false))]
        source: BoxedError,
        location: Location,
    },

    #[snafu(display("Query execution is cancelled, location: {}", location))]
    Cancelled { location: Location },

    #[snafu(display("Invalid internal state, {}, location: {}", reason, location))]
    InternalInvariant { reason: String, location: Location },

    #[snafu(display("Failed to serialize continuation token, location: {}", location))]
    SerializeToken {
        #[snafu(source)]
        error: serde_json::Error,
        location: Location,
    },
}

impl Error {
    /// Whether the error is the internal split signal consumed by the merge loop.
    pub fn is_partition_gone(&self) -> bool {
        matches!(self, Error::PartitionGone { .. })
    }

    /// Whether the last issued continuation token is still valid for a restart.
    ///
    /// Continuation and invariant failures poison the token; cancellation and
    /// exhausted-retry fetch faults do not.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Error::Cancelled { .. } | Error::Fetch { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
