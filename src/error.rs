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

//! Governor error types

use std::error;
use std::fmt::{Display, Formatter};
use std::result;

use crate::human_readable_size;

/// Result type for operations that could result in a [GovernorError]
pub type Result<T> = result::Result<T, GovernorError>;

/// Error raised by the memory governor.
///
/// Limit-exceeded conditions are synchronous and raised before any pool-level
/// reservation is attempted, so a failed call leaves no partial state behind.
/// Accounting bugs (freeing more than was reserved) are not represented here;
/// they panic instead of being silently clamped.
#[derive(Debug)]
pub enum GovernorError {
    /// The query attempted to reserve user memory beyond its configured
    /// per-query ceiling. Carries the ceiling for diagnostics.
    MemoryLimitExceeded {
        /// The configured per-query user memory ceiling in bytes
        limit: u64,
    },
    /// The query attempted to reserve spill space beyond its configured
    /// per-query spill ceiling.
    SpillLimitExceeded {
        /// The configured per-query spill ceiling in bytes
        limit: u64,
    },
    /// A reservation delegated to a memory pool could not be satisfied.
    /// The governor does not retry; the caller decides whether to abort.
    PoolReservationFailed(String),
}

impl GovernorError {
    /// Error for a query that exceeded its local user memory ceiling
    pub fn exceeded_memory_limit(limit: u64) -> Self {
        Self::MemoryLimitExceeded { limit }
    }

    /// Error for a query that exceeded its local spill ceiling
    pub fn exceeded_spill_limit(limit: u64) -> Self {
        Self::SpillLimitExceeded { limit }
    }
}

impl Display for GovernorError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            GovernorError::MemoryLimitExceeded { limit } => {
                write!(
                    f,
                    "Query exceeded local memory limit of {}",
                    human_readable_size(*limit)
                )
            }
            GovernorError::SpillLimitExceeded { limit } => {
                write!(
                    f,
                    "Query exceeded local spill limit of {}",
                    human_readable_size(*limit)
                )
            }
            GovernorError::PoolReservationFailed(desc) => {
                write!(f, "Pool reservation failed: {desc}")
            }
        }
    }
}

impl error::Error for GovernorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_error_messages() {
        let err = GovernorError::exceeded_memory_limit(20 * (1 << 30));
        assert_eq!(
            err.to_string(),
            "Query exceeded local memory limit of 20.0 GB"
        );

        let err = GovernorError::exceeded_spill_limit(500);
        assert_eq!(err.to_string(), "Query exceeded local spill limit of 500.0 B");
    }
}
