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

//! Configuration for query contexts and sessions

use crate::spill_tracker::DEFAULT_MAX_SPILL_SPACE;

/// Default guaranteed-progress threshold, 1MB.
///
/// Queries whose total reserved user memory sits below this threshold are
/// never blocked waiting on a congested pool.
pub const GUARANTEED_MEMORY: u64 = 1 << 20;

/// Per-query limits used when constructing a
/// [`QueryContext`](crate::query_context::QueryContext)
#[derive(Debug, Clone)]
pub struct QueryContextConfig {
    /// Ceiling in bytes on user memory reserved by the query. Defaults to
    /// `u64::MAX`, which will not attempt to limit memory locally.
    max_memory: u64,
    /// Ceiling in bytes on disk space the query may use for spilling
    max_spill: u64,
    /// Reserved user memory below which the query is never blocked by the
    /// pool, regardless of pool pressure
    guaranteed_memory: u64,
}

impl Default for QueryContextConfig {
    fn default() -> Self {
        Self {
            max_memory: u64::MAX,
            max_spill: DEFAULT_MAX_SPILL_SPACE,
            guaranteed_memory: GUARANTEED_MEMORY,
        }
    }
}

impl QueryContextConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Customize the user memory ceiling
    pub fn with_max_memory(mut self, max_memory: u64) -> Self {
        self.max_memory = max_memory;
        self
    }

    /// Customize the spill ceiling
    pub fn with_max_spill(mut self, max_spill: u64) -> Self {
        self.max_spill = max_spill;
        self
    }

    /// Customize the guaranteed-progress threshold
    pub fn with_guaranteed_memory(mut self, guaranteed_memory: u64) -> Self {
        self.guaranteed_memory = guaranteed_memory;
        self
    }

    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    pub fn max_spill(&self) -> u64 {
        self.max_spill
    }

    pub fn guaranteed_memory(&self) -> u64 {
        self.guaranteed_memory
    }
}

/// Per-session execution flags attached to each task context
#[derive(Debug, Clone)]
pub struct SessionConfig {
    verbose_stats: bool,
    cpu_timer_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            verbose_stats: false,
            cpu_timer_enabled: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Enables or disables collection of verbose per-operator statistics
    pub fn with_verbose_stats(mut self, enabled: bool) -> Self {
        self.verbose_stats = enabled;
        self
    }

    /// Enables or disables per-task CPU timing
    pub fn with_cpu_timer_enabled(mut self, enabled: bool) -> Self {
        self.cpu_timer_enabled = enabled;
        self
    }

    pub fn verbose_stats(&self) -> bool {
        self.verbose_stats
    }

    pub fn cpu_timer_enabled(&self) -> bool {
        self.cpu_timer_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueryContextConfig::new();
        assert_eq!(config.max_memory(), u64::MAX);
        assert_eq!(config.max_spill(), DEFAULT_MAX_SPILL_SPACE);
        assert_eq!(config.guaranteed_memory(), GUARANTEED_MEMORY);
    }

    #[test]
    fn test_builders() {
        let config = QueryContextConfig::new()
            .with_max_memory(1 << 30)
            .with_max_spill(500)
            .with_guaranteed_memory(0);
        assert_eq!(config.max_memory(), 1 << 30);
        assert_eq!(config.max_spill(), 500);
        assert_eq!(config.guaranteed_memory(), 0);

        let session = SessionConfig::new().with_verbose_stats(true);
        assert!(session.verbose_stats());
        assert!(session.cpu_timer_enabled());
    }
}
