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

//! Per-query memory and spill governance for a distributed SQL engine worker.
//!
//! Each running query gets one [`QueryContext`] that tracks the memory and
//! spill space the query consumes across all of its tasks, enforces the
//! per-query ceilings, and arbitrates shared node-wide budgets through
//! pluggable [`MemoryPool`]s. The accounting is optimistic: operators reflect
//! their byte counts in a [`MemoryTrackingContext`] first and then ask the
//! governor to validate and register the reservation, receiving a
//! [`ReservationFuture`] that delivers pool backpressure.
//!
//! ```
//! use std::sync::Arc;
//! use query_governor::memory_pool::{ClusterMemoryPool, MemoryPool, QueryId};
//! use query_governor::spill_tracker::SpillSpaceTracker;
//! use query_governor::{QueryContext, QueryContextConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> query_governor::Result<()> {
//! let general: Arc<dyn MemoryPool> = Arc::new(ClusterMemoryPool::new("general", 1 << 30));
//! let system: Arc<dyn MemoryPool> = Arc::new(ClusterMemoryPool::new("system", 1 << 28));
//!
//! let context = QueryContext::new(
//!     QueryId::new("20260829_000000_00000_aaaaa"),
//!     QueryContextConfig::new().with_max_memory(512 * 1024 * 1024),
//!     general,
//!     system,
//!     Arc::new(SpillSpaceTracker::default()),
//!     tokio::runtime::Handle::current(),
//! );
//!
//! context.query_memory_context().add_user_memory(1024);
//! context.reserve_memory(1024)?.await?;
//!
//! context.free_memory(1024);
//! context.query_memory_context().free_user_memory(1024);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod memory_context;
pub mod memory_pool;
pub mod query_context;
pub mod spill_tracker;
pub mod task_context;

pub use config::{QueryContextConfig, SessionConfig, GUARANTEED_MEMORY};
pub use error::{GovernorError, Result};
pub use memory_context::MemoryTrackingContext;
pub use memory_pool::{MemoryPool, QueryId, ReservationFuture, TaskId};
pub use query_context::{QueryContext, QueryContextVisitor};
pub use spill_tracker::{SpillBudgetTracker, SpillSpaceTracker};
pub use task_context::TaskContext;

pub const TB: u64 = 1 << 40;
pub const GB: u64 = 1 << 30;
pub const MB: u64 = 1 << 20;
pub const KB: u64 = 1 << 10;

/// Present size in human readable form
pub fn human_readable_size(size: u64) -> String {
    let (value, unit) = {
        if size >= 2 * TB {
            (size as f64 / TB as f64, "TB")
        } else if size >= 2 * GB {
            (size as f64 / GB as f64, "GB")
        } else if size >= 2 * MB {
            (size as f64 / MB as f64, "MB")
        } else if size >= 2 * KB {
            (size as f64 / KB as f64, "KB")
        } else {
            (size as f64, "B")
        }
    };
    format!("{value:.1} {unit}")
}
