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

//! [`SpillBudgetTracker`]: shared budget for temporary disk space used when
//! revocable memory is reclaimed

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::error::{GovernorError, Result};
use crate::memory_pool::ReservationFuture;

/// Default cap on spill space shared by all queries on a node, 100GB
pub const DEFAULT_MAX_SPILL_SPACE: u64 = 100 * 1024 * 1024 * 1024;

/// A shared budget of temporary disk bytes, independent of any memory pool.
///
/// Like [`MemoryPool`](crate::memory_pool::MemoryPool), implementations are
/// shared across every concurrent query and must be internally thread-safe.
pub trait SpillBudgetTracker: Send + Sync + Debug {
    /// Reserve `bytes` of spill space.
    ///
    /// Fails synchronously if the shared budget would be exceeded; no partial
    /// reservation is made.
    fn reserve(&self, bytes: u64) -> Result<ReservationFuture>;

    /// Release `bytes` of previously reserved spill space.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` exceeds the outstanding reservation.
    fn free(&self, bytes: u64);

    /// Bytes currently reserved against the shared budget
    fn used(&self) -> u64;
}

/// Default [`SpillBudgetTracker`] with a fixed node-wide cap
#[derive(Debug)]
pub struct SpillSpaceTracker {
    max_bytes: u64,
    used: AtomicU64,
}

impl SpillSpaceTracker {
    pub fn new(max_bytes: u64) -> Self {
        debug!("Created new SpillSpaceTracker(max_bytes={max_bytes})");
        Self {
            max_bytes,
            used: AtomicU64::new(0),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

impl Default for SpillSpaceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SPILL_SPACE)
    }
}

impl SpillBudgetTracker for SpillSpaceTracker {
    fn reserve(&self, bytes: u64) -> Result<ReservationFuture> {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let new_used = used.checked_add(bytes)?;
                (new_used <= self.max_bytes).then_some(new_used)
            })
            .map_err(|_| GovernorError::exceeded_spill_limit(self.max_bytes))?;
        Ok(ReservationFuture::ready())
    }

    fn free(&self, bytes: u64) {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_sub(bytes)
            })
            .expect("tried to free more spill space than is reserved");
    }

    fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}
