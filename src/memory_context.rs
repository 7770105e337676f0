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

//! Hierarchical byte counters for user, revocable and system memory.
//!
//! A [`MemoryTrackingContext`] only records bytes explicitly reported by the
//! caller; it does not reflect real allocator statistics. Task-level contexts
//! are derived from the query-level context so that every task reservation is
//! also visible in the query aggregate that the governor checks against the
//! query ceiling and registers with the memory pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A single monotonically adjustable counter chained to an optional parent.
///
/// Adjustments propagate to every ancestor, so a parent's value is always the
/// sum of its own adjustments and those of all descendants.
#[derive(Debug)]
struct MemoryCounter {
    reserved: AtomicU64,
    parent: Option<Arc<MemoryCounter>>,
}

impl MemoryCounter {
    fn new_root() -> Arc<Self> {
        Arc::new(Self {
            reserved: AtomicU64::new(0),
            parent: None,
        })
    }

    fn new_child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            reserved: AtomicU64::new(0),
            parent: Some(Arc::clone(self)),
        })
    }

    fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    fn add(&self, bytes: u64) {
        let mut counter = Some(self);
        while let Some(current) = counter {
            current.reserved.fetch_add(bytes, Ordering::AcqRel);
            counter = current.parent.as_deref();
        }
    }

    /// # Panics
    ///
    /// Panics if `bytes` exceeds the counter's current value at any level of
    /// the hierarchy; silently clamping would mask a caller accounting bug.
    fn subtract(&self, bytes: u64) {
        let mut counter = Some(self);
        while let Some(current) = counter {
            current
                .reserved
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                    reserved.checked_sub(bytes)
                })
                .expect("tried to free more memory than is reserved");
            counter = current.parent.as_deref();
        }
    }
}

/// Aggregation of the three independent memory counters tracked per query
/// and per task.
#[derive(Debug)]
pub struct MemoryTrackingContext {
    user: Arc<MemoryCounter>,
    revocable: Arc<MemoryCounter>,
    system: Arc<MemoryCounter>,
}

impl MemoryTrackingContext {
    /// Create a root (query-level) tracking context
    pub fn new() -> Self {
        Self {
            user: MemoryCounter::new_root(),
            revocable: MemoryCounter::new_root(),
            system: MemoryCounter::new_root(),
        }
    }

    /// Derive a child context whose reservations aggregate into this one
    pub fn new_child(&self) -> Self {
        Self {
            user: self.user.new_child(),
            revocable: self.revocable.new_child(),
            system: self.system.new_child(),
        }
    }

    pub fn reserved_user_memory(&self) -> u64 {
        self.user.reserved()
    }

    pub fn reserved_revocable_memory(&self) -> u64 {
        self.revocable.reserved()
    }

    pub fn reserved_system_memory(&self) -> u64 {
        self.system.reserved()
    }

    pub fn add_user_memory(&self, bytes: u64) {
        self.user.add(bytes);
    }

    pub fn free_user_memory(&self, bytes: u64) {
        self.user.subtract(bytes);
    }

    pub fn add_revocable_memory(&self, bytes: u64) {
        self.revocable.add(bytes);
    }

    pub fn free_revocable_memory(&self, bytes: u64) {
        self.revocable.subtract(bytes);
    }

    pub fn add_system_memory(&self, bytes: u64) {
        self.system.add(bytes);
    }

    pub fn free_system_memory(&self, bytes: u64) {
        self.system.subtract(bytes);
    }
}

impl Default for MemoryTrackingContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent() {
        let ctx = MemoryTrackingContext::new();
        ctx.add_user_memory(100);
        ctx.add_revocable_memory(200);
        ctx.add_system_memory(300);

        assert_eq!(ctx.reserved_user_memory(), 100);
        assert_eq!(ctx.reserved_revocable_memory(), 200);
        assert_eq!(ctx.reserved_system_memory(), 300);

        ctx.free_revocable_memory(200);
        assert_eq!(ctx.reserved_user_memory(), 100);
        assert_eq!(ctx.reserved_revocable_memory(), 0);
        assert_eq!(ctx.reserved_system_memory(), 300);
    }

    #[test]
    fn test_child_reservations_aggregate_into_parent() {
        let query = MemoryTrackingContext::new();
        let task1 = query.new_child();
        let task2 = query.new_child();

        task1.add_user_memory(100);
        task2.add_user_memory(50);
        query.add_user_memory(7);

        assert_eq!(task1.reserved_user_memory(), 100);
        assert_eq!(task2.reserved_user_memory(), 50);
        assert_eq!(query.reserved_user_memory(), 157);

        task1.free_user_memory(100);
        assert_eq!(query.reserved_user_memory(), 57);
        assert_eq!(task2.reserved_user_memory(), 50);
    }

    #[test]
    fn test_grandchild_aggregates_to_root() {
        let query = MemoryTrackingContext::new();
        let task = query.new_child();
        let operator = task.new_child();

        operator.add_revocable_memory(64);
        assert_eq!(task.reserved_revocable_memory(), 64);
        assert_eq!(query.reserved_revocable_memory(), 64);
    }

    #[test]
    #[should_panic(expected = "tried to free more memory than is reserved")]
    fn test_underflow_panics() {
        let ctx = MemoryTrackingContext::new();
        ctx.add_user_memory(10);
        ctx.free_user_memory(11);
    }

    #[test]
    #[should_panic(expected = "tried to free more memory than is reserved")]
    fn test_child_free_exceeding_own_reservation_panics() {
        let query = MemoryTrackingContext::new();
        let task = query.new_child();
        query.add_user_memory(100);

        // the query aggregate holds 100 bytes but this task reserved none
        task.free_user_memory(1);
    }
}
