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

//! [`QueryContext`]: per-query memory and spill governor

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::config::{QueryContextConfig, SessionConfig};
use crate::error::{GovernorError, Result};
use crate::memory_context::MemoryTrackingContext;
use crate::memory_pool::{MemoryPool, QueryId, ReservationFuture, TaskId};
use crate::spill_tracker::SpillBudgetTracker;
use crate::task_context::TaskContext;

/// Tracks, limits and arbitrates the memory and spill space consumed by one
/// running query across all of its tasks.
///
/// All mutating operations are serialized by a single per-query lock; given
/// the low per-query call frequency this coarse lock is a deliberate
/// simplicity/correctness trade-off. Collaborator calls made under the lock
/// (pool reservation, spill tracker reservation) are non-blocking by
/// contract; user code is never invoked while the lock is held. Continuations
/// on pool futures run on the notification executor supplied at construction,
/// never inline on the pool's completion path.
#[derive(Debug)]
pub struct QueryContext {
    query_id: QueryId,
    max_spill: u64,
    guaranteed_memory: u64,
    spill_tracker: Arc<dyn SpillBudgetTracker>,
    system_memory_pool: Arc<dyn MemoryPool>,
    notification_executor: Handle,
    query_memory_context: MemoryTrackingContext,
    /// Task registry; entries are never removed once added
    task_contexts: Arc<DashMap<TaskId, Arc<TaskContext>>>,
    state: Mutex<QueryContextState>,
}

#[derive(Debug)]
struct QueryContextState {
    /// Ceiling on reserved user memory; widened to the pool maximum by
    /// [`QueryContext::set_resource_overcommit`]
    max_memory: u64,
    memory_pool: Arc<dyn MemoryPool>,
    spill_used: u64,
}

impl QueryContext {
    pub fn new(
        query_id: QueryId,
        config: QueryContextConfig,
        memory_pool: Arc<dyn MemoryPool>,
        system_memory_pool: Arc<dyn MemoryPool>,
        spill_tracker: Arc<dyn SpillBudgetTracker>,
        notification_executor: Handle,
    ) -> Self {
        Self {
            query_id,
            max_spill: config.max_spill(),
            guaranteed_memory: config.guaranteed_memory(),
            spill_tracker,
            system_memory_pool,
            notification_executor,
            query_memory_context: MemoryTrackingContext::new(),
            task_contexts: Arc::new(DashMap::new()),
            state: Mutex::new(QueryContextState {
                max_memory: config.max_memory(),
                memory_pool,
                spill_used: 0,
            }),
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    /// The query-level memory context. Callers reflect their byte counts here
    /// (directly or through a task-level child) before asking the governor to
    /// register them with the pool.
    pub fn query_memory_context(&self) -> &MemoryTrackingContext {
        &self.query_memory_context
    }

    /// The currently assigned memory pool
    pub fn memory_pool(&self) -> Arc<dyn MemoryPool> {
        Arc::clone(&self.state.lock().memory_pool)
    }

    pub fn max_memory(&self) -> u64 {
        self.state.lock().max_memory
    }

    pub fn max_spill(&self) -> u64 {
        self.max_spill
    }

    pub fn spill_used(&self) -> u64 {
        self.state.lock().spill_used
    }

    /// Register `bytes` of user memory with the current pool.
    ///
    /// `bytes` must already be reflected in the query's memory context: the
    /// accounting is optimistic, the local counter is updated first and then
    /// validated here. If the post-reservation user total exceeds the query
    /// ceiling this fails before any pool reservation is made and the caller
    /// is expected to roll its counter back.
    pub fn reserve_memory(&self, bytes: u64) -> Result<ReservationFuture> {
        let state = self.state.lock();
        let reserved_user = self.query_memory_context.reserved_user_memory();
        if reserved_user > state.max_memory {
            return Err(GovernorError::exceeded_memory_limit(state.max_memory));
        }
        let future = state.memory_pool.reserve(&self.query_id, bytes);
        // Never block queries using a trivial amount of memory
        if reserved_user < self.guaranteed_memory {
            return Ok(ReservationFuture::ready());
        }
        Ok(future)
    }

    /// Register `bytes` of revocable memory with the current pool.
    ///
    /// Revocable memory can be reclaimed on demand by spilling, so it is not
    /// checked against the query ceiling; the pool's future is returned
    /// directly.
    pub fn reserve_revocable_memory(&self, bytes: u64) -> ReservationFuture {
        let state = self.state.lock();
        state.memory_pool.reserve_revocable(&self.query_id, bytes)
    }

    /// Register `bytes` of system memory with the separate system pool,
    /// independent of the query ceiling and of the current pool
    pub fn reserve_system_memory(&self, bytes: u64) -> ReservationFuture {
        self.system_memory_pool.reserve(&self.query_id, bytes)
    }

    /// Reserve `bytes` of spill space, failing synchronously if the query's
    /// spill ceiling or the shared spill budget would be exceeded
    pub fn reserve_spill(&self, bytes: u64) -> Result<ReservationFuture> {
        let mut state = self.state.lock();
        let spill_used = state
            .spill_used
            .checked_add(bytes)
            .filter(|total| *total <= self.max_spill)
            .ok_or_else(|| GovernorError::exceeded_spill_limit(self.max_spill))?;
        let future = self.spill_tracker.reserve(bytes)?;
        state.spill_used = spill_used;
        Ok(future)
    }

    /// Non-blocking reservation of user memory.
    ///
    /// Unlike [`QueryContext::reserve_memory`], `bytes` is not yet reflected
    /// in the query's memory context; the ceiling check is performed against
    /// the would-be total. Returns whether the pool granted the bytes; never
    /// returns a pending result.
    pub fn try_reserve_memory(&self, bytes: u64) -> bool {
        let state = self.state.lock();
        match self.query_memory_context.reserved_user_memory().checked_add(bytes) {
            Some(total) if total <= state.max_memory => {}
            _ => return false,
        }
        state.memory_pool.try_reserve(&self.query_id, bytes)
    }

    pub fn free_memory(&self, bytes: u64) {
        let state = self.state.lock();
        state.memory_pool.free(&self.query_id, bytes);
    }

    pub fn free_revocable_memory(&self, bytes: u64) {
        let state = self.state.lock();
        state.memory_pool.free_revocable(&self.query_id, bytes);
    }

    pub fn free_system_memory(&self, bytes: u64) {
        self.system_memory_pool.free(&self.query_id, bytes);
    }

    /// Release `bytes` of spill space.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` exceeds the spill space currently reserved; that is
    /// a caller accounting bug and is never silently tolerated.
    pub fn free_spill(&self, bytes: u64) {
        let mut state = self.state.lock();
        assert!(
            state.spill_used >= bytes,
            "tried to free more spill space than is reserved"
        );
        state.spill_used -= bytes;
        self.spill_tracker.free(bytes);
    }

    /// Permanently relax the local ceiling to the pool maximum, making the
    /// pool the effective arbiter. The worker kills the query if it uses the
    /// entire pool; a higher-level control loop kills it if the cluster runs
    /// out of memory.
    pub fn set_resource_overcommit(&self) {
        let mut state = self.state.lock();
        state.max_memory = state.memory_pool.max_bytes();
        debug!(
            "query {}: resource overcommit, max memory raised to {}",
            self.query_id, state.max_memory
        );
    }

    /// Reassign the query to `pool`, migrating its outstanding reservation.
    ///
    /// The new pool is reserved before the old one is released so that the
    /// total in-flight reserved memory visible to the cluster never drops
    /// below what the query actually holds. The old pool is released whether
    /// or not the new reservation succeeded; a failure is surfaced in the log
    /// rather than leaking the old pool's accounting. Once the hand-off
    /// completes, every registered task is notified that more memory may be
    /// available so operators blocked on the old pool's backpressure retry
    /// against the new one.
    pub fn set_memory_pool(&self, pool: Arc<dyn MemoryPool>) {
        let (original_pool, original_reserved, future) = {
            let mut state = self.state.lock();
            if pool.id() == state.memory_pool.id() {
                // Don't unblock our tasks and thrash the pools, if this is a no-op
                return;
            }
            let original_pool = Arc::clone(&state.memory_pool);
            let original_reserved = self.query_memory_context.reserved_user_memory()
                + self.query_memory_context.reserved_revocable_memory();
            state.memory_pool = Arc::clone(&pool);
            // From here on every new reservation addresses the new pool; the
            // reserve call itself is non-blocking by contract.
            let future = pool.reserve(&self.query_id, original_reserved);
            (original_pool, original_reserved, future)
        };

        let query_id = self.query_id.clone();
        let task_contexts = Arc::clone(&self.task_contexts);
        self.notification_executor.spawn(async move {
            if let Err(e) = future.await {
                warn!("query {query_id}: reservation against new memory pool failed: {e}");
            }
            original_pool.free(&query_id, original_reserved);
            // Unblock all the tasks, if they were waiting for memory, since
            // we're in a new pool
            for task in task_contexts.iter() {
                task.value().more_memory_available();
            }
        });
    }

    /// Create the task context for `task_id` as a child of the query-level
    /// memory context and register it.
    ///
    /// # Panics
    ///
    /// Panics if a task context already exists for `task_id`.
    pub fn add_task_context(
        &self,
        task_id: TaskId,
        session: SessionConfig,
    ) -> Arc<TaskContext> {
        let task_context = Arc::new(TaskContext::new(
            task_id.clone(),
            session,
            self.query_memory_context.new_child(),
        ));
        match self.task_contexts.entry(task_id) {
            Entry::Occupied(entry) => {
                panic!("task context already exists for {}", entry.key())
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&task_context));
            }
        }
        task_context
    }

    /// Look up the task context registered for `task_id`.
    ///
    /// # Panics
    ///
    /// Panics if no such task exists; asking for an unregistered task is a
    /// caller programming error.
    pub fn task_context(&self, task_id: &TaskId) -> Arc<TaskContext> {
        self.task_contexts
            .get(task_id)
            .map(|entry| Arc::clone(entry.value()))
            .expect("task does not exist")
    }

    pub fn accept<C, R>(&self, visitor: &dyn QueryContextVisitor<C, R>, context: &C) -> R {
        visitor.visit_query_context(self, context)
    }

    pub fn accept_children<C, R>(
        &self,
        visitor: &dyn QueryContextVisitor<C, R>,
        context: &C,
    ) -> Vec<R> {
        self.task_contexts
            .iter()
            .map(|entry| entry.value().accept(visitor, context))
            .collect()
    }
}

/// Diagnostic traversal of the query/task context tree
pub trait QueryContextVisitor<C, R> {
    fn visit_query_context(&self, query_context: &QueryContext, context: &C) -> R;

    fn visit_task_context(&self, task_context: &TaskContext, context: &C) -> R;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_pool::ClusterMemoryPool;
    use crate::spill_tracker::SpillSpaceTracker;
    use std::time::Duration;

    fn test_context(
        config: QueryContextConfig,
        pool: &Arc<ClusterMemoryPool>,
    ) -> QueryContext {
        QueryContext::new(
            QueryId::new("20260829_000000_00000_test"),
            config,
            Arc::clone(pool) as Arc<dyn MemoryPool>,
            Arc::new(ClusterMemoryPool::new("system", u64::MAX)),
            Arc::new(SpillSpaceTracker::default()),
            Handle::current(),
        )
    }

    /// Wait until `predicate` holds, or panic after a generous timeout
    async fn wait_until(predicate: impl Fn() -> bool) {
        for _ in 0..1000 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn test_exceeded_memory_limit() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 1 << 30));
        let ctx = test_context(
            QueryContextConfig::new().with_max_memory(1_000_000),
            &pool,
        );

        ctx.query_memory_context().add_user_memory(1_000_000);
        let future = ctx.reserve_memory(1_000_000).unwrap();
        assert!(future.is_resolved());
        assert_eq!(pool.query_reserved(ctx.query_id()), 1_000_000);

        ctx.query_memory_context().add_user_memory(1);
        let err = ctx.reserve_memory(1).unwrap_err();
        assert_eq!(err.to_string(), "Query exceeded local memory limit of 976.6 KB");
        // no partial reservation reached the pool; the caller rolls back its
        // optimistic counter update
        assert_eq!(pool.query_reserved(ctx.query_id()), 1_000_000);
        ctx.query_memory_context().free_user_memory(1);
        assert_eq!(ctx.query_memory_context().reserved_user_memory(), 1_000_000);
    }

    #[tokio::test]
    async fn test_small_queries_are_never_blocked() {
        // a pool with zero capacity blocks every reservation it grants
        let pool = Arc::new(ClusterMemoryPool::new("general", 0));
        let ctx = test_context(QueryContextConfig::new(), &pool);

        ctx.query_memory_context().add_user_memory(1000);
        let future = ctx.reserve_memory(1000).unwrap();
        assert!(future.is_resolved());
        // the pool still accounted the bytes
        assert_eq!(pool.query_reserved(ctx.query_id()), 1000);
    }

    #[tokio::test]
    async fn test_large_queries_see_pool_backpressure() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 0));
        let ctx = test_context(QueryContextConfig::new(), &pool);

        let bytes = 2 * crate::config::GUARANTEED_MEMORY;
        ctx.query_memory_context().add_user_memory(bytes);
        let future = ctx.reserve_memory(bytes).unwrap();
        assert!(!future.is_resolved());
    }

    #[tokio::test]
    async fn test_revocable_memory_ignores_ceiling() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 1 << 30));
        let ctx = test_context(QueryContextConfig::new().with_max_memory(100), &pool);

        ctx.query_memory_context().add_revocable_memory(1_000_000);
        let future = ctx.reserve_revocable_memory(1_000_000);
        assert!(future.is_resolved());
        assert_eq!(pool.query_reserved(ctx.query_id()), 1_000_000);

        ctx.free_revocable_memory(1_000_000);
        ctx.query_memory_context().free_revocable_memory(1_000_000);
        assert_eq!(pool.query_reserved(ctx.query_id()), 0);
    }

    #[tokio::test]
    async fn test_system_memory_uses_separate_pool() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 1 << 30));
        let system_pool = Arc::new(ClusterMemoryPool::new("system", 1 << 30));
        let ctx = QueryContext::new(
            QueryId::new("q1"),
            QueryContextConfig::new().with_max_memory(100),
            Arc::clone(&pool) as Arc<dyn MemoryPool>,
            Arc::clone(&system_pool) as Arc<dyn MemoryPool>,
            Arc::new(SpillSpaceTracker::default()),
            Handle::current(),
        );

        ctx.query_memory_context().add_system_memory(5000);
        let future = ctx.reserve_system_memory(5000);
        assert!(future.is_resolved());
        assert_eq!(system_pool.query_reserved(ctx.query_id()), 5000);
        assert_eq!(pool.query_reserved(ctx.query_id()), 0);

        ctx.free_system_memory(5000);
        ctx.query_memory_context().free_system_memory(5000);
        assert_eq!(system_pool.query_reserved(ctx.query_id()), 0);
    }

    #[tokio::test]
    async fn test_try_reserve_memory() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 70));
        let ctx = test_context(QueryContextConfig::new().with_max_memory(100), &pool);

        // over the query ceiling, the pool is never consulted
        assert!(!ctx.try_reserve_memory(101));
        assert_eq!(pool.reserved(), 0);

        assert!(ctx.try_reserve_memory(50));
        assert_eq!(pool.query_reserved(ctx.query_id()), 50);

        // within the ceiling but beyond pool capacity
        assert!(!ctx.try_reserve_memory(60));
        assert_eq!(pool.query_reserved(ctx.query_id()), 50);
    }

    #[tokio::test]
    async fn test_overflowing_requests_are_rejected() {
        let pool = Arc::new(ClusterMemoryPool::new("general", u64::MAX));
        let ctx = test_context(QueryContextConfig::new().with_max_spill(u64::MAX), &pool);

        // an addition that would wrap must not slip past the ceiling checks
        ctx.query_memory_context().add_user_memory(100);
        assert!(!ctx.try_reserve_memory(u64::MAX));
        assert_eq!(pool.reserved(), 0);

        ctx.reserve_spill(100).unwrap();
        let err = ctx.reserve_spill(u64::MAX).unwrap_err();
        assert!(matches!(err, GovernorError::SpillLimitExceeded { .. }));
        assert_eq!(ctx.spill_used(), 100);
    }

    #[tokio::test]
    async fn test_guaranteed_memory_threshold_is_configurable() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 0));

        // lowering the threshold blocks a reservation the default waves through
        let ctx = test_context(QueryContextConfig::new().with_guaranteed_memory(16), &pool);
        ctx.query_memory_context().add_user_memory(1000);
        assert!(!ctx.reserve_memory(1000).unwrap().is_resolved());

        // raising it keeps the query unblocked well past the default threshold
        let bytes = 8 * crate::config::GUARANTEED_MEMORY;
        let ctx = test_context(
            QueryContextConfig::new().with_guaranteed_memory(crate::GB),
            &pool,
        );
        ctx.query_memory_context().add_user_memory(bytes);
        assert!(ctx.reserve_memory(bytes).unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_spill_accounting() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 1 << 30));
        let ctx = test_context(QueryContextConfig::new().with_max_spill(500), &pool);

        let future = ctx.reserve_spill(500).unwrap();
        assert!(future.is_resolved());
        assert_eq!(ctx.spill_used(), 500);

        let err = ctx.reserve_spill(1).unwrap_err();
        assert_eq!(err.to_string(), "Query exceeded local spill limit of 500.0 B");
        assert_eq!(ctx.spill_used(), 500);

        ctx.free_spill(500);
        assert_eq!(ctx.spill_used(), 0);
        ctx.reserve_spill(500).unwrap();
        assert_eq!(ctx.spill_used(), 500);
    }

    #[tokio::test]
    async fn test_shared_spill_budget_failure_reserves_nothing() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 1 << 30));
        let tracker = Arc::new(SpillSpaceTracker::new(100));
        let ctx = QueryContext::new(
            QueryId::new("q1"),
            QueryContextConfig::new().with_max_spill(1000),
            Arc::clone(&pool) as Arc<dyn MemoryPool>,
            Arc::new(ClusterMemoryPool::new("system", u64::MAX)),
            Arc::clone(&tracker) as Arc<dyn SpillBudgetTracker>,
            Handle::current(),
        );

        // within the query ceiling but over the shared tracker budget
        ctx.reserve_spill(101).unwrap_err();
        assert_eq!(ctx.spill_used(), 0);
        assert_eq!(tracker.used(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "tried to free more spill space than is reserved")]
    async fn test_free_spill_underflow_panics() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 1 << 30));
        let ctx = test_context(QueryContextConfig::new().with_max_spill(500), &pool);

        ctx.reserve_spill(100).unwrap();
        ctx.free_spill(101);
    }

    #[tokio::test]
    async fn test_resource_overcommit() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 10_000_000));
        let ctx = test_context(QueryContextConfig::new().with_max_memory(1000), &pool);

        ctx.set_resource_overcommit();
        assert_eq!(ctx.max_memory(), 10_000_000);

        ctx.query_memory_context().add_user_memory(9_999_999);
        let future = ctx.reserve_memory(9_999_999).unwrap();
        assert!(future.is_resolved());
    }

    #[tokio::test]
    async fn test_pool_switch_preserves_reservation() {
        let pool_a = Arc::new(ClusterMemoryPool::new("general", 1000));
        let pool_b = Arc::new(ClusterMemoryPool::new("reserved", 1000));
        let ctx = test_context(QueryContextConfig::new(), &pool_a);

        let task1 = ctx.add_task_context(TaskId::new("t1"), SessionConfig::new());
        let task2 = ctx.add_task_context(TaskId::new("t2"), SessionConfig::new());

        ctx.query_memory_context().add_user_memory(60);
        ctx.reserve_memory(60).unwrap();
        ctx.query_memory_context().add_revocable_memory(40);
        ctx.reserve_revocable_memory(40);
        assert_eq!(pool_a.query_reserved(ctx.query_id()), 100);

        ctx.set_memory_pool(Arc::clone(&pool_b) as Arc<dyn MemoryPool>);
        assert_eq!(ctx.memory_pool().id(), pool_b.id());

        let pool_a_probe = Arc::clone(&pool_a);
        let query_id = ctx.query_id().clone();
        wait_until(move || pool_a_probe.query_reserved(&query_id) == 0).await;

        assert_eq!(pool_b.query_reserved(ctx.query_id()), 100);
        assert_eq!(task1.memory_available_notifications(), 1);
        assert_eq!(task2.memory_available_notifications(), 1);
    }

    #[tokio::test]
    async fn test_switch_to_same_pool_is_noop() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 1000));
        let ctx = test_context(QueryContextConfig::new(), &pool);
        let task = ctx.add_task_context(TaskId::new("t1"), SessionConfig::new());

        ctx.query_memory_context().add_user_memory(100);
        ctx.reserve_memory(100).unwrap();

        ctx.set_memory_pool(Arc::clone(&pool) as Arc<dyn MemoryPool>);
        tokio::time::sleep(Duration::from_millis(5)).await;

        // no reserve/free dance, no task notifications
        assert_eq!(pool.query_reserved(ctx.query_id()), 100);
        assert_eq!(pool.reserved(), 100);
        assert_eq!(task.memory_available_notifications(), 0);
    }

    #[tokio::test]
    async fn test_switch_holds_old_pool_until_new_pool_has_capacity() {
        let pool_a = Arc::new(ClusterMemoryPool::new("general", 1000));
        let pool_b = Arc::new(ClusterMemoryPool::new("reserved", 150));
        let ctx = test_context(QueryContextConfig::new(), &pool_a);
        let task = ctx.add_task_context(TaskId::new("t1"), SessionConfig::new());

        ctx.query_memory_context().add_user_memory(100);
        ctx.reserve_memory(100).unwrap();

        // another query takes most of the new pool
        let other = QueryId::new("other");
        pool_b.reserve(&other, 100);

        ctx.set_memory_pool(Arc::clone(&pool_b) as Arc<dyn MemoryPool>);
        tokio::time::sleep(Duration::from_millis(5)).await;

        // hand-off incomplete: both pools still account the bytes so the
        // in-flight total never understates what the query holds
        assert_eq!(pool_a.query_reserved(ctx.query_id()), 100);
        assert_eq!(pool_b.query_reserved(ctx.query_id()), 100);
        assert_eq!(task.memory_available_notifications(), 0);

        // capacity opens up in the new pool, completing the hand-off
        pool_b.free(&other, 100);

        let pool_a_probe = Arc::clone(&pool_a);
        let query_id = ctx.query_id().clone();
        wait_until(move || pool_a_probe.query_reserved(&query_id) == 0).await;
        assert_eq!(pool_b.query_reserved(ctx.query_id()), 100);
        assert_eq!(task.memory_available_notifications(), 1);
    }

    #[tokio::test]
    async fn test_switch_with_no_reservation() {
        let pool_a = Arc::new(ClusterMemoryPool::new("general", 1000));
        let pool_b = Arc::new(ClusterMemoryPool::new("reserved", 1000));
        let ctx = test_context(QueryContextConfig::new(), &pool_a);
        let task = ctx.add_task_context(TaskId::new("t1"), SessionConfig::new());

        ctx.set_memory_pool(Arc::clone(&pool_b) as Arc<dyn MemoryPool>);

        let task_probe = Arc::clone(&task);
        wait_until(move || task_probe.memory_available_notifications() == 1).await;
        assert_eq!(pool_a.reserved(), 0);
        assert_eq!(pool_b.query_reserved(ctx.query_id()), 0);
    }

    #[tokio::test]
    async fn test_reservations_after_switch_address_new_pool() {
        let pool_a = Arc::new(ClusterMemoryPool::new("general", 1000));
        let pool_b = Arc::new(ClusterMemoryPool::new("reserved", 1000));
        let ctx = test_context(QueryContextConfig::new(), &pool_a);

        ctx.set_memory_pool(Arc::clone(&pool_b) as Arc<dyn MemoryPool>);

        ctx.query_memory_context().add_user_memory(42);
        ctx.reserve_memory(42).unwrap();
        assert_eq!(pool_b.query_reserved(ctx.query_id()), 42);
        assert_eq!(pool_a.query_reserved(ctx.query_id()), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "task context already exists for t1")]
    async fn test_duplicate_task_context_panics() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 1000));
        let ctx = test_context(QueryContextConfig::new(), &pool);

        ctx.add_task_context(TaskId::new("t1"), SessionConfig::new());
        ctx.add_task_context(TaskId::new("t1"), SessionConfig::new());
    }

    #[tokio::test]
    #[should_panic(expected = "task does not exist")]
    async fn test_missing_task_context_panics() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 1000));
        let ctx = test_context(QueryContextConfig::new(), &pool);
        ctx.task_context(&TaskId::new("missing"));
    }

    #[tokio::test]
    async fn test_task_reservations_aggregate_into_query() {
        let pool = Arc::new(ClusterMemoryPool::new("general", 1000));
        let ctx = test_context(QueryContextConfig::new().with_max_memory(100), &pool);
        let task = ctx.add_task_context(TaskId::new("t1"), SessionConfig::new());

        task.memory_context().add_user_memory(80);
        ctx.reserve_memory(80).unwrap();
        assert_eq!(ctx.query_memory_context().reserved_user_memory(), 80);

        // a second task pushing the aggregate over the ceiling fails
        let task2 = ctx.add_task_context(TaskId::new("t2"), SessionConfig::new());
        task2.memory_context().add_user_memory(21);
        ctx.reserve_memory(21).unwrap_err();
        task2.memory_context().free_user_memory(21);

        assert_eq!(ctx.task_context(&TaskId::new("t1")).task_id().as_str(), "t1");
    }

    #[tokio::test]
    async fn test_visitor_traversal() {
        struct CountingVisitor;

        impl QueryContextVisitor<(), usize> for CountingVisitor {
            fn visit_query_context(&self, _: &QueryContext, _: &()) -> usize {
                1
            }

            fn visit_task_context(&self, _: &TaskContext, _: &()) -> usize {
                1
            }
        }

        let pool = Arc::new(ClusterMemoryPool::new("general", 1000));
        let ctx = test_context(QueryContextConfig::new(), &pool);
        ctx.add_task_context(TaskId::new("t1"), SessionConfig::new());
        ctx.add_task_context(TaskId::new("t2"), SessionConfig::new());

        assert_eq!(ctx.accept(&CountingVisitor, &()), 1);
        assert_eq!(ctx.accept_children(&CountingVisitor, &()).len(), 2);
    }
}
