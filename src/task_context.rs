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

//! Per-task execution state registered with a
//! [`QueryContext`](crate::query_context::QueryContext)

use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;
use tokio::sync::Notify;

use crate::config::SessionConfig;
use crate::memory_context::MemoryTrackingContext;
use crate::memory_pool::TaskId;
use crate::query_context::QueryContextVisitor;

/// Execution state of one task of a query.
///
/// Created through
/// [`QueryContext::add_task_context`](crate::query_context::QueryContext::add_task_context)
/// so that the task's memory context is a child of the query-level aggregate.
/// The governor signals the task whenever more memory may have become
/// available (e.g. after a pool switch) so operators blocked on backpressure
/// can retry their reservations.
#[derive(Debug)]
pub struct TaskContext {
    task_id: TaskId,
    session: SessionConfig,
    task_memory_context: MemoryTrackingContext,
    memory_notifications: AtomicUsize,
    memory_available: Notify,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        session: SessionConfig,
        task_memory_context: MemoryTrackingContext,
    ) -> Self {
        Self {
            task_id,
            session,
            task_memory_context,
            memory_notifications: AtomicUsize::new(0),
            memory_available: Notify::new(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    /// The task-level memory context; reservations made here aggregate into
    /// the owning query's totals
    pub fn memory_context(&self) -> &MemoryTrackingContext {
        &self.task_memory_context
    }

    /// Signal that more memory may be available, waking every operator
    /// suspended in [`TaskContext::wait_for_more_memory`]
    pub fn more_memory_available(&self) {
        self.memory_notifications.fetch_add(1, Ordering::Relaxed);
        debug!("task {}: more memory available", self.task_id);
        self.memory_available.notify_waiters();
    }

    /// Suspend until the next [`TaskContext::more_memory_available`] signal
    pub async fn wait_for_more_memory(&self) {
        self.memory_available.notified().await;
    }

    /// Number of memory-available signals delivered so far
    pub fn memory_available_notifications(&self) -> usize {
        self.memory_notifications.load(Ordering::Relaxed)
    }

    pub fn accept<C, R>(&self, visitor: &dyn QueryContextVisitor<C, R>, context: &C) -> R {
        visitor.visit_task_context(self, context)
    }
}
