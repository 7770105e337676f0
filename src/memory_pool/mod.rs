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

//! [`MemoryPool`]: shared byte budgets arbitrated across concurrent queries

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

mod future;
mod pool;

pub use future::{ReservationFuture, ReservationPromise};
pub use pool::{ClusterMemoryPool, UnboundedMemoryPool};

/// Opaque identifier of a running query.
///
/// Pools key their per-query accounting on this id; the governor never
/// inspects it beyond equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryId(Arc<str>);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a task within a query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id that uniquely identifies a memory pool ("general", "reserved", "system", ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryPoolId(Arc<str>);

impl MemoryPoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MemoryPoolId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A shared, process-wide budget of bytes arbitrated across the queries of a
/// cluster node.
///
/// Implementations must be internally thread-safe: a pool is shared by one
/// `QueryContext` per running query and every mutating call may race with
/// calls from other queries. The governor treats pools as opaque
/// collaborators and never assumes exclusive access.
///
/// Reservations are granted in accounting terms immediately; the returned
/// [`ReservationFuture`] is pure backpressure and resolves once the pool
/// actually has capacity. Callers that receive a pending future are expected
/// to suspend until it resolves. Implementations must never invoke wakers or
/// continuations while holding their internal locks.
pub trait MemoryPool: Send + Sync + Debug {
    /// Identifier of this pool, used by the governor's no-op switch guard
    fn id(&self) -> &MemoryPoolId;

    /// Maximum capacity of this pool in bytes
    fn max_bytes(&self) -> u64;

    /// Register a reservation of `bytes` for `query_id`.
    ///
    /// The bytes count against the pool as soon as this returns; the future
    /// resolves when the pool has free capacity.
    fn reserve(&self, query_id: &QueryId, bytes: u64) -> ReservationFuture;

    /// Same as [`MemoryPool::reserve`] for revocable bytes. A query's
    /// revocable memory can be reclaimed on demand by spilling, so pools may
    /// treat it with a different reclamation policy; the per-query total
    /// still includes it.
    fn reserve_revocable(&self, query_id: &QueryId, bytes: u64) -> ReservationFuture;

    /// Non-blocking reservation: returns `true` and accounts the bytes only
    /// if they fit within the pool's capacity right now.
    fn try_reserve(&self, query_id: &QueryId, bytes: u64) -> bool;

    /// Release `bytes` previously reserved for `query_id`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` exceeds the query's outstanding reservation; that is
    /// a caller accounting bug, not a recoverable condition.
    fn free(&self, query_id: &QueryId, bytes: u64);

    /// Release revocable `bytes` previously reserved for `query_id`
    fn free_revocable(&self, query_id: &QueryId, bytes: u64);

    /// Total bytes currently reserved against this pool
    fn reserved(&self) -> u64;

    /// Bytes currently reserved against this pool by `query_id`
    fn query_reserved(&self, query_id: &QueryId) -> u64;
}
