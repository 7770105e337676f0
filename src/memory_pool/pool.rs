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

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::memory_pool::{
    MemoryPool, MemoryPoolId, QueryId, ReservationFuture, ReservationPromise,
};

/// A [`MemoryPool`] that enforces no limit.
///
/// Reservations are tracked per query but every future resolves immediately.
#[derive(Debug)]
pub struct UnboundedMemoryPool {
    id: MemoryPoolId,
    reserved: AtomicU64,
    queries: Mutex<HashMap<QueryId, u64>>,
}

impl UnboundedMemoryPool {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: MemoryPoolId::new(id),
            reserved: AtomicU64::new(0),
            queries: Mutex::new(HashMap::new()),
        }
    }
}

impl MemoryPool for UnboundedMemoryPool {
    fn id(&self) -> &MemoryPoolId {
        &self.id
    }

    fn max_bytes(&self) -> u64 {
        u64::MAX
    }

    fn reserve(&self, query_id: &QueryId, bytes: u64) -> ReservationFuture {
        *self.queries.lock().entry(query_id.clone()).or_insert(0) += bytes;
        self.reserved.fetch_add(bytes, Ordering::Relaxed);
        ReservationFuture::ready()
    }

    fn reserve_revocable(&self, query_id: &QueryId, bytes: u64) -> ReservationFuture {
        self.reserve(query_id, bytes)
    }

    fn try_reserve(&self, query_id: &QueryId, bytes: u64) -> bool {
        self.reserve(query_id, bytes);
        true
    }

    fn free(&self, query_id: &QueryId, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut queries = self.queries.lock();
        let reservation = queries
            .get_mut(query_id)
            .expect("query did not reserve memory from this pool");
        *reservation = reservation
            .checked_sub(bytes)
            .expect("tried to free more memory than is reserved");
        if *reservation == 0 {
            queries.remove(query_id);
        }
        self.reserved.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn free_revocable(&self, query_id: &QueryId, bytes: u64) {
        self.free(query_id, bytes);
    }

    fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Relaxed)
    }

    fn query_reserved(&self, query_id: &QueryId) -> u64 {
        self.queries.lock().get(query_id).copied().unwrap_or(0)
    }
}

/// A [`MemoryPool`] with a fixed capacity shared by every query on a node.
///
/// Reservations are accounted immediately, even past capacity, so the total
/// in-flight reserved memory visible to the cluster never understates what
/// queries actually hold. Backpressure is delivered through the returned
/// future instead: whenever the pool is at or over capacity the future stays
/// pending, and every pending future resolves as soon as a free brings the
/// pool back under its limit.
///
/// Per-query accounting is a single combined total. User and revocable bytes
/// both land in it; the authoritative user/revocable split is owned by the
/// query's own tracking context, which keeps pool migration a plain
/// reserve-then-free of the combined total.
#[derive(Debug)]
pub struct ClusterMemoryPool {
    id: MemoryPoolId,
    max_bytes: u64,
    state: Mutex<ClusterPoolState>,
}

#[derive(Debug, Default)]
struct ClusterPoolState {
    /// Total bytes reserved, may exceed `max_bytes`
    reserved: u64,
    /// Outstanding reservation per query
    queries: HashMap<QueryId, u64>,
    /// Promises of every reservation granted while the pool was exhausted
    waiters: Vec<ReservationPromise>,
}

impl ClusterMemoryPool {
    pub fn new(id: impl Into<String>, max_bytes: u64) -> Self {
        let id = MemoryPoolId::new(id);
        debug!("Created new ClusterMemoryPool(id={id}, max_bytes={max_bytes})");
        Self {
            id,
            max_bytes,
            state: Mutex::new(ClusterPoolState::default()),
        }
    }

    /// Bytes of capacity not yet reserved; zero when overcommitted
    pub fn free_bytes(&self) -> u64 {
        self.max_bytes.saturating_sub(self.state.lock().reserved)
    }
}

impl MemoryPool for ClusterMemoryPool {
    fn id(&self) -> &MemoryPoolId {
        &self.id
    }

    fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn reserve(&self, query_id: &QueryId, bytes: u64) -> ReservationFuture {
        let mut state = self.state.lock();
        *state.queries.entry(query_id.clone()).or_insert(0) += bytes;
        state.reserved += bytes;

        if state.reserved < self.max_bytes {
            ReservationFuture::ready()
        } else {
            let (future, promise) = ReservationFuture::pending();
            state.waiters.push(promise);
            future
        }
    }

    fn reserve_revocable(&self, query_id: &QueryId, bytes: u64) -> ReservationFuture {
        self.reserve(query_id, bytes)
    }

    fn try_reserve(&self, query_id: &QueryId, bytes: u64) -> bool {
        let mut state = self.state.lock();
        let reserved = match state.reserved.checked_add(bytes) {
            Some(total) if total <= self.max_bytes => total,
            _ => return false,
        };
        *state.queries.entry(query_id.clone()).or_insert(0) += bytes;
        state.reserved = reserved;
        true
    }

    fn free(&self, query_id: &QueryId, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let to_complete = {
            let mut state = self.state.lock();
            let reservation = state
                .queries
                .get_mut(query_id)
                .expect("query did not reserve memory from this pool");
            *reservation = reservation
                .checked_sub(bytes)
                .expect("tried to free more memory than is reserved");
            if *reservation == 0 {
                state.queries.remove(query_id);
            }
            state.reserved -= bytes;

            if state.reserved < self.max_bytes {
                std::mem::take(&mut state.waiters)
            } else {
                Vec::new()
            }
        };
        // resolve outside of lock scope
        for promise in to_complete {
            promise.complete();
        }
    }

    fn free_revocable(&self, query_id: &QueryId, bytes: u64) {
        self.free(query_id, bytes);
    }

    fn reserved(&self) -> u64 {
        self.state.lock().reserved
    }

    fn query_reserved(&self, query_id: &QueryId) -> u64 {
        self.state.lock().queries.get(query_id).copied().unwrap_or(0)
    }
}
