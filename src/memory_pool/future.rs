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

//! Asynchronously-resolved reservation futures.
//!
//! A [`ReservationFuture`] is handed to the caller of a pool reservation; the
//! matching [`ReservationPromise`] stays with the pool and is completed (or
//! failed) by the pool's own machinery once capacity becomes available. The
//! future carries its own error channel so pool failures propagate to the
//! waiting operator instead of being swallowed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::GovernorError;

#[derive(Debug, Default)]
struct SharedState {
    outcome: Option<Result<(), GovernorError>>,
    wakers: Vec<Waker>,
}

/// Future side of a pool reservation.
///
/// Resolves to `Ok(())` once the reserved bytes are actually available, or to
/// `Err` if the pool abandoned the reservation. Dropping the future does not
/// undo the reservation; accounting lives in the pool, and pairing every
/// reserve with a free remains the caller's job.
#[derive(Debug)]
pub struct ReservationFuture {
    state: Arc<Mutex<SharedState>>,
    // guards against polling a future that already returned Ready
    done: bool,
}

impl ReservationFuture {
    /// An already-resolved ("not blocked") future
    pub fn ready() -> Self {
        Self {
            state: Arc::new(Mutex::new(SharedState {
                outcome: Some(Ok(())),
                wakers: Vec::new(),
            })),
            done: false,
        }
    }

    /// A pending future together with the promise that resolves it
    pub fn pending() -> (Self, ReservationPromise) {
        let state = Arc::new(Mutex::new(SharedState::default()));
        let future = Self {
            state: Arc::clone(&state),
            done: false,
        };
        (future, ReservationPromise { state })
    }

    /// Whether the future has already been resolved (successfully or not)
    pub fn is_resolved(&self) -> bool {
        self.state.lock().outcome.is_some()
    }
}

impl Future for ReservationFuture {
    type Output = Result<(), GovernorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        assert!(!this.done, "polled ready future");

        let mut state = this.state.lock();
        match state.outcome.take() {
            Some(outcome) => {
                this.done = true;
                Poll::Ready(outcome)
            }
            None => {
                state.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Completion side of a pending [`ReservationFuture`], held by the pool.
///
/// If the promise is dropped without being completed (e.g. the pool is torn
/// down with reservations still queued), the future resolves to an error
/// rather than hanging forever.
#[derive(Debug)]
pub struct ReservationPromise {
    state: Arc<Mutex<SharedState>>,
}

impl ReservationPromise {
    /// Resolve the future successfully
    pub fn complete(self) {
        self.finish(Ok(()));
    }

    /// Resolve the future with an error
    pub fn fail(self, error: GovernorError) {
        self.finish(Err(error));
    }

    fn finish(self, outcome: Result<(), GovernorError>) {
        let to_wake = {
            let mut state = self.state.lock();
            if state.outcome.is_none() {
                state.outcome = Some(outcome);
            }
            std::mem::take(&mut state.wakers)
        };
        // wake outside of lock scope
        for waker in to_wake {
            waker.wake();
        }
    }
}

impl Drop for ReservationPromise {
    fn drop(&mut self) {
        let to_wake = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(Err(GovernorError::PoolReservationFailed(
                "pool abandoned a pending reservation".to_string(),
            )));
            std::mem::take(&mut state.wakers)
        };
        for waker in to_wake {
            waker.wake();
        }
    }
}
