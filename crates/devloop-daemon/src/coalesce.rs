//! Coalescing executor for restart-style operations
//!
//! [`Coalescer`] wraps an async operation so that at most one execution is in
//! flight. A call made while idle runs immediately. Calls made while an
//! execution is running return [`Coalesced::Executing`] at once and leave
//! their arguments behind (last call wins); when the running execution
//! finishes, exactly one trailing execution runs with those arguments.
//!
//! This is neither leading-edge debounce (which would drop the trailing
//! intent) nor trailing debounce (which would delay the first call).

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use devloop_core::prelude::*;

/// What a caller of [`Coalescer::call`] gets back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coalesced<T> {
    /// Another execution is running; this call's arguments will be used by
    /// the trailing execution unless a later call replaces them.
    Executing,
    /// This caller drove the execution; the value is from the last run.
    Result(T),
}

impl<T> Coalesced<T> {
    pub fn is_executing(&self) -> bool {
        matches!(self, Coalesced::Executing)
    }

    pub fn into_result(self) -> Option<T> {
        match self {
            Coalesced::Executing => None,
            Coalesced::Result(data) => Some(data),
        }
    }
}

type Operation<A, T> = dyn Fn(A) -> BoxFuture<'static, T> + Send + Sync;

#[derive(Debug)]
struct CoalesceState<A> {
    running: bool,
    pending: Option<A>,
    executions: u64,
}

/// Serializes an async operation with trailing-call coalescing.
///
/// Cloning is cheap; clones share the same in-flight state.
pub struct Coalescer<A, T> {
    op: Arc<Operation<A, T>>,
    state: Arc<Mutex<CoalesceState<A>>>,
}

impl<A, T> Clone for Coalescer<A, T> {
    fn clone(&self) -> Self {
        Self {
            op: Arc::clone(&self.op),
            state: Arc::clone(&self.state),
        }
    }
}

impl<A, T> Coalescer<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    pub fn new<F, Fut>(op: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            op: Arc::new(move |args| op(args).boxed()),
            state: Arc::new(Mutex::new(CoalesceState {
                running: false,
                pending: None,
                executions: 0,
            })),
        }
    }

    /// Run the operation now, or queue `args` for the trailing execution.
    pub async fn call(&self, args: A) -> Coalesced<T> {
        {
            let mut state = self.lock();
            if state.running {
                if state.pending.replace(args).is_some() {
                    trace!("Coalescer: replaced pending arguments");
                }
                return Coalesced::Executing;
            }
            state.running = true;
        }

        // Clears `running` even if the operation panics or this future is dropped.
        let _guard = RunningGuard {
            state: Arc::clone(&self.state),
        };

        let mut args = args;
        loop {
            let data = (self.op)(args).await;

            let next = {
                let mut state = self.lock();
                state.executions += 1;
                state.pending.take()
            };

            match next {
                Some(pending) => {
                    debug!("Coalescer: running trailing execution");
                    args = pending;
                }
                None => return Coalesced::Result(data),
            }
        }
    }

    /// Whether an execution is currently in flight
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Number of completed physical executions
    pub fn executions(&self) -> u64 {
        self.lock().executions
    }

    fn lock(&self) -> MutexGuard<'_, CoalesceState<A>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct RunningGuard<A> {
    state: Arc<Mutex<CoalesceState<A>>>,
}

impl<A> Drop for RunningGuard<A> {
    fn drop(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.running = false;
    }
}
