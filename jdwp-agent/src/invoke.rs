// Cross-thread invocation
//
// Work that must run on a specific suspended debuggee thread (method
// invocation, forced return) is posted to that thread's slot. The parked
// thread picks it up from its wait loop, runs it without holding its lock and
// fills the result slot. While the work runs the thread's own suspensions are
// set aside, so the invoked code may stop and be resumed like any other code.
// The requester polls the result slot instead of
// waiting on the thread's lock, so it can never deadlock against it.

use crate::commands::invoke_options;
use crate::protocol::{error_codes, JdwpError, JdwpResult};
use crate::suspend::ThreadSuspension;
use crate::types::ThreadId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const INVOCATION_POLL: Duration = Duration::from_millis(10);

/// A unit of work posted to a suspended thread
pub type Invocation = Box<dyn FnOnce() + Send>;

/// Which threads run while an invocation is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStrategy {
    /// Only the target thread runs
    EventThread,
    /// Every visible thread is resumed for the duration of the call
    All,
}

impl InvocationStrategy {
    pub fn from_options(options: i32) -> Self {
        if options & invoke_options::SINGLE_THREADED != 0 {
            InvocationStrategy::EventThread
        } else {
            InvocationStrategy::All
        }
    }
}

impl ThreadSuspension {
    /// Run `work` on `thread` and block until it produced a result.
    ///
    /// The thread must be suspended. It runs the work the next time it is in
    /// its wait loop (immediately if it is already parked).
    pub fn post_invocation<R, F>(
        &self,
        thread: ThreadId,
        work: F,
        strategy: InvocationStrategy,
    ) -> JdwpResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let slot = self.slot(thread);
        {
            let state = slot.state.lock();
            if state.invoking || state.invocation.is_some() {
                return Err(JdwpError::Command(error_codes::ALREADY_INVOKING));
            }
            if state.count == 0 && !state.hard_suspended {
                return Err(JdwpError::Command(error_codes::THREAD_NOT_SUSPENDED));
            }
        }

        let others: Vec<ThreadId> = match strategy {
            InvocationStrategy::EventThread => Vec::new(),
            InvocationStrategy::All => self
                .runtime()
                .all_threads()
                .into_iter()
                .filter(|t| *t != thread && self.is_suspended(*t))
                .collect(),
        };
        for other in &others {
            self.resume(*other);
        }

        let result: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        {
            let mut state = slot.state.lock();
            if state.count == 0 && !state.hard_suspended {
                drop(state);
                self.resuspend(&others);
                return Err(JdwpError::Command(error_codes::THREAD_NOT_SUSPENDED));
            }

            let result = result.clone();
            state.invocation = Some(Box::new(move || {
                let value = work();
                *result.lock() = Some(value);
            }));
            slot.parked.notify_all();
        }
        debug!("Posted invocation to thread {:#x} ({:?})", thread, strategy);

        let outcome = loop {
            {
                let mut state = slot.state.lock();
                // Done once the thread has taken its suspensions back
                if !state.invoking {
                    if let Some(value) = result.lock().take() {
                        break Ok(value);
                    }
                    if state.invocation.is_some() && state.count == 0 && !state.hard_suspended {
                        // Released before it ever picked the work up
                        state.invocation = None;
                        break Err(JdwpError::Command(error_codes::THREAD_NOT_SUSPENDED));
                    }
                }
            }

            std::thread::sleep(INVOCATION_POLL);
        };

        self.resuspend(&others);
        outcome
    }

    fn resuspend(&self, threads: &[ThreadId]) {
        for thread in threads {
            self.suspend(*thread);
        }
    }
}
