// Thread suspension coordinator
//
// Every debuggee thread gets its own slot (lock + condition variable), created
// lazily. Operations on different threads never contend on the same lock; the
// slot map itself is only locked long enough to look a slot up.
//
// A thread is stopped for the debugger iff `count > 0 || hard_suspended`.
// `hard_suspended` is a provisional unit of suspension requested before the
// runtime has parked the thread; it collapses into `count` once the thread
// reaches a real stop point and is always cleared before the thread runs.

use crate::eventrequest::SuspendPolicy;
use crate::invoke::Invocation;
use crate::pinning::ObjectPins;
use crate::protocol::{error_codes, JdwpError, JdwpResult};
use crate::runtime::{DebuggeeRuntime, StopEvent};
use crate::stepping::SteppingTable;
use crate::types::{FrameInfo, Location, ThreadId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a frame query waits for a hard-suspended thread to really stop
pub const SUSPENDED_INFO_TIMEOUT: Duration = Duration::from_millis(400);
pub const SUSPENDED_INFO_POLL: Duration = Duration::from_millis(10);

/// Work run once suspension bookkeeping for an event is settled
pub type Job = Box<dyn FnOnce() + Send>;

/// Snapshot of a stopped thread
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuspendedInfo {
    /// `None` until the runtime has reported where the thread stopped
    pub location: Option<Location>,
    pub line: Option<i32>,
    pub frames: Vec<FrameInfo>,
    /// A forced return is running on this thread during this parked episode
    pub force_early_return: bool,
}

impl SuspendedInfo {
    /// Placeholder for a thread whose stop location is not known yet
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn from_stop(event: &StopEvent) -> Self {
        Self {
            location: Some(event.location),
            line: event.line,
            frames: event.frames.clone(),
            force_early_return: false,
        }
    }

    /// A known stop point without frames (thread start/death callbacks)
    pub fn without_frames() -> Self {
        Self {
            location: Some(Location::none()),
            ..Self::default()
        }
    }

    pub fn is_known(&self) -> bool {
        self.location.is_some()
    }
}

#[derive(Default)]
pub(crate) struct ThreadState {
    pub(crate) count: u32,
    pub(crate) hard_suspended: bool,
    /// Let the parked thread run once without releasing its suspension
    pub(crate) unwinding: bool,
    pub(crate) info: Option<SuspendedInfo>,
    pub(crate) invocation: Option<Invocation>,
    /// A posted invocation is running on the thread right now
    pub(crate) invoking: bool,
    /// Bumped whenever every suspension of the thread is dropped at once
    pub(crate) generation: u64,
}

impl ThreadState {
    fn is_suspended(&self) -> bool {
        self.count > 0 || self.hard_suspended
    }

    fn reported_count(&self) -> u32 {
        self.count + self.hard_suspended as u32
    }
}

#[derive(Default)]
pub(crate) struct ThreadSlot {
    pub(crate) state: Mutex<ThreadState>,
    pub(crate) parked: Condvar,
}

pub struct ThreadSuspension {
    slots: Mutex<HashMap<ThreadId, Arc<ThreadSlot>>>,
    runtime: Arc<dyn DebuggeeRuntime>,
    stepping: Arc<SteppingTable>,
    await_timeout: Duration,
}

impl ThreadSuspension {
    pub fn new(runtime: Arc<dyn DebuggeeRuntime>, stepping: Arc<SteppingTable>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            runtime,
            stepping,
            await_timeout: SUSPENDED_INFO_TIMEOUT,
        }
    }

    pub(crate) fn slot(&self, thread: ThreadId) -> Arc<ThreadSlot> {
        self.slots.lock().entry(thread).or_default().clone()
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn DebuggeeRuntime> {
        &self.runtime
    }

    /// Suspend `thread`. Never blocks the caller.
    pub fn suspend(&self, thread: ThreadId) {
        let slot = self.slot(thread);
        let mut state = slot.state.lock();

        if state.is_suspended() {
            state.count += 1;
            debug!("Thread {:#x} suspend count now {}", thread, state.reported_count());
            return;
        }

        self.runtime.request_suspend(thread);
        state.hard_suspended = true;
        state.info = Some(SuspendedInfo::unknown());
        debug!("Thread {:#x} hard suspended", thread);
    }

    /// Release one unit of suspension. Returns true if the thread was let go.
    pub fn resume(&self, thread: ThreadId) -> bool {
        let slot = self.slot(thread);
        let mut state = slot.state.lock();

        if state.count > 0 {
            state.count -= 1;
        } else if state.hard_suspended {
            state.hard_suspended = false;
        } else {
            // Already running
            return false;
        }

        if state.is_suspended() {
            debug!("Thread {:#x} suspend count now {}", thread, state.reported_count());
            return false;
        }

        self.release(thread, &slot, &mut state);
        true
    }

    fn release(&self, thread: ThreadId, slot: &ThreadSlot, state: &mut MutexGuard<'_, ThreadState>) {
        state.hard_suspended = false;
        state.info = None;
        if let Some(kind) = self.stepping.take_unsubmitted(thread) {
            debug!("Arming {:?} step for thread {:#x}", kind, thread);
            self.runtime.arm_step(thread, kind);
        }
        slot.parked.notify_all();
        debug!("Thread {:#x} resumed", thread);
    }

    /// Suspend count as the debugger sees it
    pub fn suspension_count(&self, thread: ThreadId) -> u32 {
        self.slot(thread).state.lock().reported_count()
    }

    pub fn is_suspended(&self, thread: ThreadId) -> bool {
        self.slot(thread).state.lock().is_suspended()
    }

    pub fn is_hard_suspended(&self, thread: ThreadId) -> bool {
        self.slot(thread).state.lock().hard_suspended
    }

    pub fn suspended_info(&self, thread: ThreadId) -> Option<SuspendedInfo> {
        self.slot(thread).state.lock().info.clone()
    }

    /// Frames of a suspended thread, waiting briefly for a hard-suspended
    /// thread to reach its real stop point
    pub fn await_suspended_info(&self, thread: ThreadId) -> JdwpResult<SuspendedInfo> {
        let slot = self.slot(thread);
        let deadline = Instant::now() + self.await_timeout;

        loop {
            {
                let state = slot.state.lock();
                if !state.is_suspended() {
                    return Err(JdwpError::Command(error_codes::THREAD_NOT_SUSPENDED));
                }
                if let Some(info) = state.info.as_ref().filter(|info| info.is_known()) {
                    return Ok(info.clone());
                }
            }

            if Instant::now() >= deadline {
                warn!("Thread {:#x} did not reach a stop point in time", thread);
                return Err(JdwpError::Command(error_codes::THREAD_NOT_SUSPENDED));
            }
            std::thread::sleep(SUSPENDED_INFO_POLL);
        }
    }

    /// Suspend the thread that produced an event, on that thread itself
    pub fn suspend_event_thread(&self, thread: ThreadId, info: SuspendedInfo) {
        let slot = self.slot(thread);
        let mut state = slot.state.lock();

        if state.hard_suspended {
            state.hard_suspended = false;
            state.count += 1;
        }
        state.count += 1;
        state.info = Some(info);
        debug!("Event thread {:#x} suspend count now {}", thread, state.count);
    }

    /// Record the real stop point of a hard-suspended thread. Returns true if
    /// the thread must park; false if it was resumed while racing here.
    pub fn confirm_stop(&self, thread: ThreadId, info: SuspendedInfo) -> bool {
        let slot = self.slot(thread);
        let mut state = slot.state.lock();

        if !state.hard_suspended {
            return false;
        }
        let force_early_return = state.info.as_ref().map_or(false, |i| i.force_early_return);
        state.info = Some(SuspendedInfo {
            force_early_return,
            ..info
        });
        true
    }

    /// The parking loop, run by the debuggee thread itself at a stop point.
    /// Returns once the thread is released.
    pub fn park(&self, thread: ThreadId) {
        let slot = self.slot(thread);
        let mut state = slot.state.lock();

        loop {
            if state.unwinding {
                state.unwinding = false;
                return;
            }
            if !state.is_suspended() {
                return;
            }
            if state.hard_suspended {
                // The real stop point is known now
                state.hard_suspended = false;
                state.count += 1;
            }

            if let Some(invocation) = state.invocation.take() {
                debug!("Thread {:#x} running posted invocation", thread);
                self.run_invocation(thread, &mut state, invocation);
                continue;
            }

            slot.parked.wait(&mut state);
        }
    }

    /// Run `invocation` with the thread's suspensions set aside, so a stop
    /// inside the invoked code parks and resumes like any other, then put
    /// them back. A full release meanwhile (detach, thread death) wins.
    fn run_invocation(&self, thread: ThreadId, state: &mut MutexGuard<'_, ThreadState>, invocation: Invocation) {
        let count = std::mem::take(&mut state.count);
        let info = state.info.clone();
        let generation = state.generation;
        state.invoking = true;

        MutexGuard::unlocked(state, invocation);

        state.invoking = false;
        if state.generation != generation {
            debug!("Thread {:#x} released during invocation", thread);
            return;
        }
        // Suspensions requested while the invocation ran stack on top
        state.count += count + state.hard_suspended as u32;
        state.hard_suspended = false;
        state.info = info;
    }

    /// Refresh the stop point of a thread that is still suspended (after an
    /// unwind) and park it again
    pub fn repark(&self, thread: ThreadId, info: SuspendedInfo) {
        {
            let slot = self.slot(thread);
            let mut state = slot.state.lock();
            if !state.is_suspended() {
                return;
            }
            state.info = Some(info);
        }
        self.park(thread);
    }

    /// Let a parked thread run (to unwind frames) while it stays suspended
    pub fn release_for_unwind(&self, thread: ThreadId) -> JdwpResult<()> {
        let slot = self.slot(thread);
        let mut state = slot.state.lock();

        if state.count == 0 {
            return Err(JdwpError::Command(error_codes::THREAD_NOT_SUSPENDED));
        }
        state.unwinding = true;
        state.info = Some(SuspendedInfo::unknown());
        if let Some(kind) = self.stepping.take_unsubmitted(thread) {
            self.runtime.arm_step(thread, kind);
        }
        slot.parked.notify_all();
        Ok(())
    }

    /// Mark or clear the forced-return episode of a suspended thread
    pub fn set_force_early_return(&self, thread: ThreadId, active: bool) -> JdwpResult<()> {
        let slot = self.slot(thread);
        let mut state = slot.state.lock();

        let suspended = state.count > 0;
        match state.info.as_mut() {
            Some(info) if suspended => {
                info.force_early_return = active;
                Ok(())
            }
            _ => Err(JdwpError::Command(error_codes::THREAD_NOT_SUSPENDED)),
        }
    }

    pub fn in_force_early_return(&self, thread: ThreadId) -> bool {
        self.slot(thread)
            .state
            .lock()
            .info
            .as_ref()
            .map_or(false, |info| info.force_early_return)
    }

    /// Apply an event's suspend policy on the event thread, run `jobs` once the
    /// bookkeeping is settled, then park if the thread ended up suspended.
    pub fn suspend_with_policy(
        self: &Arc<Self>,
        thread: ThreadId,
        policy: SuspendPolicy,
        info: SuspendedInfo,
        jobs: Vec<Job>,
        pins: &ObjectPins,
    ) {
        match policy {
            SuspendPolicy::None => {
                run_jobs(jobs);
                if self.confirm_stop(thread, info) {
                    self.park(thread);
                }
            }
            SuspendPolicy::EventThread => {
                self.suspend_event_thread(thread, info);
                run_jobs(jobs);
                self.park(thread);
            }
            SuspendPolicy::All => {
                pins.engage();
                self.suspend_others(thread);
                self.suspend_event_thread(thread, info);
                run_jobs(jobs);
                self.park(thread);
            }
        }
    }

    /// Suspend every visible thread except `thread` from a helper thread
    fn suspend_others(self: &Arc<Self>, thread: ThreadId) {
        let others: Vec<ThreadId> = self
            .runtime
            .all_threads()
            .into_iter()
            .filter(|t| *t != thread)
            .collect();
        if others.is_empty() {
            return;
        }

        let this = self.clone();
        let spawned = std::thread::Builder::new()
            .name("jdwp-suspend-all".to_string())
            .spawn(move || {
                for other in others {
                    this.suspend(other);
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn suspend helper: {}", e);
        }
    }

    /// VirtualMachine.Suspend
    pub fn suspend_all(&self, pins: &ObjectPins) {
        pins.engage();
        for thread in self.runtime.all_threads() {
            self.suspend(thread);
        }
    }

    /// VirtualMachine.Resume
    pub fn resume_all(&self, pins: &ObjectPins) {
        for thread in self.runtime.all_threads() {
            self.resume(thread);
        }
        if !self.any_suspended() {
            pins.release();
        }
    }

    pub fn any_suspended(&self) -> bool {
        let slots: Vec<Arc<ThreadSlot>> = self.slots.lock().values().cloned().collect();
        slots.iter().any(|slot| slot.state.lock().is_suspended())
    }

    /// Drop every suspension, e.g. when the debugger goes away
    pub fn release_everything(&self, pins: &ObjectPins) {
        let slots: Vec<Arc<ThreadSlot>> = self.slots.lock().values().cloned().collect();
        for slot in slots {
            let mut state = slot.state.lock();
            state.count = 0;
            state.hard_suspended = false;
            state.unwinding = false;
            state.info = None;
            state.invocation = None;
            state.generation += 1;
            slot.parked.notify_all();
        }
        pins.release();
    }

    /// Forget a thread that has died
    pub fn forget(&self, thread: ThreadId) {
        if let Some(slot) = self.slots.lock().remove(&thread) {
            let mut state = slot.state.lock();
            state.count = 0;
            state.hard_suspended = false;
            state.generation += 1;
            slot.parked.notify_all();
        }
    }
}

fn run_jobs(jobs: Vec<Job>) {
    for job in jobs {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRuntime;
    use crate::stepping::{StepKind, SteppingInfo};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn coordinator(threads: &[ThreadId]) -> (Arc<MockRuntime>, Arc<SteppingTable>, Arc<ThreadSuspension>) {
        let runtime = Arc::new(MockRuntime::new(threads));
        let stepping = Arc::new(SteppingTable::new());
        let suspension = Arc::new(ThreadSuspension::new(runtime.clone(), stepping.clone()));
        (runtime, stepping, suspension)
    }

    fn known_info(index: u64) -> SuspendedInfo {
        SuspendedInfo {
            location: Some(Location {
                type_tag: 1,
                class_id: 1,
                method_id: 1,
                index,
            }),
            line: Some(10),
            frames: Vec::new(),
            force_early_return: false,
        }
    }

    #[test]
    fn test_suspend_resume_counting() {
        let (runtime, _, threads) = coordinator(&[1]);

        threads.suspend(1);
        assert!(threads.is_hard_suspended(1));
        assert_eq!(threads.suspension_count(1), 1);
        assert_eq!(runtime.suspend_requests(), vec![1]);

        threads.suspend(1);
        threads.suspend(1);
        assert_eq!(threads.suspension_count(1), 3);
        // Only the first suspension asks the runtime to park the thread
        assert_eq!(runtime.suspend_requests(), vec![1]);

        assert!(!threads.resume(1));
        assert!(!threads.resume(1));
        assert_eq!(threads.suspension_count(1), 1);
        assert!(threads.resume(1));
        assert_eq!(threads.suspension_count(1), 0);
        assert!(!threads.is_suspended(1));
    }

    #[test]
    fn test_resume_is_idempotent_at_zero() {
        let (_, _, threads) = coordinator(&[1]);

        assert!(!threads.resume(1));
        assert_eq!(threads.suspension_count(1), 0);

        threads.suspend(1);
        assert!(threads.resume(1));
        assert!(!threads.resume(1));
        assert!(!threads.resume(1));
        assert_eq!(threads.suspension_count(1), 0);
    }

    #[test]
    fn test_random_sequences_never_go_negative() {
        let (_, _, threads) = coordinator(&[1]);
        let mut expected: u32 = 0;
        let mut seed: u32 = 0x2545_f491;

        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 {
                let released = threads.resume(1);
                assert_eq!(released, expected == 1);
                expected = expected.saturating_sub(1);
            } else {
                threads.suspend(1);
                expected += 1;
            }
            assert_eq!(threads.suspension_count(1), expected);
            assert_eq!(threads.is_suspended(1), expected > 0);
        }
    }

    #[test]
    fn test_hard_suspend_confirmation_keeps_count() {
        let (_, _, threads) = coordinator(&[1]);
        threads.suspend(1);
        threads.suspend(1);
        assert_eq!(threads.suspension_count(1), 2);

        // The runtime reports the stop: the provisional unit becomes real
        let parker = {
            let threads = threads.clone();
            std::thread::spawn(move || {
                assert!(threads.confirm_stop(1, known_info(0)));
                threads.park(1);
            })
        };

        let info = threads.await_suspended_info(1).unwrap();
        assert!(info.is_known());
        assert_eq!(threads.suspension_count(1), 2);

        threads.resume(1);
        assert_eq!(threads.suspension_count(1), 1);
        threads.resume(1);
        parker.join().unwrap();
        assert_eq!(threads.suspension_count(1), 0);
    }

    #[test]
    fn test_event_thread_suspension_collapses_hard_suspend() {
        let (_, _, threads) = coordinator(&[1]);
        threads.suspend(1);
        threads.suspend_event_thread(1, known_info(3));

        assert!(!threads.is_hard_suspended(1));
        assert_eq!(threads.suspension_count(1), 2);
        assert_eq!(threads.suspended_info(1).unwrap().location.unwrap().index, 3);
    }

    #[test]
    fn test_park_returns_when_resumed_while_racing() {
        let (_, _, threads) = coordinator(&[1]);
        threads.suspend(1);
        threads.resume(1);

        assert!(!threads.confirm_stop(1, known_info(0)));
        // Nothing holds the thread: park must not block
        threads.park(1);
    }

    #[test]
    fn test_park_blocks_until_released() {
        let (_, _, threads) = coordinator(&[1]);
        threads.suspend_event_thread(1, known_info(0));

        let released = Arc::new(AtomicBool::new(false));
        let parker = {
            let threads = threads.clone();
            let released = released.clone();
            std::thread::spawn(move || {
                threads.park(1);
                released.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::SeqCst));

        threads.resume(1);
        parker.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_await_suspended_info_errors() {
        let (_, _, threads) = coordinator(&[1]);
        assert!(matches!(
            threads.await_suspended_info(1),
            Err(JdwpError::Command(error_codes::THREAD_NOT_SUSPENDED))
        ));

        // Hard suspended but never reaching a stop point: bounded wait
        threads.suspend(1);
        let started = Instant::now();
        assert!(threads.await_suspended_info(1).is_err());
        assert!(started.elapsed() >= SUSPENDED_INFO_TIMEOUT);
    }

    #[test]
    fn test_resume_arms_pending_step() {
        let (runtime, stepping, threads) = coordinator(&[1]);
        threads.suspend_event_thread(1, known_info(0));
        stepping.set(1, SteppingInfo::new(4, SuspendPolicy::EventThread, StepKind::Over, 1));

        threads.resume(1);
        assert_eq!(runtime.armed_steps(), vec![(1, StepKind::Over)]);

        // A second release does not re-arm a submitted step
        threads.suspend_event_thread(1, known_info(1));
        threads.resume(1);
        assert_eq!(runtime.armed_steps().len(), 1);
    }

    #[test]
    fn test_policy_all_suspends_other_threads() {
        let (runtime, _, threads) = coordinator(&[1, 2, 3]);
        let pins = Arc::new(ObjectPins::new());
        let job_ran = Arc::new(AtomicBool::new(false));

        let event_thread = {
            let threads = threads.clone();
            let pins = pins.clone();
            let job_ran = job_ran.clone();
            std::thread::spawn(move || {
                let job: Job = Box::new(move || job_ran.store(true, Ordering::SeqCst));
                threads.suspend_with_policy(1, SuspendPolicy::All, known_info(0), vec![job], &pins);
            })
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while !(job_ran.load(Ordering::SeqCst) && threads.is_suspended(2) && threads.is_suspended(3))
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(job_ran.load(Ordering::SeqCst));
        assert!(pins.is_engaged());
        for t in [1, 2, 3] {
            assert!(threads.suspension_count(t) >= 1, "thread {} not suspended", t);
        }
        assert!(runtime.suspend_requests().contains(&2));

        threads.resume_all(&pins);
        event_thread.join().unwrap();
        assert!(!threads.any_suspended());
        assert!(!pins.is_engaged());
    }

    #[test]
    fn test_release_everything_wakes_parked_threads() {
        let (_, _, threads) = coordinator(&[1]);
        let pins = ObjectPins::new();
        threads.suspend_event_thread(1, known_info(0));
        threads.suspend(1);

        let parker = {
            let threads = threads.clone();
            std::thread::spawn(move || threads.park(1))
        };

        threads.release_everything(&pins);
        parker.join().unwrap();
        assert_eq!(threads.suspension_count(1), 0);
    }
}
