// Simulated managed runtime
//
// Keeps the state the agent asks about (threads, installed breakpoints, armed
// steps, pending unwinds) and decides at every checkpoint of a worker whether
// that worker has to report a stop.

use crate::program::{self, Op, COUNTER_CLASS, COUNTER_OBJECT, OOPS_CLASS, THROWABLE_CLASS};
use jdwp_agent::protocol::{error_codes, JdwpError, JdwpResult};
use jdwp_agent::runtime::VmVersion;
use jdwp_agent::stepping::StepKind;
use jdwp_agent::types::{
    ClassRef, FieldId, FrameId, FrameInfo, Location, MethodId, ObjectId, ReferenceTypeId,
    ThreadId, ThreadStatus, Value, ValueData,
};
use jdwp_agent::{BreakpointHit, DebuggeeRuntime, InvokeOutcome, InvokeRequest, RuntimeHandle};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

pub const FIRST_THREAD_ID: ThreadId = 0x1000;
const FIRST_OBJECT_ID: ObjectId = 0x6000;

/// One activation record of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub method: MethodId,
    pub index: usize,
}

/// Frame ids encode the owning thread and the depth from the bottom
pub fn frame_id(thread: ThreadId, depth: usize) -> FrameId {
    (thread << 16) | depth as u64
}

pub fn frame_infos(thread: ThreadId, stack: &[Frame]) -> Vec<FrameInfo> {
    stack
        .iter()
        .enumerate()
        .rev()
        .map(|(depth, frame)| FrameInfo {
            frame_id: frame_id(thread, depth),
            location: program::location(frame.method, frame.index),
        })
        .collect()
}

/// How a worker has to leave its current frame(s) after a stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwind {
    /// Return from the top frame right away
    Return,
    /// Drop frames down to this depth; the caller repeats its call
    PopTo(usize),
}

#[derive(Debug, Clone, Copy)]
struct ArmedStep {
    kind: StepKind,
    depth: usize,
}

impl ArmedStep {
    fn completes_at(&self, depth: usize) -> bool {
        match self.kind {
            StepKind::Over => depth <= self.depth,
            StepKind::Out => depth < self.depth,
            StepKind::Into | StepKind::ForceReturn | StepKind::PopFrames => true,
        }
    }
}

#[derive(Debug)]
struct SimThread {
    name: String,
    finished: bool,
    suspend_requested: bool,
    armed: Option<ArmedStep>,
    /// Stack as of the last checkpoint
    stack: Vec<Frame>,
    unwind: Option<Unwind>,
}

#[derive(Debug, Clone, Copy)]
enum Installed {
    Line(Location),
    Exception { caught: bool, uncaught: bool },
    FieldWatch { field_id: FieldId, access: bool, modification: bool },
    MethodHook { class_id: ReferenceTypeId, entry: bool, exit: bool },
}

/// What a worker found at a checkpoint
#[derive(Debug, Default)]
pub struct Checkpoint {
    pub hits: Vec<BreakpointHit>,
    pub stepped: bool,
    pub suspend_requested: bool,
}

impl Checkpoint {
    pub fn must_stop(&self) -> bool {
        !self.hits.is_empty() || self.stepped || self.suspend_requested
    }
}

pub struct SimulatedVm {
    threads: Mutex<BTreeMap<ThreadId, SimThread>>,
    installed: Mutex<HashMap<RuntimeHandle, Installed>>,
    next_handle: AtomicU64,
    next_object: AtomicU64,
    exit_code: Mutex<Option<i32>>,
    exit_requested: Condvar,
}

impl SimulatedVm {
    pub fn new(thread_count: usize) -> Self {
        let threads = (0..thread_count)
            .map(|n| {
                (
                    FIRST_THREAD_ID + n as u64,
                    SimThread {
                        name: format!("worker-{}", n),
                        finished: false,
                        suspend_requested: false,
                        armed: None,
                        stack: Vec::new(),
                        unwind: None,
                    },
                )
            })
            .collect();

        Self {
            threads: Mutex::new(threads),
            installed: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            next_object: AtomicU64::new(FIRST_OBJECT_ID),
            exit_code: Mutex::new(None),
            exit_requested: Condvar::new(),
        }
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.lock().keys().copied().collect()
    }

    fn new_object(&self) -> ObjectId {
        self.next_object.fetch_add(1, Ordering::SeqCst)
    }

    /// Evaluate the instruction the worker is about to execute
    pub fn checkpoint(&self, thread: ThreadId, stack: &[Frame], op: Op, count: i32) -> Checkpoint {
        let mut checkpoint = Checkpoint::default();
        let Some(top) = stack.last() else {
            return checkpoint;
        };
        let location = program::location(top.method, top.index);

        {
            let mut threads = self.threads.lock();
            let Some(state) = threads.get_mut(&thread) else {
                return checkpoint;
            };
            state.stack = stack.to_vec();
            if std::mem::take(&mut state.suspend_requested) {
                // Stop before the instruction runs; it is evaluated again on resume
                checkpoint.suspend_requested = true;
                return checkpoint;
            }
            if let Some(armed) = state.armed.filter(|armed| armed.completes_at(stack.len())) {
                debug!("{:?} step of thread {:#x} completes", armed.kind, thread);
                state.armed = None;
                checkpoint.stepped = true;
            }
        }

        let mut exception = None;
        for (handle, installed) in self.installed.lock().iter() {
            let handle = *handle;
            match (*installed, op) {
                (Installed::Line(at), _) if at == location => {
                    checkpoint.hits.push(BreakpointHit::Line { handle });
                }
                (Installed::Exception { caught, uncaught }, Op::Throw { caught: is_caught })
                    if (is_caught && caught) || (!is_caught && uncaught) =>
                {
                    let exception = *exception.get_or_insert_with(|| self.new_object());
                    checkpoint.hits.push(BreakpointHit::Exception {
                        handle,
                        exception,
                        exception_type: OOPS_CLASS,
                        caught: is_caught,
                        catch_location: is_caught
                            .then(|| program::location(top.method, top.index + 1)),
                    });
                }
                (
                    Installed::FieldWatch {
                        field_id,
                        access,
                        modification,
                    },
                    Op::Increment(field),
                ) if field == field_id => {
                    if access {
                        checkpoint.hits.push(BreakpointHit::FieldAccess {
                            handle,
                            class: program::counter_class(),
                            field_id,
                            object: Some(COUNTER_OBJECT),
                        });
                    }
                    if modification {
                        checkpoint.hits.push(BreakpointHit::FieldModification {
                            handle,
                            class: program::counter_class(),
                            field_id,
                            object: Some(COUNTER_OBJECT),
                            value: Value::int(count + 1),
                        });
                    }
                }
                (Installed::MethodHook { class_id, entry, exit }, op) if class_id == COUNTER_CLASS => {
                    if entry && top.index == 0 {
                        checkpoint.hits.push(BreakpointHit::MethodEntry { handle });
                    }
                    if exit && op == Op::Return {
                        checkpoint.hits.push(BreakpointHit::MethodExit {
                            handle,
                            return_value: Value::void(),
                        });
                    }
                }
                _ => {}
            }
        }

        checkpoint
    }

    /// Unwinding the agent asked for while the worker was stopped
    pub fn take_unwind(&self, thread: ThreadId) -> Option<Unwind> {
        self.threads.lock().get_mut(&thread)?.unwind.take()
    }

    pub fn finish(&self, thread: ThreadId) {
        if let Some(state) = self.threads.lock().get_mut(&thread) {
            state.finished = true;
            state.stack.clear();
            state.armed = None;
        }
    }

    pub fn requested_exit(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Wait until the debugger asks the VM to exit
    pub fn wait_for_exit(&self, timeout: Duration) -> Option<i32> {
        let mut code = self.exit_code.lock();
        if code.is_none() {
            self.exit_requested.wait_for(&mut code, timeout);
        }
        *code
    }

    fn with_thread<T>(&self, thread: ThreadId, f: impl FnOnce(&mut SimThread) -> JdwpResult<T>) -> JdwpResult<T> {
        let mut threads = self.threads.lock();
        let state = threads
            .get_mut(&thread)
            .ok_or(JdwpError::Command(error_codes::INVALID_THREAD))?;
        f(state)
    }

    fn install(&self, installed: Installed) -> RuntimeHandle {
        let handle = RuntimeHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        debug!("Installed {:?} as {:?}", installed, handle);
        self.installed.lock().insert(handle, installed);
        handle
    }
}

fn int_arg(value: &Value) -> JdwpResult<i32> {
    match value.data {
        ValueData::Int(v) => Ok(v),
        _ => Err(JdwpError::Command(error_codes::TYPE_MISMATCH)),
    }
}

impl DebuggeeRuntime for SimulatedVm {
    fn vm_version(&self) -> VmVersion {
        VmVersion {
            description: "Simulated debuggee".to_string(),
            vm_name: "jdwp-sim".to_string(),
            vm_version: env!("CARGO_PKG_VERSION").to_string(),
            ..VmVersion::default()
        }
    }

    fn all_threads(&self) -> Vec<ThreadId> {
        self.threads
            .lock()
            .iter()
            .filter(|(_, state)| !state.finished)
            .map(|(id, _)| *id)
            .collect()
    }

    fn thread_name(&self, thread: ThreadId) -> JdwpResult<String> {
        self.with_thread(thread, |state| Ok(state.name.clone()))
    }

    fn thread_status(&self, thread: ThreadId) -> JdwpResult<ThreadStatus> {
        self.with_thread(thread, |state| {
            Ok(if state.finished {
                ThreadStatus::Zombie
            } else {
                ThreadStatus::Running
            })
        })
    }

    fn request_suspend(&self, thread: ThreadId) {
        if let Some(state) = self.threads.lock().get_mut(&thread) {
            state.suspend_requested = !state.finished;
        }
    }

    fn arm_step(&self, thread: ThreadId, kind: StepKind) {
        if let Some(state) = self.threads.lock().get_mut(&thread) {
            state.armed = Some(ArmedStep {
                kind,
                depth: state.stack.len(),
            });
        }
    }

    fn cancel_step(&self, thread: ThreadId) {
        if let Some(state) = self.threads.lock().get_mut(&thread) {
            state.armed = None;
        }
    }

    fn is_assignable(&self, target: ReferenceTypeId, klass: ReferenceTypeId) -> bool {
        target == klass || (target == THROWABLE_CLASS && klass == OOPS_CLASS)
    }

    fn loaded_classes(&self) -> Vec<ClassRef> {
        program::classes()
    }

    fn install_line_breakpoint(&self, location: &Location) -> JdwpResult<RuntimeHandle> {
        let valid = location.class_id == COUNTER_CLASS
            && program::instruction(location.method_id, location.index as usize).is_some();
        if !valid {
            return Err(JdwpError::Command(error_codes::INVALID_LOCATION));
        }
        Ok(self.install(Installed::Line(*location)))
    }

    fn install_exception_breakpoint(&self, caught: bool, uncaught: bool) -> JdwpResult<RuntimeHandle> {
        Ok(self.install(Installed::Exception { caught, uncaught }))
    }

    fn install_field_watch(
        &self,
        class_id: ReferenceTypeId,
        field_id: FieldId,
        access: bool,
        modification: bool,
    ) -> JdwpResult<RuntimeHandle> {
        if class_id != COUNTER_CLASS {
            return Err(JdwpError::Command(error_codes::INVALID_CLASS));
        }
        if field_id != program::COUNT_FIELD {
            return Err(JdwpError::Command(error_codes::INVALID_FIELDID));
        }
        Ok(self.install(Installed::FieldWatch {
            field_id,
            access,
            modification,
        }))
    }

    fn attach_method_hook(&self, class_id: ReferenceTypeId, entry: bool, exit: bool) -> JdwpResult<RuntimeHandle> {
        Ok(self.install(Installed::MethodHook { class_id, entry, exit }))
    }

    fn dispose_handle(&self, handle: RuntimeHandle) {
        self.installed.lock().remove(&handle);
    }

    fn invoke_method(&self, request: &InvokeRequest) -> JdwpResult<InvokeOutcome> {
        if request.class_id != COUNTER_CLASS {
            return Err(JdwpError::Command(error_codes::INVALID_CLASS));
        }
        if request.object.map_or(false, |object| object != COUNTER_OBJECT) {
            return Err(JdwpError::Command(error_codes::INVALID_OBJECT));
        }

        match request.method_id {
            program::ADD_METHOD => {
                let [a, b] = request.args.as_slice() else {
                    return Err(JdwpError::Command(error_codes::ILLEGAL_ARGUMENT));
                };
                Ok(InvokeOutcome {
                    value: Value::int(int_arg(a)?.wrapping_add(int_arg(b)?)),
                    exception: 0,
                })
            }
            program::FAIL_METHOD => Ok(InvokeOutcome {
                value: Value::void(),
                exception: self.new_object(),
            }),
            _ => Err(JdwpError::Command(error_codes::INVALID_METHODID)),
        }
    }

    fn force_early_return(&self, thread: ThreadId, value: &Value) -> JdwpResult<()> {
        self.with_thread(thread, |state| {
            let top = state
                .stack
                .last()
                .ok_or(JdwpError::Command(error_codes::OPAQUE_FRAME))?;
            let method = program::method(top.method)
                .ok_or(JdwpError::Command(error_codes::INVALID_METHODID))?;
            if value.tag != method.return_tag {
                return Err(JdwpError::Command(error_codes::TYPE_MISMATCH));
            }
            state.unwind = Some(Unwind::Return);
            Ok(())
        })
    }

    fn pop_frames(&self, thread: ThreadId, frame: FrameId) -> JdwpResult<()> {
        self.with_thread(thread, |state| {
            let depth = (frame & 0xffff) as usize;
            if frame >> 16 != thread || depth >= state.stack.len() {
                return Err(JdwpError::Command(error_codes::INVALID_FRAMEID));
            }
            if depth == 0 {
                return Err(JdwpError::Command(error_codes::OPAQUE_FRAME));
            }
            state.unwind = Some(Unwind::PopTo(depth));
            Ok(())
        })
    }

    fn exit(&self, code: i32) {
        info!("Debugger requested exit with code {}", code);
        *self.exit_code.lock() = Some(code);
        self.exit_requested.notify_all();
    }
}
