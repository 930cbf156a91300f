// In-memory debuggee runtime for tests
//
// Records every call the agent makes into the runtime so tests can assert on
// suspension requests, armed steps, installed handles and invocations.

use crate::config::DebuggerOptions;
use crate::connection::DebuggerConnection;
use crate::context::DebuggerContext;
use crate::events::{parse_event_packet, EventSet};
use crate::protocol::{error_codes, JdwpError, JdwpResult, Packet, ReplyPacket};
use crate::pump::Outgoing;
use crate::runtime::{DebuggeeRuntime, InvokeOutcome, InvokeRequest, RuntimeHandle};
use crate::stepping::StepKind;
use crate::types::{
    ClassRef, FieldId, FrameId, Location, ReferenceTypeId, ThreadId, ThreadStatus, Value,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// What a runtime handle was installed for
#[derive(Debug, Clone, PartialEq)]
pub enum Installed {
    Line(Location),
    Exception {
        caught: bool,
        uncaught: bool,
    },
    FieldWatch {
        class_id: ReferenceTypeId,
        field_id: FieldId,
        access: bool,
        modification: bool,
    },
    MethodHook {
        class_id: ReferenceTypeId,
        entry: bool,
        exit: bool,
    },
}

#[derive(Debug)]
pub struct MockRuntime {
    threads: Mutex<Vec<ThreadId>>,
    classes: Mutex<Vec<ClassRef>>,
    supertypes: Mutex<HashMap<ReferenceTypeId, Vec<ReferenceTypeId>>>,
    next_handle: AtomicU64,
    installed: Mutex<HashMap<RuntimeHandle, Installed>>,
    disposed: Mutex<Vec<RuntimeHandle>>,
    suspend_requests: Mutex<Vec<ThreadId>>,
    armed_steps: Mutex<Vec<(ThreadId, StepKind)>>,
    cancelled_steps: Mutex<Vec<ThreadId>>,
    invocations: Mutex<Vec<(InvokeRequest, std::thread::ThreadId)>>,
    invoke_outcome: Mutex<InvokeOutcome>,
    forced_returns: Mutex<Vec<(ThreadId, Value)>>,
    popped_frames: Mutex<Vec<(ThreadId, FrameId)>>,
    exit_code: Mutex<Option<i32>>,
}

impl MockRuntime {
    pub fn new(threads: &[ThreadId]) -> Self {
        Self {
            threads: Mutex::new(threads.to_vec()),
            classes: Mutex::new(Vec::new()),
            supertypes: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            installed: Mutex::new(HashMap::new()),
            disposed: Mutex::new(Vec::new()),
            suspend_requests: Mutex::new(Vec::new()),
            armed_steps: Mutex::new(Vec::new()),
            cancelled_steps: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            invoke_outcome: Mutex::new(InvokeOutcome {
                value: Value::int(42),
                exception: 0,
            }),
            forced_returns: Mutex::new(Vec::new()),
            popped_frames: Mutex::new(Vec::new()),
            exit_code: Mutex::new(None),
        }
    }

    pub fn add_thread(&self, thread: ThreadId) {
        self.threads.lock().push(thread);
    }

    pub fn remove_thread(&self, thread: ThreadId) {
        self.threads.lock().retain(|t| *t != thread);
    }

    pub fn add_class(&self, class: ClassRef) {
        self.classes.lock().push(class);
    }

    /// Make `klass` assignable to `supertype`
    pub fn add_supertype(&self, klass: ReferenceTypeId, supertype: ReferenceTypeId) {
        self.supertypes.lock().entry(klass).or_default().push(supertype);
    }

    pub fn set_invoke_outcome(&self, outcome: InvokeOutcome) {
        *self.invoke_outcome.lock() = outcome;
    }

    pub fn suspend_requests(&self) -> Vec<ThreadId> {
        self.suspend_requests.lock().clone()
    }

    pub fn armed_steps(&self) -> Vec<(ThreadId, StepKind)> {
        self.armed_steps.lock().clone()
    }

    pub fn cancelled_steps(&self) -> Vec<ThreadId> {
        self.cancelled_steps.lock().clone()
    }

    /// Live (not disposed) handles
    pub fn installed_handles(&self) -> HashMap<RuntimeHandle, Installed> {
        self.installed.lock().clone()
    }

    pub fn disposed_handles(&self) -> Vec<RuntimeHandle> {
        self.disposed.lock().clone()
    }

    /// Handle of the live line breakpoint at `location`
    pub fn handle_for(&self, location: &Location) -> Option<RuntimeHandle> {
        self.installed
            .lock()
            .iter()
            .find(|(_, installed)| **installed == Installed::Line(*location))
            .map(|(handle, _)| *handle)
    }

    /// Live handles matching `predicate`
    pub fn handles_where(&self, predicate: impl Fn(&Installed) -> bool) -> Vec<RuntimeHandle> {
        self.installed
            .lock()
            .iter()
            .filter(|(_, installed)| predicate(installed))
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// Invocations run so far, with the OS thread each ran on
    pub fn invocations(&self) -> Vec<(InvokeRequest, std::thread::ThreadId)> {
        self.invocations.lock().clone()
    }

    pub fn forced_returns(&self) -> Vec<(ThreadId, Value)> {
        self.forced_returns.lock().clone()
    }

    pub fn popped_frames(&self) -> Vec<(ThreadId, FrameId)> {
        self.popped_frames.lock().clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    fn install(&self, installed: Installed) -> RuntimeHandle {
        let handle = RuntimeHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.installed.lock().insert(handle, installed);
        handle
    }

    fn check_thread(&self, thread: ThreadId) -> JdwpResult<()> {
        if self.threads.lock().contains(&thread) {
            Ok(())
        } else {
            Err(JdwpError::Command(error_codes::INVALID_THREAD))
        }
    }
}

impl DebuggeeRuntime for MockRuntime {
    fn all_threads(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }

    fn thread_name(&self, thread: ThreadId) -> JdwpResult<String> {
        self.check_thread(thread)?;
        Ok(format!("mock-{}", thread))
    }

    fn thread_status(&self, thread: ThreadId) -> JdwpResult<ThreadStatus> {
        self.check_thread(thread)?;
        Ok(ThreadStatus::Running)
    }

    fn request_suspend(&self, thread: ThreadId) {
        self.suspend_requests.lock().push(thread);
    }

    fn arm_step(&self, thread: ThreadId, kind: StepKind) {
        self.armed_steps.lock().push((thread, kind));
    }

    fn cancel_step(&self, thread: ThreadId) {
        self.cancelled_steps.lock().push(thread);
    }

    fn is_assignable(&self, target: ReferenceTypeId, klass: ReferenceTypeId) -> bool {
        target == klass
            || self
                .supertypes
                .lock()
                .get(&klass)
                .map_or(false, |supers| supers.contains(&target))
    }

    fn loaded_classes(&self) -> Vec<ClassRef> {
        self.classes.lock().clone()
    }

    fn install_line_breakpoint(&self, location: &Location) -> JdwpResult<RuntimeHandle> {
        if location.class_id == 0 {
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
        Ok(self.install(Installed::FieldWatch {
            class_id,
            field_id,
            access,
            modification,
        }))
    }

    fn attach_method_hook(
        &self,
        class_id: ReferenceTypeId,
        entry: bool,
        exit: bool,
    ) -> JdwpResult<RuntimeHandle> {
        Ok(self.install(Installed::MethodHook {
            class_id,
            entry,
            exit,
        }))
    }

    fn dispose_handle(&self, handle: RuntimeHandle) {
        if self.installed.lock().remove(&handle).is_some() {
            self.disposed.lock().push(handle);
        }
    }

    fn invoke_method(&self, request: &InvokeRequest) -> JdwpResult<InvokeOutcome> {
        self.invocations
            .lock()
            .push((request.clone(), std::thread::current().id()));
        Ok(self.invoke_outcome.lock().clone())
    }

    fn force_early_return(&self, thread: ThreadId, value: &Value) -> JdwpResult<()> {
        self.forced_returns.lock().push((thread, value.clone()));
        Ok(())
    }

    fn pop_frames(&self, thread: ThreadId, frame: FrameId) -> JdwpResult<()> {
        self.popped_frames.lock().push((thread, frame));
        Ok(())
    }

    fn exit(&self, code: i32) {
        *self.exit_code.lock() = Some(code);
    }
}

/// A context wired to a `MockRuntime` and a socketless connection whose
/// outgoing packets can be inspected
pub struct TestAgent {
    pub ctx: Arc<DebuggerContext>,
    pub runtime: Arc<MockRuntime>,
    pub connection: Arc<DebuggerConnection>,
    outgoing: Mutex<mpsc::Receiver<Outgoing>>,
    // Dropped last
    _io: tokio::runtime::Runtime,
}

/// Route agent logs to the test harness; `RUST_LOG` picks the level
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl TestAgent {
    pub fn new(threads: &[ThreadId]) -> Self {
        Self::with_options(threads, DebuggerOptions::default())
    }

    pub fn with_options(threads: &[ThreadId], options: DebuggerOptions) -> Self {
        init_logging();
        let io = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("test runtime");
        let runtime = Arc::new(MockRuntime::new(threads));
        let ctx = Arc::new(DebuggerContext::new(runtime.clone(), options, io.handle().clone()));
        let (connection, outgoing) = DebuggerConnection::detached(io.handle(), 64);
        ctx.set_connection(Some(connection.clone()));

        Self {
            ctx,
            runtime,
            connection,
            outgoing: Mutex::new(outgoing),
            _io: io,
        }
    }

    /// Next encoded packet the agent queued for the debugger
    pub fn next_packet(&self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.outgoing.lock().try_recv() {
                Ok(Outgoing::Packet(raw)) => {
                    return Some(Packet::decode(&raw).expect("agent sent a malformed packet"))
                }
                Ok(Outgoing::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn next_event(&self, timeout: Duration) -> Option<EventSet> {
        match self.next_packet(timeout)? {
            Packet::Command(command) => {
                Some(parse_event_packet(&command.data).expect("malformed event set"))
            }
            Packet::Reply(reply) => panic!("expected an event, got reply {:?}", reply),
        }
    }

    pub fn next_reply(&self, timeout: Duration) -> Option<ReplyPacket> {
        match self.next_packet(timeout)? {
            Packet::Reply(reply) => Some(reply),
            Packet::Command(command) => panic!("expected a reply, got command {:?}", command),
        }
    }
}
