// Managed runtime seam
//
// The agent never looks inside the debuggee itself. Everything it needs from
// the runtime (threads, types, breakpoints, invocation) goes through
// `DebuggeeRuntime`, and the runtime reports stops through `StopEvent`.

use crate::protocol::JdwpResult;
use crate::stepping::StepKind;
use crate::types::{
    ClassRef, FieldId, FrameId, FrameInfo, Location, MethodId, ObjectId, ReferenceTypeId,
    ThreadId, ThreadStatus, Value,
};
use serde::{Deserialize, Serialize};

/// Opaque handle for a breakpoint, watch or method hook owned by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeHandle(pub u64);

/// VirtualMachine.Version reply contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmVersion {
    pub description: String,
    pub jdwp_major: i32,
    pub jdwp_minor: i32,
    pub vm_version: String,
    pub vm_name: String,
}

impl Default for VmVersion {
    fn default() -> Self {
        Self {
            description: "JDWP agent".to_string(),
            jdwp_major: 1,
            jdwp_minor: 8,
            vm_version: env!("CARGO_PKG_VERSION").to_string(),
            vm_name: "jdwp-agent".to_string(),
        }
    }
}

/// A method invocation requested by the debugger
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub thread: ThreadId,
    /// `None` for static (ClassType) invocations
    pub object: Option<ObjectId>,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub args: Vec<Value>,
    pub options: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    pub value: Value,
    /// Thrown exception, 0 if none
    pub exception: ObjectId,
}

/// What made the runtime stop at a given point
#[derive(Debug, Clone, PartialEq)]
pub enum BreakpointHit {
    Line {
        handle: RuntimeHandle,
    },
    Exception {
        handle: RuntimeHandle,
        exception: ObjectId,
        exception_type: ReferenceTypeId,
        caught: bool,
        catch_location: Option<Location>,
    },
    FieldAccess {
        handle: RuntimeHandle,
        class: ClassRef,
        field_id: FieldId,
        object: Option<ObjectId>,
    },
    FieldModification {
        handle: RuntimeHandle,
        class: ClassRef,
        field_id: FieldId,
        object: Option<ObjectId>,
        value: Value,
    },
    MethodEntry {
        handle: RuntimeHandle,
    },
    MethodExit {
        handle: RuntimeHandle,
        return_value: Value,
    },
}

impl BreakpointHit {
    pub fn handle(&self) -> RuntimeHandle {
        match self {
            BreakpointHit::Line { handle }
            | BreakpointHit::Exception { handle, .. }
            | BreakpointHit::FieldAccess { handle, .. }
            | BreakpointHit::FieldModification { handle, .. }
            | BreakpointHit::MethodEntry { handle }
            | BreakpointHit::MethodExit { handle, .. } => *handle,
        }
    }
}

/// "Execution stopped here", reported by a debuggee thread about itself
#[derive(Debug, Clone)]
pub struct StopEvent {
    pub thread: ThreadId,
    pub class: ClassRef,
    pub location: Location,
    pub line: Option<i32>,
    pub this_object: Option<ObjectId>,
    pub frames: Vec<FrameInfo>,
    /// Breakpoints, watches and hooks attached at this stop
    pub hits: Vec<BreakpointHit>,
    /// The stop was produced by an armed single step
    pub stepped: bool,
}

/// Reflection and control surface of the debuggee runtime.
///
/// Implementations must be callable from any thread. `request_suspend` and
/// `arm_step` must not block: the agent calls them while holding a per-thread
/// lock.
pub trait DebuggeeRuntime: Send + Sync {
    fn vm_version(&self) -> VmVersion {
        VmVersion::default()
    }

    /// Every debuggee thread visible to the debugger
    fn all_threads(&self) -> Vec<ThreadId>;

    fn thread_name(&self, thread: ThreadId) -> JdwpResult<String>;

    fn thread_status(&self, thread: ThreadId) -> JdwpResult<ThreadStatus>;

    /// Ask the runtime to report a stop for `thread` at its next safe point
    fn request_suspend(&self, thread: ThreadId);

    /// Arm the runtime's stepping mechanism for `thread`
    fn arm_step(&self, thread: ThreadId, kind: StepKind);

    /// Drop any armed step for `thread`
    fn cancel_step(&self, thread: ThreadId);

    /// Whether values of `klass` can be assigned to `target`
    fn is_assignable(&self, target: ReferenceTypeId, klass: ReferenceTypeId) -> bool;

    fn loaded_classes(&self) -> Vec<ClassRef>;

    fn install_line_breakpoint(&self, location: &Location) -> JdwpResult<RuntimeHandle>;

    fn install_exception_breakpoint(&self, caught: bool, uncaught: bool) -> JdwpResult<RuntimeHandle>;

    fn install_field_watch(
        &self,
        class_id: ReferenceTypeId,
        field_id: FieldId,
        access: bool,
        modification: bool,
    ) -> JdwpResult<RuntimeHandle>;

    fn attach_method_hook(
        &self,
        class_id: ReferenceTypeId,
        entry: bool,
        exit: bool,
    ) -> JdwpResult<RuntimeHandle>;

    fn dispose_handle(&self, handle: RuntimeHandle);

    /// Run a method invocation. Always called on `request.thread` itself.
    fn invoke_method(&self, request: &InvokeRequest) -> JdwpResult<InvokeOutcome>;

    /// Start a forced return. Always called on `thread` itself.
    fn force_early_return(&self, thread: ThreadId, value: &Value) -> JdwpResult<()>;

    /// Prepare popping frames up to and including `frame`
    fn pop_frames(&self, thread: ThreadId, frame: FrameId) -> JdwpResult<()>;

    fn exit(&self, code: i32);
}
