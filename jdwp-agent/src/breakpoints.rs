// Breakpoint kinds
//
// Each event request that needs runtime support owns exactly one
// `BreakpointInfo`. Disposing it releases every runtime handle it holds.

use crate::protocol::JdwpResult;
use crate::runtime::{DebuggeeRuntime, RuntimeHandle};
use crate::types::{ClassRef, FieldId, Location, ReferenceTypeId};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug)]
pub enum BreakpointInfo {
    Line {
        location: Location,
        handle: RuntimeHandle,
    },
    /// Thrown types are narrowed by the request's ExceptionOnly modifier
    Exception {
        caught: bool,
        uncaught: bool,
        handle: RuntimeHandle,
    },
    Field {
        class_id: ReferenceTypeId,
        field_id: FieldId,
        access: bool,
        modification: bool,
        handle: RuntimeHandle,
    },
    /// Entry/exit hooks, attached to every matching class as it is loaded
    Method {
        entry: bool,
        exit: bool,
        hooks: Mutex<Vec<(ReferenceTypeId, RuntimeHandle)>>,
    },
}

impl BreakpointInfo {
    pub fn line(runtime: &dyn DebuggeeRuntime, location: Location) -> JdwpResult<Self> {
        let handle = runtime.install_line_breakpoint(&location)?;
        Ok(BreakpointInfo::Line { location, handle })
    }

    pub fn exception(
        runtime: &dyn DebuggeeRuntime,
        caught: bool,
        uncaught: bool,
    ) -> JdwpResult<Self> {
        let handle = runtime.install_exception_breakpoint(caught, uncaught)?;
        Ok(BreakpointInfo::Exception {
            caught,
            uncaught,
            handle,
        })
    }

    pub fn field(
        runtime: &dyn DebuggeeRuntime,
        class_id: ReferenceTypeId,
        field_id: FieldId,
        access: bool,
        modification: bool,
    ) -> JdwpResult<Self> {
        let handle = runtime.install_field_watch(class_id, field_id, access, modification)?;
        Ok(BreakpointInfo::Field {
            class_id,
            field_id,
            access,
            modification,
            handle,
        })
    }

    pub fn method(entry: bool, exit: bool) -> Self {
        BreakpointInfo::Method {
            entry,
            exit,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Attach method hooks to `class`. No-op for other kinds and for classes
    /// already hooked.
    pub fn attach_to(&self, runtime: &dyn DebuggeeRuntime, class: &ClassRef) -> JdwpResult<()> {
        if let BreakpointInfo::Method { entry, exit, hooks } = self {
            let mut hooks = hooks.lock();
            if hooks.iter().any(|(class_id, _)| *class_id == class.id) {
                return Ok(());
            }
            let handle = runtime.attach_method_hook(class.id, *entry, *exit)?;
            debug!("Attached method hook to {}", class.name);
            hooks.push((class.id, handle));
        }
        Ok(())
    }

    /// Whether `handle` belongs to this breakpoint
    pub fn owns(&self, handle: RuntimeHandle) -> bool {
        match self {
            BreakpointInfo::Line { handle: h, .. }
            | BreakpointInfo::Exception { handle: h, .. }
            | BreakpointInfo::Field { handle: h, .. } => *h == handle,
            BreakpointInfo::Method { hooks, .. } => hooks.lock().iter().any(|(_, h)| *h == handle),
        }
    }

    pub fn dispose(&self, runtime: &dyn DebuggeeRuntime) {
        match self {
            BreakpointInfo::Line { handle, .. }
            | BreakpointInfo::Exception { handle, .. }
            | BreakpointInfo::Field { handle, .. } => runtime.dispose_handle(*handle),
            BreakpointInfo::Method { hooks, .. } => {
                for (_, handle) in hooks.lock().drain(..) {
                    runtime.dispose_handle(handle);
                }
            }
        }
    }
}
