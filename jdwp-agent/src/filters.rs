// Event request registry
//
// Every EventRequest.Set creates a `RequestFilter`. Runtime stops are matched
// against the filters of the matching kind; a filter fires only if all of its
// modifiers match.

use crate::breakpoints::BreakpointInfo;
use crate::commands::modifier_kinds;
use crate::eventrequest::SuspendPolicy;
use crate::protocol::{error_codes, JdwpError, JdwpResult};
use crate::reader::{read_bool, read_i32, read_location, read_string, read_u64, read_u8};
use crate::runtime::{DebuggeeRuntime, RuntimeHandle};
use crate::types::{ClassRef, FieldId, Location, ObjectId, ReferenceTypeId, ThreadId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A decoded EventRequest.Set modifier
#[derive(Debug)]
pub enum Modifier {
    /// Remaining matches before the request fires
    Count(AtomicI32),
    Conditional(i32),
    ThreadOnly(ThreadId),
    ClassOnly(ReferenceTypeId),
    ClassMatch(String),
    ClassExclude(String),
    LocationOnly(Location),
    ExceptionOnly {
        /// 0 means any exception type
        ref_type: ReferenceTypeId,
        caught: bool,
        uncaught: bool,
    },
    FieldOnly {
        ref_type: ReferenceTypeId,
        field_id: FieldId,
    },
    Step {
        thread: ThreadId,
        size: i32,
        depth: i32,
    },
    InstanceOnly(ObjectId),
    SourceNameMatch(String),
    PlatformThreadsOnly,
}

impl Modifier {
    pub fn read(buf: &mut &[u8]) -> JdwpResult<Self> {
        let kind = read_u8(buf)?;
        let modifier = match kind {
            modifier_kinds::COUNT => {
                let count = read_i32(buf)?;
                if count <= 0 {
                    return Err(JdwpError::Command(error_codes::INVALID_COUNT));
                }
                Modifier::Count(AtomicI32::new(count))
            }
            modifier_kinds::CONDITIONAL => Modifier::Conditional(read_i32(buf)?),
            modifier_kinds::THREAD_ONLY => Modifier::ThreadOnly(read_u64(buf)?),
            modifier_kinds::CLASS_ONLY => Modifier::ClassOnly(read_u64(buf)?),
            modifier_kinds::CLASS_MATCH => Modifier::ClassMatch(read_string(buf)?),
            modifier_kinds::CLASS_EXCLUDE => Modifier::ClassExclude(read_string(buf)?),
            modifier_kinds::LOCATION_ONLY => Modifier::LocationOnly(read_location(buf)?),
            modifier_kinds::EXCEPTION_ONLY => Modifier::ExceptionOnly {
                ref_type: read_u64(buf)?,
                caught: read_bool(buf)?,
                uncaught: read_bool(buf)?,
            },
            modifier_kinds::FIELD_ONLY => Modifier::FieldOnly {
                ref_type: read_u64(buf)?,
                field_id: read_u64(buf)?,
            },
            modifier_kinds::STEP => Modifier::Step {
                thread: read_u64(buf)?,
                size: read_i32(buf)?,
                depth: read_i32(buf)?,
            },
            modifier_kinds::INSTANCE_ONLY => Modifier::InstanceOnly(read_u64(buf)?),
            modifier_kinds::SOURCE_NAME_MATCH => Modifier::SourceNameMatch(read_string(buf)?),
            modifier_kinds::PLATFORM_THREADS_ONLY => Modifier::PlatformThreadsOnly,
            other => {
                debug!("Unknown event modifier kind {}", other);
                return Err(JdwpError::Command(error_codes::ILLEGAL_ARGUMENT));
            }
        };
        Ok(modifier)
    }

    /// Type-only part of the match, used before any event exists
    fn matches_type(&self, class: &ClassRef, runtime: &dyn DebuggeeRuntime) -> bool {
        match self {
            Modifier::ClassOnly(target) => runtime.is_assignable(*target, class.id),
            Modifier::ClassMatch(pattern) => glob_matches(pattern, &class.name),
            Modifier::ClassExclude(pattern) => !glob_matches(pattern, &class.name),
            _ => true,
        }
    }

    /// Everything but the count
    fn matches_event(&self, event: &EventContext<'_>, runtime: &dyn DebuggeeRuntime) -> bool {
        match self {
            Modifier::Count(_) | Modifier::Conditional(_) | Modifier::PlatformThreadsOnly => true,
            Modifier::ThreadOnly(thread) => event.thread == Some(*thread),
            Modifier::ClassOnly(_) | Modifier::ClassMatch(_) | Modifier::ClassExclude(_) => event
                .class
                .map_or(false, |class| self.matches_type(class, runtime)),
            Modifier::LocationOnly(location) => event.location.as_ref() == Some(location),
            Modifier::ExceptionOnly {
                ref_type,
                caught,
                uncaught,
            } => match event.exception {
                Some((exception_type, was_caught)) => {
                    (*ref_type == 0 || *ref_type == exception_type)
                        && if was_caught { *caught } else { *uncaught }
                }
                None => false,
            },
            Modifier::FieldOnly { ref_type, field_id } => {
                event.field == Some((*ref_type, *field_id))
            }
            Modifier::Step { thread, .. } => event.thread == Some(*thread),
            Modifier::InstanceOnly(object) => event.this_object == Some(*object),
            Modifier::SourceNameMatch(pattern) => event
                .class
                .and_then(|class| class.source_name.as_deref())
                .map_or(false, |source| glob_matches(pattern, source)),
        }
    }
}

/// Class-name glob: `*suffix`, `prefix*` or an exact name
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else {
        pattern == name
    }
}

/// The facts about one runtime event that modifiers are matched against
#[derive(Debug, Default, Clone)]
pub struct EventContext<'a> {
    pub thread: Option<ThreadId>,
    pub class: Option<&'a ClassRef>,
    pub location: Option<Location>,
    pub this_object: Option<ObjectId>,
    /// Thrown type and whether it is caught
    pub exception: Option<(ReferenceTypeId, bool)>,
    pub field: Option<(ReferenceTypeId, FieldId)>,
}

#[derive(Debug)]
pub struct RequestFilter {
    pub request_id: i32,
    pub event_kind: u8,
    pub suspend_policy: SuspendPolicy,
    pub modifiers: Vec<Modifier>,
    active: AtomicBool,
    pub breakpoint: Option<BreakpointInfo>,
}

impl RequestFilter {
    pub fn new(
        request_id: i32,
        event_kind: u8,
        suspend_policy: SuspendPolicy,
        modifiers: Vec<Modifier>,
        breakpoint: Option<BreakpointInfo>,
    ) -> Self {
        Self {
            request_id,
            event_kind,
            suspend_policy,
            modifiers,
            active: AtomicBool::new(true),
            breakpoint,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether this event fires the request. Consumes one unit of a count
    /// modifier when everything else matches; the request fires when the
    /// count drops from 1 to 0 and is inactive afterwards.
    pub fn is_hit(&self, event: &EventContext<'_>, runtime: &dyn DebuggeeRuntime) -> bool {
        if !self.is_active() {
            return false;
        }
        if !self
            .modifiers
            .iter()
            .all(|modifier| modifier.matches_event(event, runtime))
        {
            return false;
        }

        let mut fired = true;
        for modifier in &self.modifiers {
            if let Modifier::Count(remaining) = modifier {
                let previous = remaining.fetch_sub(1, Ordering::SeqCst);
                if previous == 1 {
                    self.active.store(false, Ordering::SeqCst);
                    debug!("Request {} reached its count", self.request_id);
                } else {
                    fired = false;
                }
            }
        }
        fired
    }

    /// Whether events in `class` could ever fire this request
    pub fn matches_type(&self, class: &ClassRef, runtime: &dyn DebuggeeRuntime) -> bool {
        modifiers_match_type(&self.modifiers, class, runtime)
    }

    pub fn owns(&self, handle: RuntimeHandle) -> bool {
        self.breakpoint.as_ref().map_or(false, |info| info.owns(handle))
    }

    fn dispose(&self, runtime: &dyn DebuggeeRuntime) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(info) = &self.breakpoint {
            info.dispose(runtime);
        }
    }
}

pub fn modifiers_match_type(
    modifiers: &[Modifier],
    class: &ClassRef,
    runtime: &dyn DebuggeeRuntime,
) -> bool {
    modifiers
        .iter()
        .all(|modifier| modifier.matches_type(class, runtime))
}

#[derive(Debug, Default)]
pub struct EventFilters {
    filters: RwLock<Vec<Arc<RequestFilter>>>,
}

impl EventFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, filter: RequestFilter) -> Arc<RequestFilter> {
        let filter = Arc::new(filter);
        debug!(
            "Registered request {} (kind {}, {:?})",
            filter.request_id, filter.event_kind, filter.suspend_policy
        );
        self.filters.write().push(filter.clone());
        filter
    }

    pub fn get(&self, request_id: i32) -> Option<Arc<RequestFilter>> {
        self.filters
            .read()
            .iter()
            .find(|filter| filter.request_id == request_id)
            .cloned()
    }

    /// Remove a request and dispose its breakpoint
    pub fn remove(&self, request_id: i32, runtime: &dyn DebuggeeRuntime) -> Option<Arc<RequestFilter>> {
        let removed = {
            let mut filters = self.filters.write();
            let index = filters
                .iter()
                .position(|filter| filter.request_id == request_id)?;
            filters.remove(index)
        };
        removed.dispose(runtime);
        Some(removed)
    }

    /// Remove every BREAKPOINT request, returning how many went away
    pub fn clear_all_breakpoints(&self, runtime: &dyn DebuggeeRuntime) -> usize {
        let removed: Vec<Arc<RequestFilter>> = {
            let mut filters = self.filters.write();
            let (breakpoints, rest) = std::mem::take(&mut *filters)
                .into_iter()
                .partition(|filter| filter.event_kind == crate::commands::event_kinds::BREAKPOINT);
            *filters = rest;
            breakpoints
        };
        for filter in &removed {
            filter.dispose(runtime);
        }
        removed.len()
    }

    pub fn clear_all(&self, runtime: &dyn DebuggeeRuntime) {
        let removed = std::mem::take(&mut *self.filters.write());
        for filter in &removed {
            filter.dispose(runtime);
        }
    }

    pub fn by_kind(&self, event_kind: u8) -> Vec<Arc<RequestFilter>> {
        self.filters
            .read()
            .iter()
            .filter(|filter| filter.event_kind == event_kind && filter.is_active())
            .cloned()
            .collect()
    }

    /// Requests whose breakpoint owns `handle`
    pub fn for_handle(&self, handle: RuntimeHandle) -> Vec<Arc<RequestFilter>> {
        self.filters
            .read()
            .iter()
            .filter(|filter| filter.owns(handle))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
