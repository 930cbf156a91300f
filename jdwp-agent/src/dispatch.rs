// Runtime event dispatch
//
// Turns runtime callbacks ("thread X stopped here", "class loaded", ...) into
// zero or more debugger events and applies the resulting suspend policy on the
// calling debuggee thread.

use crate::commands::event_kinds;
use crate::connection::DebuggerConnection;
use crate::context::DebuggerContext;
use crate::eventrequest::SuspendPolicy;
use crate::events::{Event, EventKind, EventSet, CLASS_STATUS_PREPARED};
use crate::filters::EventContext;
use crate::runtime::{BreakpointHit, StopEvent};
use crate::stepping::StepKind;
use crate::suspend::{Job, SuspendedInfo};
use crate::types::{ClassRef, ObjectId, ThreadId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Events collected for one callback and the strongest policy among them
#[derive(Default)]
struct Fired {
    events: Vec<Event>,
    policy: Option<SuspendPolicy>,
}

impl Fired {
    fn push(&mut self, event: Event, policy: SuspendPolicy) {
        self.events.push(event);
        self.policy = Some(self.policy.map_or(policy, |current| current.max(policy)));
    }
}

impl DebuggerContext {
    /// A debuggee thread reports that it stopped. Runs on that thread and
    /// returns once it may continue.
    pub fn handle_stop(&self, event: StopEvent) {
        let thread = event.thread;
        let info = SuspendedInfo::from_stop(&event);

        let Some(connection) = self.connection() else {
            self.settle(thread, info);
            return;
        };

        if self.threads.in_force_early_return(thread) {
            debug!("Stop of thread {:#x} during forced return not reported", thread);
            return;
        }

        let mut fired = Fired::default();
        let context = EventContext {
            thread: Some(thread),
            class: Some(&event.class),
            location: Some(event.location),
            this_object: event.this_object,
            ..EventContext::default()
        };

        if event.stepped {
            if let Some(step) = self.stepping.get(thread) {
                match step.kind {
                    StepKind::PopFrames => {
                        self.stepping.remove(thread);
                        debug!("Thread {:#x} popped its frames", thread);
                        self.threads.repark(thread, info);
                        return;
                    }
                    StepKind::ForceReturn => {
                        self.stepping.remove(thread);
                        debug!("Thread {:#x} finished its forced return", thread);
                        self.settle(thread, info);
                        return;
                    }
                    _ => match self.filters.get(step.request_id) {
                        Some(filter) => {
                            if step.is_same_line(&event.location, event.line)
                                || !filter.is_hit(&context, self.runtime.as_ref())
                            {
                                debug!("Step of thread {:#x} continues", thread);
                                self.runtime.arm_step(thread, step.kind);
                                self.settle(thread, info);
                                return;
                            }
                            self.stepping.remove(thread);
                            fired.push(
                                Event::new(
                                    step.request_id,
                                    EventKind::Step {
                                        thread,
                                        location: event.location,
                                    },
                                ),
                                filter.suspend_policy,
                            );
                        }
                        None => {
                            // The step request was cleared while the thread ran
                            self.stepping.remove(thread);
                        }
                    },
                }
            }
        }

        let mut line_reported = false;
        for hit in &event.hits {
            let is_line = matches!(hit, BreakpointHit::Line { .. });
            let hit_context = EventContext {
                exception: match hit {
                    BreakpointHit::Exception {
                        exception_type,
                        caught,
                        ..
                    } => Some((*exception_type, *caught)),
                    _ => None,
                },
                field: match hit {
                    BreakpointHit::FieldAccess { class, field_id, .. }
                    | BreakpointHit::FieldModification { class, field_id, .. } => {
                        Some((class.id, *field_id))
                    }
                    _ => None,
                },
                ..context.clone()
            };

            for filter in self.filters.for_handle(hit.handle()) {
                if is_line && line_reported {
                    break;
                }
                let Some(details) = hit_details(&event, hit, filter.event_kind) else {
                    continue;
                };
                if !filter.is_hit(&hit_context, self.runtime.as_ref()) {
                    continue;
                }
                line_reported |= is_line;
                fired.push(Event::new(filter.request_id, details), filter.suspend_policy);
            }
        }

        let Some(policy) = fired.policy else {
            self.settle(thread, info);
            return;
        };

        let mut objects: Vec<ObjectId> = fired
            .events
            .iter()
            .flat_map(|event| event.details.object_ids())
            .collect();
        objects.extend(event.this_object);

        let jobs = self.event_jobs(connection, EventSet::new(policy, fired.events), objects);
        self.threads
            .suspend_with_policy(thread, policy, info, jobs, &self.pins);
    }

    /// Park the thread if someone suspended it while it was running
    fn settle(&self, thread: ThreadId, info: SuspendedInfo) {
        if self.threads.confirm_stop(thread, info) {
            self.threads.park(thread);
        }
    }

    fn event_jobs(
        &self,
        connection: Arc<DebuggerConnection>,
        events: EventSet,
        objects: Vec<ObjectId>,
    ) -> Vec<Job> {
        let pins = self.pins.clone();
        vec![Box::new(move || {
            for object in objects {
                pins.keep(object);
            }
            connection.send_event(&events);
        })]
    }

    /// Report a lifecycle event that happens on `thread` itself
    fn report_on_thread(&self, thread: ThreadId, event_kind: u8, context: &EventContext<'_>, details: EventKind) {
        let Some(connection) = self.connection() else {
            return;
        };

        let mut fired = Fired::default();
        for filter in self.filters.by_kind(event_kind) {
            if filter.is_hit(context, self.runtime.as_ref()) {
                fired.push(Event::new(filter.request_id, details.clone()), filter.suspend_policy);
            }
        }

        if let Some(policy) = fired.policy {
            let jobs = self.event_jobs(connection, EventSet::new(policy, fired.events), Vec::new());
            self.threads.suspend_with_policy(
                thread,
                policy,
                SuspendedInfo::without_frames(),
                jobs,
                &self.pins,
            );
        }
    }

    pub fn handle_thread_start(&self, thread: ThreadId) {
        debug!("Thread {:#x} started", thread);
        let context = EventContext {
            thread: Some(thread),
            ..EventContext::default()
        };
        self.report_on_thread(thread, event_kinds::THREAD_START, &context, EventKind::ThreadStart { thread });
    }

    pub fn handle_thread_death(&self, thread: ThreadId) {
        debug!("Thread {:#x} died", thread);
        let context = EventContext {
            thread: Some(thread),
            ..EventContext::default()
        };
        self.report_on_thread(thread, event_kinds::THREAD_DEATH, &context, EventKind::ThreadDeath { thread });

        if self.stepping.remove(thread).is_some() {
            self.runtime.cancel_step(thread);
        }
        self.threads.forget(thread);
    }

    pub fn handle_class_prepare(&self, thread: ThreadId, class: &ClassRef) {
        for kind in [
            event_kinds::METHOD_ENTRY,
            event_kinds::METHOD_EXIT,
            event_kinds::METHOD_EXIT_WITH_RETURN_VALUE,
        ] {
            for filter in self.filters.by_kind(kind) {
                if !filter.matches_type(class, self.runtime.as_ref()) {
                    continue;
                }
                if let Some(breakpoint) = &filter.breakpoint {
                    if let Err(e) = breakpoint.attach_to(self.runtime.as_ref(), class) {
                        warn!("Failed to hook methods of {}: {}", class.name, e);
                    }
                }
            }
        }

        let context = EventContext {
            thread: Some(thread),
            class: Some(class),
            ..EventContext::default()
        };
        let details = EventKind::ClassPrepare {
            thread,
            ref_type_tag: class.type_tag,
            ref_type: class.id,
            signature: class.signature.clone(),
            status: CLASS_STATUS_PREPARED,
        };
        self.report_on_thread(thread, event_kinds::CLASS_PREPARE, &context, details);
    }

    /// Class unloading has no event thread; only policy ALL suspends anything
    pub fn handle_class_unload(&self, class: &ClassRef) {
        let Some(connection) = self.connection() else {
            return;
        };

        let context = EventContext {
            class: Some(class),
            ..EventContext::default()
        };
        let mut fired = Fired::default();
        for filter in self.filters.by_kind(event_kinds::CLASS_UNLOAD) {
            if filter.is_hit(&context, self.runtime.as_ref()) {
                let details = EventKind::ClassUnload {
                    signature: class.signature.clone(),
                };
                fired.push(Event::new(filter.request_id, details), filter.suspend_policy);
            }
        }

        if let Some(policy) = fired.policy {
            if policy == SuspendPolicy::All {
                self.threads.suspend_all(&self.pins);
            }
            connection.send_event(&EventSet::new(policy, fired.events));
        }
    }

    /// The automatic VM_DEATH (request id 0) plus any requested ones
    pub fn handle_vm_death(&self) {
        let Some(connection) = self.connection() else {
            return;
        };

        let mut fired = Fired::default();
        fired.push(Event::new(0, EventKind::VMDeath), SuspendPolicy::None);
        let context = EventContext::default();
        for filter in self.filters.by_kind(event_kinds::VM_DEATH) {
            if filter.is_hit(&context, self.runtime.as_ref()) {
                fired.push(Event::new(filter.request_id, EventKind::VMDeath), filter.suspend_policy);
            }
        }

        let policy = fired.policy.unwrap_or(SuspendPolicy::None);
        connection.send_event(&EventSet::new(policy, fired.events));
    }
}

/// The event a breakpoint hit produces for a request of `event_kind`
fn hit_details(event: &StopEvent, hit: &BreakpointHit, event_kind: u8) -> Option<EventKind> {
    let thread = event.thread;
    let location = event.location;

    let details = match (hit, event_kind) {
        (BreakpointHit::Line { .. }, event_kinds::BREAKPOINT) => {
            EventKind::Breakpoint { thread, location }
        }
        (
            BreakpointHit::Exception {
                exception,
                catch_location,
                ..
            },
            event_kinds::EXCEPTION,
        ) => EventKind::Exception {
            thread,
            location,
            exception: *exception,
            catch_location: *catch_location,
        },
        (
            BreakpointHit::FieldAccess {
                class,
                field_id,
                object,
                ..
            },
            event_kinds::FIELD_ACCESS,
        ) => EventKind::FieldAccess {
            thread,
            location,
            ref_type_tag: class.type_tag,
            ref_type: class.id,
            field_id: *field_id,
            object: object.unwrap_or(0),
        },
        (
            BreakpointHit::FieldModification {
                class,
                field_id,
                object,
                value,
                ..
            },
            event_kinds::FIELD_MODIFICATION,
        ) => EventKind::FieldModification {
            thread,
            location,
            ref_type_tag: class.type_tag,
            ref_type: class.id,
            field_id: *field_id,
            object: object.unwrap_or(0),
            value: value.clone(),
        },
        (BreakpointHit::MethodEntry { .. }, event_kinds::METHOD_ENTRY) => {
            EventKind::MethodEntry { thread, location }
        }
        (BreakpointHit::MethodExit { .. }, event_kinds::METHOD_EXIT) => {
            EventKind::MethodExit { thread, location }
        }
        (BreakpointHit::MethodExit { return_value, .. }, event_kinds::METHOD_EXIT_WITH_RETURN_VALUE) => {
            EventKind::MethodExitWithReturnValue {
                thread,
                location,
                value: return_value.clone(),
            }
        }
        _ => return None,
    };
    Some(details)
}
