// JDWP event handling
//
// Events travel from the agent to the debugger inside composite event packets
// (Event.Composite, command set 64, command 100).

use crate::commands::{command_sets, event_kinds, event_set_commands};
use crate::eventrequest::SuspendPolicy;
use crate::protocol::{CommandPacket, JdwpError, JdwpResult};
use crate::reader::{put_location, put_string, read_i32, read_location, read_string, read_u64, read_u8};
use crate::types::*;
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// ClassPrepare status: VERIFIED | PREPARED
pub const CLASS_STATUS_PREPARED: i32 = 3;

/// Composite event packet (can contain multiple events)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSet {
    pub suspend_policy: u8,
    pub events: Vec<Event>,
}

/// Single event within an event set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: u8,
    pub request_id: i32,
    pub details: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    VMStart {
        thread: ThreadId,
    },
    VMDeath,
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    ClassPrepare {
        thread: ThreadId,
        ref_type_tag: u8,
        ref_type: ReferenceTypeId,
        signature: String,
        status: i32,
    },
    ClassUnload {
        signature: String,
    },
    Breakpoint {
        thread: ThreadId,
        location: Location,
    },
    Step {
        thread: ThreadId,
        location: Location,
    },
    Exception {
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
        catch_location: Option<Location>,
    },
    FieldAccess {
        thread: ThreadId,
        location: Location,
        ref_type_tag: u8,
        ref_type: ReferenceTypeId,
        field_id: FieldId,
        object: ObjectId,
    },
    FieldModification {
        thread: ThreadId,
        location: Location,
        ref_type_tag: u8,
        ref_type: ReferenceTypeId,
        field_id: FieldId,
        object: ObjectId,
        value: Value,
    },
    MethodEntry {
        thread: ThreadId,
        location: Location,
    },
    MethodExit {
        thread: ThreadId,
        location: Location,
    },
    MethodExitWithReturnValue {
        thread: ThreadId,
        location: Location,
        value: Value,
    },
    Unknown {
        kind: u8,
    },
}

impl EventKind {
    pub fn kind(&self) -> u8 {
        match self {
            EventKind::VMStart { .. } => event_kinds::VM_START,
            EventKind::VMDeath => event_kinds::VM_DEATH,
            EventKind::ThreadStart { .. } => event_kinds::THREAD_START,
            EventKind::ThreadDeath { .. } => event_kinds::THREAD_DEATH,
            EventKind::ClassPrepare { .. } => event_kinds::CLASS_PREPARE,
            EventKind::ClassUnload { .. } => event_kinds::CLASS_UNLOAD,
            EventKind::Breakpoint { .. } => event_kinds::BREAKPOINT,
            EventKind::Step { .. } => event_kinds::SINGLE_STEP,
            EventKind::Exception { .. } => event_kinds::EXCEPTION,
            EventKind::FieldAccess { .. } => event_kinds::FIELD_ACCESS,
            EventKind::FieldModification { .. } => event_kinds::FIELD_MODIFICATION,
            EventKind::MethodEntry { .. } => event_kinds::METHOD_ENTRY,
            EventKind::MethodExit { .. } => event_kinds::METHOD_EXIT,
            EventKind::MethodExitWithReturnValue { .. } => event_kinds::METHOD_EXIT_WITH_RETURN_VALUE,
            EventKind::Unknown { kind } => *kind,
        }
    }

    /// Object ids the debugger learns about through this event
    pub fn object_ids(&self) -> Vec<ObjectId> {
        match self {
            EventKind::Exception { exception, .. } => vec![*exception],
            EventKind::FieldAccess { object, .. } => vec![*object],
            EventKind::FieldModification { object, value, .. } => {
                vec![*object, value.object_id().unwrap_or(0)]
            }
            EventKind::MethodExitWithReturnValue { value, .. } => {
                value.object_id().into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            EventKind::VMDeath | EventKind::Unknown { .. } => {}
            EventKind::VMStart { thread }
            | EventKind::ThreadStart { thread }
            | EventKind::ThreadDeath { thread } => buf.put_u64(*thread),
            EventKind::ClassPrepare {
                thread,
                ref_type_tag,
                ref_type,
                signature,
                status,
            } => {
                buf.put_u64(*thread);
                buf.put_u8(*ref_type_tag);
                buf.put_u64(*ref_type);
                put_string(buf, signature);
                buf.put_i32(*status);
            }
            EventKind::ClassUnload { signature } => put_string(buf, signature),
            EventKind::Breakpoint { thread, location }
            | EventKind::Step { thread, location }
            | EventKind::MethodEntry { thread, location }
            | EventKind::MethodExit { thread, location } => {
                buf.put_u64(*thread);
                put_location(buf, location);
            }
            EventKind::MethodExitWithReturnValue {
                thread,
                location,
                value,
            } => {
                buf.put_u64(*thread);
                put_location(buf, location);
                value.put_tagged(buf);
            }
            EventKind::Exception {
                thread,
                location,
                exception,
                catch_location,
            } => {
                buf.put_u64(*thread);
                put_location(buf, location);
                Value::object(tags::OBJECT, *exception).put_tagged(buf);
                put_location(buf, &catch_location.unwrap_or_else(Location::none));
            }
            EventKind::FieldAccess {
                thread,
                location,
                ref_type_tag,
                ref_type,
                field_id,
                object,
            } => {
                buf.put_u64(*thread);
                put_location(buf, location);
                buf.put_u8(*ref_type_tag);
                buf.put_u64(*ref_type);
                buf.put_u64(*field_id);
                Value::object(tags::OBJECT, *object).put_tagged(buf);
            }
            EventKind::FieldModification {
                thread,
                location,
                ref_type_tag,
                ref_type,
                field_id,
                object,
                value,
            } => {
                buf.put_u64(*thread);
                put_location(buf, location);
                buf.put_u8(*ref_type_tag);
                buf.put_u64(*ref_type);
                buf.put_u64(*field_id);
                Value::object(tags::OBJECT, *object).put_tagged(buf);
                value.put_tagged(buf);
            }
        }
    }
}

impl Event {
    pub fn new(request_id: i32, details: EventKind) -> Self {
        Self {
            kind: details.kind(),
            request_id,
            details,
        }
    }
}

impl EventSet {
    pub fn new(suspend_policy: SuspendPolicy, events: Vec<Event>) -> Self {
        Self {
            suspend_policy: suspend_policy as u8,
            events,
        }
    }

    /// Build the Event.Composite command packet carrying this set
    pub fn to_packet(&self, id: u32) -> CommandPacket {
        let mut data = Vec::new();
        data.put_u8(self.suspend_policy);
        data.put_i32(self.events.len() as i32);
        for event in &self.events {
            data.put_u8(event.kind);
            data.put_i32(event.request_id);
            event.details.encode(&mut data);
        }
        CommandPacket::with_data(id, command_sets::EVENT, event_set_commands::COMPOSITE, data)
    }
}

/// Parse the payload of an Event.Composite packet
pub fn parse_event_packet(data: &[u8]) -> JdwpResult<EventSet> {
    let mut buf = data;

    let suspend_policy = read_u8(&mut buf)?;
    let event_count = read_i32(&mut buf)?;
    if event_count < 0 {
        return Err(JdwpError::Protocol(format!("Negative event count: {}", event_count)));
    }

    let mut events = Vec::with_capacity(event_count as usize);

    for _ in 0..event_count {
        let kind = read_u8(&mut buf)?;
        let request_id = read_i32(&mut buf)?;

        let details = match kind {
            event_kinds::BREAKPOINT => EventKind::Breakpoint {
                thread: read_u64(&mut buf)?,
                location: read_location(&mut buf)?,
            },
            event_kinds::SINGLE_STEP => EventKind::Step {
                thread: read_u64(&mut buf)?,
                location: read_location(&mut buf)?,
            },
            event_kinds::METHOD_ENTRY => EventKind::MethodEntry {
                thread: read_u64(&mut buf)?,
                location: read_location(&mut buf)?,
            },
            event_kinds::METHOD_EXIT => EventKind::MethodExit {
                thread: read_u64(&mut buf)?,
                location: read_location(&mut buf)?,
            },
            event_kinds::METHOD_EXIT_WITH_RETURN_VALUE => EventKind::MethodExitWithReturnValue {
                thread: read_u64(&mut buf)?,
                location: read_location(&mut buf)?,
                value: Value::read_tagged(&mut buf)?,
            },
            event_kinds::EXCEPTION => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                let exception = Value::read_tagged(&mut buf)?.object_id().unwrap_or(0);
                let catch_location = read_location(&mut buf)?;
                EventKind::Exception {
                    thread,
                    location,
                    exception,
                    catch_location: (catch_location != Location::none()).then_some(catch_location),
                }
            }
            event_kinds::FIELD_ACCESS => EventKind::FieldAccess {
                thread: read_u64(&mut buf)?,
                location: read_location(&mut buf)?,
                ref_type_tag: read_u8(&mut buf)?,
                ref_type: read_u64(&mut buf)?,
                field_id: read_u64(&mut buf)?,
                object: Value::read_tagged(&mut buf)?.object_id().unwrap_or(0),
            },
            event_kinds::FIELD_MODIFICATION => EventKind::FieldModification {
                thread: read_u64(&mut buf)?,
                location: read_location(&mut buf)?,
                ref_type_tag: read_u8(&mut buf)?,
                ref_type: read_u64(&mut buf)?,
                field_id: read_u64(&mut buf)?,
                object: Value::read_tagged(&mut buf)?.object_id().unwrap_or(0),
                value: Value::read_tagged(&mut buf)?,
            },
            event_kinds::VM_START => EventKind::VMStart {
                thread: read_u64(&mut buf)?,
            },
            event_kinds::VM_DEATH => EventKind::VMDeath,
            event_kinds::THREAD_START => EventKind::ThreadStart {
                thread: read_u64(&mut buf)?,
            },
            event_kinds::THREAD_DEATH => EventKind::ThreadDeath {
                thread: read_u64(&mut buf)?,
            },
            event_kinds::CLASS_PREPARE => EventKind::ClassPrepare {
                thread: read_u64(&mut buf)?,
                ref_type_tag: read_u8(&mut buf)?,
                ref_type: read_u64(&mut buf)?,
                signature: read_string(&mut buf)?,
                status: read_i32(&mut buf)?,
            },
            event_kinds::CLASS_UNLOAD => EventKind::ClassUnload {
                signature: read_string(&mut buf)?,
            },
            _ => {
                // The payload length of an unknown kind is unknown too
                warn!("Unsupported event kind: {}", kind);
                events.push(Event {
                    kind,
                    request_id,
                    details: EventKind::Unknown { kind },
                });
                break;
            }
        };

        events.push(Event {
            kind,
            request_id,
            details,
        });
    }

    Ok(EventSet {
        suspend_policy,
        events,
    })
}
