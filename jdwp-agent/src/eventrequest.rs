// EventRequest command implementations
//
// Set up and tear down event requests (breakpoints, steps, exceptions, etc.)

use crate::breakpoints::BreakpointInfo;
use crate::commands::{event_kinds, step_sizes};
use crate::context::DebuggerContext;
use crate::filters::{modifiers_match_type, Modifier, RequestFilter};
use crate::protocol::{error_codes, CommandPacket, JdwpError, JdwpResult, ReplyPacket};
use crate::pump::CommandResult;
use crate::reader::{read_i32, read_u8};
use crate::stepping::{StepKind, SteppingInfo};
use crate::types::ThreadId;
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Suspend policy for events, ordered from least to most suspending
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SuspendPolicy {
    None = 0,
    EventThread = 1,
    All = 2,
}

impl SuspendPolicy {
    pub fn from_u8(value: u8) -> JdwpResult<Self> {
        match value {
            0 => Ok(SuspendPolicy::None),
            1 => Ok(SuspendPolicy::EventThread),
            2 => Ok(SuspendPolicy::All),
            _ => Err(JdwpError::Command(error_codes::ILLEGAL_ARGUMENT)),
        }
    }
}

/// A step request decoded from its STEP modifier
struct StepRequest {
    thread: ThreadId,
    size: i32,
    kind: StepKind,
}

impl DebuggerContext {
    /// EventRequest.Set. The request id is the id of the Set packet.
    pub(crate) fn set_event_request(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let mut buf = packet.data();
        let event_kind = read_u8(&mut buf)?;
        let suspend_policy = SuspendPolicy::from_u8(read_u8(&mut buf)?)?;
        let count = read_i32(&mut buf)?;
        if count < 0 {
            return Err(JdwpError::Command(error_codes::ILLEGAL_ARGUMENT));
        }
        let modifiers = (0..count)
            .map(|_| Modifier::read(&mut buf))
            .collect::<JdwpResult<Vec<_>>>()?;

        let request_id = packet.id as i32;
        let mut step = None;
        let breakpoint = match event_kind {
            event_kinds::SINGLE_STEP => {
                step = Some(self.decode_step(&modifiers)?);
                None
            }
            event_kinds::THREAD_START
            | event_kinds::THREAD_DEATH
            | event_kinds::CLASS_PREPARE
            | event_kinds::CLASS_UNLOAD
            | event_kinds::VM_DEATH => None,
            _ => Some(self.create_breakpoint(event_kind, &modifiers)?),
        };

        self.filters.add(RequestFilter::new(
            request_id,
            event_kind,
            suspend_policy,
            modifiers,
            breakpoint,
        ));
        if let Some(step) = step {
            self.begin_step(request_id, suspend_policy, step);
        }

        let mut data = Vec::new();
        data.put_i32(request_id);
        Ok(CommandResult::reply(ReplyPacket::with_data(packet.id, data)))
    }

    fn create_breakpoint(&self, event_kind: u8, modifiers: &[Modifier]) -> JdwpResult<BreakpointInfo> {
        let runtime = self.runtime.as_ref();

        match event_kind {
            event_kinds::BREAKPOINT => {
                let location = modifiers
                    .iter()
                    .find_map(|modifier| match modifier {
                        Modifier::LocationOnly(location) => Some(*location),
                        _ => None,
                    })
                    .ok_or(JdwpError::Command(error_codes::INVALID_LOCATION))?;
                BreakpointInfo::line(runtime, location)
            }
            event_kinds::EXCEPTION => {
                let (caught, uncaught) = modifiers
                    .iter()
                    .find_map(|modifier| match modifier {
                        Modifier::ExceptionOnly { caught, uncaught, .. } => Some((*caught, *uncaught)),
                        _ => None,
                    })
                    .unwrap_or((true, true));
                BreakpointInfo::exception(runtime, caught, uncaught)
            }
            event_kinds::FIELD_ACCESS | event_kinds::FIELD_MODIFICATION => {
                let (class_id, field_id) = modifiers
                    .iter()
                    .find_map(|modifier| match modifier {
                        Modifier::FieldOnly { ref_type, field_id } => Some((*ref_type, *field_id)),
                        _ => None,
                    })
                    .ok_or(JdwpError::Command(error_codes::ILLEGAL_ARGUMENT))?;
                BreakpointInfo::field(
                    runtime,
                    class_id,
                    field_id,
                    event_kind == event_kinds::FIELD_ACCESS,
                    event_kind == event_kinds::FIELD_MODIFICATION,
                )
            }
            event_kinds::METHOD_ENTRY
            | event_kinds::METHOD_EXIT
            | event_kinds::METHOD_EXIT_WITH_RETURN_VALUE => {
                let entry = event_kind == event_kinds::METHOD_ENTRY;
                let info = BreakpointInfo::method(entry, !entry);
                for class in runtime.loaded_classes() {
                    if !modifiers_match_type(modifiers, &class, runtime) {
                        continue;
                    }
                    if let Err(e) = info.attach_to(runtime, &class) {
                        info.dispose(runtime);
                        return Err(e);
                    }
                }
                Ok(info)
            }
            other => {
                debug!("Unsupported event kind {}", other);
                Err(JdwpError::Command(error_codes::INVALID_EVENT_TYPE))
            }
        }
    }

    fn decode_step(&self, modifiers: &[Modifier]) -> JdwpResult<StepRequest> {
        let (thread, size, depth) = modifiers
            .iter()
            .find_map(|modifier| match modifier {
                Modifier::Step {
                    thread,
                    size,
                    depth,
                } => Some((*thread, *size, *depth)),
                _ => None,
            })
            .ok_or(JdwpError::Command(error_codes::ILLEGAL_ARGUMENT))?;

        if size != step_sizes::MIN && size != step_sizes::LINE {
            return Err(JdwpError::Command(error_codes::ILLEGAL_ARGUMENT));
        }
        self.runtime.thread_status(thread)?;

        Ok(StepRequest {
            thread,
            size,
            kind: StepKind::from_depth(depth)?,
        })
    }

    /// Record a step; it is armed when the thread is next released
    fn begin_step(&self, request_id: i32, suspend_policy: SuspendPolicy, step: StepRequest) {
        let mut info = SteppingInfo::new(request_id, suspend_policy, step.kind, step.size);
        info.origin = self
            .threads
            .suspended_info(step.thread)
            .and_then(|suspended| suspended.location.map(|location| (location, suspended.line)));

        if let Some(previous) = self.stepping.get(step.thread) {
            debug!(
                "Step request {} replaces {} on thread {:#x}",
                request_id, previous.request_id, step.thread
            );
        }
        self.stepping.set(step.thread, info);

        if !self.threads.is_suspended(step.thread) {
            if let Some(kind) = self.stepping.take_unsubmitted(step.thread) {
                self.runtime.arm_step(step.thread, kind);
            }
        }
    }

    /// EventRequest.Clear
    pub(crate) fn clear_event_request(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let mut buf = packet.data();
        let _event_kind = read_u8(&mut buf)?;
        let request_id = read_i32(&mut buf)?;

        match self.filters.remove(request_id, self.runtime.as_ref()) {
            Some(filter) if filter.event_kind == event_kinds::SINGLE_STEP => {
                if let Some(thread) = self.stepping.remove_request(request_id) {
                    self.runtime.cancel_step(thread);
                }
            }
            Some(_) => {}
            None => debug!("Clear of unknown request {}", request_id),
        }

        Ok(CommandResult::reply(ReplyPacket::new(packet.id)))
    }

    /// EventRequest.ClearAllBreakpoints
    pub(crate) fn clear_all_breakpoints(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let removed = self.filters.clear_all_breakpoints(self.runtime.as_ref());
        info!("Cleared {} breakpoints", removed);
        Ok(CommandResult::reply(ReplyPacket::new(packet.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{command_sets, event_commands, modifier_kinds, step_depths};
    use crate::mock::{Installed, TestAgent};
    use crate::reader::put_location;
    use crate::types::{ClassRef, Location};

    fn location(index: u64) -> Location {
        Location {
            type_tag: 1,
            class_id: 0x10,
            method_id: 0x20,
            index,
        }
    }

    fn set_packet(id: u32, kind: u8, policy: SuspendPolicy, modifiers: &[Vec<u8>]) -> CommandPacket {
        let mut data = Vec::new();
        data.put_u8(kind);
        data.put_u8(policy as u8);
        data.put_i32(modifiers.len() as i32);
        for modifier in modifiers {
            data.extend_from_slice(modifier);
        }
        CommandPacket::with_data(id, command_sets::EVENT_REQUEST, event_commands::SET, data)
    }

    fn location_modifier(location: &Location) -> Vec<u8> {
        let mut data = vec![modifier_kinds::LOCATION_ONLY];
        put_location(&mut data, location);
        data
    }

    fn step_modifier(thread: ThreadId, size: i32, depth: i32) -> Vec<u8> {
        let mut data = vec![modifier_kinds::STEP];
        data.put_u64(thread);
        data.put_i32(size);
        data.put_i32(depth);
        data
    }

    #[test]
    fn test_set_breakpoint_uses_packet_id() {
        let agent = TestAgent::new(&[1]);
        let packet = set_packet(
            77,
            event_kinds::BREAKPOINT,
            SuspendPolicy::All,
            &[location_modifier(&location(5))],
        );

        let result = agent.ctx.set_event_request(&packet).unwrap();
        let mut data = result.reply.data();
        assert_eq!(read_i32(&mut data).unwrap(), 77);
        assert_eq!(result.reply.id, 77);

        let filter = agent.ctx.filters.get(77).unwrap();
        assert_eq!(filter.suspend_policy, SuspendPolicy::All);
        assert!(agent.runtime.handle_for(&location(5)).is_some());
    }

    #[test]
    fn test_breakpoint_without_location_is_rejected() {
        let agent = TestAgent::new(&[1]);
        let packet = set_packet(1, event_kinds::BREAKPOINT, SuspendPolicy::None, &[]);

        assert!(matches!(
            agent.ctx.set_event_request(&packet),
            Err(JdwpError::Command(error_codes::INVALID_LOCATION))
        ));
        assert!(agent.ctx.filters.is_empty());
    }

    #[test]
    fn test_second_step_overwrites_first() {
        let agent = TestAgent::new(&[1]);
        agent.ctx.threads.suspend(1);

        for id in [10, 11] {
            let packet = set_packet(
                id,
                event_kinds::SINGLE_STEP,
                SuspendPolicy::EventThread,
                &[step_modifier(1, step_sizes::LINE, step_depths::OVER)],
            );
            agent.ctx.set_event_request(&packet).unwrap();
        }

        assert_eq!(agent.ctx.stepping.get(1).unwrap().request_id, 11);
        // Suspended thread: nothing armed until it is released
        assert!(agent.runtime.armed_steps().is_empty());

        agent.ctx.threads.resume(1);
        assert_eq!(agent.runtime.armed_steps(), vec![(1, StepKind::Over)]);
    }

    #[test]
    fn test_step_on_unknown_thread_fails() {
        let agent = TestAgent::new(&[1]);
        let packet = set_packet(
            3,
            event_kinds::SINGLE_STEP,
            SuspendPolicy::EventThread,
            &[step_modifier(9, step_sizes::LINE, step_depths::INTO)],
        );
        assert!(matches!(
            agent.ctx.set_event_request(&packet),
            Err(JdwpError::Command(error_codes::INVALID_THREAD))
        ));
    }

    #[test]
    fn test_clear_step_request_cancels_step() {
        let agent = TestAgent::new(&[1]);
        let packet = set_packet(
            5,
            event_kinds::SINGLE_STEP,
            SuspendPolicy::EventThread,
            &[step_modifier(1, step_sizes::MIN, step_depths::INTO)],
        );
        agent.ctx.set_event_request(&packet).unwrap();

        let mut data = vec![event_kinds::SINGLE_STEP];
        data.put_i32(5);
        let clear = CommandPacket::with_data(6, command_sets::EVENT_REQUEST, event_commands::CLEAR, data);
        agent.ctx.clear_event_request(&clear).unwrap();

        assert!(agent.ctx.stepping.get(1).is_none());
        assert_eq!(agent.runtime.cancelled_steps(), vec![1]);
        assert!(agent.ctx.filters.is_empty());
    }

    #[test]
    fn test_method_entry_hooks_matching_loaded_classes() {
        let agent = TestAgent::new(&[1]);
        agent.runtime.add_class(ClassRef::new(0x10, "com.foo.Bar"));
        agent.runtime.add_class(ClassRef::new(0x11, "org.other.Baz"));

        let mut class_match = vec![modifier_kinds::CLASS_MATCH];
        crate::reader::put_string(&mut class_match, "com.foo.*");
        let packet = set_packet(8, event_kinds::METHOD_ENTRY, SuspendPolicy::None, &[class_match]);
        agent.ctx.set_event_request(&packet).unwrap();

        let hooks = agent
            .runtime
            .handles_where(|installed| matches!(installed, Installed::MethodHook { .. }));
        assert_eq!(hooks.len(), 1);
        assert_eq!(
            agent.runtime.installed_handles()[&hooks[0]],
            Installed::MethodHook {
                class_id: 0x10,
                entry: true,
                exit: false
            }
        );
    }

    #[test]
    fn test_clear_all_breakpoints_keeps_other_requests() {
        let agent = TestAgent::new(&[1]);
        for i in 0..3 {
            let packet = set_packet(
                20 + i,
                event_kinds::BREAKPOINT,
                SuspendPolicy::EventThread,
                &[location_modifier(&location(i as u64))],
            );
            agent.ctx.set_event_request(&packet).unwrap();
        }
        agent
            .ctx
            .set_event_request(&set_packet(30, event_kinds::THREAD_START, SuspendPolicy::None, &[]))
            .unwrap();

        let clear = CommandPacket::new(31, command_sets::EVENT_REQUEST, event_commands::CLEAR_ALL_BREAKPOINTS);
        agent.ctx.clear_all_breakpoints(&clear).unwrap();

        assert_eq!(agent.ctx.filters.len(), 1);
        assert!(agent.runtime.installed_handles().is_empty());
        assert_eq!(agent.runtime.disposed_handles().len(), 3);
    }

    #[test]
    fn test_unknown_event_kind_and_policy() {
        let agent = TestAgent::new(&[1]);
        assert!(matches!(
            agent.ctx.set_event_request(&set_packet(1, 77, SuspendPolicy::None, &[])),
            Err(JdwpError::Command(error_codes::INVALID_EVENT_TYPE))
        ));

        let mut bad_policy = set_packet(2, event_kinds::THREAD_START, SuspendPolicy::None, &[]);
        bad_policy.data[1] = 9;
        assert!(matches!(
            agent.ctx.set_event_request(&bad_policy),
            Err(JdwpError::Command(error_codes::ILLEGAL_ARGUMENT))
        ));
    }

    #[test]
    fn test_policy_ordering() {
        assert!(SuspendPolicy::All > SuspendPolicy::EventThread);
        assert_eq!(
            SuspendPolicy::None.max(SuspendPolicy::EventThread),
            SuspendPolicy::EventThread
        );
    }
}
