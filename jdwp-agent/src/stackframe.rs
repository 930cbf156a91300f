// StackFrame command implementations
//
// PopFrames lets the target thread run just long enough to unwind to the
// caller of the given frame. The thread stays suspended throughout.

use crate::commands::step_sizes;
use crate::context::DebuggerContext;
use crate::eventrequest::SuspendPolicy;
use crate::protocol::{error_codes, CommandPacket, JdwpError, JdwpResult, ReplyPacket};
use crate::pump::CommandResult;
use crate::reader::read_u64;
use crate::stepping::{StepKind, SteppingInfo};
use tracing::debug;

impl DebuggerContext {
    /// StackFrame.PopFrames
    pub(crate) fn pop_frames(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let mut buf = packet.data();
        let thread = read_u64(&mut buf)?;
        let frame = read_u64(&mut buf)?;
        self.check_thread(thread)?;

        let info = self.threads.await_suspended_info(thread)?;
        let position = info
            .frames
            .iter()
            .position(|f| f.frame_id == frame)
            .ok_or(JdwpError::Command(error_codes::INVALID_FRAMEID))?;
        if position + 1 >= info.frames.len() {
            // Nothing to return to below the bottom frame
            return Err(JdwpError::Command(error_codes::OPAQUE_FRAME));
        }

        self.runtime.pop_frames(thread, frame)?;
        self.stepping.set(
            thread,
            SteppingInfo::new(0, SuspendPolicy::None, StepKind::PopFrames, step_sizes::MIN),
        );
        self.threads.release_for_unwind(thread)?;

        debug!("Thread {:#x} unwinding {} frame(s)", thread, position + 1);
        Ok(CommandResult::reply(ReplyPacket::new(packet.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{command_sets, stack_frame_commands};
    use crate::mock::TestAgent;
    use crate::runtime::StopEvent;
    use crate::suspend::SuspendedInfo;
    use crate::types::{ClassRef, FrameInfo, Location};
    use bytes::BufMut;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(id: u64, method_id: u64) -> FrameInfo {
        FrameInfo {
            frame_id: id,
            location: Location {
                type_tag: 1,
                class_id: 0x10,
                method_id,
                index: 4,
            },
        }
    }

    fn pop_packet(thread: u64, frame: u64) -> CommandPacket {
        let mut data = Vec::new();
        data.put_u64(thread);
        data.put_u64(frame);
        CommandPacket::with_data(1, command_sets::STACK_FRAME, stack_frame_commands::POP_FRAMES, data)
    }

    #[test]
    fn test_pop_frames_reparks_thread() {
        let agent = TestAgent::new(&[1]);
        let stopped = SuspendedInfo {
            location: Some(frame(10, 1).location),
            line: Some(3),
            frames: vec![frame(10, 1), frame(11, 2), frame(12, 3)],
            force_early_return: false,
        };
        agent.ctx.threads.suspend_event_thread(1, stopped);

        // The debuggee thread: parks, unwinds once released, reports where it
        // landed and parks again until resumed
        let debuggee = {
            let ctx = Arc::clone(&agent.ctx);
            std::thread::spawn(move || {
                ctx.threads.park(1);
                ctx.handle_stop(StopEvent {
                    thread: 1,
                    class: ClassRef::new(0x10, "com.foo.Bar"),
                    location: frame(11, 2).location,
                    line: Some(8),
                    this_object: None,
                    frames: vec![frame(11, 2), frame(12, 3)],
                    hits: Vec::new(),
                    stepped: true,
                });
            })
        };

        agent.ctx.pop_frames(&pop_packet(1, 10)).unwrap();
        assert_eq!(agent.runtime.popped_frames(), vec![(1, 10)]);
        assert_eq!(agent.runtime.armed_steps(), vec![(1, StepKind::PopFrames)]);

        let info = agent.ctx.threads.await_suspended_info(1).unwrap();
        assert_eq!(info.frames.len(), 2);
        assert_eq!(agent.ctx.threads.suspension_count(1), 1);
        assert!(agent.ctx.stepping.get(1).is_none());
        assert!(agent.next_packet(Duration::from_millis(50)).is_none());

        agent.ctx.threads.resume(1);
        debuggee.join().unwrap();
    }

    #[test]
    fn test_pop_bottom_or_unknown_frame() {
        let agent = TestAgent::new(&[1]);
        agent.ctx.threads.suspend_event_thread(
            1,
            SuspendedInfo {
                location: Some(Location::none()),
                line: None,
                frames: vec![frame(10, 1), frame(11, 2)],
                force_early_return: false,
            },
        );

        assert!(matches!(
            agent.ctx.pop_frames(&pop_packet(1, 11)),
            Err(JdwpError::Command(error_codes::OPAQUE_FRAME))
        ));
        assert!(matches!(
            agent.ctx.pop_frames(&pop_packet(1, 99)),
            Err(JdwpError::Command(error_codes::INVALID_FRAMEID))
        ));
        assert!(agent.runtime.popped_frames().is_empty());
    }
}
