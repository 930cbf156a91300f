// ThreadReference command implementations
//
// Commands for working with threads (frames, status, suspend/resume) plus
// ForceEarlyReturn, which runs on the target thread itself.

use crate::commands::step_sizes;
use crate::context::DebuggerContext;
use crate::eventrequest::SuspendPolicy;
use crate::invoke::InvocationStrategy;
use crate::protocol::{error_codes, CommandPacket, JdwpError, JdwpResult, ReplyPacket};
use crate::pump::CommandResult;
use crate::reader::{put_location, put_string, read_i32, read_u64};
use crate::stepping::{StepKind, SteppingInfo};
use crate::types::{SuspendStatus, ThreadId, Value};
use bytes::BufMut;
use tracing::{debug, warn};

impl DebuggerContext {
    /// Fails with INVALID_THREAD for threads the runtime does not know
    pub(crate) fn check_thread(&self, thread: ThreadId) -> JdwpResult<()> {
        self.runtime.thread_status(thread).map(|_| ())
    }

    /// ThreadReference.Name
    pub(crate) fn thread_name(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let mut buf = packet.data();
        let thread = read_u64(&mut buf)?;
        let name = self.runtime.thread_name(thread)?;

        let mut data = Vec::new();
        put_string(&mut data, &name);
        Ok(CommandResult::reply(ReplyPacket::with_data(packet.id, data)))
    }

    /// ThreadReference.Suspend
    pub(crate) fn thread_suspend(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let mut buf = packet.data();
        let thread = read_u64(&mut buf)?;
        self.check_thread(thread)?;

        self.threads.suspend(thread);
        Ok(CommandResult::reply(ReplyPacket::new(packet.id)))
    }

    /// ThreadReference.Resume
    pub(crate) fn thread_resume(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let mut buf = packet.data();
        let thread = read_u64(&mut buf)?;
        self.check_thread(thread)?;

        self.threads.resume(thread);
        if !self.threads.any_suspended() {
            self.pins.release();
        }
        Ok(CommandResult::reply(ReplyPacket::new(packet.id)))
    }

    /// ThreadReference.Status
    pub(crate) fn thread_status(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let mut buf = packet.data();
        let thread = read_u64(&mut buf)?;
        let status = self.runtime.thread_status(thread)?;
        let suspend_status = if self.threads.is_suspended(thread) {
            SuspendStatus::Suspended
        } else {
            SuspendStatus::Running
        };

        let mut data = Vec::with_capacity(8);
        data.put_i32(status as i32);
        data.put_i32(suspend_status as i32);
        Ok(CommandResult::reply(ReplyPacket::with_data(packet.id, data)))
    }

    /// ThreadReference.Frames
    pub(crate) fn thread_frames(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let mut buf = packet.data();
        let thread = read_u64(&mut buf)?;
        let start = read_i32(&mut buf)?;
        let length = read_i32(&mut buf)?;
        self.check_thread(thread)?;

        let info = self.threads.await_suspended_info(thread)?;
        let total = info.frames.len();
        if start < 0 || start as usize > total {
            return Err(JdwpError::Command(error_codes::INVALID_INDEX));
        }
        let start = start as usize;
        let end = match length {
            -1 => total,
            n if n < 0 || start + n as usize > total => {
                return Err(JdwpError::Command(error_codes::INVALID_LENGTH))
            }
            n => start + n as usize,
        };

        let frames = &info.frames[start..end];
        let mut data = Vec::with_capacity(4 + frames.len() * 33);
        data.put_i32(frames.len() as i32);
        for frame in frames {
            data.put_u64(frame.frame_id);
            put_location(&mut data, &frame.location);
        }
        Ok(CommandResult::reply(ReplyPacket::with_data(packet.id, data)))
    }

    /// ThreadReference.FrameCount
    pub(crate) fn thread_frame_count(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let mut buf = packet.data();
        let thread = read_u64(&mut buf)?;
        self.check_thread(thread)?;

        let info = self.threads.await_suspended_info(thread)?;
        let mut data = Vec::with_capacity(4);
        data.put_i32(info.frames.len() as i32);
        Ok(CommandResult::reply(ReplyPacket::with_data(packet.id, data)))
    }

    /// ThreadReference.SuspendCount
    pub(crate) fn thread_suspend_count(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let mut buf = packet.data();
        let thread = read_u64(&mut buf)?;
        self.check_thread(thread)?;

        let mut data = Vec::with_capacity(4);
        data.put_i32(self.threads.suspension_count(thread) as i32);
        Ok(CommandResult::reply(ReplyPacket::with_data(packet.id, data)))
    }

    /// ThreadReference.ForceEarlyReturn
    ///
    /// The return is prepared on the target thread while it stays suspended,
    /// from a blocking worker that also sends the reply. The thread completes
    /// the return once resumed; the stop it reaches afterwards is not reported.
    pub(crate) fn force_early_return(&self, packet: &CommandPacket) -> JdwpResult<Option<CommandResult>> {
        let mut buf = packet.data();
        let thread = read_u64(&mut buf)?;
        let value = Value::read_tagged(&mut buf)?;
        self.check_thread(thread)?;
        let connection = self.connection().ok_or(JdwpError::ConnectionClosed)?;

        self.threads.set_force_early_return(thread, true)?;
        let threads = self.threads.clone();
        let stepping = self.stepping.clone();
        let runtime = self.runtime.clone();
        let id = packet.id;

        self.io.spawn_blocking(move || {
            let outcome = threads.post_invocation(
                thread,
                move || runtime.force_early_return(thread, &value),
                InvocationStrategy::EventThread,
            );
            if let Err(e) = threads.set_force_early_return(thread, false) {
                warn!("Thread {:#x} released during forced return: {}", thread, e);
            }

            let reply = match outcome.and_then(|forced| forced) {
                Ok(()) => {
                    debug!("Forced return prepared on thread {:#x}", thread);
                    stepping.set(
                        thread,
                        SteppingInfo::new(0, SuspendPolicy::None, StepKind::ForceReturn, step_sizes::MIN),
                    );
                    ReplyPacket::new(id)
                }
                Err(e) => {
                    debug!("Forced return on thread {:#x} failed: {}", thread, e);
                    ReplyPacket::error(id, e.error_code())
                }
            };
            connection.send_reply(&reply);
        });

        Ok(None)
    }
}
