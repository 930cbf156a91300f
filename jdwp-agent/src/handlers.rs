// Command routing
//
// The core commands (VM control, threads, event requests, invocation) are
// answered by the agent itself. Everything else goes to handlers the
// embedding runtime registers per (command set, command) pair.

use crate::commands::{
    class_type_commands, command_sets, event_commands, object_commands, stack_frame_commands,
    thread_commands, vm_commands,
};
use crate::connection::DebuggerConnection;
use crate::context::DebuggerContext;
use crate::protocol::{error_codes, CommandPacket, JdwpResult, ReplyPacket};
use crate::pump::{CommandResult, PacketDispatch};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Answers one kind of command packet
pub trait CommandHandler: Send + Sync {
    /// `Ok(None)` when the reply is sent later through the connection
    fn handle(&self, packet: &CommandPacket, ctx: &DebuggerContext) -> JdwpResult<Option<CommandResult>>;
}

impl<F> CommandHandler for F
where
    F: Fn(&CommandPacket, &DebuggerContext) -> JdwpResult<Option<CommandResult>> + Send + Sync,
{
    fn handle(&self, packet: &CommandPacket, ctx: &DebuggerContext) -> JdwpResult<Option<CommandResult>> {
        self(packet, ctx)
    }
}

#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<(u8, u8), Arc<dyn CommandHandler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `command_set`/`command`
    pub fn register(&self, command_set: u8, command: u8, handler: Arc<dyn CommandHandler>) {
        if self
            .handlers
            .write()
            .insert((command_set, command), handler)
            .is_some()
        {
            debug!("Replaced handler for {}/{}", command_set, command);
        }
    }

    pub fn get(&self, command_set: u8, command: u8) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.read().get(&(command_set, command)).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl DebuggerContext {
    pub fn register_handler(&self, command_set: u8, command: u8, handler: Arc<dyn CommandHandler>) {
        self.handlers.register(command_set, command, handler);
    }

    /// Route a command to its handler
    pub(crate) fn dispatch_command(&self, packet: &CommandPacket) -> JdwpResult<Option<CommandResult>> {
        let result = match (packet.command_set, packet.command) {
            (command_sets::VIRTUAL_MACHINE, vm_commands::VERSION) => self.vm_version(packet)?,
            (command_sets::VIRTUAL_MACHINE, vm_commands::ALL_THREADS) => self.vm_all_threads(packet)?,
            (command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE) => self.vm_dispose(packet)?,
            (command_sets::VIRTUAL_MACHINE, vm_commands::ID_SIZES) => self.vm_id_sizes(packet)?,
            (command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND) => self.vm_suspend(packet)?,
            (command_sets::VIRTUAL_MACHINE, vm_commands::RESUME) => self.vm_resume(packet)?,
            (command_sets::VIRTUAL_MACHINE, vm_commands::EXIT) => self.vm_exit(packet)?,

            (command_sets::THREAD_REFERENCE, thread_commands::NAME) => self.thread_name(packet)?,
            (command_sets::THREAD_REFERENCE, thread_commands::SUSPEND) => self.thread_suspend(packet)?,
            (command_sets::THREAD_REFERENCE, thread_commands::RESUME) => self.thread_resume(packet)?,
            (command_sets::THREAD_REFERENCE, thread_commands::STATUS) => self.thread_status(packet)?,
            (command_sets::THREAD_REFERENCE, thread_commands::FRAMES) => self.thread_frames(packet)?,
            (command_sets::THREAD_REFERENCE, thread_commands::FRAME_COUNT) => {
                self.thread_frame_count(packet)?
            }
            (command_sets::THREAD_REFERENCE, thread_commands::SUSPEND_COUNT) => {
                self.thread_suspend_count(packet)?
            }
            (command_sets::THREAD_REFERENCE, thread_commands::FORCE_EARLY_RETURN) => {
                return self.force_early_return(packet)
            }

            (command_sets::EVENT_REQUEST, event_commands::SET) => self.set_event_request(packet)?,
            (command_sets::EVENT_REQUEST, event_commands::CLEAR) => self.clear_event_request(packet)?,
            (command_sets::EVENT_REQUEST, event_commands::CLEAR_ALL_BREAKPOINTS) => {
                self.clear_all_breakpoints(packet)?
            }

            (command_sets::STACK_FRAME, stack_frame_commands::POP_FRAMES) => self.pop_frames(packet)?,

            (command_sets::CLASS_TYPE, class_type_commands::INVOKE_METHOD) => {
                return self.invoke_static_method(packet)
            }
            (command_sets::OBJECT_REFERENCE, object_commands::INVOKE_METHOD) => {
                return self.invoke_instance_method(packet)
            }

            _ => return self.dispatch_registered(packet),
        };
        Ok(Some(result))
    }

    fn dispatch_registered(&self, packet: &CommandPacket) -> JdwpResult<Option<CommandResult>> {
        match self.handlers.get(packet.command_set, packet.command) {
            Some(handler) => handler.handle(packet, self),
            None => {
                debug!(
                    "No handler for command {}/{}",
                    packet.command_set, packet.command
                );
                Ok(Some(CommandResult::reply(ReplyPacket::error(
                    packet.id,
                    error_codes::NOT_IMPLEMENTED,
                ))))
            }
        }
    }
}

impl PacketDispatch for DebuggerContext {
    fn dispatch(&self, packet: &CommandPacket) -> JdwpResult<Option<CommandResult>> {
        self.dispatch_command(packet)
    }

    fn connection_finished(self: Arc<Self>, connection: Arc<DebuggerConnection>) {
        self.finish_connection(connection);
    }
}
