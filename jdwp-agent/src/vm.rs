// VirtualMachine command implementations
//
// Version, thread listing, ID sizes and the whole-VM controls: suspend,
// resume, dispose and exit.

use crate::context::DebuggerContext;
use crate::protocol::{CommandPacket, JdwpResult, ReplyPacket};
use crate::pump::CommandResult;
use crate::reader::{put_string, read_i32};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::info;

/// ID sizes used by the agent. Every ID is 8 bytes wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmIdSizes {
    pub field_id_size: i32,
    pub method_id_size: i32,
    pub object_id_size: i32,
    pub reference_type_id_size: i32,
    pub frame_id_size: i32,
}

impl Default for VmIdSizes {
    fn default() -> Self {
        Self {
            field_id_size: 8,
            method_id_size: 8,
            object_id_size: 8,
            reference_type_id_size: 8,
            frame_id_size: 8,
        }
    }
}

impl DebuggerContext {
    /// VirtualMachine.Version
    pub(crate) fn vm_version(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let version = self.runtime.vm_version();

        let mut data = Vec::new();
        put_string(&mut data, &version.description);
        data.put_i32(version.jdwp_major);
        data.put_i32(version.jdwp_minor);
        put_string(&mut data, &version.vm_version);
        put_string(&mut data, &version.vm_name);
        Ok(CommandResult::reply(ReplyPacket::with_data(packet.id, data)))
    }

    /// VirtualMachine.AllThreads
    pub(crate) fn vm_all_threads(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let threads = self.runtime.all_threads();

        let mut data = Vec::with_capacity(4 + threads.len() * 8);
        data.put_i32(threads.len() as i32);
        for thread in threads {
            data.put_u64(thread);
        }
        Ok(CommandResult::reply(ReplyPacket::with_data(packet.id, data)))
    }

    /// VirtualMachine.IDSizes
    pub(crate) fn vm_id_sizes(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let sizes = VmIdSizes::default();

        let mut data = Vec::with_capacity(20);
        data.put_i32(sizes.field_id_size);
        data.put_i32(sizes.method_id_size);
        data.put_i32(sizes.object_id_size);
        data.put_i32(sizes.reference_type_id_size);
        data.put_i32(sizes.frame_id_size);
        Ok(CommandResult::reply(ReplyPacket::with_data(packet.id, data)))
    }

    /// VirtualMachine.Suspend
    pub(crate) fn vm_suspend(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        self.threads.suspend_all(&self.pins);
        Ok(CommandResult::reply(ReplyPacket::new(packet.id)))
    }

    /// VirtualMachine.Resume
    pub(crate) fn vm_resume(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        self.threads.resume_all(&self.pins);
        Ok(CommandResult::reply(ReplyPacket::new(packet.id)))
    }

    /// VirtualMachine.Dispose: the reply goes out first, then the socket closes
    /// and the usual teardown runs
    pub(crate) fn vm_dispose(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let result = CommandResult::reply(ReplyPacket::new(packet.id));
        Ok(match self.connection() {
            Some(connection) => result.with_post(move || {
                info!("Debugger disposed the connection");
                connection.close_socket();
            }),
            None => result,
        })
    }

    /// VirtualMachine.Exit
    pub(crate) fn vm_exit(&self, packet: &CommandPacket) -> JdwpResult<CommandResult> {
        let mut buf = packet.data();
        let exit_code = read_i32(&mut buf)?;

        let runtime = self.runtime.clone();
        Ok(CommandResult::reply(ReplyPacket::new(packet.id)).with_post(move || {
            info!("Debugger requested exit with code {}", exit_code);
            runtime.exit(exit_code);
        }))
    }
}
