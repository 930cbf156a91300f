// ClassType command implementations

use crate::context::DebuggerContext;
use crate::object::read_arguments;
use crate::protocol::{CommandPacket, JdwpResult};
use crate::pump::CommandResult;
use crate::reader::{read_i32, read_u64};
use crate::runtime::InvokeRequest;

impl DebuggerContext {
    /// ClassType.InvokeMethod (static methods)
    pub(crate) fn invoke_static_method(&self, packet: &CommandPacket) -> JdwpResult<Option<CommandResult>> {
        let mut buf = packet.data();
        let class_id = read_u64(&mut buf)?;
        let thread = read_u64(&mut buf)?;
        let method_id = read_u64(&mut buf)?;
        let args = read_arguments(&mut buf)?;
        let options = read_i32(&mut buf)?;

        self.start_invocation(
            packet.id,
            InvokeRequest {
                thread,
                object: None,
                class_id,
                method_id,
                args,
                options,
            },
        )
    }
}
