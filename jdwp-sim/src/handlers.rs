// Reflection commands for the simulated program
//
// The agent core answers VM control, threads, events and invocation. These
// handlers add just enough reflection (classes, methods, line tables) for a
// debugger to find its way around `demo.Counter`.

use crate::program::{self, COUNTER_CLASS};
use bytes::BufMut;
use jdwp_agent::commands::{
    command_sets, method_commands, reference_type_commands, vm_commands,
};
use jdwp_agent::events::CLASS_STATUS_PREPARED;
use jdwp_agent::protocol::{error_codes, CommandPacket, JdwpError, JdwpResult, ReplyPacket};
use jdwp_agent::reader::{put_string, read_string, read_u64};
use jdwp_agent::types::{ClassRef, ReferenceTypeId};
use jdwp_agent::{CommandResult, DebuggerContext, DebuggerController};
use std::sync::Arc;

// Method modifiers
const ACC_PUBLIC: i32 = 0x0001;
const ACC_STATIC: i32 = 0x0008;

pub fn register(controller: &DebuggerController) {
    controller.register_handler(
        command_sets::VIRTUAL_MACHINE,
        vm_commands::CLASSES_BY_SIGNATURE,
        Arc::new(classes_by_signature),
    );
    controller.register_handler(
        command_sets::REFERENCE_TYPE,
        reference_type_commands::SIGNATURE,
        Arc::new(signature),
    );
    controller.register_handler(
        command_sets::REFERENCE_TYPE,
        reference_type_commands::METHODS,
        Arc::new(methods),
    );
    controller.register_handler(
        command_sets::REFERENCE_TYPE,
        reference_type_commands::SOURCE_FILE,
        Arc::new(source_file),
    );
    controller.register_handler(
        command_sets::METHOD,
        method_commands::LINE_TABLE,
        Arc::new(line_table),
    );
}

fn reply(packet: &CommandPacket, data: Vec<u8>) -> JdwpResult<Option<CommandResult>> {
    Ok(Some(CommandResult::reply(ReplyPacket::with_data(packet.id, data))))
}

fn find_class(ctx: &DebuggerContext, id: ReferenceTypeId) -> JdwpResult<ClassRef> {
    ctx.runtime()
        .loaded_classes()
        .into_iter()
        .find(|class| class.id == id)
        .ok_or(JdwpError::Command(error_codes::INVALID_CLASS))
}

/// VirtualMachine.ClassesBySignature
fn classes_by_signature(packet: &CommandPacket, ctx: &DebuggerContext) -> JdwpResult<Option<CommandResult>> {
    let mut buf = packet.data();
    let wanted = read_string(&mut buf)?;

    let matching: Vec<ClassRef> = ctx
        .runtime()
        .loaded_classes()
        .into_iter()
        .filter(|class| class.signature == wanted)
        .collect();

    let mut data = Vec::new();
    data.put_i32(matching.len() as i32);
    for class in &matching {
        data.put_u8(class.type_tag);
        data.put_u64(class.id);
        data.put_i32(CLASS_STATUS_PREPARED);
    }
    reply(packet, data)
}

/// ReferenceType.Signature
fn signature(packet: &CommandPacket, ctx: &DebuggerContext) -> JdwpResult<Option<CommandResult>> {
    let mut buf = packet.data();
    let class = find_class(ctx, read_u64(&mut buf)?)?;

    let mut data = Vec::new();
    put_string(&mut data, &class.signature);
    reply(packet, data)
}

/// ReferenceType.SourceFile
fn source_file(packet: &CommandPacket, ctx: &DebuggerContext) -> JdwpResult<Option<CommandResult>> {
    let mut buf = packet.data();
    let class = find_class(ctx, read_u64(&mut buf)?)?;
    let source = class
        .source_name
        .ok_or(JdwpError::Command(error_codes::ABSENT_INFORMATION))?;

    let mut data = Vec::new();
    put_string(&mut data, &source);
    reply(packet, data)
}

/// ReferenceType.Methods
fn methods(packet: &CommandPacket, ctx: &DebuggerContext) -> JdwpResult<Option<CommandResult>> {
    let mut buf = packet.data();
    let class = find_class(ctx, read_u64(&mut buf)?)?;

    let mut data = Vec::new();
    if class.id != COUNTER_CLASS {
        data.put_i32(0);
        return reply(packet, data);
    }

    data.put_i32(program::METHODS.len() as i32);
    for method in &program::METHODS {
        data.put_u64(method.id);
        put_string(&mut data, method.name);
        put_string(&mut data, method.signature);
        let modifiers = if method.body.is_empty() {
            ACC_PUBLIC | ACC_STATIC
        } else {
            ACC_PUBLIC
        };
        data.put_i32(modifiers);
    }
    reply(packet, data)
}

/// Method.LineTable
fn line_table(packet: &CommandPacket, _ctx: &DebuggerContext) -> JdwpResult<Option<CommandResult>> {
    let mut buf = packet.data();
    let class_id = read_u64(&mut buf)?;
    let method_id = read_u64(&mut buf)?;

    if class_id != COUNTER_CLASS {
        return Err(JdwpError::Command(error_codes::INVALID_CLASS));
    }
    let method = program::method(method_id).ok_or(JdwpError::Command(error_codes::INVALID_METHODID))?;
    if method.body.is_empty() {
        return Err(JdwpError::Command(error_codes::ABSENT_INFORMATION));
    }

    let mut data = Vec::new();
    data.put_u64(0);
    data.put_u64(method.body.len() as u64 - 1);
    data.put_i32(method.body.len() as i32);
    for (index, instruction) in method.body.iter().enumerate() {
        data.put_u64(index as u64);
        data.put_i32(instruction.line);
    }
    reply(packet, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{RUN_METHOD, TICK_METHOD};
    use crate::vm::SimulatedVm;
    use jdwp_agent::reader::read_i32;
    use jdwp_agent::DebuggerOptions;

    fn controller() -> DebuggerController {
        let options =
            DebuggerOptions::parse("transport=dt_socket,server=y,suspend=n,address=127.0.0.1:0").unwrap();
        DebuggerController::new(Arc::new(SimulatedVm::new(1)), options).unwrap()
    }

    fn call(
        handler: fn(&CommandPacket, &DebuggerContext) -> JdwpResult<Option<CommandResult>>,
        controller: &DebuggerController,
        data: Vec<u8>,
    ) -> JdwpResult<ReplyPacket> {
        let packet = CommandPacket::with_data(1, 0, 0, data);
        Ok(handler(&packet, controller.context())?.unwrap().reply)
    }

    #[test]
    fn test_classes_by_signature() {
        let controller = controller();
        let mut data = Vec::new();
        put_string(&mut data, "Ldemo/Counter;");

        let reply = call(classes_by_signature, &controller, data).unwrap();
        let mut buf = reply.data();
        assert_eq!(read_i32(&mut buf).unwrap(), 1);
        buf = &buf[1..];
        assert_eq!(read_u64(&mut buf).unwrap(), COUNTER_CLASS);
    }

    #[test]
    fn test_source_file_absent() {
        let controller = controller();
        let mut data = Vec::new();
        data.put_u64(program::THROWABLE_CLASS);
        assert!(matches!(
            call(source_file, &controller, data),
            Err(JdwpError::Command(error_codes::ABSENT_INFORMATION))
        ));
    }

    #[test]
    fn test_line_table_of_tick() {
        let controller = controller();
        let mut data = Vec::new();
        data.put_u64(COUNTER_CLASS);
        data.put_u64(TICK_METHOD);

        let reply = call(line_table, &controller, data).unwrap();
        let mut buf = reply.data();
        assert_eq!(read_u64(&mut buf).unwrap(), 0);
        assert_eq!(read_u64(&mut buf).unwrap(), 2);
        assert_eq!(read_i32(&mut buf).unwrap(), 3);
        assert_eq!(read_u64(&mut buf).unwrap(), 0);
        assert_eq!(read_i32(&mut buf).unwrap(), 10);
    }

    #[test]
    fn test_unknown_method() {
        let controller = controller();
        let mut data = Vec::new();
        data.put_u64(COUNTER_CLASS);
        data.put_u64(RUN_METHOD + 0x100);
        assert!(matches!(
            call(line_table, &controller, data),
            Err(JdwpError::Command(error_codes::INVALID_METHODID))
        ));
    }
}
