// ObjectReference command implementations
//
// InvokeMethod runs on the target thread and may take arbitrarily long, so the
// processor only validates and hands the call to a blocking worker. The worker
// sends the reply itself.

use crate::context::DebuggerContext;
use crate::invoke::InvocationStrategy;
use crate::protocol::{error_codes, CommandPacket, JdwpError, JdwpResult, ReplyPacket};
use crate::pump::CommandResult;
use crate::reader::{read_i32, read_u64};
use crate::runtime::{InvokeOutcome, InvokeRequest};
use crate::types::{tags, Value};
use tracing::debug;

/// Argument list of an InvokeMethod command
pub(crate) fn read_arguments(buf: &mut &[u8]) -> JdwpResult<Vec<Value>> {
    let count = read_i32(buf)?;
    if count < 0 {
        return Err(JdwpError::Command(error_codes::ILLEGAL_ARGUMENT));
    }
    (0..count).map(|_| Value::read_tagged(buf)).collect()
}

fn encode_outcome(id: u32, outcome: &InvokeOutcome) -> ReplyPacket {
    let mut data = Vec::new();
    outcome.value.put_tagged(&mut data);
    Value::object(tags::OBJECT, outcome.exception).put_tagged(&mut data);
    ReplyPacket::with_data(id, data)
}

impl DebuggerContext {
    /// ObjectReference.InvokeMethod
    pub(crate) fn invoke_instance_method(&self, packet: &CommandPacket) -> JdwpResult<Option<CommandResult>> {
        let mut buf = packet.data();
        let object = read_u64(&mut buf)?;
        let thread = read_u64(&mut buf)?;
        let class_id = read_u64(&mut buf)?;
        let method_id = read_u64(&mut buf)?;
        let args = read_arguments(&mut buf)?;
        let options = read_i32(&mut buf)?;

        self.start_invocation(
            packet.id,
            InvokeRequest {
                thread,
                object: Some(object),
                class_id,
                method_id,
                args,
                options,
            },
        )
    }

    /// Validate an invocation and run it on a worker; the reply follows later
    pub(crate) fn start_invocation(&self, id: u32, request: InvokeRequest) -> JdwpResult<Option<CommandResult>> {
        self.check_thread(request.thread)?;
        if !self.threads.is_suspended(request.thread) {
            return Err(JdwpError::Command(error_codes::THREAD_NOT_SUSPENDED));
        }
        let connection = self.connection().ok_or(JdwpError::ConnectionClosed)?;

        let threads = self.threads.clone();
        let runtime = self.runtime.clone();
        let pins = self.pins.clone();
        let strategy = InvocationStrategy::from_options(request.options);
        debug!(
            "Invoking method {:#x} on thread {:#x} ({:?})",
            request.method_id, request.thread, strategy
        );

        self.io.spawn_blocking(move || {
            let thread = request.thread;
            let outcome = threads
                .post_invocation(thread, move || runtime.invoke_method(&request), strategy)
                .and_then(|invoked| invoked);

            let reply = match outcome {
                Ok(outcome) => {
                    pins.keep(outcome.exception);
                    if let Some(object) = outcome.value.object_id() {
                        pins.keep(object);
                    }
                    encode_outcome(id, &outcome)
                }
                Err(e) => {
                    debug!("Invocation on thread {:#x} failed: {}", thread, e);
                    ReplyPacket::error(id, e.error_code())
                }
            };
            connection.send_reply(&reply);
        });

        Ok(None)
    }
}
