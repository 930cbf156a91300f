// Packet pump
//
// Three workers per connection:
// - receiver task: reads frames off the socket and queues them
// - processor thread: decodes commands and runs their handlers; a plain OS
//   thread because handlers block on debuggee threads
// - sender task: drains the bounded outgoing queue onto the socket

use crate::connection::DebuggerConnection;
use crate::protocol::{error_codes, CommandPacket, JdwpError, JdwpResult, Packet, ReplyPacket};
use crate::suspend::Job;
use crate::transport::{read_frame, write_frame};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Items on the outgoing queue
#[derive(Debug)]
pub enum Outgoing {
    Packet(Vec<u8>),
    /// The connection is being disposed
    Shutdown,
}

/// Outcome of a command handler
pub struct CommandResult {
    pub reply: ReplyPacket,
    /// Run before the reply is queued
    pub pre: Vec<Job>,
    /// Run after the reply is queued
    pub post: Vec<Job>,
}

impl CommandResult {
    pub fn reply(reply: ReplyPacket) -> Self {
        Self {
            reply,
            pre: Vec::new(),
            post: Vec::new(),
        }
    }

    pub fn with_pre(mut self, job: impl FnOnce() + Send + 'static) -> Self {
        self.pre.push(Box::new(job));
        self
    }

    pub fn with_post(mut self, job: impl FnOnce() + Send + 'static) -> Self {
        self.post.push(Box::new(job));
        self
    }
}

impl std::fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandResult")
            .field("reply", &self.reply)
            .field("pre", &self.pre.len())
            .field("post", &self.post.len())
            .finish()
    }
}

/// Where the processor sends decoded commands
pub trait PacketDispatch: Send + Sync + 'static {
    /// `Ok(None)` means the reply is shipped later by someone else
    fn dispatch(&self, packet: &CommandPacket) -> JdwpResult<Option<CommandResult>>;

    /// Called on the processor thread once the connection's inbound side is done
    fn connection_finished(self: Arc<Self>, connection: Arc<DebuggerConnection>);
}

pub(crate) async fn receive_loop<R>(
    mut reader: R,
    inbound: mpsc::Sender<Vec<u8>>,
    connection: Arc<DebuggerConnection>,
) where
    R: AsyncRead + Unpin,
{
    debug!("Receiver started");
    loop {
        let frame = tokio::select! {
            _ = connection.cancellation().cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(frame) => {
                if inbound.send(frame).await.is_err() {
                    debug!("Processor gone, receiver stopping");
                    break;
                }
            }
            Err(e) if connection.is_closed() => {
                debug!("Receiver stopped after close: {}", e);
                break;
            }
            Err(e) => {
                match &e {
                    JdwpError::ConnectionClosed => info!("Debugger closed the connection"),
                    other => error!("Failed to read packet: {}", other),
                }
                connection.record_transport_error(e);
                break;
            }
        }
    }
    debug!("Receiver stopped");
}

pub(crate) async fn send_loop<W>(
    mut writer: W,
    mut outgoing: mpsc::Receiver<Outgoing>,
    connection: Arc<DebuggerConnection>,
) where
    W: AsyncWrite + Unpin,
{
    debug!("Sender started");
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Packet(packet) => {
                if let Err(e) = write_frame(&mut writer, &packet).await {
                    if !connection.is_closed() {
                        error!("Failed to write packet: {}", e);
                        connection.record_transport_error(e);
                    }
                    // Wake the receiver so the processor learns about it
                    connection.cancellation().cancel();
                    break;
                }
            }
            Outgoing::Shutdown => break,
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Socket shutdown failed: {}", e);
    }
    debug!("Sender stopped");
}

pub(crate) fn process_loop<D: PacketDispatch>(
    mut inbound: mpsc::Receiver<Vec<u8>>,
    dispatch: Arc<D>,
    connection: Arc<DebuggerConnection>,
) {
    debug!("Processor started");
    while let Some(frame) = inbound.blocking_recv() {
        match Packet::decode(&frame) {
            Ok(Packet::Command(packet)) => process_command(dispatch.as_ref(), &connection, packet),
            Ok(Packet::Reply(reply)) => debug!("Ignoring reply packet id={}", reply.id),
            Err(e) => {
                warn!("Malformed packet: {}", e);
                if let Some(id) = frame_id(&frame) {
                    connection.send_reply(&ReplyPacket::error(id, e.error_code()));
                }
            }
        }
    }
    debug!("Processor stopped");
    dispatch.connection_finished(connection);
}

fn process_command<D: PacketDispatch + ?Sized>(
    dispatch: &D,
    connection: &DebuggerConnection,
    packet: CommandPacket,
) {
    debug!(
        "Command {}/{} id={} ({} bytes)",
        packet.command_set,
        packet.command,
        packet.id,
        packet.data.len()
    );

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> JdwpResult<Option<(ReplyPacket, Vec<Job>)>> {
        let Some(result) = dispatch.dispatch(&packet)? else {
            return Ok(None);
        };
        for job in result.pre {
            job();
        }
        Ok(Some((result.reply, result.post)))
    }));

    let (reply, post) = match outcome {
        Ok(Ok(Some(done))) => done,
        Ok(Ok(None)) => {
            debug!("Reply to id={} deferred", packet.id);
            return;
        }
        Ok(Err(e)) => {
            match &e {
                JdwpError::Command(code) => debug!(
                    "Command {}/{} failed with {}",
                    packet.command_set,
                    packet.command,
                    crate::protocol::error_message(*code)
                ),
                other => error!(
                    "Command {}/{} failed: {}",
                    packet.command_set, packet.command, other
                ),
            }
            (ReplyPacket::error(packet.id, e.error_code()), Vec::new())
        }
        Err(panic) => {
            error!(
                "Handler for {}/{} panicked: {}",
                packet.command_set,
                packet.command,
                panic_message(panic.as_ref())
            );
            (ReplyPacket::error(packet.id, error_codes::INTERNAL), Vec::new())
        }
    };

    connection.send_reply(&reply);

    for job in post {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!("Post-reply job panicked: {}", panic_message(panic.as_ref()));
        }
    }
}

fn frame_id(frame: &[u8]) -> Option<u32> {
    frame
        .get(4..8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_be_bytes)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::runtime::Runtime;

    /// Echoes the payload back, fails on command 2, panics on command 3 and
    /// defers command 4
    struct EchoDispatch {
        finished: Mutex<Option<std::sync::mpsc::Sender<Option<String>>>>,
    }

    impl PacketDispatch for EchoDispatch {
        fn dispatch(&self, packet: &CommandPacket) -> JdwpResult<Option<CommandResult>> {
            match packet.command {
                2 => Err(JdwpError::Command(error_codes::INVALID_THREAD)),
                3 => panic!("handler fault"),
                4 => Ok(None),
                _ => {
                    Ok(Some(
                        CommandResult::reply(ReplyPacket::with_data(packet.id, packet.data.clone()))
                            .with_pre(|| {})
                            .with_post(|| {}),
                    ))
                }
            }
        }

        fn connection_finished(self: Arc<Self>, connection: Arc<DebuggerConnection>) {
            connection.close_socket();
            let error = connection.take_transport_error().map(|e| e.to_string());
            if let Some(done) = self.finished.lock().take() {
                let _ = done.send(error);
            }
        }
    }

    struct Pump {
        io: Runtime,
        debugger: DuplexStream,
        connection: Arc<DebuggerConnection>,
        finished: std::sync::mpsc::Receiver<Option<String>>,
    }

    fn start_pump() -> Pump {
        let io = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (agent, debugger) = tokio::io::duplex(4096);
        let (done_tx, finished) = std::sync::mpsc::channel();
        let dispatch = Arc::new(EchoDispatch {
            finished: Mutex::new(Some(done_tx)),
        });
        let connection = DebuggerConnection::open(agent, dispatch, io.handle(), 16).unwrap();
        Pump {
            io,
            debugger,
            connection,
            finished,
        }
    }

    impl Pump {
        fn roundtrip(&mut self, packet: CommandPacket) -> ReplyPacket {
            let debugger = &mut self.debugger;
            self.io.block_on(async {
                write_frame(debugger, &packet.encode()).await.unwrap();
                let frame = tokio::time::timeout(Duration::from_secs(2), read_frame(debugger))
                    .await
                    .unwrap()
                    .unwrap();
                ReplyPacket::decode(&frame).unwrap()
            })
        }
    }

    #[test]
    fn test_reply_carries_request_id() {
        let mut pump = start_pump();
        let reply = pump.roundtrip(CommandPacket::with_data(41, 1, 1, vec![1, 2, 3]));
        assert_eq!(reply.id, 41);
        assert!(!reply.is_error());
        assert_eq!(reply.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_handler_error_and_panic_become_error_replies() {
        let mut pump = start_pump();

        let reply = pump.roundtrip(CommandPacket::new(7, 1, 2));
        assert_eq!((reply.id, reply.error_code), (7, error_codes::INVALID_THREAD));

        let reply = pump.roundtrip(CommandPacket::new(8, 1, 3));
        assert_eq!((reply.id, reply.error_code), (8, error_codes::INTERNAL));

        // The processor survived the panic
        let reply = pump.roundtrip(CommandPacket::new(9, 1, 1));
        assert_eq!((reply.id, reply.error_code), (9, error_codes::NONE));
    }

    #[test]
    fn test_deferred_reply_is_shipped_later() {
        let mut pump = start_pump();
        let debugger = &mut pump.debugger;
        pump.io.block_on(async {
            write_frame(debugger, &CommandPacket::new(12, 1, 4).encode())
                .await
                .unwrap();
        });

        let connection = pump.connection.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            connection.send_reply(&ReplyPacket::new(12));
        })
        .join()
        .unwrap();

        let debugger = &mut pump.debugger;
        let reply = pump.io.block_on(async {
            let frame = tokio::time::timeout(Duration::from_secs(2), read_frame(debugger))
                .await
                .unwrap()
                .unwrap();
            ReplyPacket::decode(&frame).unwrap()
        });
        assert_eq!(reply.id, 12);
    }

    #[test]
    fn test_eof_after_close_is_clean() {
        let pump = start_pump();
        pump.connection.close_socket();
        drop(pump.debugger);

        let error = pump.finished.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(error, None);
    }

    #[test]
    fn test_eof_without_close_is_reported() {
        let pump = start_pump();
        drop(pump.debugger);

        let error = pump.finished.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(error, Some(JdwpError::ConnectionClosed.to_string()));
        assert!(pump.connection.is_closed());
    }

    #[test]
    fn test_jobs_run_around_reply() {
        let io = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (connection, mut queue) = DebuggerConnection::detached(io.handle(), 4);
        let pre_ran = Arc::new(AtomicBool::new(false));

        struct Jobs {
            pre_ran: Arc<AtomicBool>,
            connection: Arc<DebuggerConnection>,
        }
        impl PacketDispatch for Jobs {
            fn dispatch(&self, packet: &CommandPacket) -> JdwpResult<Option<CommandResult>> {
                let flag = self.pre_ran.clone();
                let connection = self.connection.clone();
                Ok(Some(
                    CommandResult::reply(ReplyPacket::new(packet.id))
                        .with_pre(move || flag.store(true, Ordering::SeqCst))
                        .with_post(move || connection.close_socket()),
                ))
            }
            fn connection_finished(self: Arc<Self>, _connection: Arc<DebuggerConnection>) {}
        }

        let jobs = Jobs {
            pre_ran: pre_ran.clone(),
            connection: connection.clone(),
        };
        process_command(&jobs, &connection, CommandPacket::new(3, 1, 1));

        assert!(pre_ran.load(Ordering::SeqCst));
        assert!(matches!(queue.try_recv().unwrap(), Outgoing::Packet(_)));
        // The post job closed the connection after the reply went out
        assert!(matches!(queue.try_recv().unwrap(), Outgoing::Shutdown));
    }
}
