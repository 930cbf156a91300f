// Debugger controller
//
// Entry point for the embedding runtime. Owns the I/O runtime, brings up the
// transport (listen or attach), reports VM_START on every new connection and
// tears the debugger state down when a connection ends. In listen mode the
// agent then goes back to accepting.

use crate::config::{ConfigError, DebuggerOptions};
use crate::connection::DebuggerConnection;
use crate::context::DebuggerContext;
use crate::eventrequest::SuspendPolicy;
use crate::events::{Event, EventKind, EventSet};
use crate::handlers::CommandHandler;
use crate::handshake::{attach, DebuggerListener};
use crate::protocol::{JdwpError, JdwpResult};
use crate::runtime::{DebuggeeRuntime, StopEvent};
use crate::types::{ClassRef, ThreadId};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

/// Process exit code when no debugger transport could be established
pub const EXIT_NO_TRANSPORT: i32 = 2;
/// Process exit code for unusable agent options
pub const EXIT_BAD_OPTIONS: i32 = 1;

const RESET_POLL: Duration = Duration::from_millis(50);
const IO_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Invalid agent options: {0}")]
    Config(#[from] ConfigError),

    #[error("No transport available: {source}")]
    NoTransport {
        #[source]
        source: JdwpError,
    },

    #[error("Failed to start the I/O runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => EXIT_BAD_OPTIONS,
            StartupError::NoTransport { .. } | StartupError::Runtime(_) => EXIT_NO_TRANSPORT,
        }
    }
}

fn no_transport(source: JdwpError) -> StartupError {
    StartupError::NoTransport { source }
}

pub struct DebuggerController {
    ctx: Arc<DebuggerContext>,
    io: Option<Runtime>,
}

impl DebuggerController {
    pub fn new(runtime: Arc<dyn DebuggeeRuntime>, options: DebuggerOptions) -> Result<Self, StartupError> {
        let io = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("jdwp-io")
            .enable_all()
            .build()
            .map_err(StartupError::Runtime)?;
        let ctx = Arc::new(DebuggerContext::new(runtime, options, io.handle().clone()));

        Ok(Self { ctx, io: Some(io) })
    }

    pub fn context(&self) -> &Arc<DebuggerContext> {
        &self.ctx
    }

    /// Route `command_set`/`command` to `handler`. Core commands cannot be
    /// overridden.
    pub fn register_handler(&self, command_set: u8, command: u8, handler: Arc<dyn CommandHandler>) {
        self.ctx.register_handler(command_set, command, handler);
    }

    /// Bind the listening socket (listen mode). Called by `start` if needed;
    /// calling it first lets the launcher announce the address.
    pub fn listen(&self) -> Result<SocketAddr, StartupError> {
        if let Some(listener) = self.ctx.listener.lock().as_ref() {
            return Ok(listener.local_addr());
        }

        let options = &self.ctx.options;
        let listener = self
            .ctx
            .io
            .block_on(DebuggerListener::bind(
                options.effective_host(),
                options.port,
                options.handshake_timeout(),
            ))
            .map_err(no_transport)?;
        let addr = listener.local_addr();
        *self.ctx.listener.lock() = Some(Arc::new(listener));
        Ok(addr)
    }

    /// Bring up the transport.
    ///
    /// Attach mode and `suspend=y` block until a debugger is connected; any
    /// failure on this first attempt is fatal. Listen mode with `suspend=n`
    /// only binds here and accepts in the background.
    pub fn start(&self) -> Result<(), StartupError> {
        let options = &self.ctx.options;

        if options.server {
            let addr = self.listen()?;
            if options.suspend {
                info!("Waiting for debugger on {}", addr);
                let listener = self
                    .ctx
                    .listener
                    .lock()
                    .clone()
                    .ok_or_else(|| no_transport(JdwpError::ConnectionClosed))?;
                self.ctx.accept_and_establish(&listener).map_err(no_transport)?;
            } else {
                self.ctx.accept_in_background();
            }
        } else {
            let stream = self
                .ctx
                .io
                .block_on(attach(
                    options.effective_host(),
                    options.port,
                    options.handshake_timeout(),
                ))
                .map_err(no_transport)?;
            self.ctx.establish(stream).map_err(no_transport)?;
        }
        Ok(())
    }

    /// Address of the listening socket (listen mode only)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.listener.lock().as_ref().map(|listener| listener.local_addr())
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_connected()
    }

    pub fn on_stop(&self, event: StopEvent) {
        self.ctx.handle_stop(event);
    }

    pub fn on_thread_start(&self, thread: ThreadId) {
        self.ctx.handle_thread_start(thread);
    }

    pub fn on_thread_death(&self, thread: ThreadId) {
        self.ctx.handle_thread_death(thread);
    }

    pub fn on_class_prepare(&self, thread: ThreadId, class: &ClassRef) {
        self.ctx.handle_class_prepare(thread, class);
    }

    pub fn on_class_unload(&self, class: &ClassRef) {
        self.ctx.handle_class_unload(class);
    }

    pub fn on_vm_death(&self) {
        self.ctx.handle_vm_death();
    }

    /// Close the transport, drop all debugger state and stop the I/O runtime
    pub fn dispose(&mut self) {
        self.ctx.shutdown();
        if let Some(io) = self.io.take() {
            io.shutdown_timeout(IO_SHUTDOWN_TIMEOUT);
        }
    }
}

impl Drop for DebuggerController {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for DebuggerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebuggerController")
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl DebuggerContext {
    /// Start the packet pump on a handshaken socket and report VM_START
    pub(crate) fn establish(self: &Arc<Self>, stream: TcpStream) -> JdwpResult<()> {
        let _guard = self.resetting.lock();
        if self.is_closing() {
            return Err(JdwpError::ConnectionClosed);
        }

        let connection = DebuggerConnection::open(
            stream,
            self.clone(),
            &self.io,
            self.options.outgoing_queue_capacity,
        )?;
        self.set_connection(Some(connection.clone()));

        let first = self.first_connection.swap(false, Ordering::SeqCst);
        let policy = if first && self.options.suspend {
            self.threads.suspend_all(&self.pins);
            SuspendPolicy::All
        } else {
            SuspendPolicy::None
        };

        let thread = self.runtime.all_threads().first().copied().unwrap_or(0);
        connection.send_event(&EventSet::new(
            policy,
            vec![Event::new(0, EventKind::VMStart { thread })],
        ));
        info!("Debugger attached (VM_START policy {:?})", policy);
        Ok(())
    }

    pub(crate) fn accept_and_establish(self: &Arc<Self>, listener: &DebuggerListener) -> JdwpResult<()> {
        let stream = self.io.block_on(listener.accept())?;
        self.establish(stream)
    }

    /// Accept the next debugger on a helper thread. Failures only get logged:
    /// the process keeps running undebugged.
    pub(crate) fn accept_in_background(self: &Arc<Self>) {
        let Some(listener) = self.listener.lock().clone() else {
            return;
        };

        let ctx = self.clone();
        let spawned = std::thread::Builder::new()
            .name("jdwp-accept".to_string())
            .spawn(move || match ctx.accept_and_establish(&listener) {
                Ok(()) => {}
                Err(e) if ctx.is_closing() => debug!("Accept abandoned during shutdown: {}", e),
                Err(e) => warn!("Failed to accept debugger connection: {}", e),
            });
        if let Err(e) = spawned {
            error!("Failed to spawn accept thread: {}", e);
        }
    }

    /// A connection's processor is done: tear down and, in listen mode,
    /// wait for the next debugger
    pub(crate) fn finish_connection(self: Arc<Self>, connection: Arc<DebuggerConnection>) {
        connection.close_socket();
        match connection.take_transport_error() {
            Some(JdwpError::ConnectionClosed) | None => info!("Debugger connection closed"),
            Some(e) => warn!("Debugger connection lost: {}", e),
        }

        let guard = loop {
            if let Some(guard) = self.resetting.try_lock_for(RESET_POLL) {
                break guard;
            }
            if self.is_closing() {
                debug!("Shutdown in progress, leaving teardown to it");
                return;
            }
        };

        if !self.clear_connection(&connection) {
            debug!("Connection already replaced");
            return;
        }
        self.reset();
        drop(guard);

        if self.options.server && !self.is_closing() {
            info!("Listening for the next debugger");
            self.accept_in_background();
        }
    }

    /// Forget everything the debugger set up and let every thread run
    fn reset(&self) {
        let requests = self.filters.len();
        self.filters.clear_all(self.runtime.as_ref());
        for thread in self.stepping.drain() {
            self.runtime.cancel_step(thread);
        }
        self.threads.release_everything(&self.pins);
        info!("Debugger state reset ({} requests cleared)", requests);
    }

    pub(crate) fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down debugger agent");

        if let Some(listener) = self.listener.lock().take() {
            listener.close();
        }

        let _guard = self.resetting.lock();
        if let Some(connection) = self.take_connection() {
            connection.close_socket();
        }
        self.reset();
    }
}
