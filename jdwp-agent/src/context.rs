// Debugger context
//
// Agent-wide state shared by the processor thread, debuggee threads and
// invocation workers. Lives as long as the controller; connections come and
// go underneath it.

use crate::config::DebuggerOptions;
use crate::connection::DebuggerConnection;
use crate::events::EventSet;
use crate::filters::EventFilters;
use crate::handlers::HandlerTable;
use crate::handshake::DebuggerListener;
use crate::pinning::ObjectPins;
use crate::runtime::DebuggeeRuntime;
use crate::stepping::SteppingTable;
use crate::suspend::ThreadSuspension;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

pub struct DebuggerContext {
    pub(crate) runtime: Arc<dyn DebuggeeRuntime>,
    pub(crate) options: DebuggerOptions,
    pub(crate) threads: Arc<ThreadSuspension>,
    pub(crate) stepping: Arc<SteppingTable>,
    pub(crate) filters: EventFilters,
    pub(crate) pins: Arc<ObjectPins>,
    pub(crate) handlers: HandlerTable,
    pub(crate) io: Handle,
    connection: RwLock<Option<Arc<DebuggerConnection>>>,
    pub(crate) listener: Mutex<Option<Arc<DebuggerListener>>>,
    /// Serializes starting a connection and tearing one down
    pub(crate) resetting: ReentrantMutex<()>,
    /// The agent is being disposed; no more reconnects
    pub(crate) closing: AtomicBool,
    /// VM_START of the first connection still has to be reported
    pub(crate) first_connection: AtomicBool,
}

impl DebuggerContext {
    pub fn new(runtime: Arc<dyn DebuggeeRuntime>, options: DebuggerOptions, io: Handle) -> Self {
        let stepping = Arc::new(SteppingTable::new());
        let threads = Arc::new(ThreadSuspension::new(runtime.clone(), stepping.clone()));

        Self {
            runtime,
            options,
            threads,
            stepping,
            filters: EventFilters::new(),
            pins: Arc::new(ObjectPins::new()),
            handlers: HandlerTable::new(),
            io,
            connection: RwLock::new(None),
            listener: Mutex::new(None),
            resetting: ReentrantMutex::new(()),
            closing: AtomicBool::new(false),
            first_connection: AtomicBool::new(true),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn DebuggeeRuntime> {
        &self.runtime
    }

    pub fn options(&self) -> &DebuggerOptions {
        &self.options
    }

    pub fn threads(&self) -> &Arc<ThreadSuspension> {
        &self.threads
    }

    pub fn filters(&self) -> &EventFilters {
        &self.filters
    }

    pub fn pins(&self) -> &Arc<ObjectPins> {
        &self.pins
    }

    /// The attached debugger, unless it is gone or going
    pub fn connection(&self) -> Option<Arc<DebuggerConnection>> {
        self.connection
            .read()
            .as_ref()
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    pub(crate) fn set_connection(&self, connection: Option<Arc<DebuggerConnection>>) {
        *self.connection.write() = connection;
    }

    /// Forget `connection` if it is still the current one
    pub(crate) fn clear_connection(&self, connection: &Arc<DebuggerConnection>) -> bool {
        let mut current = self.connection.write();
        if current
            .as_ref()
            .map_or(false, |c| Arc::ptr_eq(c, connection))
        {
            *current = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn take_connection(&self) -> Option<Arc<DebuggerConnection>> {
        self.connection.write().take()
    }

    pub fn send_event(&self, events: &EventSet) {
        if let Some(connection) = self.connection() {
            connection.send_event(events);
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for DebuggerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebuggerContext")
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .field("filters", &self.filters.len())
            .finish()
    }
}
