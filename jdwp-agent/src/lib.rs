// JDWP debug agent
//
// The debuggee side of the Java Debug Wire Protocol:
// - Transport: handshake, framing, listen/attach, reconnect
// - Packet pump: receiver, processor and sender per connection
// - Suspension: per-thread suspend counts, parking, cross-thread invocation
// - Events: request filters, breakpoints, stepping, composite event sets
//
// The managed runtime itself stays behind the `DebuggeeRuntime` trait.

pub mod breakpoints;
pub mod classtype;
pub mod commands;
pub mod config;
pub mod connection;
pub mod context;
pub mod controller;
pub mod dispatch;
pub mod eventrequest;
pub mod events;
pub mod filters;
pub mod handlers;
pub mod handshake;
pub mod invoke;
pub mod object;
pub mod pinning;
pub mod protocol;
pub mod pump;
pub mod reader;
pub mod runtime;
pub mod stackframe;
pub mod stepping;
pub mod suspend;
pub mod thread;
pub mod transport;
pub mod types;
pub mod vm;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use config::{ConfigError, DebuggerOptions};
pub use context::DebuggerContext;
pub use controller::{DebuggerController, StartupError, EXIT_NO_TRANSPORT};
pub use eventrequest::SuspendPolicy;
pub use handlers::CommandHandler;
pub use protocol::{JdwpError, JdwpResult};
pub use pump::CommandResult;
pub use runtime::{BreakpointHit, DebuggeeRuntime, InvokeOutcome, InvokeRequest, RuntimeHandle, StopEvent};
