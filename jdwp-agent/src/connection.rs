// JDWP connection management
//
// One `DebuggerConnection` per attached debugger. It owns the outgoing queue
// and the cancellation signal of its packet pump; every thread that ships a
// packet (processor, debuggee threads, invocation workers) goes through it.

use crate::events::EventSet;
use crate::protocol::{JdwpError, JdwpResult, ReplyPacket};
use crate::pump::{process_loop, receive_loop, send_loop, Outgoing, PacketDispatch};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug)]
pub struct DebuggerConnection {
    outgoing: mpsc::Sender<Outgoing>,
    closed: AtomicBool,
    cancel: CancellationToken,
    transport_error: Mutex<Option<JdwpError>>,
    next_id: AtomicU32,
    io: Handle,
}

impl DebuggerConnection {
    /// Start the packet pump on a handshaken stream
    pub fn open<S, D>(
        stream: S,
        dispatch: Arc<D>,
        io: &Handle,
        queue_capacity: usize,
    ) -> JdwpResult<Arc<Self>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        D: PacketDispatch,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_capacity);

        let connection = Arc::new(Self::with_queue(outgoing_tx, io.clone()));

        {
            let connection = connection.clone();
            std::thread::Builder::new()
                .name("jdwp-processor".to_string())
                .spawn(move || process_loop(inbound_rx, dispatch, connection))?;
        }

        let (reader, writer) = tokio::io::split(stream);
        io.spawn(receive_loop(reader, inbound_tx, connection.clone()));
        io.spawn(send_loop(writer, outgoing_rx, connection.clone()));

        info!("Debugger connection established");
        Ok(connection)
    }

    fn with_queue(outgoing: mpsc::Sender<Outgoing>, io: Handle) -> Self {
        Self {
            outgoing,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            transport_error: Mutex::new(None),
            next_id: AtomicU32::new(1),
            io,
        }
    }

    /// A connection without a socket; packets pile up in the returned queue
    #[cfg(any(test, feature = "test-support"))]
    pub fn detached(io: &Handle, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outgoing>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(queue_capacity);
        (Arc::new(Self::with_queue(outgoing_tx, io.clone())), outgoing_rx)
    }

    /// Queue an encoded packet. Blocks while the queue is full.
    pub fn send(&self, packet: Vec<u8>) -> JdwpResult<()> {
        if self.is_closed() {
            return Err(JdwpError::ConnectionClosed);
        }
        self.outgoing
            .blocking_send(Outgoing::Packet(packet))
            .map_err(|_| JdwpError::ConnectionClosed)
    }

    pub fn send_reply(&self, reply: &ReplyPacket) {
        debug!("Sending reply id={} error={}", reply.id, reply.error_code);
        if let Err(e) = self.send(reply.encode()) {
            debug!("Dropping reply id={}: {}", reply.id, e);
        }
    }

    pub fn send_event(&self, events: &EventSet) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Sending event set id={} ({} events, policy {})",
            id,
            events.events.len(),
            events.suspend_policy
        );
        if let Err(e) = self.send(events.to_packet(id).encode()) {
            debug!("Dropping event set id={}: {}", id, e);
        }
    }

    /// Stop the pump. Safe to call more than once and from any thread.
    pub fn close_socket(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing debugger connection");
        self.cancel.cancel();

        if let Err(TrySendError::Full(shutdown)) = self.outgoing.try_send(Outgoing::Shutdown) {
            let outgoing = self.outgoing.clone();
            self.io.spawn(async move {
                let _ = outgoing.send(shutdown).await;
            });
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn record_transport_error(&self, error: JdwpError) {
        let mut slot = self.transport_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// The transport failure that ended this connection, if any
    pub fn take_transport_error(&self) -> Option<JdwpError> {
        self.transport_error.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_connection_queues_packets() {
        let io = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (connection, mut queue) = DebuggerConnection::detached(io.handle(), 4);

        connection.send_reply(&ReplyPacket::new(5));
        match queue.try_recv().unwrap() {
            Outgoing::Packet(bytes) => assert_eq!(ReplyPacket::decode(&bytes).unwrap().id, 5),
            Outgoing::Shutdown => panic!("unexpected shutdown"),
        }

        connection.close_socket();
        connection.close_socket();
        assert!(connection.is_closed());
        assert!(matches!(queue.try_recv().unwrap(), Outgoing::Shutdown));
        assert!(queue.try_recv().is_err());
        assert!(matches!(connection.send(vec![0; 11]), Err(JdwpError::ConnectionClosed)));
    }
}
