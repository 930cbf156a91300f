// JDWP handshake and socket setup
//
// Produces a connected, handshaken socket either by attaching to a listening
// debugger or by accepting one on a listening socket.

use crate::protocol::{JdwpError, JdwpResult, JDWP_HANDSHAKE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which end of the session we are. The debugger always speaks first,
/// whichever side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Read the debugger's greeting, then echo it
    Debuggee,
    /// Send the greeting, then expect it back
    Debugger,
}

/// Exchange the handshake string.
///
/// Mismatch, timeout and premature close all fail the same way.
pub async fn handshake<S>(stream: &mut S, role: HandshakeRole, timeout: Duration) -> JdwpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Performing JDWP handshake ({:?})", role);

    let exchange = async {
        if role == HandshakeRole::Debugger {
            stream.write_all(JDWP_HANDSHAKE).await?;
            stream.flush().await?;
        }

        let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
        if stream.read_exact(&mut buf).await.is_err() {
            return Err(JdwpError::InvalidHandshake);
        }

        if buf != JDWP_HANDSHAKE {
            warn!("Invalid handshake: {:?}", String::from_utf8_lossy(&buf));
            return Err(JdwpError::InvalidHandshake);
        }

        if role == HandshakeRole::Debuggee {
            stream.write_all(JDWP_HANDSHAKE).await?;
            stream.flush().await?;
        }

        Ok(())
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result?,
        Err(_) => return Err(JdwpError::HandshakeTimeout),
    }

    info!("JDWP handshake successful");
    Ok(())
}

/// Connect to a debugger that is listening and handshake with it
pub async fn attach(host: &str, port: u16, timeout: Duration) -> JdwpResult<TcpStream> {
    info!("Attaching to debugger at {}:{}", host, port);

    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(stream) => stream?,
        Err(_) => {
            return Err(JdwpError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "attach timed out",
            )))
        }
    };
    stream.set_nodelay(true)?;

    handshake(&mut stream, HandshakeRole::Debuggee, timeout).await?;
    Ok(stream)
}

/// Listening socket that accepts one debugger at a time.
///
/// `close()` may be called from any thread; it unblocks a pending `accept()`.
#[derive(Debug)]
pub struct DebuggerListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    closed: CancellationToken,
    timeout: Duration,
}

impl DebuggerListener {
    pub async fn bind(host: &str, port: u16, timeout: Duration) -> JdwpResult<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening for transport dt_socket at address: {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            closed: CancellationToken::new(),
            timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next debugger and handshake with it
    pub async fn accept(&self) -> JdwpResult<TcpStream> {
        let (mut stream, peer) = tokio::select! {
            _ = self.closed.cancelled() => return Err(JdwpError::ConnectionClosed),
            accepted = self.listener.accept() => accepted?,
        };
        info!("Accepted debugger connection from {}", peer);
        stream.set_nodelay(true)?;

        tokio::select! {
            _ = self.closed.cancelled() => Err(JdwpError::ConnectionClosed),
            result = handshake(&mut stream, HandshakeRole::Debuggee, self.timeout) => {
                result?;
                Ok(stream)
            }
        }
    }

    pub fn close(&self) {
        debug!("Closing listener on {}", self.local_addr);
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_handshake_both_roles() {
        let (mut agent, mut debugger) = tokio::io::duplex(64);

        let debugger_side = tokio::spawn(async move {
            handshake(&mut debugger, HandshakeRole::Debugger, TIMEOUT).await
        });

        handshake(&mut agent, HandshakeRole::Debuggee, TIMEOUT)
            .await
            .unwrap();
        debugger_side.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_mismatch() {
        let (mut agent, mut debugger) = tokio::io::duplex(64);
        debugger.write_all(b"JDWP-Handshakx").await.unwrap();

        assert!(matches!(
            handshake(&mut agent, HandshakeRole::Debuggee, TIMEOUT).await,
            Err(JdwpError::InvalidHandshake)
        ));
    }

    #[tokio::test]
    async fn test_handshake_premature_close() {
        let (mut agent, debugger) = tokio::io::duplex(64);
        drop(debugger);

        assert!(matches!(
            handshake(&mut agent, HandshakeRole::Debuggee, TIMEOUT).await,
            Err(JdwpError::InvalidHandshake)
        ));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (mut agent, _debugger) = tokio::io::duplex(64);

        assert!(matches!(
            handshake(&mut agent, HandshakeRole::Debuggee, Duration::from_millis(50)).await,
            Err(JdwpError::HandshakeTimeout)
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let listener = Arc::new(DebuggerListener::bind("127.0.0.1", 0, TIMEOUT).await.unwrap());

        let pending = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(JdwpError::ConnectionClosed)));
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn test_attach_to_listening_debugger() {
        let debugger = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = debugger.local_addr().unwrap().port();

        let accepting = tokio::spawn(async move {
            let (mut stream, _) = debugger.accept().await.unwrap();
            handshake(&mut stream, HandshakeRole::Debugger, TIMEOUT).await
        });

        attach("127.0.0.1", port, TIMEOUT).await.unwrap();
        accepting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_accept_from_debugger() {
        let listener = DebuggerListener::bind("127.0.0.1", 0, TIMEOUT).await.unwrap();
        let port = listener.local_addr().port();

        let debugger = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            handshake(&mut stream, HandshakeRole::Debugger, TIMEOUT).await
        });

        listener.accept().await.unwrap();
        debugger.await.unwrap().unwrap();
    }
}
