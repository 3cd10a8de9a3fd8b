//! Transport handling for one XMPP connection.
//!
//! Wraps the socket behind a plain-TCP / TLS switch so the session logic is
//! transport-agnostic. STARTTLS swaps the inner stream exactly once, in
//! place, on the already-established socket.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::XmppError;

/// Transport for one accepted connection.
pub struct XmppStream {
    inner: StreamInner,
}

#[derive(Default)]
enum StreamInner {
    #[default]
    None,
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl XmppStream {
    /// Wrap a freshly accepted TCP connection.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            inner: StreamInner::Tcp(stream),
        }
    }

    /// Whether the transport has been upgraded to TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner, StreamInner::Tls(_))
    }

    /// Read bytes from the peer. Returns 0 on EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, XmppError> {
        match &mut self.inner {
            StreamInner::None => Err(XmppError::internal("Stream not initialized")),
            StreamInner::Tcp(s) => Ok(s.read(buf).await?),
            StreamInner::Tls(s) => Ok(s.read(buf).await?),
        }
    }

    /// Write raw XML to the peer and flush.
    pub async fn write_raw(&mut self, data: &str) -> Result<(), XmppError> {
        match &mut self.inner {
            StreamInner::None => Err(XmppError::internal("Stream not initialized")),
            StreamInner::Tcp(s) => {
                s.write_all(data.as_bytes()).await?;
                Ok(s.flush().await?)
            }
            StreamInner::Tls(s) => {
                s.write_all(data.as_bytes()).await?;
                Ok(s.flush().await?)
            }
        }
    }

    /// Perform the server-side TLS handshake on the existing socket and
    /// replace the transport. Callers must have sent `<proceed/>` already.
    pub async fn upgrade(&mut self, tls_acceptor: TlsAcceptor) -> Result<(), XmppError> {
        let tcp_stream = match std::mem::take(&mut self.inner) {
            StreamInner::Tcp(s) => s,
            StreamInner::Tls(s) => {
                self.inner = StreamInner::Tls(s);
                return Err(XmppError::stream("Already using TLS"));
            }
            StreamInner::None => return Err(XmppError::internal("Stream already taken")),
        };

        let tls_stream = tls_acceptor
            .accept(tcp_stream)
            .await
            .map_err(|e| XmppError::stream(format!("TLS accept error: {}", e)))?;

        self.inner = StreamInner::Tls(Box::new(tls_stream));
        debug!("TLS upgrade complete");
        Ok(())
    }

    /// Shut down the write side of the transport.
    pub async fn close(&mut self) {
        let _ = match &mut self.inner {
            StreamInner::None => return,
            StreamInner::Tcp(s) => s.shutdown().await,
            StreamInner::Tls(s) => s.shutdown().await,
        };
    }
}
