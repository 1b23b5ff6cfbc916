//! TCP transport: listener, connector, and frame helpers.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{Framing, Transport, TransportError};

type FramedTcp = Framed<TcpStream, LengthDelimitedCodec>;

/// Write half of a framed TCP connection.
pub type FrameSink = SplitSink<FramedTcp, Bytes>;

/// Read half of a framed TCP connection.
pub type FrameStream = SplitStream<FramedTcp>;

/// A freshly accepted, already framed connection.
pub struct Accepted {
    pub sink: FrameSink,
    pub stream: FrameStream,
    /// Remote end of the socket.
    pub peer_addr: SocketAddr,
    /// Local end of the socket.
    pub local_addr: SocketAddr,
}

/// A TCP [`Transport`] that listens for incoming connections.
pub struct TcpTransport {
    listener: TcpListener,
    framing: Framing,
}

impl TcpTransport {
    /// Binds a new TCP transport to the given address.
    pub async fn bind(
        addr: &str,
        framing: Framing,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self { listener, framing })
    }
}

impl Transport for TcpTransport {
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Accepted, Self::Error> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        let local_addr =
            stream.local_addr().map_err(TransportError::AcceptFailed)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
        }

        tracing::debug!(%peer_addr, "accepted TCP connection");

        let (sink, stream) = Framed::new(stream, self.framing.codec()).split();
        Ok(Accepted {
            sink,
            stream,
            peer_addr,
            local_addr,
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, Self::Error> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }
}

/// Opens a framed TCP connection, giving up after `timeout`.
pub async fn connect(
    addr: &str,
    timeout: Duration,
    framing: Framing,
) -> Result<(FrameSink, FrameStream), TransportError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(TransportError::ConnectFailed {
                addr: addr.to_string(),
                source,
            });
        }
        Err(_) => {
            return Err(TransportError::ConnectTimeout {
                addr: addr.to_string(),
                timeout,
            });
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(addr, error = %e, "failed to set TCP_NODELAY");
    }
    tracing::debug!(addr, "TCP connection established");
    Ok(Framed::new(stream, framing.codec()).split())
}

/// Reads the next frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly.
pub async fn read_frame(
    stream: &mut FrameStream,
) -> Result<Option<BytesMut>, TransportError> {
    match stream.next().await {
        Some(Ok(frame)) => Ok(Some(frame)),
        Some(Err(e)) => Err(TransportError::ReceiveFailed(e)),
        None => Ok(None),
    }
}

/// Writes one frame and flushes it.
pub async fn write_frame(
    sink: &mut FrameSink,
    frame: Bytes,
) -> Result<(), TransportError> {
    sink.send(frame).await.map_err(TransportError::SendFailed)
}
