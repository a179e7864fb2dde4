// Client side connector: dials a TCP endpoint and hands the socket to a
// Connection. TLS (with the "h2" ALPN identifier) is layered by the
// embedder, which then uses adopt_stream with the negotiated duplex.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::connection_shared::ConnectionInitialState;
use crate::options::{ConnectionOptions, TransportInfo};
use crate::types::Result;

/// Dials the given address and runs a client connection over it. The
/// returned handle drives the connection and must be joined (or at least
/// not dropped) for its lifetime.
pub async fn start_client<A: ToSocketAddrs>(
    addr: A,
    options: ConnectionOptions,
) -> Result<(Connection, JoinHandle<Result<()>>)> {
    let socket = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

    socket.set_nodelay(options.socket_options.nodelay)?;

    let transport = TransportInfo {
        peer_addr: socket.peer_addr().ok(),
        peer_identity: None,
    };

    let (read_half, write_half) = socket.into_split();
    adopt_stream(
        options,
        transport,
        ConnectionInitialState::raw(),
        read_half,
        write_half,
    )
}

/// Runs a client connection over an already established transport, e.g. a
/// finished TLS session or an HTTP/1.1 upgrade carrying initial bytes.
pub fn adopt_stream<R, W>(
    options: ConnectionOptions,
    transport: TransportInfo,
    initial_state: ConnectionInitialState,
    read_half: R,
    write_half: W,
) -> Result<(Connection, JoinHandle<Result<()>>)>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let connection = Connection::new(options, None);
    let driver = connection.run(
        initial_state,
        transport,
        Box::new(read_half),
        Box::new(write_half),
    );

    Ok((connection, tokio::spawn(driver)))
}
