// Server side acceptor: accepts TCP connections and runs each one as an
// HTTP2 server connection driving the configured request callback.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::connection_shared::ConnectionInitialState;
use crate::options::{ConnectionOptions, ServerConnectionOptions, TransportInfo};
use crate::types::Result;

pub struct Server {
    options: ConnectionOptions,
    server_options: ServerConnectionOptions,
}

impl Server {
    pub fn new(options: ConnectionOptions, server_options: ServerConnectionOptions) -> Self {
        Self {
            options,
            server_options,
        }
    }

    /// Accept loop. Every connection runs on its own task until the
    /// listener fails.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer_addr) = listener.accept().await?;
            tracing::debug!(%peer_addr, "accepted connection");

            if let Err(error) = self.serve_socket(socket) {
                tracing::warn!(%error, "failed to start connection");
            }
        }
    }

    /// Adopts one accepted TCP socket as an HTTP2 connection.
    pub fn serve_socket(
        &self,
        socket: TcpStream,
    ) -> Result<(Connection, JoinHandle<Result<()>>)> {
        socket.set_nodelay(self.options.socket_options.nodelay)?;

        let transport = TransportInfo {
            peer_addr: socket.peer_addr().ok(),
            peer_identity: None,
        };

        let (read_half, write_half) = socket.into_split();
        self.adopt_stream(transport, ConnectionInitialState::raw(), read_half, write_half)
    }

    /// Adopts an arbitrary established transport, e.g. a TLS session that
    /// negotiated "h2", or a socket on which an HTTP/1.1 upgrade was
    /// detected (in which case initial_state describes what was already
    /// consumed and what still has to be written).
    pub fn adopt_stream<R, W>(
        &self,
        transport: TransportInfo,
        initial_state: ConnectionInitialState,
        read_half: R,
        write_half: W,
    ) -> Result<(Connection, JoinHandle<Result<()>>)>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Connection::new(self.options.clone(), Some(self.server_options.clone()));
        let driver = connection.run(
            initial_state,
            transport,
            Box::new(read_half),
            Box::new(write_half),
        );

        Ok((connection, tokio::spawn(driver)))
    }
}
