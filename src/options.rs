use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::proto::SettingId;
use crate::settings::SettingsContainer;
use crate::stream::StreamCallbackFactory;

/// How ingress flow control quota is returned to the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlMode {
    /// The connection sends WINDOW_UPDATE frames on its own as DATA frames
    /// are consumed.
    Auto,

    /// The embedder replenishes windows explicitly via send_window_update.
    Manual,
}

/// Options applied to the raw socket by the client connector and server
/// acceptor.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

/// Facts about the transport below the connection, supplied by whoever owns
/// the socket (and the TLS session, if any).
#[derive(Debug, Clone, Default)]
pub struct TransportInfo {
    pub peer_addr: Option<SocketAddr>,

    /// Raw identity material of the peer (e.g. a DER encoded certificate)
    /// when the transport authenticated it.
    pub peer_identity: Option<Bytes>,
}

#[derive(Clone)]
pub struct ConnectionOptions {
    /// HTTP2 protocol defined settings. These will be communicated to the
    /// remote endpoint when the connection starts.
    ///
    /// NOTE: Internally only the last acknowledged snapshot of these is
    /// consulted, so a value only takes effect once the peer ACKs it.
    pub protocol_settings: SettingsContainer,

    /// How long we wait for the peer to acknowledge a SETTINGS frame before
    /// giving up on the connection.
    pub settings_ack_timeout: Duration,

    /// How long we wait for the peer's first SETTINGS frame after the
    /// preface exchange.
    pub handshake_timeout: Duration,

    /// TCP connect timeout used by the client connector.
    pub connect_timeout: Duration,

    /// After a graceful shutdown started, how long to wait for in-flight
    /// streams to finish before closing abruptly.
    pub graceful_shutdown_timeout: Duration,

    /// When set, the connection shuts down gracefully after seeing no frame
    /// activity in either direction for this long.
    pub idle_timeout: Option<Duration>,

    /// If true, the data of a finished stream is discarded immediately and
    /// get_response reports it as garbage. Useful for callback-only
    /// embedders that never poll for results.
    pub garbage_on_end: bool,

    pub flow_control: FlowControlMode,

    pub socket_options: SocketOptions,

    /// Callback attached to streams that are not created through
    /// new_stream, i.e. pushed streams on a client.
    pub stream_callback: Option<Arc<dyn StreamCallbackFactory>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        // Default protocol values, except bounding the initially unlimited
        // ones to something reasonable.
        let mut protocol_settings = SettingsContainer::default();
        protocol_settings
            .set(SettingId::MAX_CONCURRENT_STREAMS, 100)
            .unwrap();
        protocol_settings
            .set(SettingId::MAX_HEADER_LIST_SIZE, 256 * 1024)
            .unwrap();

        Self {
            protocol_settings,
            settings_ack_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_millis(4500),
            connect_timeout: Duration::from_secs(5),
            graceful_shutdown_timeout: Duration::from_secs(5),
            idle_timeout: None,
            garbage_on_end: false,
            flow_control: FlowControlMode::Auto,
            socket_options: SocketOptions::default(),
            stream_callback: None,
        }
    }
}

/// Extra configuration for server side connections.
#[derive(Clone)]
pub struct ServerConnectionOptions {
    /// Produces the callback driving each request stream.
    pub request_callback: Arc<dyn StreamCallbackFactory>,
}
