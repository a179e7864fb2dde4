use std::sync::atomic::AtomicI32;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::connection_state::*;
use crate::options::{ConnectionOptions, ServerConnectionOptions};
use crate::proto::SettingId;
use crate::response::StreamResult;
use crate::stream::{StreamCallback, StreamContext, StreamHandler};
use crate::stream_set::ActiveStream;
use crate::types::*;

pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// ALPN protocol identifier to negotiate when running over TLS.
pub const ALPN_PROTOCOL: &str = "h2";

/// Initial size of the connection level flow control window at both
/// endpoints.
///
/// NOTE: The connection window is only changed by WINDOW_UPDATE frames,
/// never by SETTINGS.
pub const INITIAL_CONNECTION_WINDOW_SIZE: WindowSize = 65535;

/// Reader end of the transport as seen by the connection.
pub type DynReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Writer end of the transport as seen by the connection.
pub type DynWriter = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

pub struct ConnectionShared {
    pub is_server: bool,

    pub options: ConnectionOptions,

    pub server_options: Option<ServerConnectionOptions>,

    /// Used to notify the connection of events that have occurred. The
    /// writer task listens to these and performs actions such as sending
    /// more data or starting streams in response to each event.
    pub connection_event_sender: mpsc::UnboundedSender<ConnectionEvent>,

    pub state: Mutex<ConnectionState>,

    /// Number of bytes we may still send on the whole connection.
    pub send_window: AtomicI32,

    /// Number of bytes we are still willing to accept on the whole
    /// connection.
    pub recv_window: AtomicI32,
}

impl ConnectionShared {
    /// Clients own odd ids, servers even ones.
    pub fn is_local_stream_id(&self, id: StreamId) -> bool {
        self.is_server == (id % 2 == 0)
    }

    pub fn is_remote_stream_id(&self, id: StreamId) -> bool {
        !self.is_local_stream_id(id)
    }

    /// Initial flow control windows for a new stream: (send, recv), from
    /// the currently effective settings of both endpoints.
    pub fn initial_stream_windows(&self, state: &ConnectionState) -> (WindowSize, WindowSize) {
        (
            state.remote_settings[SettingId::INITIAL_WINDOW_SIZE] as WindowSize,
            state.local_settings[SettingId::INITIAL_WINDOW_SIZE] as WindowSize,
        )
    }

    /// Builds the registry record for a new stream and spawns the task
    /// driving its state machine.
    pub fn new_active_stream(
        &self,
        id: StreamId,
        callback: Option<Box<dyn StreamCallback>>,
        notifier: Option<Notifier>,
        send_window: WindowSize,
        recv_window: WindowSize,
    ) -> ActiveStream {
        let events = StreamHandler::spawn(id, callback, self.connection_event_sender.clone());
        ActiveStream::new(id, events, notifier, send_window, recv_window)
    }

    /// Instantiates the application callback for a peer initiated stream:
    /// the server request handler, or on clients the callback configured
    /// for pushed streams.
    pub fn peer_stream_callback(&self, id: StreamId) -> Option<Box<dyn StreamCallback>> {
        let context = StreamContext::new(id, self.connection_event_sender.clone());

        if let Some(server_options) = &self.server_options {
            return Some(server_options.request_callback.create(&context));
        }

        self.options
            .stream_callback
            .as_ref()
            .map(|factory| factory.create(&context))
    }

    /// Retires a stream that reached its terminal state: the registry entry
    /// becomes a closed record, the notifier hears about it, and a pending
    /// graceful shutdown completes once nothing is left.
    pub fn finish_stream(
        &self,
        state: &mut ConnectionState,
        stream_id: StreamId,
        result: Option<StreamResult>,
        error: Option<ProtocolError>,
    ) {
        // Results are only worth retaining for locally initiated exchanges
        // that someone may poll for.
        let response = if self.is_local_stream_id(stream_id)
            && !self.options.garbage_on_end
            && error.is_none()
        {
            result
        } else {
            None
        };

        let garbage = response.is_none();
        let notifier = state.streams.close(stream_id, response, garbage);

        if let Some(error) = &error {
            tracing::debug!(stream_id, %error, "stream finished abnormally");
        }

        if let Some(notifier) = notifier {
            let _ = notifier.send(Notice::EndStream { stream_id });
        }

        if state.shutting_down.is_some() && !state.streams.has_active_streams() {
            let _ = self.connection_event_sender.send(ConnectionEvent::Closing {
                send_goaway: None,
                close_with: Some(Ok(())),
            });
        }
    }
}

/// State describing processing that already happened on the transport
/// before it was handed to the connection.
pub struct ConnectionInitialState {
    /// This is a server and the embedder already consumed the first line of
    /// the client preface while sniffing the protocol. Only the remainder
    /// of the preface is still expected on the wire.
    pub seen_preface_head: bool,

    /// Bytes that must be written out before any HTTP2 frames, e.g. the
    /// tail of an HTTP/1.1 upgrade exchange.
    pub upgrade_payload: Option<bytes::Bytes>,
}

impl ConnectionInitialState {
    pub fn raw() -> Self {
        Self {
            seen_preface_head: false,
            upgrade_payload: None,
        }
    }
}
