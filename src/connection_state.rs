use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::headers::Headers;
use crate::options::TransportInfo;
use crate::proto::*;
use crate::response::StreamResult;
use crate::settings::{PendingLocalSettings, SettingsContainer};
use crate::stream_set::{SendScope, StreamSet};
use crate::types::*;

/// A locally initiated PING waiting for its acknowledgement.
#[derive(Debug)]
pub struct PendingPing {
    pub notifier: Option<Notifier>,
    pub sent_at: Instant,
}

/// Shutdown progression of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuttingDownState {
    No,

    /// We sent (or are about to send) a graceful GOAWAY and are draining
    /// the remaining streams.
    Graceful,

    /// The remote endpoint sent a NO_ERROR GOAWAY.
    GracefulRemote,

    /// The connection is done. No new work is accepted.
    Complete,
}

impl ShuttingDownState {
    pub fn is_some(&self) -> bool {
        !matches!(self, ShuttingDownState::No)
    }
}

/// Volatile data associated with the connection, guarded by the connection
/// state lock. The reader task, the writer task and the embedder facing
/// handles all observe it; the atomics for the connection level windows
/// live separately on ConnectionShared.
pub struct ConnectionState {
    /// Whether run() was ever called on this connection.
    pub running: bool,

    pub shutting_down: ShuttingDownState,

    /// Taken by the writer task when it starts.
    pub connection_event_receiver: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,

    /// Settings currently acknowledged by the remote endpoint and therefore
    /// in force for ingress processing.
    pub local_settings: SettingsContainer,

    /// Locally sent settings the remote endpoint has not acknowledged yet,
    /// oldest first. An ACK always applies to the front record.
    pub pending_local_settings: VecDeque<PendingLocalSettings>,

    pub next_settings_token: u64,

    /// Settings the remote endpoint asked us to use.
    pub remote_settings: SettingsContainer,

    /// Whether we have received the peer's first SETTINGS frame.
    pub remote_settings_known: bool,

    /// Outstanding locally initiated pings keyed by their opaque payload.
    pub pending_pings: HashMap<[u8; 8], PendingPing>,

    pub next_ping_counter: u64,

    pub streams: StreamSet,

    /// Highest locally initiated stream id the peer promised to process,
    /// from a received GOAWAY. None while no GOAWAY was seen.
    pub upper_sent_stream_id: Option<StreamId>,

    pub transport: TransportInfo,

    /// Last time a frame crossed the connection in either direction. Drives
    /// the optional idle shutdown.
    pub last_activity: Instant,
}

/// Events processed by the connection's writer task. Everything that wants
/// to put bytes on the wire or change connection wide state funnels through
/// these.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The remote endpoint pinged us; answer with an ACK carrying the same
    /// opaque bytes.
    Ping { ping_frame: PingFramePayload },

    /// Send a locally initiated PING and remember it for matching the ACK.
    SendPing {
        opaque_data: [u8; 8],
        notifier: Option<Notifier>,
    },

    /// Emit a RST_STREAM for a stream that failed locally.
    ResetStream {
        stream_id: StreamId,
        error: ProtocolError,
    },

    /// The embedder (or a callback) asked for a stream to be reset. Routed
    /// through the stream's state machine so it can clean up first.
    RequestReset {
        stream_id: StreamId,
        code: ErrorCode,
    },

    /// Terminate the connection. send_goaway carries an error to announce
    /// first; close_with directs how run() should complete (None keeps
    /// draining gracefully).
    Closing {
        send_goaway: Option<ProtocolError>,
        close_with: Option<Result<()>>,
    },

    /// We received remote settings, applied them, and now owe the peer an
    /// ACK.
    AcknowledgeSettings,

    /// Emit the HEADERS frame(s) opening our half of a stream.
    SendHeaders {
        stream_id: StreamId,
        headers: Headers,
        end_stream: bool,
    },

    /// Queue body bytes on a stream and poke the scheduler.
    SendData {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },

    /// Defer a trailer block until the stream's queued body drains.
    SendTrailers {
        stream_id: StreamId,
        trailers: Headers,
    },

    /// Emit a PUSH_PROMISE reserving promised_stream_id on stream_id.
    SendPushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        headers: Headers,
    },

    /// Run a scheduler pass over the given scope.
    StreamWrite { scope: SendScope },

    /// Ingress data was consumed; return the quota to the remote endpoint.
    StreamRead { stream_id: StreamId, count: usize },

    /// Explicitly grow a receive window (stream 0 for the connection).
    SendWindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },

    /// Send a SETTINGS frame updating the given parameters.
    UpdateSettings {
        parameters: Vec<SettingsParameter>,
    },

    /// The ack timer for the settings frame with this token fired.
    CheckSettingsTimeout { token: u64 },

    /// A stream's state machine reached its terminal state.
    StreamFinished {
        stream_id: StreamId,
        result: Option<StreamResult>,
        error: Option<ProtocolError>,
    },
}
