use crate::proto::ErrorCode;

pub type StreamId = u32;

/// Type used to represent the size of a flow control window.
///
/// NOTE: The window may go negative after a SETTINGS initial window size
/// decrease.
pub type WindowSize = i32;

/// An HTTP2 level error. Used for both connection level errors (carried in
/// GOAWAY frames) and stream level errors (carried in RST_STREAM frames).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: &'static str,

    /// If true, this error was generated locally rather than being received
    /// from the remote endpoint.
    pub local: bool,
}

impl ProtocolError {
    /// In the context of a request sent from a client to a server, this
    /// indicates whether the client is safe to retry the request because no
    /// application level processing was started for it.
    pub fn is_retryable(&self) -> bool {
        self.code == ErrorCode::REFUSED_STREAM
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}: [{}] {}",
            self.code,
            if self.local { "LOCAL" } else { "REMOTE" },
            self.message
        )
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The connection driver has stopped so no further operations can be
    /// performed through the connection handle.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Incorrect usage of the API by the embedder.
    #[error("{0}")]
    Usage(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Out of band notifications delivered to the embedder supplied notifier
/// channel of a connection or stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A stream reached its terminal state. The final data (if retained) can
    /// now be fetched with get_response.
    EndStream { stream_id: StreamId },

    /// A locally initiated PING was acknowledged by the remote endpoint.
    Pong { opaque_data: [u8; 8] },
}

/// Channel on which Notice values are delivered.
pub type Notifier = tokio::sync::mpsc::UnboundedSender<Notice>;
