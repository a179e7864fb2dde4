// Per stream state machine and the task driving it.
//
// Every non-idle stream has a dedicated task owning the RFC 7540 Section 5.1
// state progression for that stream and the application callback. Ingress
// events are posted by the connection reader, egress bookkeeping events by
// the connection writer. When the stream reaches its terminal state the task
// reports back to the connection, which retires the registry entry.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::connection_state::ConnectionEvent;
use crate::headers::{validate_received_trailers, Header, Headers};
use crate::proto::ErrorCode;
use crate::response::StreamResult;
use crate::types::*;

/// Inputs consumed by a stream's state machine.
#[derive(Debug)]
pub enum StreamEvent {
    /// A decoded header block arrived. The machine decides whether it is the
    /// message head or a trailer block.
    ReceivedHeaders { headers: Headers, end_stream: bool },

    /// This stream was reserved by a PUSH_PROMISE carrying these request
    /// headers (client side only).
    ReceivedPushPromise { headers: Headers },

    ReceivedData { data: Bytes, end_stream: bool },

    /// The remote endpoint reset the stream.
    ReceivedReset { code: ErrorCode },

    /// A local component asked for the stream to be reset.
    LocalReset { code: ErrorCode },

    /// Our HEADERS frame for this stream went out on the wire.
    LocalHeadersSent { end_stream: bool },

    /// A PUSH_PROMISE reserving this stream went out on the wire.
    LocalPromiseSent,

    /// The scheduler flushed the last of our body (or trailers) with an
    /// END_STREAM flag.
    LocalEndSent,
}

/// States from RFC 7540 Section 5.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Handle given to stream callbacks for talking back to the connection.
#[derive(Clone, Debug)]
pub struct StreamContext {
    pub stream_id: StreamId,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl StreamContext {
    pub(crate) fn new(
        stream_id: StreamId,
        connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            stream_id,
            connection_events,
        }
    }

    pub fn send_headers(&self, headers: Headers, end_stream: bool) -> Result<()> {
        self.post(ConnectionEvent::SendHeaders {
            stream_id: self.stream_id,
            headers,
            end_stream,
        })
    }

    pub fn send_data(&self, data: Bytes, end_stream: bool) -> Result<()> {
        self.post(ConnectionEvent::SendData {
            stream_id: self.stream_id,
            data,
            end_stream,
        })
    }

    pub fn send_trailers(&self, trailers: Headers) -> Result<()> {
        self.post(ConnectionEvent::SendTrailers {
            stream_id: self.stream_id,
            trailers,
        })
    }

    pub fn reset(&self, code: ErrorCode) -> Result<()> {
        self.post(ConnectionEvent::RequestReset {
            stream_id: self.stream_id,
            code,
        })
    }

    fn post(&self, event: ConnectionEvent) -> Result<()> {
        self.connection_events
            .send(event)
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Application hook driven by a stream. All methods default to doing
/// nothing, so implementations only override what they care about.
pub trait StreamCallback: Send + 'static {
    fn on_headers(&mut self, _stream: &StreamContext, _headers: &[Header], _end_stream: bool) {}

    fn on_push_promise(&mut self, _stream: &StreamContext, _headers: &[Header]) {}

    fn on_data(&mut self, _stream: &StreamContext, _data: &[u8], _end_stream: bool) {}

    fn on_trailers(&mut self, _stream: &StreamContext, _trailers: &[Header]) {}

    /// The stream reached its terminal state. error is None for a clean
    /// close.
    fn on_close(&mut self, _stream: &StreamContext, _error: Option<&ProtocolError>) {}
}

/// Produces one callback instance per stream.
pub trait StreamCallbackFactory: Send + Sync + 'static {
    fn create(&self, stream: &StreamContext) -> Box<dyn StreamCallback>;
}

/// State machine for one stream.
pub(crate) struct StreamHandler {
    context: StreamContext,
    state: StreamState,

    received_headers: Option<Headers>,
    received_body: BytesMut,
    received_trailers: Option<Headers>,

    /// First error that closed the stream abruptly, if any.
    error: Option<ProtocolError>,

    callback: Option<Box<dyn StreamCallback>>,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl StreamHandler {
    pub fn new(
        stream_id: StreamId,
        callback: Option<Box<dyn StreamCallback>>,
        connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            context: StreamContext::new(stream_id, connection_events.clone()),
            state: StreamState::Idle,
            received_headers: None,
            received_body: BytesMut::new(),
            received_trailers: None,
            error: None,
            callback,
            connection_events,
        }
    }

    /// Creates the handler together with its event channel and spawns the
    /// driving task.
    pub fn spawn(
        stream_id: StreamId,
        callback: Option<Box<dyn StreamCallback>>,
        connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> mpsc::UnboundedSender<StreamEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler = Self::new(stream_id, callback, connection_events);
        tokio::spawn(handler.run(receiver));
        sender
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<StreamEvent>) {
        while self.state != StreamState::Closed {
            let event = match events.recv().await {
                Some(event) => event,
                // The connection dropped the stream entry. Nothing left to
                // report to.
                None => return,
            };

            self.apply(event);
        }

        if let Some(callback) = &mut self.callback {
            callback.on_close(&self.context, self.error.as_ref());
        }

        let result = if self.error.is_none() {
            Some(StreamResult {
                headers: self.received_headers.take().unwrap_or_default(),
                body: self.received_body.split().freeze(),
                trailers: self.received_trailers.take(),
            })
        } else {
            None
        };

        let _ = self.connection_events.send(ConnectionEvent::StreamFinished {
            stream_id: self.context.stream_id,
            result,
            error: self.error.take(),
        });
    }

    /// Runs one input through the state machine.
    pub fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::ReceivedHeaders {
                headers,
                end_stream,
            } => self.receive_headers(headers, end_stream),
            StreamEvent::ReceivedPushPromise { headers } => self.receive_push_promise(headers),
            StreamEvent::ReceivedData { data, end_stream } => self.receive_data(data, end_stream),
            StreamEvent::ReceivedReset { code } => {
                self.error = Some(ProtocolError {
                    code,
                    message: "Received RST_STREAM from remote endpoint",
                    local: false,
                });
                self.state = StreamState::Closed;
            }
            StreamEvent::LocalReset { code } => {
                self.stream_error(code, "Stream reset locally");
            }
            StreamEvent::LocalHeadersSent { end_stream } => {
                self.local_headers_sent(end_stream);
            }
            StreamEvent::LocalPromiseSent => {
                if self.state == StreamState::Idle {
                    self.state = StreamState::ReservedLocal;
                }
            }
            StreamEvent::LocalEndSent => self.local_end(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn receive_headers(&mut self, headers: Headers, end_stream: bool) {
        match self.state {
            StreamState::Idle | StreamState::ReservedRemote | StreamState::Open
            | StreamState::HalfClosedLocal => {
                if self.received_headers.is_some() {
                    // A second header block on the same stream is a trailer
                    // block. Trailers must end the stream.
                    if !end_stream {
                        self.stream_error(
                            ErrorCode::PROTOCOL_ERROR,
                            "Trailers received without END_STREAM",
                        );
                        return;
                    }

                    if let Err(e) = validate_received_trailers(&headers) {
                        self.stream_error(e.code, e.message);
                        return;
                    }

                    if let Some(callback) = &mut self.callback {
                        callback.on_trailers(&self.context, &headers);
                    }
                    self.received_trailers = Some(headers);
                    self.remote_end();
                    return;
                }

                if let Some(callback) = &mut self.callback {
                    callback.on_headers(&self.context, &headers, end_stream);
                }
                self.received_headers = Some(headers);

                self.state = match self.state {
                    StreamState::Idle => StreamState::Open,
                    StreamState::ReservedRemote => StreamState::HalfClosedLocal,
                    other => other,
                };

                if end_stream {
                    self.remote_end();
                }
            }
            StreamState::HalfClosedRemote | StreamState::Closed => {
                self.stream_error(
                    ErrorCode::STREAM_CLOSED,
                    "Received HEADERS after the remote end of the stream",
                );
            }
            StreamState::ReservedLocal => {
                self.stream_error(
                    ErrorCode::PROTOCOL_ERROR,
                    "Received HEADERS on a locally reserved stream",
                );
            }
        }
    }

    fn receive_push_promise(&mut self, headers: Headers) {
        match self.state {
            StreamState::Idle => {
                if let Some(callback) = &mut self.callback {
                    callback.on_push_promise(&self.context, &headers);
                }
                self.state = StreamState::ReservedRemote;
            }
            _ => {
                self.stream_error(
                    ErrorCode::PROTOCOL_ERROR,
                    "PUSH_PROMISE reserving a stream that is not idle",
                );
            }
        }
    }

    fn receive_data(&mut self, data: Bytes, end_stream: bool) {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => {
                if let Some(callback) = &mut self.callback {
                    callback.on_data(&self.context, &data, end_stream);
                }
                self.received_body.extend_from_slice(&data);

                if end_stream {
                    self.remote_end();
                }
            }
            _ => {
                // RFC 7540 Section 6.1: DATA outside "open" or "half-closed
                // (local)" answers with STREAM_CLOSED.
                self.stream_error(
                    ErrorCode::STREAM_CLOSED,
                    "Received DATA on a stream that cannot accept it",
                );
            }
        }
    }

    fn local_headers_sent(&mut self, end_stream: bool) {
        self.state = match self.state {
            StreamState::Idle => StreamState::Open,
            StreamState::ReservedLocal => StreamState::HalfClosedRemote,
            other => other,
        };

        if end_stream {
            self.local_end();
        }
    }

    fn local_end(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    fn remote_end(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            StreamState::ReservedRemote => StreamState::Closed,
            other => other,
        };
    }

    /// Closes the stream due to a locally detected error and tells the
    /// remote endpoint with a RST_STREAM.
    fn stream_error(&mut self, code: ErrorCode, message: &'static str) {
        let error = ProtocolError {
            code,
            message,
            local: true,
        };

        if self.error.is_none() {
            self.error = Some(error.clone());
        }

        let _ = self.connection_events.send(ConnectionEvent::ResetStream {
            stream_id: self.context.stream_id,
            error,
        });

        self.state = StreamState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> (StreamHandler, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (StreamHandler::new(1, None, sender), receiver)
    }

    fn request_headers() -> Headers {
        vec![
            Header::new(&b":method"[..], &b"GET"[..]),
            Header::new(&b":scheme"[..], &b"http"[..]),
            Header::new(&b":path"[..], &b"/"[..]),
        ]
    }

    #[test]
    fn request_response_exchange_reaches_closed() {
        let (mut handler, _events) = handler();

        // Local request with a body, then a complete remote response.
        handler.apply(StreamEvent::LocalHeadersSent { end_stream: false });
        assert_eq!(handler.state(), StreamState::Open);

        handler.apply(StreamEvent::LocalEndSent);
        assert_eq!(handler.state(), StreamState::HalfClosedLocal);

        handler.apply(StreamEvent::ReceivedHeaders {
            headers: request_headers(),
            end_stream: false,
        });
        assert_eq!(handler.state(), StreamState::HalfClosedLocal);

        handler.apply(StreamEvent::ReceivedData {
            data: Bytes::from_static(b"body"),
            end_stream: true,
        });
        assert_eq!(handler.state(), StreamState::Closed);
        assert_eq!(&handler.received_body[..], b"body");
    }

    #[test]
    fn headers_with_end_stream_half_closes_the_remote_side() {
        let (mut handler, _events) = handler();

        handler.apply(StreamEvent::ReceivedHeaders {
            headers: request_headers(),
            end_stream: true,
        });
        assert_eq!(handler.state(), StreamState::HalfClosedRemote);

        handler.apply(StreamEvent::LocalHeadersSent { end_stream: true });
        assert_eq!(handler.state(), StreamState::Closed);
    }

    #[test]
    fn second_header_block_is_a_trailer_block() {
        let (mut handler, _events) = handler();

        handler.apply(StreamEvent::ReceivedHeaders {
            headers: request_headers(),
            end_stream: false,
        });
        handler.apply(StreamEvent::ReceivedHeaders {
            headers: vec![Header::new(&b"grpc-status"[..], &b"0"[..])],
            end_stream: true,
        });

        assert_eq!(handler.state(), StreamState::HalfClosedRemote);
        assert!(handler.received_trailers.is_some());
        assert!(handler.error.is_none());
    }

    #[test]
    fn trailers_without_end_stream_reset_the_stream() {
        let (mut handler, mut events) = handler();

        handler.apply(StreamEvent::ReceivedHeaders {
            headers: request_headers(),
            end_stream: false,
        });
        handler.apply(StreamEvent::ReceivedHeaders {
            headers: vec![Header::new(&b"late"[..], &b"x"[..])],
            end_stream: false,
        });

        assert_eq!(handler.state(), StreamState::Closed);
        match events.try_recv().unwrap() {
            ConnectionEvent::ResetStream { stream_id, error } => {
                assert_eq!(stream_id, 1);
                assert_eq!(error.code, ErrorCode::PROTOCOL_ERROR);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn data_after_remote_end_is_stream_closed() {
        let (mut handler, mut events) = handler();

        handler.apply(StreamEvent::ReceivedHeaders {
            headers: request_headers(),
            end_stream: true,
        });
        handler.apply(StreamEvent::ReceivedData {
            data: Bytes::from_static(b"late"),
            end_stream: false,
        });

        assert_eq!(handler.state(), StreamState::Closed);
        match events.try_recv().unwrap() {
            ConnectionEvent::ResetStream { error, .. } => {
                assert_eq!(error.code, ErrorCode::STREAM_CLOSED);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn push_promise_reserves_and_response_half_closes() {
        let (mut handler, _events) = handler();

        handler.apply(StreamEvent::ReceivedPushPromise {
            headers: request_headers(),
        });
        assert_eq!(handler.state(), StreamState::ReservedRemote);

        handler.apply(StreamEvent::ReceivedHeaders {
            headers: vec![Header::new(&b":status"[..], &b"200"[..])],
            end_stream: false,
        });
        assert_eq!(handler.state(), StreamState::HalfClosedLocal);

        handler.apply(StreamEvent::ReceivedData {
            data: Bytes::from_static(b"pushed"),
            end_stream: true,
        });
        assert_eq!(handler.state(), StreamState::Closed);
    }

    #[test]
    fn remote_reset_closes_without_answering() {
        let (mut handler, mut events) = handler();

        handler.apply(StreamEvent::ReceivedHeaders {
            headers: request_headers(),
            end_stream: false,
        });
        handler.apply(StreamEvent::ReceivedReset {
            code: ErrorCode::CANCEL,
        });

        assert_eq!(handler.state(), StreamState::Closed);
        assert_eq!(handler.error.as_ref().unwrap().code, ErrorCode::CANCEL);
        assert!(!handler.error.as_ref().unwrap().local);
        assert!(events.try_recv().is_err());
    }
}
