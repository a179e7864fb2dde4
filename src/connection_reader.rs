use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;

use crate::connection_shared::*;
use crate::connection_state::*;
use crate::frame_utils;
use crate::headers::{validate_received_headers, Headers};
use crate::hpack::HeaderDecoder;
use crate::options::FlowControlMode;
use crate::proto::*;
use crate::stream::StreamEvent;
use crate::stream_set::{try_add_window, SendScope, StreamKind};
use crate::types::*;

enum ReceivedHeadersType {
    PushPromise {
        promised_stream_id: StreamId,
    },
    RegularHeaders {
        end_stream: bool,
    },
}

/// A header block under reassembly: a HEADERS or PUSH_PROMISE frame plus
/// any CONTINUATION fragments that followed it, up to END_HEADERS.
struct ReceivedHeaders {
    /// Id of the stream on which this block was received.
    stream_id: StreamId,

    data: BytesMut,

    typ: ReceivedHeadersType,
}

macro_rules! connection_error {
    ($code:ident, $message:expr) => {
        return Err(ProtocolError {
            code: ErrorCode::$code,
            message: $message,
            local: true,
        }
        .into())
    };
}

/// The task that exclusively reads incoming data from the raw connection.
///
/// Stateless validation and HPACK decoding happen here; decoded stream
/// events are delivered straight to the stream handlers while connection
/// scoped frames are posted to the writer task as typed events.
pub struct ConnectionReader {
    shared: Arc<ConnectionShared>,
}

impl ConnectionReader {
    pub fn new(shared: Arc<ConnectionShared>) -> Self {
        Self { shared }
    }

    /// Rather than returning its result, the reader reports failures by
    /// sending Goaway/Closing events to the writer task and terminating.
    pub async fn run(self, reader: DynReader, seen_preface_head: bool) {
        let result = self.run_inner(reader, seen_preface_head).await;

        match result {
            Ok(()) => {
                // run_inner already announced the shutdown itself.
            }
            Err(Error::Io(io_error)) => {
                // A peer that simply drops the transport is common and is
                // reported as a normal termination. Everything else keeps
                // the underlying error.
                let close_with = match io_error.kind() {
                    std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe => Ok(()),
                    _ => Err(io_error.into()),
                };

                let _ = self
                    .shared
                    .connection_event_sender
                    .send(ConnectionEvent::Closing {
                        send_goaway: None,
                        close_with: Some(close_with),
                    });
            }
            Err(Error::Protocol(error)) if error.local => {
                // We caught the remote endpoint violating the protocol.
                tracing::warn!(%error, "connection error");
                let _ = self
                    .shared
                    .connection_event_sender
                    .send(ConnectionEvent::Closing {
                        send_goaway: Some(error),
                        close_with: None,
                    });
            }
            Err(error) => {
                let _ = self
                    .shared
                    .connection_event_sender
                    .send(ConnectionEvent::Closing {
                        send_goaway: Some(ProtocolError {
                            code: ErrorCode::INTERNAL_ERROR,
                            message: "Unknown internal error occurred",
                            local: true,
                        }),
                        close_with: Some(Err(error)),
                    });
            }
        }
    }

    async fn run_inner(&self, mut reader: DynReader, seen_preface_head: bool) -> Result<()> {
        let handshake_timeout = self.shared.options.handshake_timeout;

        // Server endpoints start by reading the preface sent by the client.
        if self.shared.is_server {
            let expected: &[u8] = if seen_preface_head {
                // "PRI * HTTP/2.0\r\n" was already consumed upstream.
                &CONNECTION_PREFACE[16..]
            } else {
                CONNECTION_PREFACE
            };

            let mut preface = vec![0u8; expected.len()];
            let read = tokio::time::timeout(handshake_timeout, reader.read_exact(&mut preface));
            match read.await {
                Ok(result) => {
                    result?;
                }
                Err(_) => {
                    connection_error!(PROTOCOL_ERROR, "Timed out waiting for connection preface");
                }
            }

            if preface != expected {
                // Most likely not an HTTP2 client at all. Stop talking to
                // it without attempting a GOAWAY.
                let _ = self
                    .shared
                    .connection_event_sender
                    .send(ConnectionEvent::Closing {
                        send_goaway: None,
                        close_with: Some(Ok(())),
                    });
                return Ok(());
            }
        }

        // Used to decode remotely created header blocks. Shared across all
        // streams on the connection and owned exclusively by this task.
        let mut remote_header_decoder;
        let mut max_frame_size;
        {
            let state = self.shared.state.lock().await;
            remote_header_decoder =
                HeaderDecoder::new(state.local_settings[SettingId::HEADER_TABLE_SIZE] as usize);
            max_frame_size = state.local_settings[SettingId::MAX_FRAME_SIZE];
        }

        // Whether we've seen the peer's first (non-ACK) SETTINGS frame.
        let mut received_remote_settings = false;

        // The currently reassembling header block, if any. While this is
        // set, only CONTINUATION frames for the same stream are legal.
        let mut pending_header: Option<ReceivedHeaders> = None;

        let mut frame_header_buf = [0u8; FrameHeader::size_of()];
        loop {
            if received_remote_settings {
                reader.read_exact(&mut frame_header_buf).await?;
            } else {
                // The peer owes us its SETTINGS frame promptly after the
                // preface exchange.
                match tokio::time::timeout(
                    handshake_timeout,
                    reader.read_exact(&mut frame_header_buf),
                )
                .await
                {
                    Ok(result) => {
                        result?;
                    }
                    Err(_) => {
                        connection_error!(
                            PROTOCOL_ERROR,
                            "Timed out waiting for the peer's first SETTINGS frame"
                        );
                    }
                }
            }

            let frame_header = FrameHeader::parse_complete(&frame_header_buf);
            tracing::trace!(
                typ = ?frame_header.typ,
                stream_id = frame_header.stream_id,
                length = frame_header.length,
                "received frame"
            );

            if !received_remote_settings && frame_header.typ != FrameType::SETTINGS {
                connection_error!(
                    PROTOCOL_ERROR,
                    "Expected first received frame to be a SETTINGS frame"
                );
            }

            // Frame size check per RFC 7540 Section 4.2. The payload is not
            // consumed.
            if frame_header.length > max_frame_size {
                connection_error!(
                    FRAME_SIZE_ERROR,
                    "Received frame larger than the maximum frame size"
                );
            }

            // Header blocks must not interleave with anything else
            // (RFC 7540 Section 6.10).
            if let Some(received_headers) = &pending_header {
                if frame_header.typ != FrameType::CONTINUATION
                    || frame_header.stream_id != received_headers.stream_id
                {
                    connection_error!(
                        PROTOCOL_ERROR,
                        "Frame interleaved into an unfinished header block"
                    );
                }
            }

            let mut payload = BytesMut::zeroed(frame_header.length as usize);
            reader.read_exact(&mut payload).await?;
            let payload: Bytes = payload.freeze();

            self.shared.state.lock().await.last_activity = Instant::now();

            match frame_header.typ {
                FrameType::DATA => {
                    self.receive_data(&frame_header, payload).await?;
                }
                FrameType::HEADERS => {
                    if frame_header.stream_id == 0 {
                        connection_error!(
                            PROTOCOL_ERROR,
                            "Received HEADERS on the connection control stream"
                        );
                    }
                    if self.shared.is_local_stream_id(frame_header.stream_id) {
                        // Nothing the peer can legally start on our half of
                        // the id space.
                        connection_error!(
                            PROTOCOL_ERROR,
                            "Received HEADERS on a locally owned stream id"
                        );
                    }

                    let flags = HeadersFrameFlags::parse(frame_header.flags);
                    let headers_frame = HeadersFramePayload::parse_complete(payload, &flags)?;
                    frame_utils::check_padding(&headers_frame.padding)?;

                    if let Some(priority) = &headers_frame.priority {
                        if priority.stream_dependency == frame_header.stream_id {
                            self.reset_stream_locally(
                                frame_header.stream_id,
                                ErrorCode::PROTOCOL_ERROR,
                            )
                            .await;
                            continue;
                        }
                    }

                    let received_headers = ReceivedHeaders {
                        stream_id: frame_header.stream_id,
                        data: BytesMut::from(&headers_frame.header_block_fragment[..]),
                        typ: ReceivedHeadersType::RegularHeaders {
                            end_stream: flags.end_stream,
                        },
                    };

                    if flags.end_headers {
                        self.receive_headers(received_headers, &mut remote_header_decoder)
                            .await?;
                    } else {
                        pending_header = Some(received_headers);
                    }
                }
                FrameType::PRIORITY => {
                    if frame_header.stream_id == 0 {
                        connection_error!(
                            PROTOCOL_ERROR,
                            "Received PRIORITY on the connection control stream"
                        );
                    }
                    if frame_header.length as usize != PriorityFramePayload::size_of() {
                        connection_error!(
                            FRAME_SIZE_ERROR,
                            "Received PRIORITY frame of the wrong length"
                        );
                    }

                    let priority_frame = PriorityFramePayload::parse_complete(payload)?;

                    if priority_frame.stream_dependency == frame_header.stream_id {
                        self.reset_stream_locally(
                            frame_header.stream_id,
                            ErrorCode::PROTOCOL_ERROR,
                        )
                        .await;
                    }

                    // Priorities are parsed but not acted upon.
                }
                FrameType::RST_STREAM => {
                    if frame_header.stream_id == 0 {
                        connection_error!(
                            PROTOCOL_ERROR,
                            "Received RST_STREAM on the connection control stream"
                        );
                    }
                    if frame_header.length as usize != RstStreamFramePayload::size_of() {
                        connection_error!(
                            FRAME_SIZE_ERROR,
                            "Received RST_STREAM frame of the wrong length"
                        );
                    }

                    let rst_frame = RstStreamFramePayload::parse_complete(payload)?;

                    let mut state = self.shared.state.lock().await;
                    match state.streams.classify(frame_header.stream_id) {
                        StreamKind::Idle => {
                            connection_error!(
                                PROTOCOL_ERROR,
                                "Received RST_STREAM for an idle stream"
                            );
                        }
                        StreamKind::Active => {
                            if let Some(stream) =
                                state.streams.get_active_mut(frame_header.stream_id)
                            {
                                let _ = stream.events.send(StreamEvent::ReceivedReset {
                                    code: rst_frame.error_code,
                                });
                            }
                        }
                        StreamKind::Closed => {
                            // Late reset of something we already finished.
                        }
                    }
                }
                FrameType::SETTINGS => {
                    self.receive_settings(
                        &frame_header,
                        payload,
                        &mut remote_header_decoder,
                        &mut max_frame_size,
                        &mut received_remote_settings,
                    )
                    .await?;
                }
                FrameType::PUSH_PROMISE => {
                    if self.shared.is_server {
                        connection_error!(
                            PROTOCOL_ERROR,
                            "Clients must not receive PUSH_PROMISE as a server"
                        );
                    }

                    {
                        let state = self.shared.state.lock().await;
                        if state.local_settings[SettingId::ENABLE_PUSH] == 0 {
                            connection_error!(
                                PROTOCOL_ERROR,
                                "Received PUSH_PROMISE while push is disabled"
                            );
                        }
                    }

                    let flags = PushPromiseFrameFlags::parse(frame_header.flags);
                    let push_promise_frame =
                        PushPromiseFramePayload::parse_complete(payload, &flags)?;
                    frame_utils::check_padding(&push_promise_frame.padding)?;

                    let received_headers = ReceivedHeaders {
                        stream_id: frame_header.stream_id,
                        data: BytesMut::from(&push_promise_frame.header_block_fragment[..]),
                        typ: ReceivedHeadersType::PushPromise {
                            promised_stream_id: push_promise_frame.promised_stream_id,
                        },
                    };

                    if flags.end_headers {
                        self.receive_headers(received_headers, &mut remote_header_decoder)
                            .await?;
                    } else {
                        pending_header = Some(received_headers);
                    }
                }
                FrameType::PING => {
                    if frame_header.stream_id != 0 {
                        connection_error!(
                            PROTOCOL_ERROR,
                            "Received PING on a non-connection control stream"
                        );
                    }
                    if frame_header.length as usize != PingFramePayload::size_of() {
                        connection_error!(
                            FRAME_SIZE_ERROR,
                            "Received PING frame of the wrong length"
                        );
                    }

                    let flags = PingFrameFlags::parse(frame_header.flags);
                    let ping_frame = PingFramePayload::parse_complete(payload)?;

                    if flags.ack {
                        let mut state = self.shared.state.lock().await;
                        if let Some(pending) =
                            state.pending_pings.remove(&ping_frame.opaque_data)
                        {
                            tracing::debug!(
                                rtt = ?pending.sent_at.elapsed(),
                                "ping acknowledged"
                            );
                            if let Some(notifier) = pending.notifier {
                                let _ = notifier.send(Notice::Pong {
                                    opaque_data: ping_frame.opaque_data,
                                });
                            }
                        }
                        // ACKs for unknown opaque data are ignored.
                    } else {
                        let _ = self
                            .shared
                            .connection_event_sender
                            .send(ConnectionEvent::Ping { ping_frame });
                    }
                }
                FrameType::GOAWAY => {
                    if frame_header.stream_id != 0 {
                        connection_error!(
                            PROTOCOL_ERROR,
                            "Received GOAWAY on a non-connection control stream"
                        );
                    }

                    let goaway_frame = GoawayFramePayload::parse_complete(payload)?;

                    if goaway_frame.last_stream_id != 0
                        && !self.shared.is_local_stream_id(goaway_frame.last_stream_id)
                    {
                        connection_error!(
                            PROTOCOL_ERROR,
                            "GOAWAY last_stream_id does not name one of our streams"
                        );
                    }

                    if self.receive_goaway(goaway_frame).await? {
                        return Ok(());
                    }
                }
                FrameType::WINDOW_UPDATE => {
                    if frame_header.length as usize != WindowUpdateFramePayload::size_of() {
                        connection_error!(
                            FRAME_SIZE_ERROR,
                            "Received WINDOW_UPDATE frame of the wrong length"
                        );
                    }

                    let window_update = WindowUpdateFramePayload::parse_complete(payload)?;
                    self.receive_window_update(&frame_header, window_update)
                        .await?;
                }
                FrameType::CONTINUATION => {
                    let mut received_headers = match pending_header.take() {
                        Some(v) => v,
                        None => {
                            connection_error!(
                                PROTOCOL_ERROR,
                                "CONTINUATION without a preceding HEADERS or PUSH_PROMISE"
                            );
                        }
                    };

                    let flags = ContinuationFrameFlags::parse(frame_header.flags);
                    received_headers.data.extend_from_slice(&payload);

                    if flags.end_headers {
                        self.receive_headers(received_headers, &mut remote_header_decoder)
                            .await?;
                    } else {
                        pending_header = Some(received_headers);
                    }
                }
                FrameType::Unknown(_) => {
                    // Unknown frame types are discarded (RFC 7540
                    // Section 4.1) to stay extension friendly.
                }
            }
        }
    }

    async fn receive_data(&self, frame_header: &FrameHeader, payload: Bytes) -> Result<()> {
        if frame_header.stream_id == 0 {
            connection_error!(PROTOCOL_ERROR, "Received DATA on the connection control stream");
        }

        let flags = DataFrameFlags::parse(frame_header.flags);
        let data_frame = DataFramePayload::parse_complete(payload, &flags)?;
        frame_utils::check_padding(&data_frame.padding)?;

        let flow_controlled_length = frame_header.length as usize;

        // The whole frame counts against the connection level window, even
        // if the stream it names is dead.
        let connection_window = self.shared.recv_window.load(Ordering::Acquire);
        if (flow_controlled_length as WindowSize) > connection_window {
            connection_error!(
                FLOW_CONTROL_ERROR,
                "Received DATA exceeding the connection flow control window"
            );
        }
        self.shared
            .recv_window
            .fetch_sub(flow_controlled_length as WindowSize, Ordering::AcqRel);

        let mut state_guard = self.shared.state.lock().await;
        let state = &mut *state_guard;

        match state.streams.classify(frame_header.stream_id) {
            StreamKind::Idle => {
                connection_error!(PROTOCOL_ERROR, "Received DATA on an idle stream");
            }
            StreamKind::Closed => {
                // Section 6.1: answer with STREAM_CLOSED but keep the
                // connection alive; the quota is handed back right away.
                drop(state_guard);

                self.send_event(ConnectionEvent::ResetStream {
                    stream_id: frame_header.stream_id,
                    error: ProtocolError {
                        code: ErrorCode::STREAM_CLOSED,
                        message: "Received DATA on a closed stream",
                        local: true,
                    },
                });

                if flow_controlled_length > 0 {
                    self.send_event(ConnectionEvent::StreamRead {
                        stream_id: 0,
                        count: flow_controlled_length,
                    });
                }
            }
            StreamKind::Active => {
                let stream = state
                    .streams
                    .get_active_mut(frame_header.stream_id)
                    .unwrap();

                if (flow_controlled_length as WindowSize) > stream.recv_window {
                    let _ = stream.events.send(StreamEvent::LocalReset {
                        code: ErrorCode::FLOW_CONTROL_ERROR,
                    });
                    drop(state_guard);

                    self.send_event(ConnectionEvent::StreamRead {
                        stream_id: 0,
                        count: flow_controlled_length,
                    });
                    return Ok(());
                }

                stream.recv_window -= flow_controlled_length as WindowSize;

                let _ = stream.events.send(StreamEvent::ReceivedData {
                    data: data_frame.data.clone(),
                    end_stream: flags.end_stream,
                });

                let auto = self.shared.options.flow_control == FlowControlMode::Auto;
                drop(state_guard);

                if auto {
                    if flow_controlled_length > 0 {
                        self.send_event(ConnectionEvent::StreamRead {
                            stream_id: frame_header.stream_id,
                            count: flow_controlled_length,
                        });
                    }
                } else {
                    // In manual mode only the padding overhead is returned
                    // automatically; the embedder owns the rest.
                    let padding_overhead = flow_controlled_length - data_frame.data.len();
                    if padding_overhead > 0 {
                        self.send_event(ConnectionEvent::StreamRead {
                            stream_id: frame_header.stream_id,
                            count: padding_overhead,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    async fn receive_headers(
        &self,
        received_headers: ReceivedHeaders,
        remote_header_decoder: &mut HeaderDecoder,
    ) -> Result<()> {
        // Decode first in all cases so the compression context stays in
        // sync with the remote encoder.
        let headers: Headers = remote_header_decoder
            .decode(&received_headers.data)
            .map_err(Error::from)?;

        let stream_id = received_headers.stream_id;

        match received_headers.typ {
            ReceivedHeadersType::RegularHeaders { end_stream } => {
                if let Err(error) = validate_received_headers(&headers) {
                    // A malformed (but decodable) block only poisons the
                    // stream.
                    self.reset_stream_locally(stream_id, error.code).await;
                    return Ok(());
                }

                let mut state_guard = self.shared.state.lock().await;
                let state = &mut *state_guard;

                match state.streams.classify(stream_id) {
                    StreamKind::Active => {
                        let stream = state.streams.get_active_mut(stream_id).unwrap();
                        let _ = stream.events.send(StreamEvent::ReceivedHeaders {
                            headers,
                            end_stream,
                        });
                    }
                    StreamKind::Idle => {
                        if !self.shared.is_server {
                            connection_error!(
                                PROTOCOL_ERROR,
                                "Received HEADERS on an idle stream without a PUSH_PROMISE"
                            );
                        }

                        if state.shutting_down.is_some() {
                            drop(state_guard);
                            self.send_event(ConnectionEvent::ResetStream {
                                stream_id,
                                error: ProtocolError {
                                    code: ErrorCode::REFUSED_STREAM,
                                    message: "Received a new request while shutting down",
                                    local: true,
                                },
                            });
                            return Ok(());
                        }

                        let callback = self.shared.peer_stream_callback(stream_id);
                        let (send_window, recv_window) =
                            self.shared.initial_stream_windows(state);
                        let built = state.streams.new_stream(Some(stream_id), |id| {
                            self.shared.new_active_stream(
                                id,
                                callback,
                                None,
                                send_window,
                                recv_window,
                            )
                        });

                        match built {
                            Ok(_) => {
                                let stream =
                                    state.streams.get_active_mut(stream_id).unwrap();
                                let _ = stream.events.send(StreamEvent::ReceivedHeaders {
                                    headers,
                                    end_stream,
                                });
                            }
                            Err(Error::Protocol(error))
                                if error.code == ErrorCode::REFUSED_STREAM =>
                            {
                                drop(state_guard);
                                self.send_event(ConnectionEvent::ResetStream {
                                    stream_id,
                                    error,
                                });
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    StreamKind::Closed => {
                        drop(state_guard);
                        self.send_event(ConnectionEvent::ResetStream {
                            stream_id,
                            error: ProtocolError {
                                code: ErrorCode::STREAM_CLOSED,
                                message: "Received HEADERS on a closed stream",
                                local: true,
                            },
                        });
                    }
                }
            }
            ReceivedHeadersType::PushPromise { promised_stream_id } => {
                let mut state_guard = self.shared.state.lock().await;
                let state = &mut *state_guard;

                // The parent must be a stream we initiated and still know.
                if !self.shared.is_local_stream_id(stream_id)
                    || state.streams.classify(stream_id) == StreamKind::Idle
                {
                    connection_error!(
                        PROTOCOL_ERROR,
                        "PUSH_PROMISE received on an unusable parent stream"
                    );
                }

                if !self.shared.is_remote_stream_id(promised_stream_id)
                    || state.streams.classify(promised_stream_id) != StreamKind::Idle
                {
                    connection_error!(
                        PROTOCOL_ERROR,
                        "PUSH_PROMISE promised stream id is not an idle peer id"
                    );
                }

                let callback = self.shared.peer_stream_callback(promised_stream_id);
                let (send_window, recv_window) = self.shared.initial_stream_windows(state);
                let built = state.streams.new_stream(Some(promised_stream_id), |id| {
                    self.shared
                        .new_active_stream(id, callback, None, send_window, recv_window)
                });

                match built {
                    Ok(_) => {
                        let stream = state
                            .streams
                            .get_active_mut(promised_stream_id)
                            .unwrap();
                        let _ = stream
                            .events
                            .send(StreamEvent::ReceivedPushPromise { headers });
                    }
                    Err(Error::Protocol(error))
                        if error.code == ErrorCode::REFUSED_STREAM =>
                    {
                        drop(state_guard);
                        self.send_event(ConnectionEvent::ResetStream {
                            stream_id: promised_stream_id,
                            error,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }

    async fn receive_settings(
        &self,
        frame_header: &FrameHeader,
        payload: Bytes,
        remote_header_decoder: &mut HeaderDecoder,
        max_frame_size: &mut u32,
        received_remote_settings: &mut bool,
    ) -> Result<()> {
        if frame_header.stream_id != 0 {
            connection_error!(
                PROTOCOL_ERROR,
                "Received SETTINGS on a non-connection control stream"
            );
        }

        let flags = SettingsFrameFlags::parse(frame_header.flags);

        if flags.ack {
            if frame_header.length != 0 {
                connection_error!(FRAME_SIZE_ERROR, "Received SETTINGS ACK with a payload");
            }

            let mut state_guard = self.shared.state.lock().await;
            let state = &mut *state_guard;

            // The ACK applies to the oldest settings we sent.
            let acknowledged = match state.pending_local_settings.pop_front() {
                Some(v) => v,
                None => {
                    connection_error!(
                        PROTOCOL_ERROR,
                        "Received SETTINGS ACK with no settings outstanding"
                    );
                }
            };

            let old_window_size =
                state.local_settings[SettingId::INITIAL_WINDOW_SIZE] as WindowSize;
            state.local_settings = acknowledged.settings;

            let new_window_size =
                state.local_settings[SettingId::INITIAL_WINDOW_SIZE] as WindowSize;
            let window_diff = new_window_size - old_window_size;
            if window_diff != 0 {
                state.streams.update_all_recv_windows(window_diff)?;
            }

            remote_header_decoder
                .set_max_table_size(state.local_settings[SettingId::HEADER_TABLE_SIZE] as usize);
            *max_frame_size = state.local_settings[SettingId::MAX_FRAME_SIZE];

            let my_max = state.local_settings.max_concurrent_streams();
            state.streams.update_my_max_active(my_max);
            drop(state_guard);

            if window_diff > 0 {
                // Let the peer use the additional connection level quota.
                self.send_event(ConnectionEvent::SendWindowUpdate {
                    stream_id: 0,
                    increment: window_diff as u32,
                });
            }
        } else {
            let settings_frame = SettingsFramePayload::parse_complete(payload)?;

            let mut state_guard = self.shared.state.lock().await;
            let state = &mut *state_guard;

            for param in settings_frame.parameters {
                let old_value = state.remote_settings.set(param.id, param.value)?;

                match param.id {
                    SettingId::INITIAL_WINDOW_SIZE => {
                        // NOTE: The connection level window is not touched
                        // by this setting.
                        let window_diff = (param.value as WindowSize)
                            - (old_value.unwrap_or(65535) as WindowSize);
                        state.streams.update_all_send_windows(window_diff)?;
                    }
                    SettingId::MAX_CONCURRENT_STREAMS => {
                        state
                            .streams
                            .update_their_max_active(state.remote_settings.max_concurrent_streams());
                    }
                    _ => {}
                }
            }

            state.remote_settings_known = true;
            *received_remote_settings = true;
            drop(state_guard);

            self.send_event(ConnectionEvent::AcknowledgeSettings);

            // Window changes may have unblocked queued data.
            self.send_event(ConnectionEvent::StreamWrite {
                scope: SendScope::All,
            });
        }

        Ok(())
    }

    /// Handles a remote GOAWAY. Returns true when the reader should stop.
    async fn receive_goaway(&self, goaway_frame: GoawayFramePayload) -> Result<bool> {
        tracing::debug!(
            code = ?goaway_frame.error_code,
            last_stream_id = goaway_frame.last_stream_id,
            "received GOAWAY"
        );

        let mut state_guard = self.shared.state.lock().await;
        let state = &mut *state_guard;

        state.upper_sent_stream_id = Some(goaway_frame.last_stream_id);

        // Streams the peer will never process can be retried elsewhere.
        for id in state.streams.active_stream_ids() {
            if self.shared.is_local_stream_id(id) && id > goaway_frame.last_stream_id {
                if let Some(stream) = state.streams.get_active_mut(id) {
                    let _ = stream.events.send(StreamEvent::ReceivedReset {
                        code: ErrorCode::REFUSED_STREAM,
                    });
                }
            }
        }

        if goaway_frame.error_code == ErrorCode::NO_ERROR {
            if !state.shutting_down.is_some() {
                state.shutting_down = ShuttingDownState::GracefulRemote;
            }
            drop(state_guard);

            // Ask the writer whether the connection can stop already.
            self.send_event(ConnectionEvent::Closing {
                send_goaway: None,
                close_with: None,
            });

            Ok(false)
        } else {
            state.shutting_down = ShuttingDownState::Complete;
            drop(state_guard);

            self.send_event(ConnectionEvent::Closing {
                send_goaway: None,
                close_with: Some(Err(ProtocolError {
                    code: goaway_frame.error_code,
                    message: "Remote GOAWAY received",
                    local: false,
                }
                .into())),
            });

            Ok(true)
        }
    }

    async fn receive_window_update(
        &self,
        frame_header: &FrameHeader,
        window_update: WindowUpdateFramePayload,
    ) -> Result<()> {
        let increment = window_update.window_size_increment;

        if increment == 0 {
            if frame_header.stream_id == 0 {
                connection_error!(
                    PROTOCOL_ERROR,
                    "Received WINDOW_UPDATE with an increment of zero"
                );
            }

            let mut state = self.shared.state.lock().await;
            match state.streams.classify(frame_header.stream_id) {
                StreamKind::Idle => {
                    connection_error!(
                        PROTOCOL_ERROR,
                        "Received WINDOW_UPDATE for an idle stream"
                    );
                }
                StreamKind::Active => {
                    if let Some(stream) = state.streams.get_active_mut(frame_header.stream_id) {
                        let _ = stream.events.send(StreamEvent::LocalReset {
                            code: ErrorCode::PROTOCOL_ERROR,
                        });
                    }
                }
                StreamKind::Closed => {}
            }
            return Ok(());
        }

        if frame_header.stream_id == 0 {
            try_add_window(&self.shared.send_window, increment as WindowSize)
                .map_err(Error::from)?;

            self.send_event(ConnectionEvent::StreamWrite {
                scope: SendScope::All,
            });
            return Ok(());
        }

        let mut state_guard = self.shared.state.lock().await;
        let state = &mut *state_guard;

        match state.streams.classify(frame_header.stream_id) {
            StreamKind::Idle => {
                connection_error!(
                    PROTOCOL_ERROR,
                    "Received WINDOW_UPDATE for an idle stream"
                );
            }
            StreamKind::Closed => {
                drop(state_guard);
                self.send_event(ConnectionEvent::ResetStream {
                    stream_id: frame_header.stream_id,
                    error: ProtocolError {
                        code: ErrorCode::STREAM_CLOSED,
                        message: "Received WINDOW_UPDATE on a closed stream",
                        local: true,
                    },
                });
            }
            StreamKind::Active => {
                let stream = state
                    .streams
                    .get_active_mut(frame_header.stream_id)
                    .unwrap();

                match stream.send_window.checked_add(increment as WindowSize) {
                    Some(new_window) => {
                        stream.send_window = new_window;
                        drop(state_guard);

                        self.send_event(ConnectionEvent::StreamWrite {
                            scope: SendScope::Stream(frame_header.stream_id),
                        });
                    }
                    None => {
                        let _ = stream.events.send(StreamEvent::LocalReset {
                            code: ErrorCode::FLOW_CONTROL_ERROR,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Resets a stream via its state machine, which takes care of emitting
    /// the RST_STREAM frame. A no-op for streams that are not active.
    async fn reset_stream_locally(&self, stream_id: StreamId, code: ErrorCode) {
        let mut state = self.shared.state.lock().await;
        if let Some(stream) = state.streams.get_active_mut(stream_id) {
            let _ = stream.events.send(StreamEvent::LocalReset { code });
        }
    }

    fn send_event(&self, event: ConnectionEvent) {
        let _ = self.shared.connection_event_sender.send(event);
    }
}
