use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicI32;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::connection_reader::ConnectionReader;
use crate::connection_shared::*;
use crate::connection_state::*;
use crate::connection_writer::ConnectionWriter;
use crate::headers::Headers;
use crate::options::{ConnectionOptions, ServerConnectionOptions, TransportInfo};
use crate::proto::{ErrorCode, SettingsParameter};
use crate::response::{decode_body, ResponsePoll};
use crate::settings::SettingsContainer;
use crate::stream::{StreamCallback, StreamContext};
use crate::stream_set::{SendScope, StreamKind, StreamSet};
use crate::types::*;

/// Options applying to one send operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Set END_STREAM on the final frame of this send.
    pub end_stream: bool,
}

/// A single HTTP2 connection to a remote endpoint.
///
/// The handle is cheap to keep around and is how the embedder starts
/// streams and performs connection control operations. The actual protocol
/// work happens inside the future returned by run(), which must be polled
/// for the lifetime of the connection.
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Losing the handle means nobody can use the connection anymore, so
        // let the peer know and wind down the driver.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            handle.spawn(async move {
                Self::shutdown_impl(&shared, false).await;
            });
        }
    }
}

impl Connection {
    pub fn new(
        options: ConnectionOptions,
        server_options: Option<ServerConnectionOptions>,
    ) -> Self {
        let is_server = server_options.is_some();

        let (connection_event_sender, connection_event_receiver) = mpsc::unbounded_channel();

        Connection {
            shared: Arc::new(ConnectionShared {
                is_server,
                options,
                server_options,
                connection_event_sender,
                state: Mutex::new(ConnectionState {
                    running: false,
                    shutting_down: ShuttingDownState::No,
                    connection_event_receiver: Some(connection_event_receiver),
                    local_settings: SettingsContainer::default(),
                    pending_local_settings: std::collections::VecDeque::new(),
                    next_settings_token: 0,
                    remote_settings: SettingsContainer::default(),
                    remote_settings_known: false,
                    pending_pings: HashMap::new(),
                    next_ping_counter: 0,
                    streams: StreamSet::new(is_server),
                    upper_sent_stream_id: None,
                    transport: TransportInfo::default(),
                    last_activity: Instant::now(),
                }),
                send_window: AtomicI32::new(INITIAL_CONNECTION_WINDOW_SIZE),
                recv_window: AtomicI32::new(INITIAL_CONNECTION_WINDOW_SIZE),
            }),
        }
    }

    /// Runs the connection driver. Must be called exactly once and polled
    /// until completion even after the embedder loses interest, so that
    /// in-flight streams settle and the GOAWAY exchange happens.
    pub fn run(
        &self,
        initial_state: ConnectionInitialState,
        transport: TransportInfo,
        reader: DynReader,
        writer: DynWriter,
    ) -> impl std::future::Future<Output = Result<()>> + Send + 'static {
        Self::run_inner(self.shared.clone(), initial_state, transport, reader, writer)
    }

    async fn run_inner(
        shared: Arc<ConnectionShared>,
        initial_state: ConnectionInitialState,
        transport: TransportInfo,
        reader: DynReader,
        writer: DynWriter,
    ) -> Result<()> {
        {
            let mut state = shared.state.lock().await;
            if state.running {
                return Err(Error::Usage("run() can only be called once per connection"));
            }
            state.running = true;
            state.transport = transport;
        }

        // The reader gets its own task so ingress keeps flowing while the
        // writer blocks on the socket.
        let reader_task = tokio::spawn(
            ConnectionReader::new(shared.clone()).run(reader, initial_state.seen_preface_head),
        );

        let idle_task = shared
            .options
            .idle_timeout
            .map(|timeout| tokio::spawn(Self::idle_watchdog(shared.clone(), timeout)));

        let result = ConnectionWriter::new(shared.clone())
            .run(writer, initial_state.upgrade_payload)
            .await;

        reader_task.abort();
        if let Some(task) = idle_task {
            task.abort();
        }

        let mut state = shared.state.lock().await;
        let had_remote_goaway = state.shutting_down == ShuttingDownState::GracefulRemote;
        state.shutting_down = ShuttingDownState::Complete;

        // Dropping the registry entries closes the per-stream channels,
        // which ends the handler tasks.
        state.streams.clear();
        state.pending_pings.clear();
        drop(state);

        // A peer that said goodbye first is allowed to just hang up.
        match result {
            Err(Error::Io(_)) if had_remote_goaway => Ok(()),
            other => other,
        }
    }

    async fn idle_watchdog(shared: Arc<ConnectionShared>, timeout: std::time::Duration) {
        loop {
            tokio::time::sleep(timeout / 2).await;

            let idle_for = shared.state.lock().await.last_activity.elapsed();
            if idle_for >= timeout {
                tracing::debug!(?idle_for, "closing idle connection");
                Self::shutdown_impl(&shared, true).await;
                return;
            }
        }
    }

    /// Whether new_stream can be expected to succeed.
    pub async fn accepting_requests(&self) -> bool {
        let state = self.shared.state.lock().await;
        !state.shutting_down.is_some()
    }

    /// Opens a locally initiated stream, sending the given header block and
    /// optionally a body. The returned context is the handle for any
    /// further sends on the stream.
    ///
    /// Fails fast with REFUSED_STREAM when the peer's concurrency cap is
    /// reached; nothing is emitted in that case and the attempt is safe to
    /// retry on another connection.
    pub async fn new_stream(
        &self,
        headers: Headers,
        body: Option<Bytes>,
        options: SendOptions,
        callback: Option<Box<dyn StreamCallback>>,
        notifier: Option<Notifier>,
    ) -> Result<StreamContext> {
        if self.shared.is_server {
            return Err(Error::Usage(
                "Servers initiate streams with send_promise, not new_stream",
            ));
        }

        let mut state_guard = self.shared.state.lock().await;
        let state = &mut *state_guard;

        if state.shutting_down.is_some() {
            return Err(ProtocolError {
                code: ErrorCode::REFUSED_STREAM,
                message: "Connection is shutting down",
                local: true,
            }
            .into());
        }

        if let Some(upper) = state.upper_sent_stream_id {
            if state.streams.mine().next_available_stream_id() > upper {
                return Err(ProtocolError {
                    code: ErrorCode::REFUSED_STREAM,
                    message: "Peer sent GOAWAY and will not accept this stream",
                    local: false,
                }
                .into());
            }
        }

        let (send_window, recv_window) = self.shared.initial_stream_windows(state);
        let stream_id = state.streams.new_stream(None, |id| {
            self.shared
                .new_active_stream(id, callback, notifier, send_window, recv_window)
        })?;

        // Posted while still holding the lock so that header blocks hit the
        // wire in stream id order.
        match body {
            Some(body) => {
                self.post(ConnectionEvent::SendHeaders {
                    stream_id,
                    headers,
                    end_stream: false,
                })?;
                self.post(ConnectionEvent::SendData {
                    stream_id,
                    data: body,
                    end_stream: options.end_stream,
                })?;
            }
            None => {
                self.post(ConnectionEvent::SendHeaders {
                    stream_id,
                    headers,
                    end_stream: options.end_stream,
                })?;
            }
        }

        Ok(StreamContext::new(
            stream_id,
            self.shared.connection_event_sender.clone(),
        ))
    }

    /// Sends a header block on an existing stream (e.g. a server response).
    pub async fn send_headers(
        &self,
        stream_id: StreamId,
        headers: Headers,
        options: SendOptions,
    ) -> Result<()> {
        self.post(ConnectionEvent::SendHeaders {
            stream_id,
            headers,
            end_stream: options.end_stream,
        })
    }

    /// Queues body bytes on a stream. Delivery is up to the flow control
    /// scheduler.
    pub async fn send_body(
        &self,
        stream_id: StreamId,
        data: Bytes,
        options: SendOptions,
    ) -> Result<()> {
        self.post(ConnectionEvent::SendData {
            stream_id,
            data,
            end_stream: options.end_stream,
        })
    }

    /// Queues a trailer block, emitted once the stream's body drains.
    /// Trailers always end the stream.
    pub async fn send_trailers(&self, stream_id: StreamId, trailers: Headers) -> Result<()> {
        self.post(ConnectionEvent::SendTrailers {
            stream_id,
            trailers,
        })
    }

    pub async fn rst_stream(&self, stream_id: StreamId, code: ErrorCode) -> Result<()> {
        self.post(ConnectionEvent::RequestReset { stream_id, code })
    }

    /// Reserves a pushed stream on a server and announces it to the client
    /// with a PUSH_PROMISE on the given parent stream. The response is then
    /// sent on the returned context.
    pub async fn send_promise(
        &self,
        stream_id: StreamId,
        headers: Headers,
        callback: Option<Box<dyn StreamCallback>>,
    ) -> Result<StreamContext> {
        if !self.shared.is_server {
            return Err(Error::Usage("Only servers can promise streams"));
        }

        let mut state_guard = self.shared.state.lock().await;
        let state = &mut *state_guard;

        if state.shutting_down.is_some() {
            return Err(ProtocolError {
                code: ErrorCode::REFUSED_STREAM,
                message: "Connection is shutting down",
                local: true,
            }
            .into());
        }

        if state.remote_settings[crate::proto::SettingId::ENABLE_PUSH] == 0 {
            return Err(ProtocolError {
                code: ErrorCode::PROTOCOL_ERROR,
                message: "The peer disabled server push",
                local: true,
            }
            .into());
        }

        if state.streams.classify(stream_id) != StreamKind::Active {
            return Err(Error::Usage("Cannot promise on an inactive stream"));
        }

        let (send_window, recv_window) = self.shared.initial_stream_windows(state);
        let promised_stream_id = state.streams.new_stream(None, |id| {
            self.shared
                .new_active_stream(id, callback, None, send_window, recv_window)
        })?;

        // Posted under the lock to keep promises in id order on the wire.
        self.post(ConnectionEvent::SendPushPromise {
            stream_id,
            promised_stream_id,
            headers,
        })?;

        Ok(StreamContext::new(
            promised_stream_id,
            self.shared.connection_event_sender.clone(),
        ))
    }

    /// Polls the final outcome of a stream. Returns NotReady until the
    /// stream closed; fetching a ready result consumes it.
    ///
    /// Bodies are decompressed according to their Content-Encoding header.
    pub async fn get_response(&self, stream_id: StreamId) -> Result<ResponsePoll> {
        let result = {
            let mut state = self.shared.state.lock().await;

            match state.streams.classify(stream_id) {
                StreamKind::Idle | StreamKind::Active => return Ok(ResponsePoll::NotReady),
                StreamKind::Closed => match state.streams.get_closed_mut(stream_id) {
                    Some(closed) => match closed.response.take() {
                        Some(result) => {
                            state.streams.discard_closed(stream_id);
                            result
                        }
                        None => return Ok(ResponsePoll::Garbage),
                    },
                    // Implicitly closed: whatever there was is gone.
                    None => return Ok(ResponsePoll::Garbage),
                },
            }
        };

        Ok(ResponsePoll::Ready(decode_body(result)?))
    }

    /// Ids of all currently active streams.
    pub async fn get_streams(&self) -> Vec<StreamId> {
        self.shared.state.lock().await.streams.active_stream_ids()
    }

    pub async fn get_peer(&self) -> Option<SocketAddr> {
        self.shared.state.lock().await.transport.peer_addr
    }

    /// Identity material of the peer as reported by the transport, e.g. the
    /// DER encoded TLS certificate.
    pub async fn get_peer_identity(&self) -> Option<Bytes> {
        self.shared.state.lock().await.transport.peer_identity.clone()
    }

    /// Sends a PING to the remote endpoint. The acknowledgement is
    /// delivered to the notifier as a Pong notice carrying the same opaque
    /// bytes.
    pub async fn send_ping(&self, notifier: Option<Notifier>) -> Result<()> {
        let opaque_data = {
            let mut state = self.shared.state.lock().await;
            let counter = state.next_ping_counter;
            state.next_ping_counter += 1;
            counter.to_be_bytes()
        };

        self.post(ConnectionEvent::SendPing {
            opaque_data,
            notifier,
        })
    }

    /// Sends a SETTINGS frame updating the given parameters. The new values
    /// take effect once the peer acknowledges them.
    pub async fn update_settings(&self, parameters: Vec<SettingsParameter>) -> Result<()> {
        // Validate eagerly so the embedder gets the error, not the writer.
        let mut scratch = SettingsContainer::default();
        for param in &parameters {
            scratch.set(param.id, param.value)?;
        }

        self.post(ConnectionEvent::UpdateSettings { parameters })
    }

    /// Grants additional receive window to the peer. stream_id 0 grows the
    /// connection level window. This is how embedders running with manual
    /// flow control return quota.
    pub async fn send_window_update(&self, stream_id: StreamId, increment: u32) -> Result<()> {
        self.post(ConnectionEvent::SendWindowUpdate {
            stream_id,
            increment,
        })
    }

    /// Requests a scheduler pass. Normally not needed, but harmless.
    pub async fn poke_scheduler(&self) -> Result<()> {
        self.post(ConnectionEvent::StreamWrite {
            scope: SendScope::All,
        })
    }

    /// Starts shutting the connection down with a NO_ERROR GOAWAY. With
    /// graceful set, in-flight streams are drained first (bounded by the
    /// configured graceful shutdown timeout); otherwise the connection
    /// closes as soon as the GOAWAY is flushed.
    pub async fn shutdown(&self, graceful: bool) {
        Self::shutdown_impl(&self.shared, graceful).await
    }

    /// Stops the connection without waiting for stream completion.
    pub async fn stop(&self) {
        Self::shutdown_impl(&self.shared, false).await
    }

    fn shutdown_impl<'a>(
        shared: &'a Arc<ConnectionShared>,
        graceful: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            {
                let mut state = shared.state.lock().await;

                match state.shutting_down {
                    ShuttingDownState::Complete => return,
                    ShuttingDownState::Graceful if graceful => return,
                    _ => {}
                }

                if graceful {
                    state.shutting_down = ShuttingDownState::Graceful;

                    let shared = shared.clone();
                    let timeout = shared.options.graceful_shutdown_timeout;
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        Self::shutdown_impl(&shared, false).await;
                    });
                } else {
                    state.shutting_down = ShuttingDownState::Complete;
                }
            }

            let error = ProtocolError {
                code: ErrorCode::NO_ERROR,
                message: "Shutting down",
                local: true,
            };

            let _ = shared.connection_event_sender.send(ConnectionEvent::Closing {
                send_goaway: Some(error),
                close_with: if graceful { None } else { Some(Ok(())) },
            });
        })
    }

    fn post(&self, event: ConnectionEvent) -> Result<()> {
        self.shared
            .connection_event_sender
            .send(event)
            .map_err(|_| Error::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use crate::frame_utils;
    use crate::headers::Header;
    use crate::proto::*;
    use crate::stream::{StreamCallback, StreamCallbackFactory, StreamContext};

    fn h(name: &'static str, value: &'static str) -> Header {
        Header::new(name.as_bytes(), value.as_bytes())
    }

    fn request_headers(path: &'static str) -> Headers {
        vec![
            h(":method", "GET"),
            h(":scheme", "http"),
            h(":path", path),
            h(":authority", "localhost"),
        ]
    }

    /// Server callback that answers every request with the request path as
    /// the body once the request finishes.
    struct EchoServer;

    struct EchoStream {
        request_path: Vec<u8>,
    }

    impl EchoStream {
        fn respond(&self, stream: &StreamContext) {
            let _ = stream.send_headers(vec![h(":status", "200")], false);
            let _ = stream.send_data(bytes::Bytes::from(self.request_path.clone()), true);
        }
    }

    impl StreamCallbackFactory for EchoServer {
        fn create(&self, _stream: &StreamContext) -> Box<dyn StreamCallback> {
            Box::new(EchoStream {
                request_path: vec![],
            })
        }
    }

    impl StreamCallback for EchoStream {
        fn on_headers(&mut self, stream: &StreamContext, headers: &[Header], end_stream: bool) {
            if let Some(path) = crate::headers::find_header(headers, ":path") {
                self.request_path.extend_from_slice(path);
            }

            if end_stream {
                self.respond(stream);
            }
        }

        fn on_data(&mut self, stream: &StreamContext, _data: &[u8], end_stream: bool) {
            if end_stream {
                self.respond(stream);
            }
        }
    }

    fn connected_pair() -> (
        Connection,
        Connection,
        tokio::task::JoinHandle<Result<()>>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        connected_pair_with(ConnectionOptions::default())
    }

    fn connected_pair_with(
        server_options: ConnectionOptions,
    ) -> (
        Connection,
        Connection,
        tokio::task::JoinHandle<Result<()>>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (client_io, server_io) = duplex(1 << 20);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        let server = Connection::new(
            server_options,
            Some(ServerConnectionOptions {
                request_callback: Arc::new(EchoServer),
            }),
        );
        let server_task = tokio::spawn(server.run(
            ConnectionInitialState::raw(),
            TransportInfo::default(),
            Box::new(server_read),
            Box::new(server_write),
        ));

        let client = Connection::new(ConnectionOptions::default(), None);
        let client_task = tokio::spawn(client.run(
            ConnectionInitialState::raw(),
            TransportInfo::default(),
            Box::new(client_read),
            Box::new(client_write),
        ));

        (client, server, client_task, server_task)
    }

    async fn wait_for_response(client: &Connection, stream_id: StreamId) -> ResponsePoll {
        for _ in 0..200 {
            match client.get_response(stream_id).await.unwrap() {
                ResponsePoll::NotReady => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await
                }
                ready => return ready,
            }
        }
        panic!("stream {} never finished", stream_id);
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let (client, _server, _ct, _st) = connected_pair();

        let stream = client
            .new_stream(
                request_headers("/hello"),
                None,
                SendOptions { end_stream: true },
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(stream.stream_id, 1);

        let response = wait_for_response(&client, stream.stream_id).await;
        match response {
            ResponsePoll::Ready(result) => {
                assert_eq!(
                    crate::headers::find_header(&result.headers, ":status")
                        .unwrap()
                        .as_ref(),
                    b"200"
                );
                assert_eq!(&result.body[..], b"/hello");
            }
            other => panic!("unexpected response: {:?}", other),
        }

        // A consumed response is gone.
        assert_eq!(
            client.get_response(stream.stream_id).await.unwrap(),
            ResponsePoll::Garbage
        );
    }

    #[tokio::test]
    async fn multiple_streams_multiplex_on_one_connection() {
        let (client, _server, _ct, _st) = connected_pair();

        let s1 = client
            .new_stream(
                request_headers("/one"),
                None,
                SendOptions { end_stream: true },
                None,
                None,
            )
            .await
            .unwrap();
        let s2 = client
            .new_stream(
                request_headers("/two"),
                None,
                SendOptions { end_stream: true },
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!((s1.stream_id, s2.stream_id), (1, 3));

        for (id, expected) in [(1, b"/one".as_slice()), (3, b"/two".as_slice())] {
            match wait_for_response(&client, id).await {
                ResponsePoll::Ready(result) => assert_eq!(&result.body[..], expected),
                other => panic!("unexpected response: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn request_with_body_is_delivered() {
        let (client, _server, _ct, _st) = connected_pair();

        let stream = client
            .new_stream(
                request_headers("/post"),
                Some(Bytes::from_static(b"payload bytes")),
                SendOptions { end_stream: true },
                None,
                None,
            )
            .await
            .unwrap();

        match wait_for_response(&client, stream.stream_id).await {
            ResponsePoll::Ready(result) => assert_eq!(&result.body[..], b"/post"),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn ping_round_trips_to_the_notifier() {
        let (client, _server, _ct, _st) = connected_pair();

        let (notifier, mut notices) = mpsc::unbounded_channel();
        client.send_ping(Some(notifier)).await.unwrap();

        let notice = tokio::time::timeout(std::time::Duration::from_secs(5), notices.recv())
            .await
            .expect("timed out waiting for pong")
            .unwrap();

        match notice {
            Notice::Pong { opaque_data } => {
                assert_eq!(opaque_data, 0u64.to_be_bytes());
            }
            other => panic!("unexpected notice: {:?}", other),
        }
    }

    #[tokio::test]
    async fn end_stream_notice_is_delivered() {
        let (client, _server, _ct, _st) = connected_pair();

        let (notifier, mut notices) = mpsc::unbounded_channel();
        let stream = client
            .new_stream(
                request_headers("/notify"),
                None,
                SendOptions { end_stream: true },
                None,
                Some(notifier),
            )
            .await
            .unwrap();

        let notice = tokio::time::timeout(std::time::Duration::from_secs(5), notices.recv())
            .await
            .expect("timed out waiting for end of stream")
            .unwrap();
        assert_eq!(
            notice,
            Notice::EndStream {
                stream_id: stream.stream_id
            }
        );
    }

    #[tokio::test]
    async fn server_refuses_streams_beyond_the_advertised_cap() {
        let mut server_options = ConnectionOptions::default();
        server_options
            .protocol_settings
            .set(SettingId::MAX_CONCURRENT_STREAMS, 2)
            .unwrap();

        let (client, _server, _ct, _st) = connected_pair_with(server_options);

        // Wait until the client has learned the peer's stream cap.
        for _ in 0..200 {
            if client.shared.state.lock().await.remote_settings_known {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(client.shared.state.lock().await.remote_settings_known);

        let s1 = client
            .new_stream(request_headers("/a"), None, SendOptions::default(), None, None)
            .await
            .unwrap();
        let s2 = client
            .new_stream(request_headers("/b"), None, SendOptions::default(), None, None)
            .await
            .unwrap();
        assert_eq!((s1.stream_id, s2.stream_id), (1, 3));

        let err = client
            .new_stream(request_headers("/c"), None, SendOptions::default(), None, None)
            .await
            .unwrap_err();
        match err {
            Error::Protocol(e) => assert_eq!(e.code, ErrorCode::REFUSED_STREAM),
            other => panic!("unexpected error: {:?}", other),
        }

        // No id was burned for the refused stream.
        {
            let state = client.shared.state.lock().await;
            assert_eq!(state.streams.mine().next_available_stream_id(), 5);
        }
    }

    /// Drives a server connection with raw bytes, returning the io handle
    /// for direct frame-level assertions.
    fn raw_server() -> (
        tokio::io::DuplexStream,
        Connection,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (peer_io, server_io) = duplex(1 << 16);
        let (server_read, server_write) = tokio::io::split(server_io);

        let server = Connection::new(
            ConnectionOptions::default(),
            Some(ServerConnectionOptions {
                request_callback: Arc::new(EchoServer),
            }),
        );
        let task = tokio::spawn(server.run(
            ConnectionInitialState::raw(),
            TransportInfo::default(),
            Box::new(server_read),
            Box::new(server_write),
        ));

        (peer_io, server, task)
    }

    /// Reads frames from the raw side until one of the given type shows up.
    async fn read_frame_of_type(
        io: &mut tokio::io::DuplexStream,
        typ: FrameType,
    ) -> (FrameHeader, Vec<u8>) {
        loop {
            let mut header_buf = [0u8; 9];
            io.read_exact(&mut header_buf).await.unwrap();
            let header = FrameHeader::parse_complete(&header_buf);

            let mut payload = vec![0u8; header.length as usize];
            io.read_exact(&mut payload).await.unwrap();

            if header.typ == typ {
                return (header, payload);
            }
        }
    }

    #[tokio::test]
    async fn bad_preface_closes_the_socket_without_goaway() {
        let (mut peer, _server, task) = raw_server();

        peer.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        // The server hangs up without writing anything beyond its SETTINGS.
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn oversized_ping_is_a_frame_size_error() {
        let (mut peer, _server, _task) = raw_server();

        peer.write_all(CONNECTION_PREFACE).await.unwrap();
        peer.write_all(&frame_utils::new_settings_frame(&[])).await.unwrap();

        // PING with length 9.
        let mut frame = vec![];
        FrameHeader {
            length: 9,
            typ: FrameType::PING,
            flags: 0,
            stream_id: 0,
        }
        .serialize(&mut frame);
        frame.extend_from_slice(&[0u8; 9]);
        peer.write_all(&frame).await.unwrap();

        let (_, payload) = read_frame_of_type(&mut peer, FrameType::GOAWAY).await;
        let goaway = GoawayFramePayload::parse_complete(Bytes::from(payload)).unwrap();
        assert_eq!(goaway.error_code, ErrorCode::FRAME_SIZE_ERROR);
    }

    #[tokio::test]
    async fn continuation_interleaving_is_a_protocol_error() {
        let (mut peer, _server, _task) = raw_server();

        peer.write_all(CONNECTION_PREFACE).await.unwrap();
        peer.write_all(&frame_utils::new_settings_frame(&[])).await.unwrap();

        // HEADERS without END_HEADERS on stream 1, then DATA on the same
        // stream. The DATA frame must kill the connection.
        let mut frame = vec![];
        FrameHeader {
            length: 0,
            typ: FrameType::HEADERS,
            flags: 0,
            stream_id: 1,
        }
        .serialize(&mut frame);
        peer.write_all(&frame).await.unwrap();

        peer.write_all(&frame_utils::new_data_frame(1, b"x", false))
            .await
            .unwrap();

        let (_, payload) = read_frame_of_type(&mut peer, FrameType::GOAWAY).await;
        let goaway = GoawayFramePayload::parse_complete(Bytes::from(payload)).unwrap();
        assert_eq!(goaway.error_code, ErrorCode::PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn first_frame_must_be_settings() {
        let (mut peer, _server, _task) = raw_server();

        peer.write_all(CONNECTION_PREFACE).await.unwrap();
        peer.write_all(&frame_utils::new_ping_frame([0u8; 8], false))
            .await
            .unwrap();

        let (_, payload) = read_frame_of_type(&mut peer, FrameType::GOAWAY).await;
        let goaway = GoawayFramePayload::parse_complete(Bytes::from(payload)).unwrap();
        assert_eq!(goaway.error_code, ErrorCode::PROTOCOL_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_settings_time_out() {
        let (mut peer, client_io) = duplex(1 << 16);
        let (client_read, client_write) = tokio::io::split(client_io);

        let client = Connection::new(ConnectionOptions::default(), None);
        let task = tokio::spawn(client.run(
            ConnectionInitialState::raw(),
            TransportInfo::default(),
            Box::new(client_read),
            Box::new(client_write),
        ));

        // The fake server completes the handshake but never acknowledges
        // the client's settings; the 5 second ack timer must fire.
        peer.write_all(&frame_utils::new_settings_frame(&[]))
            .await
            .unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(60), task)
            .await
            .unwrap()
            .unwrap();

        match result {
            Err(Error::Protocol(error)) => {
                assert_eq!(error.code, ErrorCode::SETTINGS_TIMEOUT);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // The GOAWAY made it onto the wire before the connection stopped.
        let (_, payload) = read_frame_of_type(&mut peer, FrameType::GOAWAY).await;
        let goaway = GoawayFramePayload::parse_complete(Bytes::from(payload)).unwrap();
        assert_eq!(goaway.error_code, ErrorCode::SETTINGS_TIMEOUT);
    }

    #[tokio::test]
    async fn shutdown_completes_the_driver_cleanly() {
        let (client, _server, client_task, _st) = connected_pair();

        client.shutdown(false).await;

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), client_task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
