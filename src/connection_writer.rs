use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::connection_shared::*;
use crate::connection_state::*;
use crate::frame_utils;
use crate::hpack::HeaderEncoder;
use crate::proto::*;
use crate::settings::PendingLocalSettings;
use crate::stream::StreamEvent;
use crate::stream_set::{try_add_window, QueuedData, SendScope};
use crate::types::*;

/// The task that owns the write half of the transport, the HPACK encode
/// context and all mutations that put frames on the wire. Every other
/// component talks to it through ConnectionEvents, which also fixes the
/// order in which frames are emitted.
pub struct ConnectionWriter {
    shared: Arc<ConnectionShared>,
}

impl ConnectionWriter {
    pub fn new(shared: Arc<ConnectionShared>) -> Self {
        Self { shared }
    }

    pub async fn run(
        self,
        mut writer: DynWriter,
        upgrade_payload: Option<Bytes>,
    ) -> Result<()> {
        // Anything left over from a protocol upgrade goes out before the
        // first HTTP2 byte.
        if let Some(payload) = upgrade_payload {
            writer.write_all(&payload).await?;
        }

        if !self.shared.is_server {
            writer.write_all(CONNECTION_PREFACE).await?;
        }

        let mut connection_event_receiver;
        {
            let mut state = self.shared.state.lock().await;

            connection_event_receiver = state
                .connection_event_receiver
                .take()
                .ok_or(Error::Usage("run() can only be called once per connection"))?;

            // Our initial SETTINGS frame: everything that differs from the
            // protocol defaults, recorded as pending until the peer ACKs.
            let settings = self.shared.options.protocol_settings.clone();
            let mut payload = vec![];
            settings.serialize_payload(&state.local_settings, &mut payload);

            let token = state.next_settings_token;
            state.next_settings_token += 1;
            state
                .pending_local_settings
                .push_back(PendingLocalSettings { token, settings });
            self.spawn_settings_ack_timer(token);
            drop(state);

            writer
                .write_all(&frame_utils::new_settings_frame(&payload))
                .await?;
            writer.flush().await?;
        }

        // Used to encode locally created header blocks. Owned exclusively
        // by this task so blocks hit the wire in encode order.
        let mut local_header_encoder = HeaderEncoder::new();

        let mut remote_settings_known = self.shared.state.lock().await.remote_settings_known;

        // Events deferred until we know the peer's settings.
        let mut pending_events: Vec<ConnectionEvent> = vec![];

        loop {
            let event = {
                if remote_settings_known && !pending_events.is_empty() {
                    pending_events.remove(0)
                } else {
                    match connection_event_receiver.recv().await {
                        Some(event) => event,
                        None => return Ok(()),
                    }
                }
            };

            // Until the peer's first SETTINGS frame arrives we only process
            // control events; everything else would bake in wrong limits.
            if !remote_settings_known {
                let allow = matches!(
                    event,
                    ConnectionEvent::AcknowledgeSettings
                        | ConnectionEvent::Closing { .. }
                        | ConnectionEvent::CheckSettingsTimeout { .. }
                        | ConnectionEvent::Ping { .. }
                );
                if !allow {
                    pending_events.push(event);
                    continue;
                }
            }

            match event {
                ConnectionEvent::Ping { ping_frame } => {
                    writer
                        .write_all(&frame_utils::new_ping_frame(ping_frame.opaque_data, true))
                        .await?;
                }
                ConnectionEvent::SendPing {
                    opaque_data,
                    notifier,
                } => {
                    {
                        let mut state = self.shared.state.lock().await;
                        state.pending_pings.insert(
                            opaque_data,
                            PendingPing {
                                notifier,
                                sent_at: Instant::now(),
                            },
                        );
                    }
                    writer
                        .write_all(&frame_utils::new_ping_frame(opaque_data, false))
                        .await?;
                }
                ConnectionEvent::ResetStream { stream_id, error } => {
                    tracing::debug!(stream_id, %error, "sending RST_STREAM");
                    writer
                        .write_all(&frame_utils::new_rst_stream_frame(stream_id, error))
                        .await?;
                }
                ConnectionEvent::RequestReset { stream_id, code } => {
                    let mut state = self.shared.state.lock().await;
                    if let Some(stream) = state.streams.get_active_mut(stream_id) {
                        let _ = stream.events.send(StreamEvent::LocalReset { code });
                    }
                }
                ConnectionEvent::Closing {
                    send_goaway,
                    close_with,
                } => {
                    if let Some(error) = send_goaway {
                        let last_stream_id = {
                            let mut state = self.shared.state.lock().await;
                            state.shutting_down = ShuttingDownState::Complete;
                            state.streams.highest_peer_stream_id()
                        };

                        writer
                            .write_all(&frame_utils::new_goaway_frame(
                                last_stream_id,
                                error.clone(),
                            ))
                            .await?;
                        writer.flush().await?;

                        if error.code != ErrorCode::NO_ERROR {
                            return Err(error.into());
                        }
                    }

                    match close_with {
                        Some(result) => {
                            writer.flush().await?;
                            return result;
                        }
                        None => {
                            // Graceful: keep draining until the last stream
                            // finishes.
                            let state = self.shared.state.lock().await;
                            if !state.streams.has_active_streams() {
                                return Ok(());
                            }
                        }
                    }
                }
                ConnectionEvent::AcknowledgeSettings => {
                    writer
                        .write_all(&frame_utils::new_settings_ack_frame())
                        .await?;
                    remote_settings_known = true;
                }
                ConnectionEvent::SendHeaders {
                    stream_id,
                    headers,
                    end_stream,
                } => {
                    let (events, max_frame_size) = {
                        let mut state_guard = self.shared.state.lock().await;
                        let state = &mut *state_guard;

                        let max_frame_size =
                            state.remote_settings[SettingId::MAX_FRAME_SIZE] as usize;

                        let stream = match state.streams.get_active_mut(stream_id) {
                            Some(stream) => stream,
                            // The stream died before we got to send its
                            // headers. Nothing to do.
                            None => continue,
                        };

                        stream.headers_sent = true;
                        if end_stream {
                            stream.body_complete = true;
                            stream.queued = QueuedData::Done;
                        }

                        (stream.events.clone(), max_frame_size)
                    };

                    let block = local_header_encoder.encode_block(&headers);
                    writer
                        .write_all(&frame_utils::new_headers_frames(
                            stream_id,
                            &block,
                            end_stream,
                            max_frame_size,
                        ))
                        .await?;

                    let _ = events.send(StreamEvent::LocalHeadersSent { end_stream });
                }
                ConnectionEvent::SendData {
                    stream_id,
                    data,
                    end_stream,
                } => {
                    let frames = {
                        let mut state_guard = self.shared.state.lock().await;
                        let state = &mut *state_guard;

                        let updated = state.streams.update(stream_id, |stream| {
                            stream.queue_data(&data);
                            if end_stream {
                                stream.complete_body();
                            }
                        });
                        if !updated {
                            continue;
                        }

                        self.run_scheduler(
                            state,
                            SendScope::Stream(stream_id),
                            &mut local_header_encoder,
                        )
                    };

                    writer.write_all(&frames).await?;
                }
                ConnectionEvent::SendTrailers {
                    stream_id,
                    trailers,
                } => {
                    let frames = {
                        let mut state_guard = self.shared.state.lock().await;
                        let state = &mut *state_guard;

                        let updated = state.streams.update(stream_id, |stream| {
                            stream.trailers = Some(trailers);
                            stream.complete_body();
                        });
                        if !updated {
                            continue;
                        }

                        self.run_scheduler(
                            state,
                            SendScope::Stream(stream_id),
                            &mut local_header_encoder,
                        )
                    };

                    writer.write_all(&frames).await?;
                }
                ConnectionEvent::SendPushPromise {
                    stream_id,
                    promised_stream_id,
                    headers,
                } => {
                    let (events, max_frame_size) = {
                        let mut state_guard = self.shared.state.lock().await;
                        let state = &mut *state_guard;

                        let max_frame_size =
                            state.remote_settings[SettingId::MAX_FRAME_SIZE] as usize;

                        let promised = match state.streams.get_active_mut(promised_stream_id) {
                            Some(stream) => stream.events.clone(),
                            None => continue,
                        };

                        (promised, max_frame_size)
                    };

                    let block = local_header_encoder.encode_block(&headers);
                    writer
                        .write_all(&frame_utils::new_push_promise_frames(
                            stream_id,
                            promised_stream_id,
                            &block,
                            max_frame_size,
                        ))
                        .await?;

                    let _ = events.send(StreamEvent::LocalPromiseSent);
                }
                ConnectionEvent::StreamWrite { scope } => {
                    let frames = {
                        let mut state_guard = self.shared.state.lock().await;
                        let state = &mut *state_guard;
                        self.run_scheduler(state, scope, &mut local_header_encoder)
                    };

                    writer.write_all(&frames).await?;
                }
                ConnectionEvent::StreamRead { stream_id, count } => {
                    // Quota was consumed locally; hand it back to the peer.
                    let _ = try_add_window(&self.shared.recv_window, count as WindowSize);

                    let stream_alive = if stream_id != 0 {
                        let mut state = self.shared.state.lock().await;
                        match state.streams.get_active_mut(stream_id) {
                            Some(stream) => {
                                stream.recv_window =
                                    stream.recv_window.saturating_add(count as WindowSize);
                                true
                            }
                            None => false,
                        }
                    } else {
                        false
                    };

                    writer
                        .write_all(&frame_utils::new_window_update_frame(0, count as u32))
                        .await?;
                    if stream_alive {
                        writer
                            .write_all(&frame_utils::new_window_update_frame(
                                stream_id,
                                count as u32,
                            ))
                            .await?;
                    }
                }
                ConnectionEvent::SendWindowUpdate {
                    stream_id,
                    increment,
                } => {
                    if stream_id == 0 {
                        let _ =
                            try_add_window(&self.shared.recv_window, increment as WindowSize);
                    } else {
                        let mut state = self.shared.state.lock().await;
                        if let Some(stream) = state.streams.get_active_mut(stream_id) {
                            stream.recv_window =
                                stream.recv_window.saturating_add(increment as WindowSize);
                        }
                    }

                    writer
                        .write_all(&frame_utils::new_window_update_frame(stream_id, increment))
                        .await?;
                }
                ConnectionEvent::UpdateSettings { parameters } => {
                    let payload = {
                        let mut state = self.shared.state.lock().await;

                        // The new frame builds on whatever the peer will
                        // have acknowledged once it gets to this one.
                        let base = state
                            .pending_local_settings
                            .back()
                            .map(|p| p.settings.clone())
                            .unwrap_or_else(|| state.local_settings.clone());

                        let mut next = base.clone();
                        for param in parameters {
                            // Validated on the embedder side already.
                            let _ = next.set(param.id, param.value);
                        }

                        let mut payload = vec![];
                        next.serialize_payload(&base, &mut payload);

                        let token = state.next_settings_token;
                        state.next_settings_token += 1;
                        state
                            .pending_local_settings
                            .push_back(PendingLocalSettings {
                                token,
                                settings: next,
                            });
                        self.spawn_settings_ack_timer(token);

                        payload
                    };

                    writer
                        .write_all(&frame_utils::new_settings_frame(&payload))
                        .await?;
                }
                ConnectionEvent::CheckSettingsTimeout { token } => {
                    let expired = {
                        let state = self.shared.state.lock().await;
                        state
                            .pending_local_settings
                            .front()
                            .map(|p| p.token == token)
                            .unwrap_or(false)
                    };

                    if expired {
                        let error = ProtocolError {
                            code: ErrorCode::SETTINGS_TIMEOUT,
                            message: "Settings were not acknowledged in time",
                            local: true,
                        };

                        let last_stream_id = {
                            let mut state = self.shared.state.lock().await;
                            state.shutting_down = ShuttingDownState::Complete;
                            state.streams.highest_peer_stream_id()
                        };

                        writer
                            .write_all(&frame_utils::new_goaway_frame(
                                last_stream_id,
                                error.clone(),
                            ))
                            .await?;
                        writer.flush().await?;
                        return Err(error.into());
                    }
                }
                ConnectionEvent::StreamFinished {
                    stream_id,
                    result,
                    error,
                } => {
                    let mut state = self.shared.state.lock().await;
                    self.shared
                        .finish_stream(&mut state, stream_id, result, error);
                }
            }

            writer.flush().await?;
        }
    }

    fn run_scheduler(
        &self,
        state: &mut ConnectionState,
        scope: SendScope,
        encoder: &mut HeaderEncoder,
    ) -> Vec<u8> {
        let max_frame_size = state.remote_settings[SettingId::MAX_FRAME_SIZE] as usize;

        let mut out = vec![];
        state.streams.send_what_we_can(
            scope,
            &self.shared.send_window,
            max_frame_size,
            encoder,
            &mut out,
        );

        if !out.is_empty() {
            state.last_activity = Instant::now();
        }

        out
    }

    fn spawn_settings_ack_timer(&self, token: u64) {
        let sender = self.shared.connection_event_sender.clone();
        let timeout = self.shared.options.settings_ack_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = sender.send(ConnectionEvent::CheckSettingsTimeout { token });
        });
    }
}
