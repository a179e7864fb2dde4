// Helpers for constructing outbound protocol frames.

use crate::proto::*;
use crate::types::*;

pub fn new_data_frame(stream_id: StreamId, data: &[u8], end_stream: bool) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FrameHeader::size_of() + data.len());
    FrameHeader {
        length: data.len() as u32,
        typ: FrameType::DATA,
        flags: DataFrameFlags {
            end_stream,
            padded: false,
        }
        .to_u8(),
        stream_id,
    }
    .serialize(&mut frame);

    frame.extend_from_slice(data);
    frame
}

/// Serializes one complete header block as a HEADERS frame followed by zero
/// or more CONTINUATION frames, each at most max_frame_size bytes.
///
/// The frames are returned in one buffer so that the writer emits them
/// back to back without anything interleaved.
pub fn new_headers_frames(
    stream_id: StreamId,
    block: &[u8],
    end_stream: bool,
    max_frame_size: usize,
) -> Vec<u8> {
    let mut out = vec![];

    let mut chunks = block.chunks(max_frame_size.max(1)).peekable();
    let mut first = true;

    // An empty block still produces one empty HEADERS frame.
    loop {
        let chunk: &[u8] = chunks.next().unwrap_or(&[]);
        let last = chunks.peek().is_none();

        if first {
            FrameHeader {
                length: chunk.len() as u32,
                typ: FrameType::HEADERS,
                flags: HeadersFrameFlags {
                    end_stream,
                    end_headers: last,
                    padded: false,
                    priority: false,
                }
                .to_u8(),
                stream_id,
            }
            .serialize(&mut out);
        } else {
            FrameHeader {
                length: chunk.len() as u32,
                typ: FrameType::CONTINUATION,
                flags: ContinuationFrameFlags { end_headers: last }.to_u8(),
                stream_id,
            }
            .serialize(&mut out);
        }

        out.extend_from_slice(chunk);
        first = false;

        if last {
            break;
        }
    }

    out
}

/// Serializes a PUSH_PROMISE frame (with CONTINUATIONs as needed) reserving
/// promised_stream_id on the stream identified by stream_id.
pub fn new_push_promise_frames(
    stream_id: StreamId,
    promised_stream_id: StreamId,
    block: &[u8],
    max_frame_size: usize,
) -> Vec<u8> {
    let mut out = vec![];

    // The 4 byte promised stream id counts against the frame size limit.
    let first_chunk_size = max_frame_size.saturating_sub(4).max(1).min(block.len());
    let (first_chunk, mut rest) = block.split_at(first_chunk_size);

    FrameHeader {
        length: (first_chunk.len() + 4) as u32,
        typ: FrameType::PUSH_PROMISE,
        flags: PushPromiseFrameFlags {
            end_headers: rest.is_empty(),
            padded: false,
        }
        .to_u8(),
        stream_id,
    }
    .serialize(&mut out);
    out.extend_from_slice(&promised_stream_id.to_be_bytes());
    out.extend_from_slice(first_chunk);

    while !rest.is_empty() {
        let n = rest.len().min(max_frame_size.max(1));
        let (chunk, remaining) = rest.split_at(n);
        rest = remaining;

        FrameHeader {
            length: chunk.len() as u32,
            typ: FrameType::CONTINUATION,
            flags: ContinuationFrameFlags {
                end_headers: rest.is_empty(),
            }
            .to_u8(),
            stream_id,
        }
        .serialize(&mut out);
        out.extend_from_slice(chunk);
    }

    out
}

pub fn new_rst_stream_frame(stream_id: StreamId, error: ProtocolError) -> Vec<u8> {
    let mut frame = vec![];
    FrameHeader {
        length: RstStreamFramePayload::size_of() as u32,
        typ: FrameType::RST_STREAM,
        flags: 0,
        stream_id,
    }
    .serialize(&mut frame);

    RstStreamFramePayload {
        error_code: error.code,
    }
    .serialize(&mut frame);

    frame
}

pub fn new_settings_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FrameHeader::size_of() + payload.len());
    FrameHeader {
        length: payload.len() as u32,
        typ: FrameType::SETTINGS,
        flags: 0,
        stream_id: 0,
    }
    .serialize(&mut frame);

    frame.extend_from_slice(payload);
    frame
}

pub fn new_settings_ack_frame() -> Vec<u8> {
    let mut frame = vec![];
    FrameHeader {
        length: 0,
        typ: FrameType::SETTINGS,
        flags: SettingsFrameFlags { ack: true }.to_u8(),
        stream_id: 0,
    }
    .serialize(&mut frame);

    frame
}

pub fn new_ping_frame(opaque_data: [u8; 8], ack: bool) -> Vec<u8> {
    let mut frame = vec![];
    FrameHeader {
        length: PingFramePayload::size_of() as u32,
        typ: FrameType::PING,
        flags: PingFrameFlags { ack }.to_u8(),
        stream_id: 0,
    }
    .serialize(&mut frame);

    PingFramePayload { opaque_data }.serialize(&mut frame);
    frame
}

pub fn new_goaway_frame(last_stream_id: StreamId, error: ProtocolError) -> Vec<u8> {
    let mut frame = vec![];

    let debug_data = error.message.as_bytes();
    FrameHeader {
        length: (8 + debug_data.len()) as u32,
        typ: FrameType::GOAWAY,
        flags: 0,
        stream_id: 0,
    }
    .serialize(&mut frame);

    GoawayFramePayload {
        last_stream_id,
        error_code: error.code,
        additional_debug_data: bytes::Bytes::copy_from_slice(debug_data),
    }
    .serialize(&mut frame);

    frame
}

pub fn new_window_update_frame(stream_id: StreamId, increment: u32) -> Vec<u8> {
    let mut frame = vec![];
    FrameHeader {
        length: WindowUpdateFramePayload::size_of() as u32,
        typ: FrameType::WINDOW_UPDATE,
        flags: 0,
        stream_id,
    }
    .serialize(&mut frame);

    WindowUpdateFramePayload {
        window_size_increment: increment,
    }
    .serialize(&mut frame);

    frame
}

/// Padding in DATA/HEADERS/PUSH_PROMISE frames must be all zeros.
pub fn check_padding(padding: &[u8]) -> Result<()> {
    for byte in padding {
        if *byte != 0 {
            return Err(ProtocolError {
                code: ErrorCode::PROTOCOL_ERROR,
                message: "Received non-zero padding bytes",
                local: true,
            }
            .into());
        }
    }

    Ok(())
}
