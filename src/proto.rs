// Wire level definitions for the HTTP2 framing layer from RFC 7540 Section 4
// and Section 6: the fixed 9 byte frame header, the per-type flag bits and the
// typed frame payloads.

use bytes::{Buf, BufMut, Bytes};

use crate::types::{ProtocolError, StreamId};

/// Mask for the 31 low bits holding a stream id. The top bit of the wire
/// encoding is reserved and must be ignored on receipt.
const STREAM_ID_MASK: u32 = (1 << 31) - 1;

macro_rules! parse_error {
    ($code:ident, $message:expr) => {
        ProtocolError {
            code: ErrorCode::$code,
            message: $message,
            local: true,
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum FrameType {
    DATA,
    HEADERS,
    PRIORITY,
    RST_STREAM,
    SETTINGS,
    PUSH_PROMISE,
    PING,
    GOAWAY,
    WINDOW_UPDATE,
    CONTINUATION,
    Unknown(u8),
}

impl FrameType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => FrameType::DATA,
            1 => FrameType::HEADERS,
            2 => FrameType::PRIORITY,
            3 => FrameType::RST_STREAM,
            4 => FrameType::SETTINGS,
            5 => FrameType::PUSH_PROMISE,
            6 => FrameType::PING,
            7 => FrameType::GOAWAY,
            8 => FrameType::WINDOW_UPDATE,
            9 => FrameType::CONTINUATION,
            v => FrameType::Unknown(v),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            FrameType::DATA => 0,
            FrameType::HEADERS => 1,
            FrameType::PRIORITY => 2,
            FrameType::RST_STREAM => 3,
            FrameType::SETTINGS => 4,
            FrameType::PUSH_PROMISE => 5,
            FrameType::PING => 6,
            FrameType::GOAWAY => 7,
            FrameType::WINDOW_UPDATE => 8,
            FrameType::CONTINUATION => 9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Error codes from RFC 7540 Section 7. Unknown codes are carried through so
/// that future extensions round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum ErrorCode {
    NO_ERROR,
    PROTOCOL_ERROR,
    INTERNAL_ERROR,
    FLOW_CONTROL_ERROR,
    SETTINGS_TIMEOUT,
    STREAM_CLOSED,
    FRAME_SIZE_ERROR,
    REFUSED_STREAM,
    CANCEL,
    COMPRESSION_ERROR,
    CONNECT_ERROR,
    ENHANCE_YOUR_CALM,
    INADEQUATE_SECURITY,
    HTTP_1_1_REQUIRED,
    Unknown(u32),
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0x0 => ErrorCode::NO_ERROR,
            0x1 => ErrorCode::PROTOCOL_ERROR,
            0x2 => ErrorCode::INTERNAL_ERROR,
            0x3 => ErrorCode::FLOW_CONTROL_ERROR,
            0x4 => ErrorCode::SETTINGS_TIMEOUT,
            0x5 => ErrorCode::STREAM_CLOSED,
            0x6 => ErrorCode::FRAME_SIZE_ERROR,
            0x7 => ErrorCode::REFUSED_STREAM,
            0x8 => ErrorCode::CANCEL,
            0x9 => ErrorCode::COMPRESSION_ERROR,
            0xa => ErrorCode::CONNECT_ERROR,
            0xb => ErrorCode::ENHANCE_YOUR_CALM,
            0xc => ErrorCode::INADEQUATE_SECURITY,
            0xd => ErrorCode::HTTP_1_1_REQUIRED,
            v => ErrorCode::Unknown(v),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            ErrorCode::NO_ERROR => 0x0,
            ErrorCode::PROTOCOL_ERROR => 0x1,
            ErrorCode::INTERNAL_ERROR => 0x2,
            ErrorCode::FLOW_CONTROL_ERROR => 0x3,
            ErrorCode::SETTINGS_TIMEOUT => 0x4,
            ErrorCode::STREAM_CLOSED => 0x5,
            ErrorCode::FRAME_SIZE_ERROR => 0x6,
            ErrorCode::REFUSED_STREAM => 0x7,
            ErrorCode::CANCEL => 0x8,
            ErrorCode::COMPRESSION_ERROR => 0x9,
            ErrorCode::CONNECT_ERROR => 0xa,
            ErrorCode::ENHANCE_YOUR_CALM => 0xb,
            ErrorCode::INADEQUATE_SECURITY => 0xc,
            ErrorCode::HTTP_1_1_REQUIRED => 0xd,
            ErrorCode::Unknown(v) => v,
        }
    }
}

/// Identifiers of SETTINGS parameters from RFC 7540 Section 6.5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum SettingId {
    HEADER_TABLE_SIZE,
    ENABLE_PUSH,
    MAX_CONCURRENT_STREAMS,
    INITIAL_WINDOW_SIZE,
    MAX_FRAME_SIZE,
    MAX_HEADER_LIST_SIZE,
    Unknown(u16),
}

impl SettingId {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => SettingId::HEADER_TABLE_SIZE,
            2 => SettingId::ENABLE_PUSH,
            3 => SettingId::MAX_CONCURRENT_STREAMS,
            4 => SettingId::INITIAL_WINDOW_SIZE,
            5 => SettingId::MAX_FRAME_SIZE,
            6 => SettingId::MAX_HEADER_LIST_SIZE,
            v => SettingId::Unknown(v),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            SettingId::HEADER_TABLE_SIZE => 1,
            SettingId::ENABLE_PUSH => 2,
            SettingId::MAX_CONCURRENT_STREAMS => 3,
            SettingId::INITIAL_WINDOW_SIZE => 4,
            SettingId::MAX_FRAME_SIZE => 5,
            SettingId::MAX_HEADER_LIST_SIZE => 6,
            SettingId::Unknown(v) => v,
        }
    }
}

/// The fixed size header prefixing every frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the frame payload in bytes (24 bits on the wire).
    pub length: u32,
    pub typ: FrameType,
    pub flags: u8,
    pub stream_id: StreamId,
}

impl FrameHeader {
    pub const fn size_of() -> usize {
        9
    }

    /// Decodes a frame header from exactly 9 bytes. This cannot fail since
    /// unknown frame types are preserved and the reserved bit is dropped.
    pub fn parse_complete(buf: &[u8; 9]) -> Self {
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let typ = FrameType::from_u8(buf[3]);
        let flags = buf[4];
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & STREAM_ID_MASK;

        Self {
            length,
            typ,
            flags,
            stream_id,
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.put_uint(self.length as u64, 3);
        out.put_u8(self.typ.to_u8());
        out.put_u8(self.flags);
        out.put_u32(self.stream_id & STREAM_ID_MASK);
    }
}

pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

#[derive(Debug, Clone, Copy, Default)]
pub struct DataFrameFlags {
    pub end_stream: bool,
    pub padded: bool,
}

impl DataFrameFlags {
    pub fn parse(flags: u8) -> Self {
        Self {
            end_stream: flags & FLAG_END_STREAM != 0,
            padded: flags & FLAG_PADDED != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        (if self.end_stream { FLAG_END_STREAM } else { 0 })
            | (if self.padded { FLAG_PADDED } else { 0 })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeadersFrameFlags {
    pub end_stream: bool,
    pub end_headers: bool,
    pub padded: bool,
    pub priority: bool,
}

impl HeadersFrameFlags {
    pub fn parse(flags: u8) -> Self {
        Self {
            end_stream: flags & FLAG_END_STREAM != 0,
            end_headers: flags & FLAG_END_HEADERS != 0,
            padded: flags & FLAG_PADDED != 0,
            priority: flags & FLAG_PRIORITY != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        (if self.end_stream { FLAG_END_STREAM } else { 0 })
            | (if self.end_headers { FLAG_END_HEADERS } else { 0 })
            | (if self.padded { FLAG_PADDED } else { 0 })
            | (if self.priority { FLAG_PRIORITY } else { 0 })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsFrameFlags {
    pub ack: bool,
}

impl SettingsFrameFlags {
    pub fn parse(flags: u8) -> Self {
        Self {
            ack: flags & FLAG_ACK != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        if self.ack {
            FLAG_ACK
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PingFrameFlags {
    pub ack: bool,
}

impl PingFrameFlags {
    pub fn parse(flags: u8) -> Self {
        Self {
            ack: flags & FLAG_ACK != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        if self.ack {
            FLAG_ACK
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PushPromiseFrameFlags {
    pub end_headers: bool,
    pub padded: bool,
}

impl PushPromiseFrameFlags {
    pub fn parse(flags: u8) -> Self {
        Self {
            end_headers: flags & FLAG_END_HEADERS != 0,
            padded: flags & FLAG_PADDED != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        (if self.end_headers { FLAG_END_HEADERS } else { 0 })
            | (if self.padded { FLAG_PADDED } else { 0 })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContinuationFrameFlags {
    pub end_headers: bool,
}

impl ContinuationFrameFlags {
    pub fn parse(flags: u8) -> Self {
        Self {
            end_headers: flags & FLAG_END_HEADERS != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        if self.end_headers {
            FLAG_END_HEADERS
        } else {
            0
        }
    }
}

/// Strips the padding from a padded frame payload. Returns the inner payload
/// and the padding bytes (which must later be verified to be zero).
fn split_padding(mut payload: Bytes) -> Result<(Bytes, Bytes), ProtocolError> {
    if payload.is_empty() {
        return Err(parse_error!(
            PROTOCOL_ERROR,
            "Padded frame too short to hold the pad length"
        ));
    }

    let pad_length = payload.get_u8() as usize;
    if pad_length >= payload.len() {
        // RFC 7540 Section 6.1: padding that exceeds the remaining payload
        // must be treated as a connection error.
        return Err(parse_error!(
            PROTOCOL_ERROR,
            "Frame padding larger than remaining payload"
        ));
    }

    let padding = payload.split_off(payload.len() - pad_length);
    Ok((payload, padding))
}

#[derive(Debug, Clone)]
pub struct DataFramePayload {
    pub data: Bytes,
    pub padding: Bytes,
}

impl DataFramePayload {
    pub fn parse_complete(
        payload: Bytes,
        flags: &DataFrameFlags,
    ) -> Result<Self, ProtocolError> {
        let (data, padding) = if flags.padded {
            split_padding(payload)?
        } else {
            (payload, Bytes::new())
        };

        Ok(Self { data, padding })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFramePayload {
    pub exclusive: bool,
    pub stream_dependency: StreamId,
    pub weight: u8,
}

impl PriorityFramePayload {
    pub const fn size_of() -> usize {
        5
    }

    pub fn parse_complete(mut payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.len() != Self::size_of() {
            return Err(parse_error!(
                FRAME_SIZE_ERROR,
                "PRIORITY payload must be exactly 5 bytes"
            ));
        }

        let word = payload.get_u32();
        Ok(Self {
            exclusive: word & (1 << 31) != 0,
            stream_dependency: word & STREAM_ID_MASK,
            weight: payload.get_u8(),
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        let mut word = self.stream_dependency & STREAM_ID_MASK;
        if self.exclusive {
            word |= 1 << 31;
        }
        out.put_u32(word);
        out.put_u8(self.weight);
    }
}

#[derive(Debug, Clone)]
pub struct HeadersFramePayload {
    pub priority: Option<PriorityFramePayload>,
    pub header_block_fragment: Bytes,
    pub padding: Bytes,
}

impl HeadersFramePayload {
    pub fn parse_complete(
        payload: Bytes,
        flags: &HeadersFrameFlags,
    ) -> Result<Self, ProtocolError> {
        let (mut inner, padding) = if flags.padded {
            split_padding(payload)?
        } else {
            (payload, Bytes::new())
        };

        let priority = if flags.priority {
            if inner.len() < PriorityFramePayload::size_of() {
                return Err(parse_error!(
                    FRAME_SIZE_ERROR,
                    "HEADERS payload too short to hold the priority fields"
                ));
            }

            let fields = inner.split_to(PriorityFramePayload::size_of());
            Some(PriorityFramePayload::parse_complete(fields)?)
        } else {
            None
        };

        Ok(Self {
            priority,
            header_block_fragment: inner,
            padding,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFramePayload {
    pub error_code: ErrorCode,
}

impl RstStreamFramePayload {
    pub const fn size_of() -> usize {
        4
    }

    pub fn parse_complete(mut payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.len() != Self::size_of() {
            return Err(parse_error!(
                FRAME_SIZE_ERROR,
                "RST_STREAM payload must be exactly 4 bytes"
            ));
        }

        Ok(Self {
            error_code: ErrorCode::from_u32(payload.get_u32()),
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.put_u32(self.error_code.to_u32());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsParameter {
    pub id: SettingId,
    pub value: u32,
}

impl SettingsParameter {
    pub const fn size_of() -> usize {
        6
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.put_u16(self.id.to_u16());
        out.put_u32(self.value);
    }
}

#[derive(Debug, Clone)]
pub struct SettingsFramePayload {
    pub parameters: Vec<SettingsParameter>,
}

impl SettingsFramePayload {
    pub fn parse_complete(mut payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.len() % SettingsParameter::size_of() != 0 {
            return Err(parse_error!(
                FRAME_SIZE_ERROR,
                "SETTINGS payload length not a multiple of 6"
            ));
        }

        let mut parameters = vec![];
        while payload.has_remaining() {
            parameters.push(SettingsParameter {
                id: SettingId::from_u16(payload.get_u16()),
                value: payload.get_u32(),
            });
        }

        Ok(Self { parameters })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        for param in &self.parameters {
            param.serialize(out);
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushPromiseFramePayload {
    pub promised_stream_id: StreamId,
    pub header_block_fragment: Bytes,
    pub padding: Bytes,
}

impl PushPromiseFramePayload {
    pub fn parse_complete(
        payload: Bytes,
        flags: &PushPromiseFrameFlags,
    ) -> Result<Self, ProtocolError> {
        let (mut inner, padding) = if flags.padded {
            split_padding(payload)?
        } else {
            (payload, Bytes::new())
        };

        if inner.len() < 4 {
            return Err(parse_error!(
                FRAME_SIZE_ERROR,
                "PUSH_PROMISE payload too short to hold the promised stream id"
            ));
        }

        let promised_stream_id = inner.get_u32() & STREAM_ID_MASK;

        Ok(Self {
            promised_stream_id,
            header_block_fragment: inner,
            padding,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFramePayload {
    pub opaque_data: [u8; 8],
}

impl PingFramePayload {
    pub const fn size_of() -> usize {
        8
    }

    pub fn parse_complete(payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.len() != Self::size_of() {
            return Err(parse_error!(
                FRAME_SIZE_ERROR,
                "PING payload must be exactly 8 bytes"
            ));
        }

        let mut opaque_data = [0u8; 8];
        opaque_data.copy_from_slice(&payload);
        Ok(Self { opaque_data })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.opaque_data);
    }
}

#[derive(Debug, Clone)]
pub struct GoawayFramePayload {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub additional_debug_data: Bytes,
}

impl GoawayFramePayload {
    pub fn parse_complete(mut payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.len() < 8 {
            return Err(parse_error!(
                FRAME_SIZE_ERROR,
                "GOAWAY payload must be at least 8 bytes"
            ));
        }

        Ok(Self {
            last_stream_id: payload.get_u32() & STREAM_ID_MASK,
            error_code: ErrorCode::from_u32(payload.get_u32()),
            additional_debug_data: payload,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.put_u32(self.last_stream_id & STREAM_ID_MASK);
        out.put_u32(self.error_code.to_u32());
        out.extend_from_slice(&self.additional_debug_data);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFramePayload {
    pub window_size_increment: u32,
}

impl WindowUpdateFramePayload {
    pub const fn size_of() -> usize {
        4
    }

    pub fn parse_complete(mut payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.len() != Self::size_of() {
            return Err(parse_error!(
                FRAME_SIZE_ERROR,
                "WINDOW_UPDATE payload must be exactly 4 bytes"
            ));
        }

        Ok(Self {
            window_size_increment: payload.get_u32() & STREAM_ID_MASK,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.put_u32(self.window_size_increment & STREAM_ID_MASK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_round_trip() {
        let header = FrameHeader {
            length: 0x00ab_cdef,
            typ: FrameType::WINDOW_UPDATE,
            flags: 0,
            stream_id: 77,
        };

        let mut out = vec![];
        header.serialize(&mut out);
        assert_eq!(out.len(), FrameHeader::size_of());

        let mut buf = [0u8; 9];
        buf.copy_from_slice(&out);
        assert_eq!(FrameHeader::parse_complete(&buf), header);
    }

    #[test]
    fn frame_header_ignores_reserved_bit() {
        let buf = [0, 0, 8, 0, 0, 0x80, 0, 0, 1];
        let header = FrameHeader::parse_complete(&buf);
        assert_eq!(header.stream_id, 1);
        assert_eq!(header.length, 8);
        assert_eq!(header.typ, FrameType::DATA);
    }

    #[test]
    fn settings_payload_parses_parameters() {
        let input: &[u8] = &[0, 4, 0, 0, 0xff, 0xff, 0, 3, 0, 0, 0, 100];

        let settings = SettingsFramePayload::parse_complete(Bytes::from_static(input)).unwrap();
        assert_eq!(settings.parameters.len(), 2);
        assert_eq!(
            settings.parameters[0],
            SettingsParameter {
                id: SettingId::INITIAL_WINDOW_SIZE,
                value: 65535
            }
        );
        assert_eq!(
            settings.parameters[1],
            SettingsParameter {
                id: SettingId::MAX_CONCURRENT_STREAMS,
                value: 100
            }
        );
    }

    #[test]
    fn settings_payload_rejects_truncated_parameters() {
        let err =
            SettingsFramePayload::parse_complete(Bytes::from_static(&[0, 4, 0])).unwrap_err();
        assert_eq!(err.code, ErrorCode::FRAME_SIZE_ERROR);
    }

    #[test]
    fn data_payload_strips_padding() {
        // pad_length = 2, data = "hi", padding = [0, 0]
        let payload = Bytes::from_static(&[2, b'h', b'i', 0, 0]);
        let flags = DataFrameFlags {
            end_stream: false,
            padded: true,
        };

        let data = DataFramePayload::parse_complete(payload, &flags).unwrap();
        assert_eq!(&data.data[..], b"hi");
        assert_eq!(data.padding.len(), 2);
    }

    #[test]
    fn data_payload_rejects_oversized_padding() {
        let payload = Bytes::from_static(&[4, b'h', b'i']);
        let flags = DataFrameFlags {
            end_stream: false,
            padded: true,
        };

        let err = DataFramePayload::parse_complete(payload, &flags).unwrap_err();
        assert_eq!(err.code, ErrorCode::PROTOCOL_ERROR);
    }

    #[test]
    fn ping_payload_length_is_enforced() {
        let err =
            PingFramePayload::parse_complete(Bytes::from(vec![0u8; 9])).unwrap_err();
        assert_eq!(err.code, ErrorCode::FRAME_SIZE_ERROR);

        let ping = PingFramePayload::parse_complete(Bytes::from(vec![7u8; 8])).unwrap();
        assert_eq!(ping.opaque_data, [7u8; 8]);
    }

    #[test]
    fn goaway_round_trip() {
        let goaway = GoawayFramePayload {
            last_stream_id: 5,
            error_code: ErrorCode::ENHANCE_YOUR_CALM,
            additional_debug_data: Bytes::from_static(b"too_many_pings"),
        };

        let mut out = vec![];
        goaway.serialize(&mut out);

        let parsed = GoawayFramePayload::parse_complete(Bytes::from(out)).unwrap();
        assert_eq!(parsed.last_stream_id, 5);
        assert_eq!(parsed.error_code, ErrorCode::ENHANCE_YOUR_CALM);
        assert_eq!(&parsed.additional_debug_data[..], b"too_many_pings");
    }
}
