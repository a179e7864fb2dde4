// Thin adapter around the `hpack` crate.
//
// The connection owns exactly one decode context (driven by the reader task)
// and one encode context (driven by the writer task). Both advance
// monotonically: every received header block goes through the decoder in
// arrival order and every sent block goes through the encoder in send order,
// so the dynamic tables on both sides of the wire stay in sync.

use bytes::Bytes;

use crate::headers::{Header, Headers};
use crate::proto::ErrorCode;
use crate::types::ProtocolError;

pub struct HeaderDecoder {
    inner: hpack::Decoder<'static>,
}

impl HeaderDecoder {
    pub fn new(max_table_size: usize) -> Self {
        let mut inner = hpack::Decoder::new();
        inner.set_max_table_size(max_table_size);
        Self { inner }
    }

    /// Decodes one complete header block (the concatenation of the HEADERS or
    /// PUSH_PROMISE fragment and any CONTINUATION fragments).
    ///
    /// Any decoder failure poisons the compression context, so the caller
    /// must treat the returned error as fatal for the connection.
    pub fn decode(&mut self, block: &[u8]) -> Result<Headers, ProtocolError> {
        let fields = self.inner.decode(block).map_err(|_| ProtocolError {
            code: ErrorCode::COMPRESSION_ERROR,
            message: "Failure while decoding received header block",
            local: true,
        })?;

        Ok(fields
            .into_iter()
            .map(|(name, value)| Header {
                name: Bytes::from(name),
                value: Bytes::from(value),
            })
            .collect())
    }

    /// Applies a new maximum dynamic table size. Called when the remote
    /// endpoint acknowledges a change to our HEADER_TABLE_SIZE setting.
    pub fn set_max_table_size(&mut self, max_table_size: usize) {
        self.inner.set_max_table_size(max_table_size);
    }
}

pub struct HeaderEncoder {
    inner: hpack::Encoder<'static>,
}

impl HeaderEncoder {
    pub fn new() -> Self {
        Self {
            inner: hpack::Encoder::new(),
        }
    }

    /// Encodes a header list into a single header block. Splitting the block
    /// into HEADERS/CONTINUATION frames happens at the framing layer.
    pub fn encode_block(&mut self, headers: &[Header]) -> Vec<u8> {
        self.inner.encode(
            headers
                .iter()
                .map(|h| (h.name.as_ref(), h.value.as_ref())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(name: &'static str, value: &'static str) -> Header {
        Header::new(name.as_bytes(), value.as_bytes())
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut encoder = HeaderEncoder::new();
        let mut decoder = HeaderDecoder::new(4096);

        let headers = vec![
            h(":method", "GET"),
            h(":scheme", "https"),
            h(":path", "/index.html"),
            h("accept", "*/*"),
        ];

        let block = encoder.encode_block(&headers);
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(decoded, headers);

        // A second block keeps the shared dynamic table in sync.
        let more = vec![h(":method", "GET"), h("accept", "*/*")];
        let block = encoder.encode_block(&more);
        assert_eq!(decoder.decode(&block).unwrap(), more);
    }

    #[test]
    fn decode_failure_is_a_compression_error() {
        let mut decoder = HeaderDecoder::new(4096);

        // An indexed field referencing a non-existent dynamic table entry.
        let err = decoder.decode(&[0xbe]).unwrap_err();
        assert_eq!(err.code, ErrorCode::COMPRESSION_ERROR);
    }
}
