// Storage of completed exchanges and decoding of their bodies.

use std::io::Read;

use bytes::Bytes;

use crate::headers::{find_header, Headers, CONTENT_ENCODING};
use crate::types::Result;

/// Everything received on a stream by the time it finished: the header
/// block, the concatenated DATA payloads and the optional trailer block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamResult {
    pub headers: Headers,
    pub body: Bytes,
    pub trailers: Option<Headers>,
}

/// Result of polling a stream for its final outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePoll {
    /// The stream finished and this is what it produced.
    Ready(StreamResult),

    /// The stream is still running (or was never started).
    NotReady,

    /// The stream finished but its data was discarded at finish time
    /// because the connection runs with response garbage collection.
    Garbage,
}

/// Decodes the body of a finished stream according to its Content-Encoding
/// header. Unknown encodings pass through untouched.
pub fn decode_body(result: StreamResult) -> Result<StreamResult> {
    let encoding = match find_header(&result.headers, CONTENT_ENCODING) {
        Some(value) => value.to_ascii_lowercase(),
        None => return Ok(result),
    };

    let decoded = match encoding.as_slice() {
        b"gzip" => read_all(flate2::read::GzDecoder::new(&result.body[..]))?,
        b"zip" => read_all(flate2::read::DeflateDecoder::new(&result.body[..]))?,
        b"compress" | b"deflate" => read_all(flate2::read::ZlibDecoder::new(&result.body[..]))?,
        _ => return Ok(result),
    };

    Ok(StreamResult {
        headers: result.headers,
        body: decoded.into(),
        trailers: result.trailers,
    })
}

fn read_all<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut out = vec![];
    reader.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::headers::Header;

    fn result_with_encoding(encoding: &'static str, body: Vec<u8>) -> StreamResult {
        StreamResult {
            headers: vec![Header::new(
                CONTENT_ENCODING.as_bytes(),
                encoding.as_bytes(),
            )],
            body: body.into(),
            trailers: None,
        }
    }

    #[test]
    fn gzip_body_is_decoded() {
        let mut encoder = flate2::write::GzEncoder::new(vec![], flate2::Compression::default());
        encoder.write_all(b"hello world").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode_body(result_with_encoding("gzip", compressed)).unwrap();
        assert_eq!(&decoded.body[..], b"hello world");
    }

    #[test]
    fn deflate_body_is_decoded() {
        let mut encoder = flate2::write::ZlibEncoder::new(vec![], flate2::Compression::default());
        encoder.write_all(b"abcabc").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode_body(result_with_encoding("deflate", compressed)).unwrap();
        assert_eq!(&decoded.body[..], b"abcabc");
    }

    #[test]
    fn unknown_encoding_passes_through() {
        let result = result_with_encoding("br", b"opaque".to_vec());
        let decoded = decode_body(result.clone()).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn missing_encoding_passes_through() {
        let result = StreamResult {
            headers: vec![],
            body: Bytes::from_static(b"plain"),
            trailers: None,
        };
        assert_eq!(decode_body(result.clone()).unwrap(), result);
    }
}
