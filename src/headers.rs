// Helpers and constants for working with HTTP2 header lists.

use bytes::Bytes;

use crate::proto::ErrorCode;
use crate::types::ProtocolError;

pub const METHOD_PSEUDO_HEADER_NAME: &str = ":method";
pub const SCHEME_PSEUDO_HEADER_NAME: &str = ":scheme";
pub const PATH_PSEUDO_HEADER_NAME: &str = ":path";
pub const AUTHORITY_PSEUDO_HEADER_NAME: &str = ":authority";
pub const STATUS_PSEUDO_HEADER_NAME: &str = ":status";

pub const CONTENT_ENCODING: &str = "content-encoding";

/// One header field. Names are kept as raw bytes since HPACK treats both
/// sides as opaque octet strings. Pseudo header fields start with ':'.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: Bytes,
    pub value: Bytes,
}

impl Header {
    pub fn new<N: Into<Bytes>, V: Into<Bytes>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with(b":")
    }
}

pub type Headers = Vec<Header>;

/// Finds the value of the first header with the given (lower case) name.
pub fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a Bytes> {
    headers
        .iter()
        .find(|h| h.name.as_ref() == name.as_bytes())
        .map(|h| &h.value)
}

/// Validates a decoded header block received from the remote endpoint.
///
/// Checks the requirements of RFC 7540 Section 8.1.2: names must be lower
/// case and pseudo headers must precede all regular headers.
pub fn validate_received_headers(headers: &[Header]) -> Result<(), ProtocolError> {
    let mut done_pseudo_headers = false;

    for header in headers {
        if header
            .name
            .iter()
            .any(|b| b.is_ascii_uppercase())
        {
            return Err(ProtocolError {
                code: ErrorCode::PROTOCOL_ERROR,
                message: "Header name is not lower case",
                local: true,
            });
        }

        if header.is_pseudo() {
            if done_pseudo_headers {
                return Err(ProtocolError {
                    code: ErrorCode::PROTOCOL_ERROR,
                    message: "Pseudo headers not at the beginning of the header block",
                    local: true,
                });
            }
        } else {
            done_pseudo_headers = true;
        }
    }

    Ok(())
}

/// Validates a trailer block. Trailers must not contain pseudo headers.
pub fn validate_received_trailers(headers: &[Header]) -> Result<(), ProtocolError> {
    validate_received_headers(headers)?;

    if headers.iter().any(|h| h.is_pseudo()) {
        return Err(ProtocolError {
            code: ErrorCode::PROTOCOL_ERROR,
            message: "Trailers must not contain pseudo headers",
            local: true,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(name: &'static str, value: &'static str) -> Header {
        Header::new(name.as_bytes(), value.as_bytes())
    }

    #[test]
    fn pseudo_headers_must_come_first() {
        assert!(validate_received_headers(&[
            h(":method", "GET"),
            h(":path", "/"),
            h("accept", "*/*"),
        ])
        .is_ok());

        let err = validate_received_headers(&[
            h(":method", "GET"),
            h("accept", "*/*"),
            h(":path", "/"),
        ])
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::PROTOCOL_ERROR);
    }

    #[test]
    fn upper_case_names_are_rejected() {
        let err = validate_received_headers(&[h("Accept", "*/*")]).unwrap_err();
        assert_eq!(err.code, ErrorCode::PROTOCOL_ERROR);
    }

    #[test]
    fn trailers_reject_pseudo_headers() {
        assert!(validate_received_trailers(&[h("grpc-status", "0")]).is_ok());
        assert!(validate_received_trailers(&[h(":status", "200")]).is_err());
    }

    #[test]
    fn find_header_returns_first_match() {
        let headers = vec![h("a", "1"), h("b", "2"), h("a", "3")];
        assert_eq!(find_header(&headers, "a").unwrap().as_ref(), b"1");
        assert!(find_header(&headers, "c").is_none());
    }
}
