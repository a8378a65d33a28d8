//! Length-prefixed wire frames.
//!
//! Both directions use the same framing:
//!
//! ```text
//! packetSize  uint32 big endian
//! packet      [packetSize]byte
//! ```
//!
//! A request packet is a command line with arguments separated by line
//! breaks: `"<cmdName>\n<first arg>\n<second arg>"`. Arguments carry
//! value escaping (see [`crate::escape`]) and are unescaped into the
//! request's `exact` view. A response packet is a JSON object.

use thiserror::Error;

use crate::escape::value_unescape;

pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame body. A length field beyond this is
/// treated as a malformed frame and terminates the connection.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {got_bytes} bytes exceeds limit of {max_frame_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
}

/// One parsed request. Two parallel views of the same tokens:
/// `exact` holds the unescaped bytes (used for binary payloads), and
/// `args` holds the raw escaped text (used for command-name matching
/// and option parsing). The two are always the same length.
#[derive(Clone, Debug, Default)]
pub struct RawRequest {
    pub exact: Vec<Vec<u8>>,
    pub args: Vec<String>,
}

impl RawRequest {
    /// Build a request from escaped argument tokens.
    pub fn from_tokens<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let mut req = RawRequest::default();
        for token in tokens {
            let escaped = String::from_utf8_lossy(token.as_ref()).into_owned();
            // Tokens without a backslash are byte-identical in both views.
            if escaped.contains('\\') {
                req.exact.push(value_unescape(&escaped));
            } else {
                req.exact.push(token.as_ref().to_vec());
            }
            req.args.push(escaped);
        }
        req
    }

    pub fn command_name(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }
}

/// Result of scanning the inbound buffer for one frame.
pub enum FrameScan {
    /// Not enough bytes buffered yet.
    Incomplete,
    /// One complete frame; `consumed` bytes should be drained.
    Complete { request: RawRequest, consumed: usize },
    /// The length field is unusable; the connection must terminate.
    Malformed(FrameError),
}

/// Attempt to parse one request frame from the front of `inbound`.
pub fn parse_frame(inbound: &[u8], max_frame_bytes: usize) -> FrameScan {
    if inbound.len() < FRAME_HEADER_LEN {
        return FrameScan::Incomplete;
    }
    let packet_size =
        u32::from_be_bytes([inbound[0], inbound[1], inbound[2], inbound[3]]) as usize;
    if packet_size > max_frame_bytes {
        return FrameScan::Malformed(FrameError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: packet_size,
        });
    }
    if inbound.len() - FRAME_HEADER_LEN < packet_size {
        return FrameScan::Incomplete;
    }

    let packet = &inbound[FRAME_HEADER_LEN..FRAME_HEADER_LEN + packet_size];
    let request = RawRequest::from_tokens(packet.split(|&b| b == b'\n'));

    FrameScan::Complete {
        request,
        consumed: FRAME_HEADER_LEN + packet_size,
    }
}

/// Frame a payload for the wire: 4-byte big-endian length, then the
/// payload bytes.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(tokens: &[&str]) -> Vec<u8> {
        encode_frame(tokens.join("\n").as_bytes())
    }

    #[test]
    fn parse_single_frame() {
        let data = frame_of(&["setk", "/a/b"]);
        match parse_frame(&data, DEFAULT_MAX_FRAME_BYTES) {
            FrameScan::Complete { request, consumed } => {
                assert_eq!(consumed, data.len());
                assert_eq!(request.args, vec!["setk", "/a/b"]);
                assert_eq!(request.exact, vec![b"setk".to_vec(), b"/a/b".to_vec()]);
            }
            _ => panic!("expected complete frame"),
        }
    }

    #[test]
    fn parse_partial_header_is_incomplete() {
        assert!(matches!(
            parse_frame(&[0, 0, 0], DEFAULT_MAX_FRAME_BYTES),
            FrameScan::Incomplete
        ));
    }

    #[test]
    fn parse_partial_body_is_incomplete() {
        let data = frame_of(&["getk", "/x"]);
        assert!(matches!(
            parse_frame(&data[..data.len() - 1], DEFAULT_MAX_FRAME_BYTES),
            FrameScan::Incomplete
        ));
    }

    #[test]
    fn parse_consumes_exactly_one_frame() {
        let mut data = frame_of(&["setk", "/a"]);
        let second = frame_of(&["getk", "/a"]);
        data.extend_from_slice(&second);
        match parse_frame(&data, DEFAULT_MAX_FRAME_BYTES) {
            FrameScan::Complete { request, consumed } => {
                assert_eq!(request.args[0], "setk");
                assert_eq!(consumed, data.len() - second.len());
            }
            _ => panic!("expected complete frame"),
        }
    }

    #[test]
    fn oversized_length_is_malformed() {
        let data = encode_frame(b"x");
        assert!(matches!(
            parse_frame(&data, 0),
            FrameScan::Malformed(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn escaped_token_produces_distinct_views() {
        // "setv\n/k\n\00" — the value token is an escaped NUL byte.
        let data = frame_of(&["setv", "/k", "\\00"]);
        match parse_frame(&data, DEFAULT_MAX_FRAME_BYTES) {
            FrameScan::Complete { request, .. } => {
                assert_eq!(request.args[2], "\\00");
                assert_eq!(request.exact[2], vec![0u8]);
            }
            _ => panic!("expected complete frame"),
        }
    }

    #[test]
    fn empty_payload_is_single_empty_token() {
        let data = encode_frame(b"");
        match parse_frame(&data, DEFAULT_MAX_FRAME_BYTES) {
            FrameScan::Complete { request, .. } => {
                assert_eq!(request.args, vec![""]);
                assert_eq!(request.command_name(), "");
            }
            _ => panic!("expected complete frame"),
        }
    }

    #[test]
    fn frame_round_trip() {
        let payload = b"{\"ok\":true}";
        let framed = encode_frame(payload);
        assert_eq!(&framed[..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&framed[4..], payload);
    }
}
