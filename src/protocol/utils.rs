//! pkt-line codec shared by the smart protocol handlers: length-prefixed
//! line reads and writes, whitespace-delimited token scans, and the
//! advertisement reply builder.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::types::{PKT_LINE_END_MARKER, ProtocolError};

/// Read one packet line from the buffer.
///
/// Returns `(bytes_consumed, payload)`. A consumed count of 0 means the
/// buffer held no complete line; a flush packet (`0000`) consumes 4 bytes
/// and yields an empty payload.
pub fn read_pkt_line(bytes: &mut Bytes) -> (usize, Bytes) {
    if bytes.len() < 4 {
        return (0, Bytes::new());
    }

    let pkt_length = bytes.copy_to_bytes(4);
    let pkt_length = match core::str::from_utf8(&pkt_length)
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
    {
        Some(len) => len,
        None => {
            tracing::warn!("invalid pkt-line length prefix: {:?}", pkt_length);
            return (0, Bytes::new());
        }
    };

    if pkt_length == 0 {
        return (4, Bytes::new()); // flush packet
    }
    if pkt_length < 4 {
        tracing::warn!("invalid pkt-line length {pkt_length}");
        return (0, Bytes::new());
    }

    let data_length = pkt_length - 4;
    if bytes.len() < data_length {
        tracing::warn!(
            "short pkt-line: need {data_length} bytes, have {}",
            bytes.len()
        );
        return (0, Bytes::new());
    }

    (pkt_length, bytes.copy_to_bytes(data_length))
}

/// Append one pkt-line with its 4-hex length prefix.
pub fn add_pkt_line_string(pkt_line_stream: &mut BytesMut, buf_str: String) {
    let buf_str_length = buf_str.len() + 4;
    pkt_line_stream.put(Bytes::from(format!("{buf_str_length:04x}")));
    pkt_line_stream.put(buf_str.as_bytes());
}

/// Consume up to the next whitespace or NUL, returning the token.
pub fn read_until_white_space(bytes: &mut Bytes) -> String {
    let mut buf = Vec::new();
    while bytes.has_remaining() {
        let c = bytes.get_u8();
        if c.is_ascii_whitespace() || c == 0 {
            break;
        }
        buf.push(c);
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// Build the info/refs advertisement: the `# service=` preamble, a flush,
/// the ref lines, and the terminating flush.
pub fn build_advertisement(ref_list: &[String], service: &str) -> BytesMut {
    let mut pkt_line_stream = BytesMut::new();
    add_pkt_line_string(&mut pkt_line_stream, format!("# service={service}\n"));
    pkt_line_stream.put(&PKT_LINE_END_MARKER[..]);

    for ref_line in ref_list {
        add_pkt_line_string(&mut pkt_line_stream, ref_line.to_string());
    }
    pkt_line_stream.put(&PKT_LINE_END_MARKER[..]);
    pkt_line_stream
}

/// Extract `service=` from an info/refs query string.
pub fn service_from_query(query: &str) -> Result<&str, ProtocolError> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("service="))
        .ok_or_else(|| ProtocolError::invalid_request("missing service parameter"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lines round-trip through the pkt-line codec, flush included.
    #[test]
    fn test_pkt_line_round_trip() {
        let mut buf = BytesMut::new();
        add_pkt_line_string(&mut buf, "hello\n".to_string());
        add_pkt_line_string(&mut buf, "world\n".to_string());
        buf.put(&PKT_LINE_END_MARKER[..]);

        let mut bytes = buf.freeze();
        let (consumed, line) = read_pkt_line(&mut bytes);
        assert_eq!(consumed, 10);
        assert_eq!(&line[..], b"hello\n");
        let (_, line) = read_pkt_line(&mut bytes);
        assert_eq!(&line[..], b"world\n");
        let (consumed, line) = read_pkt_line(&mut bytes);
        assert_eq!(consumed, 4);
        assert!(line.is_empty());
    }

    /// Malformed prefixes consume nothing.
    #[test]
    fn test_bad_length_prefix() {
        let mut bytes = Bytes::from_static(b"zzzzjunk");
        let (consumed, line) = read_pkt_line(&mut bytes);
        assert_eq!(consumed, 0);
        assert!(line.is_empty());

        let mut short = Bytes::from_static(b"00");
        assert_eq!(read_pkt_line(&mut short).0, 0);
    }

    /// Token scan stops at whitespace and NUL.
    #[test]
    fn test_read_until_white_space() {
        let mut bytes = Bytes::from_static(b"want deadbeef\0caps");
        assert_eq!(read_until_white_space(&mut bytes), "want");
        assert_eq!(read_until_white_space(&mut bytes), "deadbeef");
        assert_eq!(read_until_white_space(&mut bytes), "caps");
    }

    /// The advertisement starts with the service preamble and ends with a
    /// flush.
    #[test]
    fn test_build_advertisement() {
        let out = build_advertisement(
            &["0000000000000000000000000000000000000000 capabilities^{}\0caps\n".to_string()],
            "git-upload-pack",
        );
        let text = String::from_utf8_lossy(&out).to_string();
        assert!(text.starts_with("001e# service=git-upload-pack\n0000"));
        assert!(text.ends_with("0000"));
    }

    /// Query parsing finds the service parameter.
    #[test]
    fn test_service_from_query() {
        assert_eq!(
            service_from_query("service=git-upload-pack").unwrap(),
            "git-upload-pack"
        );
        assert_eq!(
            service_from_query("a=b&service=git-receive-pack").unwrap(),
            "git-receive-pack"
        );
        assert!(service_from_query("a=b").is_err());
    }
}
