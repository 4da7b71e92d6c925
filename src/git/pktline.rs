//! Minimal pkt-line framing for out-of-band error reports.
//!
//! A pkt-line is a 4-digit lowercase hex length (which counts the 4 length
//! bytes themselves) followed by the payload.  Git clients print a line of the
//! form `ERR <message>` as `remote error: <message>` and abort.

/// Largest payload a single pkt-line may carry.
pub const MAX_PAYLOAD: usize = 65516;

/// Frame `payload` as a single pkt-line.  Oversized payloads are truncated.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(MAX_PAYLOAD)];
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Frame an error report: `ERR <message>\n`.
pub fn encode_error(message: &str) -> Vec<u8> {
    encode(format!("ERR {message}\n").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_counts_header() {
        assert_eq!(encode(b"a\n"), b"0006a\n".to_vec());
        assert_eq!(encode(b""), b"0004".to_vec());
    }

    #[test]
    fn error_line() {
        let line = encode_error("you are not authorized to do this");
        let text = String::from_utf8(line).unwrap();
        assert_eq!(text, "002aERR you are not authorized to do this\n");
        assert_eq!(usize::from_str_radix(&text[..4], 16).unwrap(), text.len());
    }

    #[test]
    fn oversized_payload_is_truncated() {
        let big = vec![b'x'; MAX_PAYLOAD + 10];
        let line = encode(&big);
        assert_eq!(&line[..4], b"fff0");
        assert_eq!(line.len(), 65520);
    }
}
