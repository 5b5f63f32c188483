//! Literal-aware response framing.
//!
//! IMAP responses are not line-delimited: a line may end with an octet-count
//! declaration `{n}` (or the non-synchronizing `{n+}`), in which case the next
//! `n` bytes are a literal body that belongs to the same response and may
//! itself contain CRLFs. [`ResponseFramer`] consumes the inbound byte stream
//! in whatever chunks the transport delivers and emits one complete response
//! per frame, never splitting inside a literal body.
//!
//! Framing is a pure state machine with no I/O; it cannot fail. Malformed
//! responses surface later as parse errors.

use bytes::{Bytes, BytesMut};

/// Incremental framer for the server's response stream.
///
/// Feed arbitrary chunks with [`push`](Self::push); each returned frame is one
/// logical response with interior literal declarations and bodies intact and
/// the final line terminator stripped. The produced frames are identical for
/// every possible partition of the same byte stream.
#[derive(Debug, Default)]
pub struct ResponseFramer {
    /// Bytes received but not yet claimed by a frame.
    buf: BytesMut,
    /// Partial response assembled across literal boundaries.
    pending: BytesMut,
    /// Octets of the current literal body still owed.
    literal_remaining: usize,
}

impl ResponseFramer {
    /// Creates an empty framer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every response it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.literal_remaining > 0 {
                if self.buf.len() < self.literal_remaining {
                    return None;
                }
                let body = self.buf.split_to(self.literal_remaining);
                self.pending.extend_from_slice(&body);
                self.literal_remaining = 0;
            }

            let lf = self.buf.iter().position(|&b| b == b'\n')?;
            // tolerate bare LF from nonconforming servers
            let term_start = if lf > 0 && self.buf[lf - 1] == b'\r' {
                lf - 1
            } else {
                lf
            };

            if let Some(n) = literal_declaration(&self.buf[..term_start]) {
                // keep the declaration and its terminator inside the response
                let line = self.buf.split_to(lf + 1);
                self.pending.extend_from_slice(&line);
                self.literal_remaining = n;
                continue;
            }

            let mut tail = self.buf.split_to(lf + 1);
            tail.truncate(term_start);
            return Some(if self.pending.is_empty() {
                tail.freeze()
            } else {
                self.pending.extend_from_slice(&tail);
                self.pending.split().freeze()
            });
        }
    }
}

/// Recognizes a `{n}` or `{n+}` token at the end of a line.
///
/// The `+` marker is irrelevant for inbound framing; both forms announce `n`
/// literal octets after the terminator. Digit runs that overflow `usize` are
/// not valid declarations.
fn literal_declaration(line: &[u8]) -> Option<usize> {
    if !line.ends_with(b"}") {
        return None;
    }
    let open = line.iter().rposition(|&b| b == b'{')?;
    let mut digits = &line[open + 1..line.len() - 1];
    if let Some(stripped) = digits.strip_suffix(b"+") {
        digits = stripped;
    }
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn collect(framer: &mut ResponseFramer, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for chunk in chunks {
            for frame in framer.push(chunk) {
                frames.push(frame.to_vec());
            }
        }
        frames
    }

    #[test]
    fn test_literal_declaration() {
        assert_eq!(literal_declaration(b"* 1 FETCH (BODY[] {11}"), Some(11));
        assert_eq!(literal_declaration(b"a APPEND x {310+}"), Some(310));
        assert_eq!(literal_declaration(b"{0}"), Some(0));
        assert_eq!(literal_declaration(b"* OK done"), None);
        assert_eq!(literal_declaration(b"{}"), None);
        assert_eq!(literal_declaration(b"{12a}"), None);
        assert_eq!(literal_declaration(b"{99999999999999999999999999}"), None);
    }

    #[test]
    fn test_simple_line() {
        let mut framer = ResponseFramer::new();
        let frames = collect(&mut framer, &[b"* OK ready\r\n"]);
        assert_eq!(frames, vec![b"* OK ready".to_vec()]);
    }

    #[test]
    fn test_two_lines_one_chunk() {
        let mut framer = ResponseFramer::new();
        let frames = collect(&mut framer, &[b"* OK a\r\nW1 OK b\r\n"]);
        assert_eq!(frames, vec![b"* OK a".to_vec(), b"W1 OK b".to_vec()]);
    }

    #[test]
    fn test_bare_lf_tolerated() {
        let mut framer = ResponseFramer::new();
        let frames = collect(&mut framer, &[b"* OK ready\n"]);
        assert_eq!(frames, vec![b"* OK ready".to_vec()]);
    }

    #[test]
    fn test_literal_body_with_crlf() {
        let mut framer = ResponseFramer::new();
        let frames = collect(&mut framer, &[b"* 1 FETCH (BODY[] {6}\r\nab\r\ncd)\r\n"]);
        assert_eq!(frames, vec![b"* 1 FETCH (BODY[] {6}\r\nab\r\ncd)".to_vec()]);
    }

    #[test]
    fn test_literal_split_across_chunks() {
        let mut framer = ResponseFramer::new();
        let frames = collect(
            &mut framer,
            &[b"* 1 FETCH (BODY[] {11}\r\nhello", b" world)\r\nW3 OK fetched\r\n"],
        );
        assert_eq!(
            frames,
            vec![
                b"* 1 FETCH (BODY[] {11}\r\nhello world)".to_vec(),
                b"W3 OK fetched".to_vec(),
            ]
        );
    }

    #[test]
    fn test_chunk_boundary_inside_declaration() {
        let mut framer = ResponseFramer::new();
        let frames = collect(
            &mut framer,
            &[b"* 1 FETCH (X {1", b"0}\r\n0123456789)\r\n"],
        );
        assert_eq!(frames, vec![b"* 1 FETCH (X {10}\r\n0123456789)".to_vec()]);
    }

    #[test]
    fn test_empty_literal() {
        let mut framer = ResponseFramer::new();
        let frames = collect(&mut framer, &[b"* 1 FETCH (X {0}\r\n)\r\n"]);
        assert_eq!(frames, vec![b"* 1 FETCH (X {0}\r\n)".to_vec()]);
    }

    #[test]
    fn test_non_sync_literal_framed_identically() {
        let mut framer = ResponseFramer::new();
        let frames = collect(&mut framer, &[b"* 1 FETCH (X {5+}\r\nabcde)\r\n"]);
        assert_eq!(frames, vec![b"* 1 FETCH (X {5+}\r\nabcde)".to_vec()]);
    }

    #[test]
    fn test_literal_containing_brace_line() {
        // a literal body that itself looks like a declaration must not recurse
        let mut framer = ResponseFramer::new();
        let frames = collect(&mut framer, &[b"* 1 FETCH (X {6}\r\n{2}\r\nA)\r\n"]);
        assert_eq!(frames, vec![b"* 1 FETCH (X {6}\r\n{2}\r\nA)".to_vec()]);
    }

    #[test]
    fn test_partition_invariance() {
        let stream: &[u8] =
            b"* OK greeting\r\n* 2 FETCH (BODY[] {13}\r\nline1\r\nline2})\r\nW9 OK done\r\n";
        let mut whole = ResponseFramer::new();
        let expected: Vec<Vec<u8>> = whole.push(stream).iter().map(|b| b.to_vec()).collect();
        assert_eq!(expected.len(), 3);

        // byte-at-a-time delivery yields the same frames
        let mut framer = ResponseFramer::new();
        let mut got = Vec::new();
        for byte in stream {
            for frame in framer.push(std::slice::from_ref(byte)) {
                got.push(frame.to_vec());
            }
        }
        assert_eq!(got, expected);

        // every split point in two yields the same frames
        for split in 0..stream.len() {
            let mut framer = ResponseFramer::new();
            let got = collect(&mut framer, &[&stream[..split], &stream[split..]]);
            assert_eq!(got, expected, "split at {split}");
        }
    }

    #[test]
    fn test_incomplete_input_held() {
        let mut framer = ResponseFramer::new();
        assert!(framer.push(b"* OK no terminator yet").is_empty());
        assert!(framer.push(b" {3}\r\nab").is_empty());
        let frames = framer.push(b"c rest\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"* OK no terminator yet {3}\r\nabc rest");
    }
}
