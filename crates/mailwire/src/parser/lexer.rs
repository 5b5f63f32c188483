//! Byte cursor for response tokenization.

use crate::{Error, Result};

/// Bytes that terminate an atom.
const ATOM_DELIMITERS: &[u8] = b" ()[]\"{";

/// A cursor over one framed response.
pub(crate) struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) const fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub(crate) fn error(&self, message: impl Into<String>) -> Error {
        Error::Parse {
            position: self.pos,
            message: message.into(),
        }
    }

    pub(crate) fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    pub(crate) fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    pub(crate) fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    pub(crate) fn expect(&mut self, byte: u8) -> Result<()> {
        match self.bump() {
            Some(b) if b == byte => Ok(()),
            Some(b) => Err(self.error(format!(
                "expected {:?}, found {:?}",
                char::from(byte),
                char::from(b)
            ))),
            None => Err(self.error(format!(
                "expected {:?}, found end of response",
                char::from(byte)
            ))),
        }
    }

    /// Consumes one space if present.
    pub(crate) fn skip_space(&mut self) {
        if self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    pub(crate) fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    /// Takes bytes up to the next space or the end of input.
    pub(crate) fn take_token(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b' ' {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected token"));
        }
        Ok(&self.input[start..self.pos])
    }

    /// Takes bytes while they are valid atom characters.
    pub(crate) fn take_atom_chars(&mut self) -> &'a [u8] {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if ATOM_DELIMITERS.contains(&b) || b == b'\r' || b == b'\n' {
                break;
            }
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    /// Takes exactly `n` bytes.
    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.input.len() - self.pos < n {
            return Err(self.error(format!("literal body truncated, wanted {n} bytes")));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.input[start..self.pos])
    }

    /// Returns everything from the cursor to the end of input.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let start = self.pos;
        self.pos = self.input.len();
        &self.input[start..]
    }
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

    #[test]
    fn test_take_token() {
        let mut cur = Cursor::new(b"W1 OK done");
        assert_eq!(cur.take_token().unwrap(), b"W1");
        cur.skip_space();
        assert_eq!(cur.take_token().unwrap(), b"OK");
    }

    #[test]
    fn test_atom_chars_stop_at_delimiters() {
        let mut cur = Cursor::new(b"BODY[TEXT]");
        assert_eq!(cur.take_atom_chars(), b"BODY");
        assert_eq!(cur.peek(), Some(b'['));
    }

    #[test]
    fn test_take_counts() {
        let mut cur = Cursor::new(b"abcdef");
        assert_eq!(cur.take(4).unwrap(), b"abcd");
        assert!(cur.take(3).is_err());
    }

    #[test]
    fn test_expect_reports_position() {
        let mut cur = Cursor::new(b"x");
        let err = cur.expect(b'y').unwrap_err();
        assert!(matches!(err, Error::Parse { position: 1, .. }));
    }
}
