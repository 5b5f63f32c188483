//! Request serialization.
//!
//! A [`Request`] is the client-side command AST. [`TextCompiler`] turns it
//! into wire chunks: with literal splitting enabled, every synchronizing
//! literal ends its chunk right after the `{n}` declaration so the send
//! engine can wait for the server's `+` continuation before emitting the
//! body. Non-synchronizing `{n+}` literals stay inline.
//!
//! Like the parser, this is a collaborator seam behind [`CommandCompiler`].

use crate::{Error, Result};

/// One value in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Bare atom, written as-is.
    Atom(String),
    /// Quoted string.
    String(String),
    /// Decimal number.
    Number(u64),
    /// Octet-counted literal.
    Literal {
        /// Literal body.
        data: Vec<u8>,
        /// Use the `{n+}` form that needs no continuation.
        non_sync: bool,
    },
    /// Parenthesized list.
    List(Vec<Value>),
}

impl Value {
    /// Creates a synchronizing literal.
    #[must_use]
    pub fn literal(data: impl Into<Vec<u8>>) -> Self {
        Self::Literal {
            data: data.into(),
            non_sync: false,
        }
    }

    /// Creates a non-synchronizing (`{n+}`) literal.
    #[must_use]
    pub fn literal_non_sync(data: impl Into<Vec<u8>>) -> Self {
        Self::Literal {
            data: data.into(),
            non_sync: true,
        }
    }
}

/// A client command awaiting serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Tag assigned by the send engine; empty until the command is sent.
    pub tag: String,
    /// Command name, e.g. `CAPABILITY`, `LOGIN`, `APPEND`.
    pub command: String,
    /// Arguments following the command name.
    pub attributes: Vec<Value>,
}

impl Request {
    /// Creates a request with no arguments.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            tag: String::new(),
            command: command.into(),
            attributes: Vec::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn attr(mut self, value: Value) -> Self {
        self.attributes.push(value);
        self
    }
}

impl From<&str> for Request {
    fn from(command: &str) -> Self {
        Self::new(command)
    }
}

impl From<String> for Request {
    fn from(command: String) -> Self {
        Self::new(command)
    }
}

/// Serializes requests into wire chunks.
pub trait CommandCompiler: Send {
    /// Compiles a request.
    ///
    /// With `split_for_literals`, each chunk except the last ends with a
    /// synchronizing literal declaration (and its CRLF); the following chunk
    /// starts with the literal body. Chunks never carry a trailing CRLF for
    /// the command line itself; the send engine appends that to the final
    /// chunk. With `redact`, string and literal contents are masked so the
    /// result is safe to log.
    ///
    /// # Errors
    ///
    /// Returns a compile error when the request cannot be represented on the
    /// wire.
    fn compile(
        &self,
        request: &Request,
        split_for_literals: bool,
        redact: bool,
    ) -> Result<Vec<Vec<u8>>>;
}

/// The built-in request compiler.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCompiler;

impl CommandCompiler for TextCompiler {
    fn compile(
        &self,
        request: &Request,
        split_for_literals: bool,
        redact: bool,
    ) -> Result<Vec<Vec<u8>>> {
        if request.command.trim().is_empty() {
            return Err(Error::Compile("empty command name".to_string()));
        }

        let mut chunks: Vec<Vec<u8>> = vec![Vec::new()];
        {
            let head = &mut chunks[0];
            if !request.tag.is_empty() {
                head.extend_from_slice(request.tag.as_bytes());
                head.push(b' ');
            }
            head.extend_from_slice(request.command.trim().as_bytes());
        }
        for value in &request.attributes {
            push_byte(&mut chunks, b' ');
            write_value(&mut chunks, value, split_for_literals, redact)?;
        }
        Ok(chunks)
    }
}

fn push_byte(chunks: &mut Vec<Vec<u8>>, byte: u8) {
    if let Some(last) = chunks.last_mut() {
        last.push(byte);
    }
}

fn push_slice(chunks: &mut Vec<Vec<u8>>, bytes: &[u8]) {
    if let Some(last) = chunks.last_mut() {
        last.extend_from_slice(bytes);
    }
}

fn write_value(
    chunks: &mut Vec<Vec<u8>>,
    value: &Value,
    split_for_literals: bool,
    redact: bool,
) -> Result<()> {
    match value {
        Value::Atom(atom) => push_slice(chunks, atom.as_bytes()),
        Value::Number(n) => push_slice(chunks, n.to_string().as_bytes()),
        Value::String(s) => {
            if redact {
                push_slice(chunks, b"\"----\"");
            } else {
                write_quoted(chunks, s)?;
            }
        }
        Value::Literal { data, non_sync } => {
            let marker = if *non_sync { "+" } else { "" };
            push_slice(chunks, format!("{{{}{}}}", data.len(), marker).as_bytes());
            // under redaction only the declaration reaches the log
            if !redact {
                push_slice(chunks, b"\r\n");
                if split_for_literals && !non_sync {
                    chunks.push(Vec::new());
                }
                push_slice(chunks, data);
            }
        }
        Value::List(items) => {
            push_byte(chunks, b'(');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    push_byte(chunks, b' ');
                }
                write_value(chunks, item, split_for_literals, redact)?;
            }
            push_byte(chunks, b')');
        }
    }
    Ok(())
}

fn write_quoted(chunks: &mut Vec<Vec<u8>>, s: &str) -> Result<()> {
    if s.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(Error::Compile(
            "quoted string may not contain line breaks, use a literal".to_string(),
        ));
    }
    push_byte(chunks, b'"');
    for b in s.bytes() {
        if b == b'"' || b == b'\\' {
            push_byte(chunks, b'\\');
        }
        push_byte(chunks, b);
    }
    push_byte(chunks, b'"');
    Ok(())
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

    fn compile(request: &Request, split: bool, redact: bool) -> Vec<Vec<u8>> {
        TextCompiler.compile(request, split, redact).unwrap()
    }

    fn tagged(mut request: Request, tag: &str) -> Request {
        request.tag = tag.to_string();
        request
    }

    #[test]
    fn test_bare_command() {
        let req = tagged(Request::new("CAPABILITY"), "W1");
        assert_eq!(compile(&req, true, false), vec![b"W1 CAPABILITY".to_vec()]);
    }

    #[test]
    fn test_untagged_request() {
        let req = Request::new("DONE");
        assert_eq!(compile(&req, true, false), vec![b"DONE".to_vec()]);
    }

    #[test]
    fn test_atoms_and_strings() {
        let req = tagged(
            Request::new("LIST")
                .attr(Value::String(String::new()))
                .attr(Value::String("*".to_string())),
            "W2",
        );
        assert_eq!(compile(&req, true, false), vec![b"W2 LIST \"\" \"*\"".to_vec()]);
    }

    #[test]
    fn test_quoted_escaping() {
        let req = Request::new("LOGIN").attr(Value::String("pa\"ss\\wd".to_string()));
        assert_eq!(
            compile(&req, false, false),
            vec![b"LOGIN \"pa\\\"ss\\\\wd\"".to_vec()]
        );
    }

    #[test]
    fn test_literal_splits_for_continuation() {
        let req = tagged(
            Request::new("APPEND")
                .attr(Value::Atom("INBOX".to_string()))
                .attr(Value::literal(b"hello".to_vec())),
            "W1",
        );
        let chunks = compile(&req, true, false);
        assert_eq!(
            chunks,
            vec![b"W1 APPEND INBOX {5}\r\n".to_vec(), b"hello".to_vec()]
        );
    }

    #[test]
    fn test_non_sync_literal_stays_inline() {
        let req = tagged(
            Request::new("APPEND")
                .attr(Value::Atom("INBOX".to_string()))
                .attr(Value::literal_non_sync(b"hello".to_vec())),
            "W1",
        );
        let chunks = compile(&req, true, false);
        assert_eq!(chunks, vec![b"W1 APPEND INBOX {5+}\r\nhello".to_vec()]);
    }

    #[test]
    fn test_no_split_keeps_one_chunk() {
        let req = tagged(
            Request::new("APPEND").attr(Value::literal(b"abc".to_vec())),
            "W1",
        );
        let chunks = compile(&req, false, false);
        assert_eq!(chunks, vec![b"W1 APPEND {3}\r\nabc".to_vec()]);
    }

    #[test]
    fn test_redaction_masks_secrets() {
        let req = tagged(
            Request::new("LOGIN")
                .attr(Value::String("user".to_string()))
                .attr(Value::String("hunter2".to_string())),
            "W3",
        );
        let chunks = compile(&req, false, true);
        assert_eq!(chunks, vec![b"W3 LOGIN \"----\" \"----\"".to_vec()]);
    }

    #[test]
    fn test_redaction_drops_literal_bodies() {
        let req = Request::new("APPEND").attr(Value::literal(b"secret mail".to_vec()));
        let chunks = compile(&req, false, true);
        assert_eq!(chunks, vec![b"APPEND {11}".to_vec()]);
    }

    #[test]
    fn test_list_arguments() {
        let req = Request::new("STORE")
            .attr(Value::Atom("+FLAGS".to_string()))
            .attr(Value::List(vec![
                Value::Atom("\\Seen".to_string()),
                Value::Atom("\\Deleted".to_string()),
            ]));
        assert_eq!(
            compile(&req, false, false),
            vec![b"STORE +FLAGS (\\Seen \\Deleted)".to_vec()]
        );
    }

    #[test]
    fn test_string_with_newline_rejected() {
        let req = Request::new("LOGIN").attr(Value::String("a\r\nb".to_string()));
        assert!(TextCompiler.compile(&req, false, false).is_err());
    }

    #[test]
    fn test_empty_command_rejected() {
        let req = Request::new("  ");
        assert!(TextCompiler.compile(&req, false, false).is_err());
    }

    #[test]
    fn test_bare_string_wraps_into_request() {
        let req: Request = "NOOP".into();
        assert_eq!(req.command, "NOOP");
        assert!(req.attributes.is_empty());
    }
}
