//! Response parsing.
//!
//! One framed response goes in, a [`Response`] AST comes out. Attributes are
//! a tagged variant over the token kinds IMAP uses on the wire: atoms (with
//! an optional bracketed section), quoted strings, octet-counted literals,
//! numbers, parenthesized lists, and the trailing human-readable text of
//! status responses.
//!
//! The parser behind [`TextParser`] covers the response grammar this engine
//! routes on. It is a collaborator seam: anything implementing
//! [`ResponseParser`] can replace it.

mod lexer;

use std::collections::BTreeMap;

use lexer::Cursor;

use crate::Result;

/// Status command names whose remainder is free-form text.
const STATUS_COMMANDS: [&str; 5] = ["OK", "NO", "BAD", "BYE", "PREAUTH"];

/// Returns true for response commands that carry codes and human text.
#[must_use]
pub fn is_status_command(command: &str) -> bool {
    STATUS_COMMANDS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(command))
}

/// One typed attribute of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// Bare atom, optionally carrying a bracketed section such as
    /// `BODY[TEXT]` or the leading `[CAPABILITY ...]` of a status response.
    Atom {
        /// Atom text. Empty for a standalone bracketed section.
        value: String,
        /// Attributes inside the brackets, if any.
        section: Option<Vec<Attribute>>,
    },
    /// Quoted string.
    String(String),
    /// Octet-counted literal body.
    Literal(Vec<u8>),
    /// Decimal number.
    Number(u64),
    /// Parenthesized list.
    List(Vec<Attribute>),
    /// Trailing human-readable text of a status response.
    Text(String),
}

impl Attribute {
    /// Creates a plain atom.
    #[must_use]
    pub fn atom(value: impl Into<String>) -> Self {
        Self::Atom {
            value: value.into(),
            section: None,
        }
    }

    /// Returns the atom value, if this is an atom.
    #[must_use]
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Self::Atom { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Returns the text value, if this is trailing text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }
}

/// A parsed server response.
///
/// `tag`, `command`, and `attributes` come straight from the wire. The
/// remaining fields are filled in by the dispatcher: numeric untagged
/// responses are normalized into `command` plus `nr`, status responses get
/// `code`, `code_data`, and `human_readable`, and a tagged completion carries
/// the untagged `payload` collected for its command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    /// Response tag: `*`, `+`, or a command tag such as `W3`.
    pub tag: String,
    /// Command name, e.g. `OK`, `CAPABILITY`, `EXISTS`.
    pub command: String,
    /// Typed attributes following the command.
    pub attributes: Vec<Attribute>,
    /// Sequence number of a numeric untagged response, e.g. `* 17 EXISTS`.
    pub nr: Option<u32>,
    /// Response code from a bracketed section, e.g. `AUTHENTICATIONFAILED`.
    pub code: Option<String>,
    /// Arguments following the response code inside the brackets.
    pub code_data: Vec<Attribute>,
    /// Human-readable text of a status response.
    pub human_readable: Option<String>,
    /// Untagged responses collected for the completed command, by name.
    pub payload: BTreeMap<String, Vec<Response>>,
}

impl Response {
    /// Creates a response with the given tag and command.
    #[must_use]
    pub fn new(tag: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    /// Creates the synthetic response for a `+` continuation request.
    #[must_use]
    pub fn continuation(text: impl Into<String>) -> Self {
        Self {
            tag: "+".to_string(),
            human_readable: Some(text.into()),
            ..Self::default()
        }
    }
}

/// Parses framed response text into the [`Response`] AST.
pub trait ResponseParser: Send {
    /// Parses one framed response.
    ///
    /// # Errors
    ///
    /// Returns a parse error with byte position on malformed input.
    fn parse(&self, input: &[u8]) -> Result<Response>;
}

/// The built-in response parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextParser;

impl ResponseParser for TextParser {
    fn parse(&self, input: &[u8]) -> Result<Response> {
        parse_response(input)
    }
}

fn parse_response(input: &[u8]) -> Result<Response> {
    let mut cur = Cursor::new(input);

    let tag_bytes = cur.take_token()?;
    let tag = to_utf8(&cur, tag_bytes)?;
    cur.skip_space();
    let command_bytes = cur.take_token()?;
    let command = to_utf8(&cur, command_bytes)?;

    let mut attributes = Vec::new();
    if is_status_command(&command) {
        cur.skip_space();
        if cur.peek() == Some(b'[') {
            let section = parse_section(&mut cur)?;
            attributes.push(Attribute::Atom {
                value: String::new(),
                section: Some(section),
            });
            cur.skip_space();
        }
        if !cur.at_end() {
            attributes.push(Attribute::Text(
                String::from_utf8_lossy(cur.rest()).into_owned(),
            ));
        }
    } else {
        loop {
            cur.skip_spaces();
            if cur.at_end() {
                break;
            }
            let attr = parse_attribute(&mut cur)?;
            attributes.push(attr);
        }
    }

    Ok(Response {
        tag,
        command,
        attributes,
        ..Response::default()
    })
}

fn to_utf8(cur: &Cursor<'_>, bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| cur.error("invalid UTF-8 in token"))
}

fn parse_attribute(cur: &mut Cursor<'_>) -> Result<Attribute> {
    match cur.peek() {
        Some(b'(') => parse_list(cur),
        Some(b'"') => parse_quoted(cur),
        Some(b'{') => parse_literal(cur),
        Some(b'[') => {
            let section = parse_section(cur)?;
            Ok(Attribute::Atom {
                value: String::new(),
                section: Some(section),
            })
        }
        Some(_) => parse_atom_or_number(cur),
        None => Err(cur.error("expected attribute, found end of response")),
    }
}

fn parse_list(cur: &mut Cursor<'_>) -> Result<Attribute> {
    cur.expect(b'(')?;
    let mut items = Vec::new();
    loop {
        cur.skip_spaces();
        match cur.peek() {
            Some(b')') => {
                cur.expect(b')')?;
                return Ok(Attribute::List(items));
            }
            Some(_) => items.push(parse_attribute(cur)?),
            None => return Err(cur.error("unterminated list")),
        }
    }
}

fn parse_section(cur: &mut Cursor<'_>) -> Result<Vec<Attribute>> {
    cur.expect(b'[')?;
    let mut items = Vec::new();
    loop {
        cur.skip_spaces();
        match cur.peek() {
            Some(b']') => {
                cur.expect(b']')?;
                return Ok(items);
            }
            Some(_) => items.push(parse_attribute(cur)?),
            None => return Err(cur.error("unterminated section")),
        }
    }
}

fn parse_quoted(cur: &mut Cursor<'_>) -> Result<Attribute> {
    cur.expect(b'"')?;
    let mut out = Vec::new();
    loop {
        match cur.bump() {
            Some(b'"') => return Ok(Attribute::String(String::from_utf8_lossy(&out).into_owned())),
            Some(b'\\') => match cur.bump() {
                Some(b) => out.push(b),
                None => return Err(cur.error("unterminated quoted string")),
            },
            Some(b) => out.push(b),
            None => return Err(cur.error("unterminated quoted string")),
        }
    }
}

fn parse_literal(cur: &mut Cursor<'_>) -> Result<Attribute> {
    cur.expect(b'{')?;
    let mut digits = String::new();
    while let Some(b) = cur.peek() {
        if !b.is_ascii_digit() {
            break;
        }
        digits.push(char::from(b));
        cur.bump();
    }
    if cur.peek() == Some(b'+') {
        cur.bump();
    }
    let n: usize = digits
        .parse()
        .map_err(|_| cur.error("invalid literal length"))?;
    cur.expect(b'}')?;
    if cur.peek() == Some(b'\r') {
        cur.bump();
    }
    cur.expect(b'\n')?;
    Ok(Attribute::Literal(cur.take(n)?.to_vec()))
}

fn parse_atom_or_number(cur: &mut Cursor<'_>) -> Result<Attribute> {
    let bytes = cur.take_atom_chars();
    if bytes.is_empty() {
        return Err(cur.error("expected atom"));
    }
    let mut value = to_utf8(cur, bytes)?;

    if cur.peek() == Some(b'[') {
        // section attached to the atom, e.g. BODY[TEXT]
        let section = parse_section(cur)?;
        // partial range suffix like <0.100> stays part of the atom text
        let tail = cur.take_atom_chars();
        value.push_str(&to_utf8(cur, tail)?);
        return Ok(Attribute::Atom {
            value,
            section: Some(section),
        });
    }

    if value.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = value.parse::<u64>() {
            return Ok(Attribute::Number(n));
        }
    }
    Ok(Attribute::Atom {
        value,
        section: None,
    })
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

    fn parse(input: &[u8]) -> Response {
        TextParser.parse(input).unwrap()
    }

    #[test]
    fn test_untagged_status() {
        let resp = parse(b"* OK IMAP4rev1 ready");
        assert_eq!(resp.tag, "*");
        assert_eq!(resp.command, "OK");
        assert_eq!(
            resp.attributes,
            vec![Attribute::Text("IMAP4rev1 ready".to_string())]
        );
    }

    #[test]
    fn test_status_with_code() {
        let resp = parse(b"W4 NO [AUTHENTICATIONFAILED] bad creds");
        assert_eq!(resp.tag, "W4");
        assert_eq!(resp.command, "NO");
        assert_eq!(resp.attributes.len(), 2);
        let Attribute::Atom {
            value,
            section: Some(section),
        } = &resp.attributes[0]
        else {
            panic!("expected section-carrying atom, got {:?}", resp.attributes[0]);
        };
        assert!(value.is_empty());
        assert_eq!(section, &vec![Attribute::atom("AUTHENTICATIONFAILED")]);
        assert_eq!(resp.attributes[1], Attribute::Text("bad creds".to_string()));
    }

    #[test]
    fn test_status_code_with_arguments() {
        let resp = parse(b"* OK [UNSEEN 17] Message 17 is first unseen");
        let Attribute::Atom {
            section: Some(section),
            ..
        } = &resp.attributes[0]
        else {
            panic!("expected section");
        };
        assert_eq!(
            section,
            &vec![Attribute::atom("UNSEEN"), Attribute::Number(17)]
        );
    }

    #[test]
    fn test_capability_line() {
        let resp = parse(b"* CAPABILITY IMAP4rev1 AUTH=PLAIN");
        assert_eq!(resp.command, "CAPABILITY");
        assert_eq!(
            resp.attributes,
            vec![Attribute::atom("IMAP4rev1"), Attribute::atom("AUTH=PLAIN")]
        );
    }

    #[test]
    fn test_numeric_untagged_raw_form() {
        let resp = parse(b"* 42 EXISTS");
        assert_eq!(resp.command, "42");
        assert_eq!(resp.attributes, vec![Attribute::atom("EXISTS")]);
    }

    #[test]
    fn test_list_response() {
        let resp = parse(b"* LIST (\\HasChildren) \"/\" INBOX");
        assert_eq!(resp.command, "LIST");
        assert_eq!(
            resp.attributes,
            vec![
                Attribute::List(vec![Attribute::atom("\\HasChildren")]),
                Attribute::String("/".to_string()),
                Attribute::atom("INBOX"),
            ]
        );
    }

    #[test]
    fn test_fetch_with_literal() {
        let resp = parse(b"* 1 FETCH (BODY[] {11}\r\nhello world)");
        assert_eq!(resp.command, "1");
        assert_eq!(resp.attributes.len(), 2);
        assert_eq!(
            resp.attributes[1],
            Attribute::List(vec![
                Attribute::Atom {
                    value: "BODY".to_string(),
                    section: Some(vec![]),
                },
                Attribute::Literal(b"hello world".to_vec()),
            ])
        );
    }

    #[test]
    fn test_nested_lists() {
        let resp = parse(b"* 12 FETCH (FLAGS (\\Seen \\Answered) UID 100)");
        let Attribute::List(items) = &resp.attributes[1] else {
            panic!("expected list");
        };
        assert_eq!(
            items[1],
            Attribute::List(vec![
                Attribute::atom("\\Seen"),
                Attribute::atom("\\Answered"),
            ])
        );
        assert_eq!(items[3], Attribute::Number(100));
    }

    #[test]
    fn test_quoted_escapes() {
        let resp = parse(b"* LIST () \"/\" \"a \\\"b\\\" c\"");
        assert_eq!(
            resp.attributes[2],
            Attribute::String("a \"b\" c".to_string())
        );
    }

    #[test]
    fn test_unterminated_quoted_string_is_error() {
        let err = TextParser.parse(b"* LIST () \"/\" \"oops").unwrap_err();
        assert!(matches!(err, crate::Error::Parse { .. }));
    }

    #[test]
    fn test_truncated_literal_is_error() {
        let err = TextParser.parse(b"* 1 FETCH (X {10}\r\nabc)").unwrap_err();
        assert!(matches!(err, crate::Error::Parse { .. }));
    }

    #[test]
    fn test_continuation_constructor() {
        let resp = Response::continuation("Ready for literal data");
        assert_eq!(resp.tag, "+");
        assert_eq!(
            resp.human_readable.as_deref(),
            Some("Ready for literal data")
        );
    }
}
