//! Packed-file record format.
//!
//! A file is a sequence of LF-terminated records, each one key/value pair
//! with prefix compression against the preceding record:
//!
//! ```text
//! record := US '+' <depth> US '"' <key-suffix> RS <value> [ETX <state>] LF
//! value  := US '"' <bytes>     string
//!         | US '+' <number>    number
//!         | US '+'             boolean true
//!         | US '-'             boolean false
//!         | US '#' <bytes>     relation soul
//!         | (empty)            null tombstone
//! ```
//!
//! `depth` is the count of leading key bytes shared with the preceding
//! record (0 for the first). Bytes that collide with the markers are
//! backslash-escaped, so files stay valid UTF-8 text.

use mesh_primitives::{Soul, State, Value};
use thiserror::Error;

use mesh_radix::RadixTree;

/// Token start (unit separator).
pub const US: u8 = 0x1F;
/// Key/value separator (record separator; doubles as the radix record
/// marker in serialized trees).
pub const RS: u8 = 0x1E;
/// State prefix (end-of-text).
pub const ETX: u8 = 0x03;

const ESCAPED: [u8; 5] = [US, RS, ETX, b'\n', b'\\'];

/// A stored value cell: the field value plus its logical clock, when one
/// accompanied the write.
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    pub value: Value,
    pub state: Option<State>,
}

impl Cell {
    #[must_use]
    pub fn new(value: Value, state: Option<State>) -> Self {
        Self { value, state }
    }

    #[must_use]
    pub fn stated(value: Value, state: State) -> Self {
        Self {
            value,
            state: Some(state),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("truncated record at byte {0}")]
    Truncated(usize),
    #[error("unexpected byte {byte:#04x} at {pos}")]
    Unexpected { byte: u8, pos: usize },
    #[error("bad depth at byte {0}")]
    BadDepth(usize),
    #[error("bad number literal at byte {0}")]
    BadNumber(usize),
    #[error("record is not valid utf-8 at byte {0}")]
    BadUtf8(usize),
}

fn push_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if ESCAPED.contains(&b) {
            out.push(b'\\');
        }
        out.push(b);
    }
}

/// Append one record. Returns the number of bytes written so callers can
/// account file sizes while packing.
pub fn encode_record(prev_key: &[u8], key: &[u8], cell: &Cell, out: &mut Vec<u8>) -> usize {
    let before = out.len();

    let depth = prev_key
        .iter()
        .zip(key)
        .take_while(|(a, b)| a == b)
        .count();

    out.push(US);
    out.push(b'+');
    out.extend_from_slice(depth.to_string().as_bytes());

    out.push(US);
    out.push(b'"');
    push_escaped(out, &key[depth..]);

    out.push(RS);

    match &cell.value {
        Value::Null => {}
        Value::Bool(true) => {
            out.push(US);
            out.push(b'+');
        }
        Value::Bool(false) => {
            out.push(US);
            out.push(b'-');
        }
        Value::Number(n) => {
            out.push(US);
            out.push(b'+');
            out.extend_from_slice(n.to_string().as_bytes());
        }
        Value::String(s) => {
            out.push(US);
            out.push(b'"');
            push_escaped(out, s.as_bytes());
        }
        Value::Relation(soul) => {
            out.push(US);
            out.push(b'#');
            push_escaped(out, soul.as_str().as_bytes());
        }
    }

    if let Some(state) = cell.state {
        out.push(ETX);
        out.extend_from_slice(state.to_string().as_bytes());
    }

    out.push(b'\n');
    out.len() - before
}

/// Encode a whole tree as one file image.
#[must_use]
pub fn encode_tree(tree: &RadixTree<Cell>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = Vec::new();
    let _ = tree.map(|key, cell| {
        let _ = encode_record(&prev, key, cell, &mut out);
        prev.clear();
        prev.extend_from_slice(key);
        core::ops::ControlFlow::<()>::Continue(())
    });
    out
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, byte: u8) -> Result<(), ParseError> {
        match self.bump() {
            Some(b) if b == byte => Ok(()),
            Some(b) => Err(ParseError::Unexpected {
                byte: b,
                pos: self.pos - 1,
            }),
            None => Err(ParseError::Truncated(self.pos)),
        }
    }

    /// Read (unescaping) until one of `stops` appears unescaped. The stop
    /// byte is not consumed.
    fn until(&mut self, stops: &[u8]) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Ok(out),
                Some(b'\\') => {
                    let _ = self.bump();
                    let escaped = self.bump().ok_or(ParseError::Truncated(self.pos))?;
                    out.push(escaped);
                }
                Some(b) if stops.contains(&b) => return Ok(out),
                Some(b) => {
                    let _ = self.bump();
                    out.push(b);
                }
            }
        }
    }
}

fn utf8(bytes: Vec<u8>, pos: usize) -> Result<String, ParseError> {
    String::from_utf8(bytes).map_err(|_| ParseError::BadUtf8(pos))
}

/// Parse a file image back into a tree.
pub fn parse(bytes: &[u8]) -> Result<RadixTree<Cell>, ParseError> {
    let mut tree = RadixTree::new();
    let mut scanner = Scanner { bytes, pos: 0 };
    let mut prev_key: Vec<u8> = Vec::new();

    while scanner.peek().is_some() {
        scanner.expect(US)?;
        scanner.expect(b'+')?;
        let depth_text = utf8(scanner.until(&[US])?, scanner.pos)?;
        let depth: usize = depth_text
            .parse()
            .map_err(|_| ParseError::BadDepth(scanner.pos))?;
        if depth > prev_key.len() {
            return Err(ParseError::BadDepth(scanner.pos));
        }

        scanner.expect(US)?;
        scanner.expect(b'"')?;
        let suffix = scanner.until(&[RS])?;
        scanner.expect(RS)?;

        let mut key = prev_key[..depth].to_vec();
        key.extend_from_slice(&suffix);

        let value = match scanner.peek() {
            Some(ETX) | Some(b'\n') | None => Value::Null,
            Some(US) => {
                let _ = scanner.bump();
                let tag = scanner.bump().ok_or(ParseError::Truncated(scanner.pos))?;
                match tag {
                    b'"' => {
                        let body = scanner.until(&[ETX, b'\n'])?;
                        Value::String(utf8(body, scanner.pos)?)
                    }
                    b'#' => {
                        let body = scanner.until(&[ETX, b'\n'])?;
                        Value::Relation(Soul::from(utf8(body, scanner.pos)?))
                    }
                    b'+' => {
                        let body = utf8(scanner.until(&[ETX, b'\n'])?, scanner.pos)?;
                        if body.is_empty() {
                            Value::Bool(true)
                        } else {
                            Value::Number(
                                body.parse()
                                    .map_err(|_| ParseError::BadNumber(scanner.pos))?,
                            )
                        }
                    }
                    b'-' => Value::Bool(false),
                    other => {
                        return Err(ParseError::Unexpected {
                            byte: other,
                            pos: scanner.pos - 1,
                        })
                    }
                }
            }
            Some(other) => {
                return Err(ParseError::Unexpected {
                    byte: other,
                    pos: scanner.pos,
                })
            }
        };

        let state = if scanner.peek() == Some(ETX) {
            let _ = scanner.bump();
            let text = utf8(scanner.until(&[b'\n'])?, scanner.pos)?;
            Some(
                text.parse::<State>()
                    .map_err(|_| ParseError::BadNumber(scanner.pos))?,
            )
        } else {
            None
        };

        scanner.expect(b'\n')?;

        let _ = tree.set(&key, Cell::new(value, state));
        prev_key = key;
    }

    Ok(tree)
}
