/// Backend output decoder
///
/// This module splits the backend byte stream into terminator-delimited
/// blocks and parses each block into a `DecodedResponse` tree. Both the
/// `name="value",list=[...]` notation and JSON objects are accepted, so
/// `{"state":"running"}` and `state="running"` decode identically.

use crate::types::{DecodedResponse, Value};
use std::iter::Peekable;
use std::str::Chars;
use thiserror::Error;

/// Terminator the bridge writes after every complete block.
pub const DEFAULT_BLOCK_TERMINATOR: &str = "@\n";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of block")]
    UnexpectedEnd,
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("empty field name")]
    EmptyKey,
    #[error("empty value")]
    EmptyValue,
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(String),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Accumulates raw backend output and yields complete blocks.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    terminator: Vec<u8>,
    /// Offset up to which `buffer` is known to hold no terminator start.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new(terminator: &str) -> Self {
        let terminator = if terminator.is_empty() {
            log::warn!("Empty block terminator configured, using {:?}", DEFAULT_BLOCK_TERMINATOR);
            DEFAULT_BLOCK_TERMINATOR
        } else {
            terminator
        };
        Self {
            buffer: Vec::new(),
            terminator: terminator.as_bytes().to_vec(),
            scanned: 0,
        }
    }

    /// Append a chunk and return every block it completed, trimmed, in
    /// arrival order. Blank blocks are skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut blocks = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = find(&self.buffer[from..], &self.terminator) {
            let end = from + offset;
            let text = String::from_utf8_lossy(&self.buffer[start..end]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                blocks.push(trimmed.to_string());
            }
            start = end + self.terminator.len();
            from = start;
        }
        self.buffer.drain(..start);

        // A terminator may straddle the next chunk boundary.
        self.scanned = self.buffer.len().saturating_sub(self.terminator.len() - 1);
        blocks
    }

    /// Number of bytes waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_TERMINATOR)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Parse one complete block.
pub fn decode_block(block: &str) -> Result<DecodedResponse> {
    let mut chars = block.chars().peekable();
    let mut items = Vec::new();

    loop {
        skip_separators(&mut chars);
        match chars.peek() {
            None => break,
            Some('{') => {
                chars.next();
                items.extend(parse_results(&mut chars, '}')?);
            }
            Some(_) => items.push(parse_result(&mut chars)?),
        }
    }

    Ok(DecodedResponse { items })
}

/// Parse `key=value` pairs up to and including `close`.
fn parse_results(chars: &mut Peekable<Chars>, close: char) -> Result<Vec<(String, Value)>> {
    let mut results = Vec::new();

    loop {
        skip_separators(chars);
        match chars.peek() {
            None => return Err(DecodeError::UnexpectedEnd),
            Some(&ch) if ch == close => {
                chars.next();
                return Ok(results);
            }
            Some(_) => results.push(parse_result(chars)?),
        }
    }
}

fn parse_result(chars: &mut Peekable<Chars>) -> Result<(String, Value)> {
    let key = parse_key(chars)?;
    skip_whitespace(chars);
    match chars.next() {
        Some('=') | Some(':') => {}
        Some(other) => return Err(DecodeError::UnexpectedChar(other)),
        None => return Err(DecodeError::UnexpectedEnd),
    }
    let value = parse_value(chars)?;
    Ok((key, value))
}

fn parse_key(chars: &mut Peekable<Chars>) -> Result<String> {
    let key = if chars.peek() == Some(&'"') {
        parse_quoted(chars)?
    } else {
        parse_identifier(chars)
    };

    if key.is_empty() {
        return match chars.peek() {
            Some(&ch) if ch != '"' => Err(DecodeError::UnexpectedChar(ch)),
            _ => Err(DecodeError::EmptyKey),
        };
    }
    Ok(key)
}

fn parse_identifier(chars: &mut Peekable<Chars>) -> String {
    let mut identifier = String::new();

    while let Some(&ch) = chars.peek() {
        if ch.is_alphanumeric() || ch == '_' || ch == '-' || ch == '.' {
            identifier.push(ch);
            chars.next();
        } else {
            break;
        }
    }

    identifier
}

fn parse_value(chars: &mut Peekable<Chars>) -> Result<Value> {
    skip_whitespace(chars);
    match chars.peek() {
        Some('"') => Ok(Value::String(parse_quoted(chars)?)),
        Some('[') => parse_list(chars),
        Some('{') => {
            chars.next();
            Ok(Value::Tuple(parse_results(chars, '}')?))
        }
        Some(_) => Ok(Value::String(parse_bare(chars)?)),
        None => Err(DecodeError::UnexpectedEnd),
    }
}

fn parse_list(chars: &mut Peekable<Chars>) -> Result<Value> {
    chars.next(); // consume opening bracket
    let mut list = Vec::new();

    loop {
        skip_separators(chars);
        match chars.peek() {
            None => return Err(DecodeError::UnexpectedEnd),
            Some(']') => {
                chars.next();
                return Ok(Value::List(list));
            }
            Some('[') | Some('{') => list.push(parse_value(chars)?),
            Some(_) => list.push(parse_list_item(chars)?),
        }
    }
}

/// List items may be written as `name=value`; the name carries no
/// information and is dropped.
fn parse_list_item(chars: &mut Peekable<Chars>) -> Result<Value> {
    let text = if chars.peek() == Some(&'"') {
        parse_quoted(chars)?
    } else {
        parse_bare(chars)?
    };

    skip_whitespace(chars);
    if matches!(chars.peek(), Some('=') | Some(':')) {
        chars.next();
        return parse_value(chars);
    }
    Ok(Value::String(text))
}

fn parse_bare(chars: &mut Peekable<Chars>) -> Result<String> {
    let mut token = String::new();

    while let Some(&ch) = chars.peek() {
        if matches!(ch, ',' | ']' | '}' | '=' | ':') || ch.is_whitespace() {
            break;
        }
        token.push(ch);
        chars.next();
    }

    if token.is_empty() {
        return match chars.peek() {
            Some(&ch) if ch != ',' => Err(DecodeError::UnexpectedChar(ch)),
            _ => Err(DecodeError::EmptyValue),
        };
    }
    Ok(token)
}

fn parse_quoted(chars: &mut Peekable<Chars>) -> Result<String> {
    chars.next(); // consume opening quote
    let mut text = String::new();

    loop {
        match chars.next() {
            None => return Err(DecodeError::UnexpectedEnd),
            Some('"') => return Ok(text),
            Some('\\') => match chars.next() {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some('r') => text.push('\r'),
                Some('b') => text.push('\u{8}'),
                Some('f') => text.push('\u{c}'),
                Some('\\') => text.push('\\'),
                Some('"') => text.push('"'),
                Some('/') => text.push('/'),
                Some('u') => text.push(parse_unicode_escape(chars)?),
                Some(other) => {
                    text.push('\\');
                    text.push(other);
                }
                None => return Err(DecodeError::UnexpectedEnd),
            },
            Some(ch) => text.push(ch),
        }
    }
}

fn parse_unicode_escape(chars: &mut Peekable<Chars>) -> Result<char> {
    let digits: String = chars.by_ref().take(4).collect();
    if digits.len() != 4 {
        return Err(DecodeError::UnexpectedEnd);
    }
    u32::from_str_radix(&digits, 16)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| DecodeError::InvalidEscape(format!("u{}", digits)))
}

fn skip_whitespace(chars: &mut Peekable<Chars>) {
    while chars.peek().is_some_and(|ch| ch.is_whitespace()) {
        chars.next();
    }
}

fn skip_separators(chars: &mut Peekable<Chars>) {
    while chars.peek().is_some_and(|&ch| ch == ',' || ch.is_whitespace()) {
        chars.next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mi_and_json_notation_agree() {
        let mi = decode_block(r#"state="enginesetupok""#).unwrap();
        let json = decode_block(r#"{"state":"enginesetupok"}"#).unwrap();
        assert_eq!(mi, json);
        assert_eq!(mi.get("state").unwrap().data(), "enginesetupok");
    }

    #[test]
    fn test_parse_multiple_results() {
        let block = decode_block(r#"state="stopped",location={file="a.c",line="3"}"#).unwrap();
        assert_eq!(block.items.len(), 2);
        let location = block.get("location").unwrap();
        assert_eq!(location.field("file"), "a.c");
        assert_eq!(location.get("line").unwrap().to_int(), 3);
    }

    #[test]
    fn test_parse_named_list_items() {
        let block =
            decode_block(r#"stack={frames=[frame={level="0",func="main"},frame={level="1",func="start"}],hasmore="0"}"#)
                .unwrap();
        let frames = block.get("stack").unwrap().get("frames").unwrap().as_list().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].field("func"), "start");
    }

    #[test]
    fn test_parse_json_scalars_and_lists() {
        let block = decode_block(r#"{"breakpoint-added":{"modelid":"B1","lldbid":"42","line":10,"locations":[]}}"#)
            .unwrap();
        let bkpt = block.get("breakpoint-added").unwrap();
        assert_eq!(bkpt.get("line").unwrap().to_int(), 10);
        assert!(bkpt.get("locations").unwrap().as_list().unwrap().is_empty());
    }

    #[test]
    fn test_parse_escapes() {
        let block = decode_block(r#"output="a\"b\\c\ndA""#).unwrap();
        assert_eq!(block.get("output").unwrap().data(), "a\"b\\c\ndA");
    }

    #[test]
    fn test_reject_malformed_blocks() {
        assert_eq!(decode_block(r#"state="running"#), Err(DecodeError::UnexpectedEnd));
        assert_eq!(decode_block(r#"{"state":"running""#), Err(DecodeError::UnexpectedEnd));
        assert_eq!(decode_block("state running"), Err(DecodeError::UnexpectedChar('r')));
        assert!(decode_block(r#"x="\uZZZZ""#).is_err());
    }

    #[test]
    fn test_empty_block_decodes_to_nothing() {
        assert!(decode_block("   ").unwrap().is_empty());
    }

    #[test]
    fn test_frame_decoder_reassembles_split_blocks() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.push(b"state=\"run").is_empty());
        assert_eq!(decoder.push(b"ning\"@\n@\n  x=\"1\"  @"), vec!["state=\"running\""]);
        assert_eq!(decoder.buffered(), b"  x=\"1\"  @".len());
        assert_eq!(decoder.push(b"\n"), vec!["x=\"1\""]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_frame_decoder_resumes_scan_across_chunks() {
        let mut decoder = FrameDecoder::default();
        let payload = "x".repeat(4096);
        let mut chunks = vec![b"data=\"".to_vec()];
        for chunk in payload.as_bytes().chunks(100) {
            chunks.push(chunk.to_vec());
        }
        for chunk in chunks {
            assert!(decoder.push(&chunk).is_empty());
            assert_eq!(decoder.scanned, decoder.buffered() - 1);
        }

        // Terminator split right between the two bytes.
        assert!(decoder.push(b"\"@").is_empty());
        let blocks = decoder.push(b"\nnext=\"1\"@\n");
        assert_eq!(blocks, vec![format!("data=\"{}\"", payload), "next=\"1\"".to_string()]);
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.scanned, 0);
    }

    #[test]
    fn test_frame_decoder_custom_terminator() {
        let mut decoder = FrameDecoder::new("\n");
        assert_eq!(decoder.push(b"a=\"1\"\nb=\"2\"\n"), vec!["a=\"1\"", "b=\"2\""]);
    }
}
