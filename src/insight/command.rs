use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::error::{EngineError, Result};
use super::response::opening_quote;
use crate::shared::models::ToolCallRequest;

static FUNCTION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)").expect("function name pattern"));

const CALL_SHAPE_HINT: &str = "Expected name(arg='value', ...).";

/// Splits `name(arguments)` into the function name and the raw argument block.
/// Arguments are left unparsed so the caller can resolve the tool first.
pub fn split_call(fragment: &str) -> Result<ToolCallRequest> {
    let trimmed = fragment.trim().trim_matches('`').trim();

    let name = FUNCTION_NAME
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| {
            EngineError::Format(format!(
                "Invalid function call format: no function name found. {CALL_SHAPE_HINT}"
            ))
        })?;

    let after_name = &trimmed[name.len()..];
    let open = after_name.find('(').ok_or_else(|| {
        EngineError::Format(format!(
            "Invalid function call format: missing '(' after '{name}'. {CALL_SHAPE_HINT}"
        ))
    })?;
    if !after_name[..open].trim().is_empty() {
        return Err(EngineError::Format(format!(
            "Invalid function call format: unexpected text between '{name}' and '('. {CALL_SHAPE_HINT}"
        )));
    }
    let close = match closing_paren(after_name.as_bytes(), open) {
        Closing::At(close) => Some(close),
        // leave the quote error to the argument parser
        Closing::UnterminatedQuote => after_name.rfind(')').filter(|close| *close > open),
        Closing::Missing => None,
    }
    .ok_or_else(|| {
        EngineError::Format(format!(
            "Invalid function call format: unbalanced parentheses in call to '{name}'. {CALL_SHAPE_HINT}"
        ))
    })?;

    Ok(ToolCallRequest {
        function_name: name.to_string(),
        raw_argument_text: after_name[open + 1..close].to_string(),
        parsed_arguments: BTreeMap::new(),
    })
}

enum Closing {
    At(usize),
    UnterminatedQuote,
    Missing,
}

/// Finds the `)` matching the `(` at `open`, ignoring parentheses inside
/// quoted values.
fn closing_paren(bytes: &[u8], open: usize) -> Closing {
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        if let Some(delim) = opening_quote(&bytes[i..]) {
            i += delim.len();
            loop {
                if i >= bytes.len() {
                    return Closing::UnterminatedQuote;
                }
                if bytes[i] == b'\\' {
                    i += 2;
                } else if bytes[i..].starts_with(delim) {
                    i += delim.len();
                    break;
                } else {
                    i += 1;
                }
            }
            continue;
        }
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Closing::At(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    Closing::Missing
}

/// Parses `a='x', b="""y""", c=3` into lowercased names and unescaped values.
pub fn parse_arguments(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut scanner = Scanner::new(raw);
    let mut arguments = BTreeMap::new();

    loop {
        scanner.skip_separators();
        if scanner.at_end() {
            break;
        }

        let name = scanner.identifier();
        if name.is_empty() {
            return Err(EngineError::Parameter(format!(
                "Expected an argument name at position {} of '{}'",
                scanner.pos,
                raw.trim()
            )));
        }

        scanner.skip_whitespace();
        if !scanner.eat(b'=') {
            return Err(EngineError::Parameter(format!(
                "Argument '{name}' must be written as {name}='value'"
            )));
        }
        scanner.skip_whitespace();

        let value = match scanner.quoted(&name)? {
            Some(quoted) => unescape(quoted),
            None => scanner.bare_value().trim().to_string(),
        };

        scanner.skip_whitespace();
        if !scanner.at_end() && !scanner.eat(b',') {
            return Err(EngineError::Parameter(format!(
                "Unexpected text after argument '{name}' at position {}",
                scanner.pos
            )));
        }

        arguments.insert(name.to_ascii_lowercase(), value);
    }

    Ok(arguments)
}

pub fn parse_tool_call(fragment: &str) -> Result<ToolCallRequest> {
    let mut request = split_call(fragment)?;
    request.parsed_arguments = parse_arguments(&request.raw_argument_text)?;
    Ok(request)
}

struct Scanner<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace() || b == b',') {
            self.pos += 1;
        }
    }

    fn identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            let allowed = b == b'_'
                || b.is_ascii_alphabetic()
                || (self.pos > start && b.is_ascii_digit());
            if !allowed {
                break;
            }
            self.pos += 1;
        }
        self.text[start..self.pos].to_string()
    }

    /// Reads a quoted value and returns its raw inner text, or `None` when the
    /// value is not quoted.
    fn quoted(&mut self, name: &str) -> Result<Option<&'a str>> {
        let Some(delim) = opening_quote(&self.bytes[self.pos..]) else {
            return Ok(None);
        };
        let start = self.pos + delim.len();
        let mut i = start;
        while i < self.bytes.len() {
            if self.bytes[i] == b'\\' {
                i += 2;
                continue;
            }
            if self.bytes[i..].starts_with(delim) {
                self.pos = i + delim.len();
                return Ok(Some(&self.text[start..i]));
            }
            i += 1;
        }
        Err(EngineError::Parameter(format!(
            "Unterminated quoted value for argument '{name}'"
        )))
    }

    /// Unquoted value up to the next top-level comma. Brackets and nested
    /// quotes are respected so inline JSON survives.
    fn bare_value(&mut self) -> &'a str {
        let start = self.pos;
        let mut depth = 0usize;
        let mut quote: Option<u8> = None;
        while let Some(b) = self.peek() {
            match quote {
                Some(q) => {
                    if b == b'\\' {
                        self.pos += 1;
                    } else if b == q {
                        quote = None;
                    }
                }
                None => match b {
                    b'\'' | b'"' => quote = Some(b),
                    b'[' | b'{' | b'(' => depth += 1,
                    b']' | b'}' | b')' => depth = depth.saturating_sub(1),
                    b',' if depth == 0 => break,
                    _ => {}
                },
            }
            self.pos += 1;
        }
        self.pos = self.pos.min(self.bytes.len());
        &self.text[start..self.pos]
    }
}

/// Resolves `\n`, `\t`, `\r`, `\0`, `\\` and quote escapes. Unknown escapes are
/// kept verbatim.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
