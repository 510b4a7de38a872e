//! Splits raw model text into its thinking, tool call and answer sections.
//!
//! The model is asked to reply as
//!
//! ```text
//! Thinking: <reasoning>
//! CALL_FUNCTION: tool_name(arg='value')
//! ANSWER: <text for the user>
//! ```
//!
//! with either action section optional and in any order. Markers are matched
//! case-insensitively. Inside a tool call payload, quoted argument values are
//! skipped so code such as `print("ANSWER: 1")` does not end the payload early.

pub const CALL_MARKER: &str = "CALL_FUNCTION:";
pub const ANSWER_MARKER: &str = "ANSWER:";
pub const THINKING_LABEL: &str = "Thinking:";
pub const NO_THINKING: &str = "(No thinking provided)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub thinking_text: String,
    pub tool_call_text: Option<String>,
    pub answer_text: Option<String>,
}

impl ParsedResponse {
    pub fn is_ambiguous(&self) -> bool {
        self.tool_call_text.is_none() && self.answer_text.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Call,
    Answer,
}

impl Marker {
    const ALL: [Marker; 2] = [Marker::Call, Marker::Answer];

    fn label(self) -> &'static str {
        match self {
            Marker::Call => CALL_MARKER,
            Marker::Answer => ANSWER_MARKER,
        }
    }
}

pub fn parse_model_output(text: &str) -> ParsedResponse {
    let markers = locate_markers(text);

    let thinking_end = markers.first().map(|(pos, _)| *pos).unwrap_or(text.len());
    let thinking_text = clean_thinking(&text[..thinking_end]);

    let mut tool_call_text = None;
    let mut answer_text = None;

    for (idx, (pos, marker)) in markers.iter().enumerate() {
        let start = pos + marker.label().len();
        let end = markers
            .get(idx + 1)
            .map(|(next, _)| *next)
            .unwrap_or(text.len());
        let payload = text[start..end].trim().to_string();

        // first occurrence of each marker wins
        let slot = match marker {
            Marker::Call => &mut tool_call_text,
            Marker::Answer => &mut answer_text,
        };
        if slot.is_none() {
            *slot = Some(payload);
        }
    }

    ParsedResponse {
        thinking_text,
        tool_call_text,
        answer_text,
    }
}

fn locate_markers(text: &str) -> Vec<(usize, Marker)> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut in_call = false;
    let mut depth = 0usize;
    let mut quote: Option<&'static [u8]> = None;
    let mut i = 0;

    while i < bytes.len() {
        if let Some(delim) = quote {
            if bytes[i] == b'\\' {
                i += 2;
            } else if bytes[i..].starts_with(delim) {
                i += delim.len();
                quote = None;
            } else {
                i += 1;
            }
            continue;
        }

        if let Some(marker) = marker_at(bytes, i) {
            found.push((i, marker));
            in_call = marker == Marker::Call;
            depth = 0;
            i += marker.label().len();
            continue;
        }

        // quotes only count inside the call's argument block
        if in_call && depth > 0 {
            if let Some(delim) = opening_quote(&bytes[i..]) {
                quote = Some(delim);
                i += delim.len();
                continue;
            }
        }

        if in_call {
            match bytes[i] {
                b'(' => depth += 1,
                b')' if depth > 0 => {
                    depth -= 1;
                    if depth == 0 {
                        in_call = false;
                    }
                }
                _ => {}
            }
        }

        i += 1;
    }

    found
}

fn marker_at(bytes: &[u8], at: usize) -> Option<Marker> {
    Marker::ALL.into_iter().find(|marker| {
        let label = marker.label().as_bytes();
        bytes.len() - at >= label.len() && bytes[at..at + label.len()].eq_ignore_ascii_case(label)
    })
}

pub(crate) fn opening_quote(rest: &[u8]) -> Option<&'static [u8]> {
    const DELIMITERS: [&[u8]; 4] = [b"'''", b"\"\"\"", b"'", b"\""];
    DELIMITERS.into_iter().find(|delim| rest.starts_with(delim))
}

fn clean_thinking(raw: &str) -> String {
    let trimmed = raw.trim();
    let label = THINKING_LABEL.as_bytes();
    let body = if trimmed.len() >= label.len()
        && trimmed.as_bytes()[..label.len()].eq_ignore_ascii_case(label)
    {
        trimmed[label.len()..].trim()
    } else {
        trimmed
    };

    if body.is_empty() {
        NO_THINKING.to_string()
    } else {
        body.to_string()
    }
}
