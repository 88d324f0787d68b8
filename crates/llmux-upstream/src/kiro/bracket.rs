//! Inline textual tool calls of the form `[Called <name> with args: {json}]`.
//!
//! Some Kiro responses describe tool calls inside the assistant text instead
//! of (or in addition to) structured tool-use events. These are detected,
//! their JSON repaired when sloppy, and the bracketed text removed from the
//! emitted content.

use serde_json::Value as JsonValue;

const MARKER: &str = "[Called ";
const ARGS_SEP: &str = " with args: ";

#[derive(Debug, Clone, PartialEq)]
pub struct BracketCall {
    pub name: String,
    pub args: JsonValue,
}

/// Extract every bracket call from `text`, returning the text with the
/// bracketed spans removed.
pub fn extract_bracket_calls(text: &str) -> (String, Vec<BracketCall>) {
    let mut remaining = text;
    let mut cleaned = String::with_capacity(text.len());
    let mut calls = Vec::new();

    while let Some(start) = remaining.find(MARKER) {
        match match_call(&remaining[start..]) {
            Some((consumed, call)) => {
                cleaned.push_str(&remaining[..start]);
                calls.push(call);
                remaining = &remaining[start + consumed..];
            }
            None => {
                // Not a well-formed call; keep the literal text and move on.
                cleaned.push_str(&remaining[..start + MARKER.len()]);
                remaining = &remaining[start + MARKER.len()..];
            }
        }
    }
    cleaned.push_str(remaining);
    (cleaned, calls)
}

/// Try to match one complete call at the start of `text` (which begins with
/// the marker). Returns the consumed byte length and the parsed call.
fn match_call(text: &str) -> Option<(usize, BracketCall)> {
    let after_marker = &text[MARKER.len()..];
    let sep = after_marker.find(ARGS_SEP)?;
    let name = after_marker[..sep].trim();
    if name.is_empty() || name.contains(']') || name.contains('\n') {
        return None;
    }
    let args_start = MARKER.len() + sep + ARGS_SEP.len();
    let args_text = &text[args_start..];
    let json_len = scan_json_value(args_text)?;
    let rest = args_text[json_len..].trim_start();
    if !rest.starts_with(']') {
        return None;
    }
    let close_offset = args_text[json_len..].find(']').unwrap_or(0);
    let consumed = args_start + json_len + close_offset + 1;
    let args = repair_json(&args_text[..json_len]);
    Some((
        consumed,
        BracketCall {
            name: name.to_string(),
            args,
        },
    ))
}

/// Length of the JSON object/array starting at the front of `text`,
/// tolerant of brackets inside strings and escapes. `None` if unterminated.
fn scan_json_value(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut seen_open = false;
    for (i, &byte) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' | b'[' if !in_string => {
                depth += 1;
                seen_open = true;
            }
            b'}' | b']' if !in_string => {
                depth -= 1;
                if seen_open && depth == 0 {
                    return Some(i + 1);
                }
                // A close before any open means the value never started.
                if depth < 0 {
                    return None;
                }
            }
            b' ' | b'\t' if !seen_open => {}
            _ if !seen_open => return None,
            _ => {}
        }
    }
    None
}

/// Best-effort JSON repair: parse as-is, then with trailing commas stripped,
/// unquoted keys quoted, and bare-word values quoted. Unrepairable input is
/// wrapped rather than dropped.
pub fn repair_json(raw: &str) -> JsonValue {
    if let Ok(value) = serde_json::from_str::<JsonValue>(raw) {
        return value;
    }
    let repaired = quote_bare_words(&strip_trailing_commas(raw));
    match serde_json::from_str::<JsonValue>(&repaired) {
        Ok(value) => value,
        Err(_) => serde_json::json!({ "raw_arguments": raw }),
    }
}

fn strip_trailing_commas(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &byte) in bytes.iter().enumerate() {
        let ch = byte as char;
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match byte {
            b'\\' if in_string => {
                escaped = true;
                out.push(ch);
            }
            b'"' => {
                in_string = !in_string;
                out.push(ch);
            }
            b',' if !in_string => {
                let next_close = bytes[i + 1..]
                    .iter()
                    .find(|&&b| !b.is_ascii_whitespace())
                    .copied();
                if !matches!(next_close, Some(b'}') | Some(b']')) {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Quote unquoted object keys and bare-word values (`{a: yes}` →
/// `{"a": "yes"}`). Numbers, booleans and null stay as they are.
fn quote_bare_words(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        let ch = byte as char;
        if escaped {
            escaped = false;
            out.push(ch);
            i += 1;
            continue;
        }
        if in_string {
            if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            out.push(ch);
            i += 1;
            continue;
        }
        match byte {
            b'"' => {
                in_string = true;
                out.push(ch);
                i += 1;
            }
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'-')
                {
                    i += 1;
                }
                let word = &raw[start..i];
                let next = bytes[i..]
                    .iter()
                    .find(|&&b| !b.is_ascii_whitespace())
                    .copied();
                let is_key = next == Some(b':');
                let is_literal = matches!(word, "true" | "false" | "null");
                if is_key || !is_literal {
                    out.push('"');
                    out.push_str(word);
                    out.push('"');
                } else {
                    out.push_str(word);
                }
            }
            _ => {
                out.push(ch);
                i += 1;
            }
        }
    }
    out
}

/// Streaming wrapper: text flows through unchanged until a potential marker
/// appears, then is withheld until the call completes or proves malformed.
#[derive(Debug, Default)]
pub struct BracketFilter {
    held: String,
}

impl BracketFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, text: &str) -> (String, Vec<BracketCall>) {
        self.held.push_str(text);
        let mut out = String::new();
        let mut calls = Vec::new();
        loop {
            let Some(start) = self.held.find('[') else {
                out.push_str(&self.held);
                self.held.clear();
                break;
            };
            out.push_str(&self.held[..start]);
            self.held.drain(..start);

            // Could this still grow into a marker?
            if self.held.len() < MARKER.len() {
                if MARKER.starts_with(&self.held) {
                    break;
                }
                // A lone bracket that cannot become a marker.
                out.push('[');
                self.held.drain(..1);
                continue;
            }
            if !self.held.starts_with(MARKER) {
                out.push('[');
                self.held.drain(..1);
                continue;
            }
            match match_call(&self.held) {
                Some((consumed, call)) => {
                    calls.push(call);
                    self.held.drain(..consumed);
                }
                None if self.could_complete() => break,
                None => {
                    out.push('[');
                    self.held.drain(..1);
                }
            }
        }
        (out, calls)
    }

    /// Whether the held text may still become a complete call with more
    /// input.
    fn could_complete(&self) -> bool {
        let after_marker = &self.held[MARKER.len()..];
        match after_marker.find(ARGS_SEP) {
            Some(sep) => {
                let name = after_marker[..sep].trim();
                if name.is_empty() || name.contains(']') || name.contains('\n') {
                    return false;
                }
                let args = &after_marker[sep + ARGS_SEP.len()..];
                match scan_json_value(args) {
                    // JSON done: only trailing whitespace may precede the
                    // not-yet-arrived `]`.
                    Some(len) => args[len..].trim().is_empty(),
                    // JSON absent or still streaming: fine unless it already
                    // starts with something that can never be JSON.
                    None => {
                        let head = args.trim_start();
                        head.is_empty() || head.starts_with('{') || head.starts_with('[')
                    }
                }
            }
            // Name still streaming in.
            None => !after_marker.contains(']') && !after_marker.contains('\n'),
        }
    }

    pub fn finish(&mut self) -> (String, Vec<BracketCall>) {
        let held = std::mem::take(&mut self.held);
        extract_bracket_calls(&held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_example_with_bracket_inside_string() {
        let (cleaned, calls) =
            extract_bracket_calls("[Called foo with args: {\"a\":1, \"b\":[\"]\"]}]");
        assert_eq!(cleaned, "");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "foo");
        assert_eq!(calls[0].args, serde_json::json!({"a": 1, "b": ["]"]}));
    }

    #[test]
    fn surrounding_text_is_preserved() {
        let (cleaned, calls) =
            extract_bracket_calls("ok [Called search with args: {\"q\":\"x\"}] done");
        assert_eq!(cleaned, "ok  done");
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].args, serde_json::json!({"q": "x"}));
    }

    #[test]
    fn malformed_call_text_is_kept_verbatim() {
        let input = "[Called broken with args: {never closes";
        let (cleaned, calls) = extract_bracket_calls(input);
        assert_eq!(cleaned, input);
        assert!(calls.is_empty());
    }

    #[test]
    fn repair_handles_trailing_commas_and_bare_words() {
        assert_eq!(
            repair_json("{\"a\": 1,}"),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            repair_json("{query: hello, limit: 3}"),
            serde_json::json!({"query": "hello", "limit": 3})
        );
        assert_eq!(
            repair_json("{flag: true}"),
            serde_json::json!({"flag": true})
        );
        assert_eq!(
            repair_json("total garbage ["),
            serde_json::json!({"raw_arguments": "total garbage ["})
        );
    }

    #[test]
    fn filter_passes_plain_text_through() {
        let mut filter = BracketFilter::new();
        let (out, calls) = filter.feed("hello [not a call] world");
        assert_eq!(out, "hello [not a call] world");
        assert!(calls.is_empty());
    }

    #[test]
    fn filter_withholds_partial_call_across_chunks() {
        let mut filter = BracketFilter::new();
        let (out1, calls1) = filter.feed("ok [Called search with ar");
        assert_eq!(out1, "ok ");
        assert!(calls1.is_empty());
        let (out2, calls2) = filter.feed("gs: {\"q\":\"x\"}] done");
        assert_eq!(out2, " done");
        assert_eq!(calls2.len(), 1);
        assert_eq!(calls2[0].args, serde_json::json!({"q": "x"}));
        let (tail, tail_calls) = filter.finish();
        assert!(tail.is_empty());
        assert!(tail_calls.is_empty());
    }

    #[test]
    fn filter_finish_flushes_unmatched_text() {
        let mut filter = BracketFilter::new();
        let (out, _) = filter.feed("tail [Called x with args: {\"a\"");
        assert_eq!(out, "tail ");
        let (flushed, calls) = filter.finish();
        assert_eq!(flushed, "[Called x with args: {\"a\"");
        assert!(calls.is_empty());
    }
}
