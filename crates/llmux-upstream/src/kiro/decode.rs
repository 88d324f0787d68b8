//! Incremental extraction of JSON records from Kiro's AWS-event-stream
//! framed response bodies.
//!
//! The framing itself (binary preludes, header blocks, CRCs) is never
//! parsed; the decoder scans for the JSON objects embedded in the payload by
//! looking for known key markers, then walks braces with string/escape
//! awareness. Whatever trails an incomplete object is carried over to the
//! next chunk, so records may be split at any byte boundary.

use serde_json::Value as JsonValue;

/// One decoded payload record. Five shapes exist on this wire.
#[derive(Debug, Clone, PartialEq)]
pub enum KiroRecord {
    /// `{"content": "..."}` — assistant text delta.
    Content(String),
    /// `{"name": "...", "toolUseId": "...", "input": "...", "stop": ...}`
    ToolStart {
        name: String,
        tool_use_id: String,
        input: String,
        stop: bool,
    },
    /// `{"input": "..."}` — continuation for the in-flight tool use.
    ToolInput(String),
    /// `{"stop": true}` — terminator for the in-flight tool use.
    ToolStop,
    /// `{"contextUsagePercentage": N}` — context-window consumption.
    ContextUsage(f64),
}

/// Key markers that identify a payload object amid the binary framing.
const MARKERS: [&[u8]; 5] = [
    b"\"content\"",
    b"\"toolUseId\"",
    b"\"input\"",
    b"\"stop\"",
    b"\"contextUsagePercentage\"",
];

#[derive(Debug, Default)]
pub struct KiroStreamDecoder {
    buf: Vec<u8>,
    last_content: Option<String>,
}

enum Scan {
    Complete(usize),
    Incomplete,
}

impl KiroStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<KiroRecord> {
        self.buf.extend_from_slice(chunk);
        let mut records = Vec::new();
        loop {
            let Some(start) = self.next_object_start() else {
                self.trim_dead_prefix();
                break;
            };
            match scan_object(&self.buf[start..]) {
                Scan::Complete(len) => {
                    let object = self.buf[start..start + len].to_vec();
                    self.buf.drain(..start + len);
                    if let Some(record) = parse_record(&object)
                        && !self.is_duplicate_content(&record)
                    {
                        records.push(record);
                    }
                }
                Scan::Incomplete => {
                    // Keep the partial object as the carry-over buffer.
                    self.buf.drain(..start);
                    break;
                }
            }
        }
        records
    }

    /// End-of-stream: one last attempt over whatever is buffered.
    pub fn finish(&mut self) -> Vec<KiroRecord> {
        let records = self.feed(&[]);
        self.buf.clear();
        records
    }

    /// Earliest marker in the buffer, backed up to its enclosing `{`.
    fn next_object_start(&self) -> Option<usize> {
        let marker_at = MARKERS
            .iter()
            .filter_map(|marker| find_subslice(&self.buf, marker))
            .min()?;
        self.buf[..marker_at]
            .iter()
            .rposition(|&byte| byte == b'{')
    }

    /// Nothing useful before the last `{` (if any); drop framing noise so
    /// the buffer stays bounded between records.
    fn trim_dead_prefix(&mut self) {
        if let Some(last_open) = self.buf.iter().rposition(|&byte| byte == b'{') {
            self.buf.drain(..last_open);
        } else {
            self.buf.clear();
        }
    }

    /// Upstream occasionally double-emits a content delta; collapse exact
    /// back-to-back duplicates.
    fn is_duplicate_content(&mut self, record: &KiroRecord) -> bool {
        match record {
            KiroRecord::Content(text) => {
                if self.last_content.as_deref() == Some(text.as_str()) {
                    return true;
                }
                self.last_content = Some(text.clone());
                false
            }
            _ => {
                self.last_content = None;
                false
            }
        }
    }
}

/// Walk an object starting at `{`, tracking brace depth, string state and
/// backslash escapes. Returns the byte length of the complete object.
fn scan_object(bytes: &[u8]) -> Scan {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &byte) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Scan::Complete(i + 1);
                }
            }
            _ => {}
        }
    }
    Scan::Incomplete
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_record(object: &[u8]) -> Option<KiroRecord> {
    let value: JsonValue = serde_json::from_slice(object).ok()?;
    let map = value.as_object()?;

    if let Some(pct) = map.get("contextUsagePercentage").and_then(JsonValue::as_f64) {
        return Some(KiroRecord::ContextUsage(pct));
    }
    if let (Some(name), Some(tool_use_id)) = (
        map.get("name").and_then(JsonValue::as_str),
        map.get("toolUseId").and_then(JsonValue::as_str),
    ) {
        return Some(KiroRecord::ToolStart {
            name: name.to_string(),
            tool_use_id: tool_use_id.to_string(),
            input: map
                .get("input")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            stop: map.get("stop").and_then(JsonValue::as_bool).unwrap_or(false),
        });
    }
    if let Some(content) = map.get("content").and_then(JsonValue::as_str) {
        return Some(KiroRecord::Content(content.to_string()));
    }
    if let Some(input) = map.get("input").and_then(JsonValue::as_str) {
        return Some(KiroRecord::ToolInput(input.to_string()));
    }
    if map.get("stop").and_then(JsonValue::as_bool) == Some(true) {
        return Some(KiroRecord::ToolStop);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &str) -> Vec<u8> {
        // Fake event-stream noise around the JSON payload.
        let mut bytes = vec![0x00, 0x00, 0x01, 0x2a, 0x0d, b':', b'e', b'v'];
        bytes.extend_from_slice(payload.as_bytes());
        bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        bytes
    }

    #[test]
    fn extracts_content_from_framed_payload() {
        let mut decoder = KiroStreamDecoder::new();
        let records = decoder.feed(&framed(r#"{"content":"hello"}"#));
        assert_eq!(records, vec![KiroRecord::Content("hello".to_string())]);
    }

    #[test]
    fn survives_arbitrary_byte_splits() {
        let body = [
            framed(r#"{"content":"one"}"#),
            framed(r#"{"name":"run","toolUseId":"tu1","input":"{\"c"}"#),
            framed(r#"{"input":"md\":1}"}"#),
            framed(r#"{"stop":true}"#),
            framed(r#"{"contextUsagePercentage":12.5}"#),
        ]
        .concat();

        // Re-run the whole body at every split size, including size 1.
        for split in [1usize, 2, 3, 7, 16, body.len()] {
            let mut decoder = KiroStreamDecoder::new();
            let mut records = Vec::new();
            for chunk in body.chunks(split) {
                records.extend(decoder.feed(chunk));
            }
            records.extend(decoder.finish());
            assert_eq!(
                records,
                vec![
                    KiroRecord::Content("one".to_string()),
                    KiroRecord::ToolStart {
                        name: "run".to_string(),
                        tool_use_id: "tu1".to_string(),
                        input: "{\"c".to_string(),
                        stop: false,
                    },
                    KiroRecord::ToolInput("md\":1}".to_string()),
                    KiroRecord::ToolStop,
                    KiroRecord::ContextUsage(12.5),
                ],
                "split={split}"
            );
        }
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_depth() {
        let mut decoder = KiroStreamDecoder::new();
        let records = decoder.feed(&framed(r#"{"content":"a } b { c \" d"}"#));
        assert_eq!(
            records,
            vec![KiroRecord::Content("a } b { c \" d".to_string())]
        );
    }

    #[test]
    fn back_to_back_duplicate_content_collapses() {
        let mut decoder = KiroStreamDecoder::new();
        let mut body = framed(r#"{"content":"dup"}"#);
        body.extend(framed(r#"{"content":"dup"}"#));
        body.extend(framed(r#"{"content":"next"}"#));
        body.extend(framed(r#"{"content":"next"}"#));
        let records = decoder.feed(&body);
        assert_eq!(
            records,
            vec![
                KiroRecord::Content("dup".to_string()),
                KiroRecord::Content("next".to_string()),
            ]
        );
    }

    #[test]
    fn repeated_content_after_other_records_is_kept() {
        let mut decoder = KiroStreamDecoder::new();
        let mut body = framed(r#"{"content":"x"}"#);
        body.extend(framed(r#"{"stop":true}"#));
        body.extend(framed(r#"{"content":"x"}"#));
        let records = decoder.feed(&body);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn unknown_objects_are_skipped() {
        let mut decoder = KiroStreamDecoder::new();
        // Contains the "input" marker as a non-string value; not a record.
        let records = decoder.feed(&framed(r#"{"input":42}"#));
        assert!(records.is_empty());
    }
}
