//! Anthropic messages ⇄ canonical conversion and the streaming emitter that
//! produces a well-formed Anthropic event sequence from canonical events.

use llmux_protocol::claude::{
    ContentBlock, ImageSource, MessageContent, MessageDeltaBody, MessageParam, MessagesRequest,
    MessagesResponse, StreamContentBlock, StreamDelta, StreamEvent as WireEvent, SystemParam, Tool,
    ToolResultContent, Usage,
};

use crate::{
    CanonicalRequest, CanonicalResponse, ContentPart, Message, Role, StopReason, StreamEvent,
    TokenUsage, ToolSpec,
};

pub fn request_to_canonical(req: MessagesRequest) -> CanonicalRequest {
    let mut out = CanonicalRequest::new(req.model);
    out.stream = req.stream.unwrap_or(false);
    out.max_tokens = req.max_tokens;
    out.temperature = req.temperature;
    out.top_p = req.top_p;
    out.stop_sequences = req.stop_sequences.unwrap_or_default();
    out.system = req.system.and_then(system_text);
    out.tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| ToolSpec {
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        })
        .collect();
    out.messages = req
        .messages
        .into_iter()
        .map(|message| Message {
            role: if message.role == "assistant" {
                Role::Assistant
            } else {
                Role::User
            },
            content: content_to_parts(message.content),
        })
        .collect();
    out
}

fn system_text(system: SystemParam) -> Option<String> {
    match system {
        SystemParam::Text(text) => (!text.is_empty()).then_some(text),
        SystemParam::Blocks(blocks) => {
            let texts: Vec<String> = blocks.into_iter().map(|block| block.text).collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
    }
}

fn content_to_parts(content: MessageContent) -> Vec<ContentPart> {
    match content {
        MessageContent::Text(text) => vec![ContentPart::text(text)],
        MessageContent::Blocks(blocks) => blocks.into_iter().map(block_to_part).collect(),
    }
}

fn block_to_part(block: ContentBlock) -> ContentPart {
    match block {
        ContentBlock::Text { text } => ContentPart::text(text),
        ContentBlock::Image { source } => ContentPart::Image {
            media_type: source.media_type,
            data: source.data,
        },
        ContentBlock::ToolUse { id, name, input } => ContentPart::ToolUse { id, name, input },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ContentPart::ToolResult {
            tool_use_id,
            content: match content {
                None => Vec::new(),
                Some(ToolResultContent::Text(text)) => vec![ContentPart::text(text)],
                Some(ToolResultContent::Blocks(blocks)) => {
                    blocks.into_iter().map(block_to_part).collect()
                }
            },
            is_error: is_error.unwrap_or(false),
        },
    }
}

pub fn request_from_canonical(req: &CanonicalRequest) -> MessagesRequest {
    MessagesRequest {
        model: req.model.clone(),
        messages: req
            .messages
            .iter()
            .map(|message| MessageParam {
                role: message.role.as_str().to_string(),
                content: MessageContent::Blocks(
                    message.content.iter().map(part_to_block).collect(),
                ),
            })
            .collect(),
        system: req.system.clone().map(SystemParam::Text),
        tools: if req.tools.is_empty() {
            None
        } else {
            Some(
                req.tools
                    .iter()
                    .map(|tool| Tool {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        input_schema: tool.input_schema.clone(),
                    })
                    .collect(),
            )
        },
        tool_choice: None,
        max_tokens: Some(req.max_tokens.unwrap_or(4096)),
        stream: req.stream.then_some(true),
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: (!req.stop_sequences.is_empty()).then(|| req.stop_sequences.clone()),
    }
}

fn part_to_block(part: &ContentPart) -> ContentBlock {
    match part {
        ContentPart::Text { text } => ContentBlock::Text { text: text.clone() },
        ContentPart::Image { media_type, data } => ContentBlock::Image {
            source: ImageSource {
                kind: "base64".to_string(),
                media_type: media_type.clone(),
                data: data.clone(),
            },
        },
        ContentPart::ToolUse { id, name, input } => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        ContentPart::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ContentBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: (!content.is_empty()).then(|| {
                ToolResultContent::Blocks(content.iter().map(part_to_block).collect())
            }),
            is_error: (*is_error).then_some(true),
        },
    }
}

pub fn response_from_canonical(resp: &CanonicalResponse) -> MessagesResponse {
    MessagesResponse {
        id: format!("msg_{}", resp.id),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: resp.model.clone(),
        content: resp.content.iter().map(part_to_block).collect(),
        stop_reason: Some(stop_reason(resp.stop_reason).to_string()),
        stop_sequence: None,
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
        },
    }
}

pub fn response_to_canonical(resp: MessagesResponse) -> CanonicalResponse {
    CanonicalResponse {
        id: resp.id.trim_start_matches("msg_").to_string(),
        model: resp.model,
        content: resp.content.into_iter().map(block_to_part).collect(),
        stop_reason: parse_stop_reason(resp.stop_reason.as_deref()),
        usage: TokenUsage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
        },
    }
}

pub fn stop_reason(stop: StopReason) -> &'static str {
    match stop {
        StopReason::EndTurn => "end_turn",
        StopReason::MaxTokens => "max_tokens",
        StopReason::StopSequence => "stop_sequence",
        StopReason::ToolUse => "tool_use",
    }
}

pub fn parse_stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        Some("tool_use") => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

// ---- streaming: canonical -> Anthropic events ----

#[derive(Debug, PartialEq)]
enum OpenBlock {
    None,
    Text,
    Tool,
}

/// Emits the Anthropic stream grammar: `message_start`, well-nested content
/// blocks, `message_delta` with stop reason and usage, `message_stop` last.
#[derive(Debug)]
pub struct ClaudeStreamEmitter {
    model: String,
    next_index: u32,
    open: OpenBlock,
    stopped: bool,
}

impl ClaudeStreamEmitter {
    pub fn new() -> Self {
        Self {
            model: "unknown".to_string(),
            next_index: 0,
            open: OpenBlock::None,
            stopped: false,
        }
    }

    pub fn emit(&mut self, event: StreamEvent) -> Vec<WireEvent> {
        if self.stopped {
            return Vec::new();
        }
        match event {
            StreamEvent::Start { id, model } => {
                self.model = model.clone();
                vec![WireEvent::MessageStart {
                    message: MessagesResponse {
                        id: format!("msg_{id}"),
                        kind: "message".to_string(),
                        role: "assistant".to_string(),
                        model,
                        content: Vec::new(),
                        stop_reason: None,
                        stop_sequence: None,
                        usage: Usage::default(),
                    },
                }]
            }
            StreamEvent::TextDelta { text } => {
                let mut out = Vec::new();
                if self.open == OpenBlock::Tool {
                    out.push(self.close_block());
                }
                if self.open == OpenBlock::None {
                    out.push(WireEvent::ContentBlockStart {
                        index: self.next_index,
                        content_block: StreamContentBlock::Text {
                            text: String::new(),
                        },
                    });
                    self.open = OpenBlock::Text;
                }
                out.push(WireEvent::ContentBlockDelta {
                    index: self.next_index,
                    delta: StreamDelta::TextDelta { text },
                });
                out
            }
            StreamEvent::ToolUseStart { id, name } => {
                let mut out = Vec::new();
                if self.open != OpenBlock::None {
                    out.push(self.close_block());
                }
                out.push(WireEvent::ContentBlockStart {
                    index: self.next_index,
                    content_block: StreamContentBlock::ToolUse {
                        id,
                        name,
                        input: serde_json::json!({}),
                    },
                });
                self.open = OpenBlock::Tool;
                out
            }
            StreamEvent::ToolUseDelta { partial_json, .. } => {
                if self.open != OpenBlock::Tool {
                    return Vec::new();
                }
                vec![WireEvent::ContentBlockDelta {
                    index: self.next_index,
                    delta: StreamDelta::InputJsonDelta { partial_json },
                }]
            }
            StreamEvent::ToolUseStop { .. } => {
                if self.open == OpenBlock::Tool {
                    vec![self.close_block()]
                } else {
                    Vec::new()
                }
            }
            StreamEvent::Finish {
                stop_reason: reason,
                usage,
            } => {
                self.stopped = true;
                let mut out = Vec::new();
                if self.open != OpenBlock::None {
                    out.push(self.close_block());
                }
                out.push(WireEvent::MessageDelta {
                    delta: MessageDeltaBody {
                        stop_reason: Some(stop_reason(reason).to_string()),
                        stop_sequence: None,
                    },
                    usage: Usage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    },
                });
                out.push(WireEvent::MessageStop);
                out
            }
        }
    }

    fn close_block(&mut self) -> WireEvent {
        let event = WireEvent::ContentBlockStop {
            index: self.next_index,
        };
        self.next_index += 1;
        self.open = OpenBlock::None;
        event
    }
}

impl Default for ClaudeStreamEmitter {
    fn default() -> Self {
        Self::new()
    }
}

// ---- streaming: Anthropic events -> canonical (upstream side) ----

#[derive(Debug, Default)]
pub struct ClaudeStreamCollector {
    input_tokens: u32,
    tool_by_index: std::collections::HashMap<u32, String>,
}

impl ClaudeStreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&mut self, event: WireEvent) -> Vec<StreamEvent> {
        match event {
            WireEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
                vec![StreamEvent::Start {
                    id: message.id.trim_start_matches("msg_").to_string(),
                    model: message.model,
                }]
            }
            WireEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StreamContentBlock::Text { text } => {
                    if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![StreamEvent::TextDelta { text }]
                    }
                }
                StreamContentBlock::ToolUse { id, name, .. } => {
                    self.tool_by_index.insert(index, id.clone());
                    vec![StreamEvent::ToolUseStart { id, name }]
                }
            },
            WireEvent::ContentBlockDelta { index, delta } => match delta {
                StreamDelta::TextDelta { text } => vec![StreamEvent::TextDelta { text }],
                StreamDelta::InputJsonDelta { partial_json } => {
                    match self.tool_by_index.get(&index) {
                        Some(id) => vec![StreamEvent::ToolUseDelta {
                            id: id.clone(),
                            partial_json,
                        }],
                        None => Vec::new(),
                    }
                }
            },
            WireEvent::ContentBlockStop { index } => match self.tool_by_index.remove(&index) {
                Some(id) => vec![StreamEvent::ToolUseStop { id }],
                None => Vec::new(),
            },
            WireEvent::MessageDelta { delta, usage } => {
                vec![StreamEvent::Finish {
                    stop_reason: parse_stop_reason(delta.stop_reason.as_deref()),
                    usage: TokenUsage {
                        input_tokens: if usage.input_tokens > 0 {
                            usage.input_tokens
                        } else {
                            self.input_tokens
                        },
                        output_tokens: usage.output_tokens,
                    },
                }]
            }
            WireEvent::MessageStop | WireEvent::Ping | WireEvent::Error { .. } => Vec::new(),
        }
    }
}
