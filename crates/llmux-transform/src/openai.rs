//! OpenAI chat-completions ⇄ canonical conversion, plus the streaming
//! emitter (canonical events → chunks) and collector (chunks → canonical
//! events) used on the two sides of the pipeline.

use llmux_protocol::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChunkChoice, ChunkDelta, ContentPart as WirePart, FunctionCall, FunctionCallChunk,
    FunctionDefinition, ImageUrl, MessageContent, ToolCall, ToolCallChunk, ToolDefinition, Usage,
};
use serde_json::Value as JsonValue;

use crate::{
    CanonicalRequest, CanonicalResponse, ContentPart, Message, Role, StopReason, StreamEvent,
    TokenUsage, ToolSpec, parse_tool_arguments,
};

pub fn request_to_canonical(req: ChatCompletionRequest) -> CanonicalRequest {
    let mut out = CanonicalRequest::new(req.model);
    out.stream = req.stream.unwrap_or(false);
    out.max_tokens = req.max_completion_tokens.or(req.max_tokens);
    out.temperature = req.temperature;
    out.top_p = req.top_p;
    out.stop_sequences = stop_to_sequences(req.stop);
    out.tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| ToolSpec {
            name: tool.function.name,
            description: tool.function.description,
            input_schema: tool.function.parameters,
        })
        .collect();

    let mut system_lines: Vec<String> = Vec::new();
    for message in req.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(text) = content_as_text(message.content) {
                    system_lines.push(text);
                }
            }
            "tool" => {
                let tool_use_id = message.tool_call_id.unwrap_or_default();
                let content = match content_as_text(message.content) {
                    Some(text) => vec![ContentPart::text(text)],
                    None => Vec::new(),
                };
                out.messages.push(Message::user(vec![ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error: false,
                }]));
            }
            "assistant" => {
                let mut parts = content_to_parts(message.content);
                for call in message.tool_calls.unwrap_or_default() {
                    parts.push(ContentPart::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        input: parse_tool_arguments(&call.function.arguments),
                    });
                }
                out.messages.push(Message::assistant(parts));
            }
            _ => {
                out.messages.push(Message::user(content_to_parts(message.content)));
            }
        }
    }
    if !system_lines.is_empty() {
        out.system = Some(system_lines.join("\n"));
    }
    out
}

pub fn request_from_canonical(req: &CanonicalRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: Some(MessageContent::Text(system.clone())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        });
    }
    for message in &req.messages {
        messages.extend(message_from_canonical(message));
    }

    ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        tools: if req.tools.is_empty() {
            None
        } else {
            Some(
                req.tools
                    .iter()
                    .map(|tool| ToolDefinition {
                        kind: "function".to_string(),
                        function: FunctionDefinition {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        },
        tool_choice: None,
        stream: req.stream.then_some(true),
        max_tokens: req.max_tokens,
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: if req.stop_sequences.is_empty() {
            None
        } else {
            Some(JsonValue::from(req.stop_sequences.clone()))
        },
    }
}

fn message_from_canonical(message: &Message) -> Vec<ChatMessage> {
    let mut out = Vec::new();
    match message.role {
        Role::Assistant => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();
            for part in &message.content {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                        id: id.clone(),
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name: name.clone(),
                            arguments: input.to_string(),
                        },
                    }),
                    // Assistant images/tool-results do not exist on this wire.
                    ContentPart::Image { .. } | ContentPart::ToolResult { .. } => {}
                }
            }
            out.push(ChatMessage {
                role: "assistant".to_string(),
                content: (!text_parts.is_empty())
                    .then(|| MessageContent::Text(text_parts.join("\n"))),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
                name: None,
            });
        }
        Role::User => {
            let mut wire_parts: Vec<WirePart> = Vec::new();
            for part in &message.content {
                match part {
                    ContentPart::Text { text } => wire_parts.push(WirePart::Text {
                        text: text.clone(),
                    }),
                    ContentPart::Image { media_type, data } => wire_parts.push(WirePart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:{media_type};base64,{data}"),
                            detail: None,
                        },
                    }),
                    ContentPart::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        // Tool results leave the user message: OpenAI models
                        // them as a separate role:tool message.
                        flush_user_parts(&mut out, &mut wire_parts);
                        out.push(ChatMessage {
                            role: "tool".to_string(),
                            content: Some(MessageContent::Text(parts_as_text(content))),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                            name: None,
                        });
                    }
                    ContentPart::ToolUse { .. } => {}
                }
            }
            flush_user_parts(&mut out, &mut wire_parts);
        }
    }
    out
}

fn flush_user_parts(out: &mut Vec<ChatMessage>, parts: &mut Vec<WirePart>) {
    if parts.is_empty() {
        return;
    }
    let drained = std::mem::take(parts);
    let content = if drained.len() == 1
        && let WirePart::Text { text } = &drained[0]
    {
        MessageContent::Text(text.clone())
    } else {
        MessageContent::Parts(drained)
    };
    out.push(ChatMessage {
        role: "user".to_string(),
        content: Some(content),
        tool_calls: None,
        tool_call_id: None,
        name: None,
    });
}

pub fn response_from_canonical(resp: &CanonicalResponse, created: i64) -> ChatCompletionResponse {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for part in &resp.content {
        match part {
            ContentPart::Text { text } => text_parts.push(text.clone()),
            ContentPart::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            ContentPart::Image { .. } | ContentPart::ToolResult { .. } => {}
        }
    }
    ChatCompletionResponse {
        id: format!("chatcmpl-{}", resp.id),
        object: "chat.completion".to_string(),
        created,
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: Some(MessageContent::Text(text_parts.join(""))),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
                name: None,
            },
            finish_reason: Some(finish_reason(resp.stop_reason).to_string()),
        }],
        usage: Some(Usage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        }),
    }
}

pub fn response_to_canonical(resp: ChatCompletionResponse) -> CanonicalResponse {
    let usage = resp.usage.unwrap_or_default();
    let mut content = Vec::new();
    let mut stop_reason = StopReason::EndTurn;
    if let Some(choice) = resp.choices.into_iter().next() {
        if let Some(text) = content_as_text(choice.message.content)
            && !text.is_empty()
        {
            content.push(ContentPart::text(text));
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            content.push(ContentPart::ToolUse {
                id: call.id,
                name: call.function.name,
                input: parse_tool_arguments(&call.function.arguments),
            });
        }
        stop_reason = match choice.finish_reason.as_deref() {
            Some("length") => StopReason::MaxTokens,
            Some("tool_calls") => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        };
    }
    CanonicalResponse {
        id: resp.id,
        model: resp.model,
        content,
        stop_reason,
        usage: TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    }
}

fn content_as_text(content: Option<MessageContent>) -> Option<String> {
    match content? {
        MessageContent::Text(text) => Some(text),
        MessageContent::Parts(parts) => {
            let texts: Vec<String> = parts
                .into_iter()
                .filter_map(|part| match part {
                    WirePart::Text { text } => Some(text),
                    WirePart::ImageUrl { .. } => None,
                })
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
    }
}

fn content_to_parts(content: Option<MessageContent>) -> Vec<ContentPart> {
    match content {
        None => Vec::new(),
        Some(MessageContent::Text(text)) => vec![ContentPart::text(text)],
        Some(MessageContent::Parts(parts)) => parts
            .into_iter()
            .map(|part| match part {
                WirePart::Text { text } => ContentPart::text(text),
                WirePart::ImageUrl { image_url } => image_to_part(&image_url.url),
            })
            .collect(),
    }
}

fn image_to_part(url: &str) -> ContentPart {
    match parse_data_url(url) {
        Some((media_type, data)) => ContentPart::Image { media_type, data },
        // Remote URLs are not fetched here; keep a marker so the turn is not empty.
        None => ContentPart::text(format!("[image: {url}]")),
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type.to_string(), data.to_string()))
}

fn parts_as_text(parts: &[ContentPart]) -> String {
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    texts.join("\n")
}

fn stop_to_sequences(stop: Option<JsonValue>) -> Vec<String> {
    match stop {
        Some(JsonValue::String(s)) => vec![s],
        Some(JsonValue::Array(items)) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn finish_reason(stop: StopReason) -> &'static str {
    match stop {
        StopReason::EndTurn | StopReason::StopSequence => "stop",
        StopReason::MaxTokens => "length",
        StopReason::ToolUse => "tool_calls",
    }
}

// ---- streaming: canonical -> OpenAI chunks ----

#[derive(Debug)]
pub struct OpenAiStreamEmitter {
    id: String,
    model: String,
    created: i64,
    role_emitted: bool,
    tool_index: u32,
    open_tool: Option<String>,
}

impl OpenAiStreamEmitter {
    pub fn new(created: i64) -> Self {
        Self {
            id: "chatcmpl-unknown".to_string(),
            model: "unknown".to_string(),
            created,
            role_emitted: false,
            tool_index: 0,
            open_tool: None,
        }
    }

    pub fn emit(&mut self, event: StreamEvent) -> Vec<ChatCompletionChunk> {
        match event {
            StreamEvent::Start { id, model } => {
                self.id = format!("chatcmpl-{id}");
                self.model = model;
                self.role_emitted = true;
                vec![self.chunk(
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        ..ChunkDelta::default()
                    },
                    None,
                    None,
                )]
            }
            StreamEvent::TextDelta { text } => {
                let mut out = self.ensure_role();
                out.push(self.chunk(
                    ChunkDelta {
                        content: Some(text),
                        ..ChunkDelta::default()
                    },
                    None,
                    None,
                ));
                out
            }
            StreamEvent::ToolUseStart { id, name } => {
                let mut out = self.ensure_role();
                if self.open_tool.take().is_some() {
                    self.tool_index += 1;
                }
                self.open_tool = Some(id.clone());
                out.push(self.chunk(
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallChunk {
                            index: self.tool_index,
                            id: Some(id),
                            kind: Some("function".to_string()),
                            function: Some(FunctionCallChunk {
                                name: Some(name),
                                arguments: Some(String::new()),
                            }),
                        }]),
                        ..ChunkDelta::default()
                    },
                    None,
                    None,
                ));
                out
            }
            StreamEvent::ToolUseDelta { partial_json, .. } => {
                vec![self.chunk(
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallChunk {
                            index: self.tool_index,
                            id: None,
                            kind: None,
                            function: Some(FunctionCallChunk {
                                name: None,
                                arguments: Some(partial_json),
                            }),
                        }]),
                        ..ChunkDelta::default()
                    },
                    None,
                    None,
                )]
            }
            StreamEvent::ToolUseStop { .. } => {
                if self.open_tool.take().is_some() {
                    self.tool_index += 1;
                }
                Vec::new()
            }
            StreamEvent::Finish { stop_reason, usage } => {
                vec![self.chunk(
                    ChunkDelta::default(),
                    Some(finish_reason(stop_reason).to_string()),
                    Some(Usage {
                        prompt_tokens: usage.input_tokens,
                        completion_tokens: usage.output_tokens,
                        total_tokens: usage.input_tokens + usage.output_tokens,
                    }),
                )]
            }
        }
    }

    fn ensure_role(&mut self) -> Vec<ChatCompletionChunk> {
        if self.role_emitted {
            return Vec::new();
        }
        self.role_emitted = true;
        vec![self.chunk(
            ChunkDelta {
                role: Some("assistant".to_string()),
                ..ChunkDelta::default()
            },
            None,
            None,
        )]
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

// ---- streaming: OpenAI chunks -> canonical (upstream side) ----

#[derive(Debug, Default)]
pub struct OpenAiStreamCollector {
    started: bool,
    open_tool: Option<String>,
    usage: TokenUsage,
    finish: Option<StopReason>,
}

impl OpenAiStreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&mut self, chunk: ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start {
                id: chunk.id.trim_start_matches("chatcmpl-").to_string(),
                model: chunk.model.clone(),
            });
        }
        if let Some(usage) = &chunk.usage {
            self.usage = TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content
                && !text.is_empty()
            {
                events.push(StreamEvent::TextDelta { text });
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                if let Some(id) = call.id {
                    if let Some(open) = self.open_tool.take() {
                        events.push(StreamEvent::ToolUseStop { id: open });
                    }
                    let name = call
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default();
                    self.open_tool = Some(id.clone());
                    events.push(StreamEvent::ToolUseStart { id: id.clone(), name });
                    if let Some(args) = call.function.and_then(|f| f.arguments)
                        && !args.is_empty()
                    {
                        events.push(StreamEvent::ToolUseDelta {
                            id,
                            partial_json: args,
                        });
                    }
                } else if let Some(open) = self.open_tool.clone()
                    && let Some(args) = call.function.and_then(|f| f.arguments)
                    && !args.is_empty()
                {
                    events.push(StreamEvent::ToolUseDelta {
                        id: open,
                        partial_json: args,
                    });
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish = Some(match reason.as_str() {
                    "length" => StopReason::MaxTokens,
                    "tool_calls" => StopReason::ToolUse,
                    _ => StopReason::EndTurn,
                });
            }
        }
        events
    }

    /// Terminal events once the upstream body ends.
    pub fn finish(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(open) = self.open_tool.take() {
            events.push(StreamEvent::ToolUseStop { id: open });
        }
        events.push(StreamEvent::Finish {
            stop_reason: self.finish.unwrap_or(StopReason::EndTurn),
            usage: self.usage,
        });
        events
    }
}
