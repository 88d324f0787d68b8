//! Gemini generateContent ⇄ canonical conversion and streaming adapters.

use llmux_protocol::gemini::{
    Candidate, Content, FunctionCall, FunctionDeclaration, FunctionResponse,
    GenerateContentRequest, GenerateContentResponse, GenerationConfig, InlineData, Part, Tool,
    UsageMetadata,
};
use serde_json::Value as JsonValue;

use crate::{
    CanonicalRequest, CanonicalResponse, ContentPart, Message, Role, StopReason, StreamEvent,
    TokenUsage, ToolSpec,
};

pub fn request_to_canonical(model: &str, stream: bool, req: GenerateContentRequest) -> CanonicalRequest {
    let mut out = CanonicalRequest::new(model);
    out.stream = stream;
    out.system = req.system_instruction.and_then(|content| {
        let texts: Vec<String> = content
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect();
        (!texts.is_empty()).then(|| texts.join("\n"))
    });
    if let Some(config) = req.generation_config {
        out.max_tokens = config.max_output_tokens;
        out.temperature = config.temperature;
        out.top_p = config.top_p;
        out.stop_sequences = config.stop_sequences.unwrap_or_default();
    }
    out.tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .flat_map(|tool| tool.function_declarations.unwrap_or_default())
        .map(|decl| ToolSpec {
            name: decl.name,
            description: decl.description,
            input_schema: decl.parameters,
        })
        .collect();
    out.messages = req
        .contents
        .into_iter()
        .map(|content| Message {
            role: if content.role.as_deref() == Some("model") {
                Role::Assistant
            } else {
                Role::User
            },
            content: content.parts.into_iter().filter_map(part_to_canonical).collect(),
        })
        .collect();
    out
}

fn part_to_canonical(part: Part) -> Option<ContentPart> {
    if let Some(text) = part.text {
        return Some(ContentPart::text(text));
    }
    if let Some(inline) = part.inline_data {
        return Some(ContentPart::Image {
            media_type: inline.mime_type,
            data: inline.data,
        });
    }
    if let Some(call) = part.function_call {
        return Some(ContentPart::ToolUse {
            // Gemini function calls carry no id; derive a stable one.
            id: format!("fc-{}", call.name),
            name: call.name,
            input: call.args,
        });
    }
    if let Some(response) = part.function_response {
        return Some(ContentPart::ToolResult {
            tool_use_id: format!("fc-{}", response.name),
            content: vec![ContentPart::text(response.response.to_string())],
            is_error: false,
        });
    }
    None
}

pub fn request_from_canonical(req: &CanonicalRequest) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: req.messages.iter().map(message_to_content).collect(),
        system_instruction: req.system.as_ref().map(|system| Content {
            role: None,
            parts: vec![Part::text(system.clone())],
        }),
        tools: if req.tools.is_empty() {
            None
        } else {
            Some(vec![Tool {
                function_declarations: Some(
                    req.tools
                        .iter()
                        .map(|tool| FunctionDeclaration {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.input_schema.clone(),
                        })
                        .collect(),
                ),
            }])
        },
        generation_config: Some(GenerationConfig {
            max_output_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            stop_sequences: (!req.stop_sequences.is_empty()).then(|| req.stop_sequences.clone()),
        }),
    }
}

fn message_to_content(message: &Message) -> Content {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "model",
    };
    let parts = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => Part::text(text.clone()),
            ContentPart::Image { media_type, data } => Part {
                inline_data: Some(InlineData {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                }),
                ..Part::default()
            },
            ContentPart::ToolUse { name, input, .. } => Part {
                function_call: Some(FunctionCall {
                    name: name.clone(),
                    args: input.clone(),
                }),
                ..Part::default()
            },
            ContentPart::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let name = tool_use_id.trim_start_matches("fc-").to_string();
                let text = content
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text } => Some(text.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                let response = serde_json::from_str::<JsonValue>(&text)
                    .unwrap_or_else(|_| serde_json::json!({ "result": text }));
                Part {
                    function_response: Some(FunctionResponse { name, response }),
                    ..Part::default()
                }
            }
        })
        .collect();
    Content {
        role: Some(role.to_string()),
        parts,
    }
}

pub fn response_from_canonical(resp: &CanonicalResponse) -> GenerateContentResponse {
    let parts = resp
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => Part::text(text.clone()),
            ContentPart::ToolUse { name, input, .. } => Part {
                function_call: Some(FunctionCall {
                    name: name.clone(),
                    args: input.clone(),
                }),
                ..Part::default()
            },
            ContentPart::Image { media_type, data } => Part {
                inline_data: Some(InlineData {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                }),
                ..Part::default()
            },
            ContentPart::ToolResult { .. } => Part::default(),
        })
        .collect();
    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Content {
                role: Some("model".to_string()),
                parts,
            },
            finish_reason: Some(finish_reason(resp.stop_reason).to_string()),
            index: Some(0),
        }],
        usage_metadata: Some(UsageMetadata {
            prompt_token_count: resp.usage.input_tokens,
            candidates_token_count: resp.usage.output_tokens,
            total_token_count: resp.usage.input_tokens + resp.usage.output_tokens,
        }),
        model_version: Some(resp.model.clone()),
    }
}

pub fn response_to_canonical(model: &str, resp: GenerateContentResponse) -> CanonicalResponse {
    let usage = resp.usage_metadata.unwrap_or_default();
    let mut content = Vec::new();
    let mut stop_reason = StopReason::EndTurn;
    if let Some(candidate) = resp.candidates.into_iter().next() {
        content = candidate
            .content
            .parts
            .into_iter()
            .filter_map(part_to_canonical)
            .collect();
        stop_reason = match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => StopReason::MaxTokens,
            _ if content
                .iter()
                .any(|part| matches!(part, ContentPart::ToolUse { .. })) =>
            {
                StopReason::ToolUse
            }
            _ => StopReason::EndTurn,
        };
    }
    CanonicalResponse {
        id: "gemini".to_string(),
        model: resp.model_version.unwrap_or_else(|| model.to_string()),
        content,
        stop_reason,
        usage: TokenUsage {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
        },
    }
}

pub fn finish_reason(stop: StopReason) -> &'static str {
    match stop {
        StopReason::MaxTokens => "MAX_TOKENS",
        _ => "STOP",
    }
}

// ---- streaming: canonical -> Gemini chunks ----

/// Gemini streams are a sequence of partial `GenerateContentResponse` bodies,
/// each carrying `candidates[0].content.parts`.
#[derive(Debug)]
pub struct GeminiStreamEmitter {
    model: String,
    tool_json: Option<(String, String)>,
}

impl GeminiStreamEmitter {
    pub fn new() -> Self {
        Self {
            model: "unknown".to_string(),
            tool_json: None,
        }
    }

    pub fn emit(&mut self, event: StreamEvent) -> Vec<GenerateContentResponse> {
        match event {
            StreamEvent::Start { model, .. } => {
                self.model = model;
                Vec::new()
            }
            StreamEvent::TextDelta { text } => vec![self.chunk(Part::text(text), None, None)],
            StreamEvent::ToolUseStart { name, .. } => {
                self.tool_json = Some((name, String::new()));
                Vec::new()
            }
            StreamEvent::ToolUseDelta { partial_json, .. } => {
                if let Some((_, buffer)) = self.tool_json.as_mut() {
                    buffer.push_str(&partial_json);
                }
                Vec::new()
            }
            StreamEvent::ToolUseStop { .. } => match self.tool_json.take() {
                Some((name, buffer)) => {
                    let args = serde_json::from_str::<JsonValue>(&buffer)
                        .unwrap_or_else(|_| serde_json::json!({}));
                    vec![self.chunk(
                        Part {
                            function_call: Some(FunctionCall { name, args }),
                            ..Part::default()
                        },
                        None,
                        None,
                    )]
                }
                None => Vec::new(),
            },
            StreamEvent::Finish { stop_reason, usage } => {
                vec![self.chunk(
                    Part::default(),
                    Some(finish_reason(stop_reason).to_string()),
                    Some(UsageMetadata {
                        prompt_token_count: usage.input_tokens,
                        candidates_token_count: usage.output_tokens,
                        total_token_count: usage.input_tokens + usage.output_tokens,
                    }),
                )]
            }
        }
    }

    fn chunk(
        &self,
        part: Part,
        finish_reason: Option<String>,
        usage: Option<UsageMetadata>,
    ) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    role: Some("model".to_string()),
                    parts: vec![part],
                },
                finish_reason,
                index: Some(0),
            }],
            usage_metadata: usage,
            model_version: Some(self.model.clone()),
        }
    }
}

impl Default for GeminiStreamEmitter {
    fn default() -> Self {
        Self::new()
    }
}

// ---- streaming: Gemini chunks -> canonical (upstream side) ----

#[derive(Debug, Default)]
pub struct GeminiStreamCollector {
    started: bool,
    usage: TokenUsage,
    finish: Option<StopReason>,
    saw_tool: bool,
    tool_seq: u32,
}

impl GeminiStreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&mut self, chunk: GenerateContentResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start {
                id: "gemini".to_string(),
                model: chunk
                    .model_version
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }
        if let Some(usage) = &chunk.usage_metadata {
            self.usage = TokenUsage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            };
        }
        for candidate in chunk.candidates {
            for part in candidate.content.parts {
                if let Some(text) = part.text
                    && !text.is_empty()
                {
                    events.push(StreamEvent::TextDelta { text });
                }
                if let Some(call) = part.function_call {
                    self.saw_tool = true;
                    self.tool_seq += 1;
                    let id = format!("fc-{}-{}", call.name, self.tool_seq);
                    events.push(StreamEvent::ToolUseStart {
                        id: id.clone(),
                        name: call.name,
                    });
                    events.push(StreamEvent::ToolUseDelta {
                        id: id.clone(),
                        partial_json: call.args.to_string(),
                    });
                    events.push(StreamEvent::ToolUseStop { id });
                }
            }
            if let Some(reason) = candidate.finish_reason {
                self.finish = Some(match reason.as_str() {
                    "MAX_TOKENS" => StopReason::MaxTokens,
                    _ => StopReason::EndTurn,
                });
            }
        }
        events
    }

    pub fn finish(self) -> Vec<StreamEvent> {
        let stop_reason = if self.saw_tool {
            StopReason::ToolUse
        } else {
            self.finish.unwrap_or(StopReason::EndTurn)
        };
        vec![StreamEvent::Finish {
            stop_reason,
            usage: self.usage,
        }]
    }
}
