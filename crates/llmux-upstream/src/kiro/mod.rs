//! Claude-Kiro adapter: CodeWhisperer-style conversation-state requests,
//! AWS event-stream responses, machine-id headers, inline bracket tool
//! calls.

pub mod bracket;
pub mod decode;
mod usage;

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};

use llmux_common::error::{ProviderError, ProviderResult};
use llmux_pool::adapter::{Adapter, StreamReceiver};
use llmux_pool::record::{ProviderRecord, ProviderType};
use llmux_transform::history::{
    CONTINUE_PROMPT, dedup_tool_results, drop_placeholder_tail, merge_adjacent_roles,
    retain_recent_images, split_history_current,
};
use llmux_transform::{
    CanonicalRequest, CanonicalResponse, ContentPart, Message, Role, StopReason, StreamEvent,
    TokenUsage,
};

use crate::counting;
use crate::http::{self, HttpCtx};
use bracket::{BracketCall, BracketFilter, extract_bracket_calls, repair_json};
use decode::{KiroRecord, KiroStreamDecoder};

const API_URL: &str = "https://codewhisperer.{region}.amazonaws.com/generateAssistantResponse";
const USAGE_URL: &str = "https://codewhisperer.{region}.amazonaws.com/getUsageLimits";
const MACHINE_ID_SUFFIX: &str = "KIRO_DEFAULT_MACHINE";
/// Context window used to back-compute input tokens from
/// `contextUsagePercentage`.
const CLAUDE_DEFAULT_MAX_TOKENS: u32 = 200_000;
/// Current-turn filler when the only payload is tool results.
const TOOL_RESULTS_PROMPT: &str = "Tool results provided.";

const MODELS: [&str; 5] = [
    "claude-opus-4-5",
    "claude-sonnet-4-5",
    "claude-haiku-4-5",
    "claude-sonnet-4",
    "claude-3-7-sonnet",
];

pub struct KiroAdapter {
    ctx: HttpCtx,
    api_url_template: String,
    usage_url_template: String,
}

impl KiroAdapter {
    pub fn new(ctx: HttpCtx) -> Self {
        Self {
            ctx,
            api_url_template: API_URL.to_string(),
            usage_url_template: USAGE_URL.to_string(),
        }
    }

    /// Test constructor pointing both endpoints at one base URL.
    pub fn with_base_url(ctx: HttpCtx, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            ctx,
            api_url_template: format!("{base}/generateAssistantResponse"),
            usage_url_template: format!("{base}/getUsageLimits"),
        }
    }

    fn api_url(&self, record: &ProviderRecord) -> String {
        self.api_url_template.replace("{region}", record.region())
    }

    fn usage_url(&self, record: &ProviderRecord) -> String {
        self.usage_url_template.replace("{region}", record.region())
    }
}

pub(crate) fn machine_id(record: &ProviderRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.uuid.as_bytes());
    hasher.update(record.profile_arn.as_deref().unwrap_or_default().as_bytes());
    hasher.update(record.client_id.as_deref().unwrap_or_default().as_bytes());
    hasher.update(MACHINE_ID_SUFFIX.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn build_headers(record: &ProviderRecord) -> ProviderResult<Vec<(String, String)>> {
    let access_token = record
        .access_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            ProviderError::CredentialMissing(format!("provider {} has no access token", record.uuid))
        })?;
    let machine = machine_id(record);
    Ok(vec![
        ("authorization".into(), format!("Bearer {access_token}")),
        ("content-type".into(), "application/x-amz-json-1.0".into()),
        (
            "user-agent".into(),
            format!(
                "aws-sdk-js/1.0.7 ua/2.1 os/{}#{} lang/js md/nodejs api/codewhispererstreaming#1.0.7 m/E sdk-machine-id#{machine}",
                std::env::consts::OS,
                std::env::consts::ARCH,
            ),
        ),
        (
            "x-amz-user-agent".into(),
            format!("aws-sdk-js/1.0.7 KiroIDE sdk-machine-id#{machine}"),
        ),
        (
            "amz-sdk-invocation-id".into(),
            uuid::Uuid::new_v4().to_string(),
        ),
        ("amz-sdk-request".into(), "attempt=1; max=1".into()),
    ])
}

pub(crate) fn context_usage_to_input_tokens(pct: f64) -> u32 {
    (pct / 100.0 * CLAUDE_DEFAULT_MAX_TOKENS as f64).round() as u32
}

// ---- request building ----

fn shaped_messages(req: &CanonicalRequest) -> (Vec<Message>, Message) {
    let mut messages = merge_adjacent_roles(req.messages.clone());
    drop_placeholder_tail(&mut messages);
    retain_recent_images(&mut messages);
    for message in messages.iter_mut() {
        dedup_tool_results(message);
    }
    split_history_current(messages)
}

fn user_input_message(
    message: &Message,
    model: &str,
    system: Option<&str>,
    tools: Option<&CanonicalRequest>,
) -> JsonValue {
    let mut content = message.joined_text();
    if let Some(system) = system
        && !system.is_empty()
    {
        content = if content.is_empty() {
            system.to_string()
        } else {
            format!("{system}\n\n{content}")
        };
    }

    let mut images = Vec::new();
    let mut tool_results = Vec::new();
    for part in &message.content {
        match part {
            ContentPart::Image { media_type, data } => {
                let format = media_type.strip_prefix("image/").unwrap_or("png");
                images.push(json!({
                    "format": format,
                    "source": { "bytes": data },
                }));
            }
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let text = content
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text } => Some(text.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                tool_results.push(json!({
                    "toolUseId": tool_use_id,
                    "status": if *is_error { "error" } else { "success" },
                    "content": [{ "text": text }],
                }));
            }
            ContentPart::Text { .. } | ContentPart::ToolUse { .. } => {}
        }
    }

    // Upstream rejects an empty current content.
    if content.is_empty() {
        content = if tool_results.is_empty() {
            CONTINUE_PROMPT.to_string()
        } else {
            TOOL_RESULTS_PROMPT.to_string()
        };
    }

    let mut message_obj = json!({
        "content": content,
        "modelId": model,
        "origin": "AI_EDITOR",
    });
    if !images.is_empty() {
        message_obj["images"] = JsonValue::Array(images);
    }
    let mut context = serde_json::Map::new();
    if !tool_results.is_empty() {
        context.insert("toolResults".to_string(), JsonValue::Array(tool_results));
    }
    if let Some(req) = tools
        && !req.tools.is_empty()
    {
        let specs: Vec<JsonValue> = req
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "toolSpecification": {
                        "name": tool.name,
                        "description": tool.description.clone().unwrap_or_default(),
                        "inputSchema": { "json": tool.input_schema.clone().unwrap_or(json!({})) },
                    }
                })
            })
            .collect();
        context.insert("tools".to_string(), JsonValue::Array(specs));
    }
    if !context.is_empty() {
        message_obj["userInputMessageContext"] = JsonValue::Object(context);
    }
    json!({ "userInputMessage": message_obj })
}

fn assistant_response_message(message: &Message) -> JsonValue {
    let text = message.joined_text();
    let tool_uses: Vec<JsonValue> = message
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::ToolUse { id, name, input } => Some(json!({
                "toolUseId": id,
                "name": name,
                "input": input,
            })),
            _ => None,
        })
        .collect();
    let mut message_obj = json!({
        "content": if text.is_empty() { CONTINUE_PROMPT.to_string() } else { text },
    });
    if !tool_uses.is_empty() {
        message_obj["toolUses"] = JsonValue::Array(tool_uses);
    }
    json!({ "assistantResponseMessage": message_obj })
}

fn build_request_body(record: &ProviderRecord, model: &str, req: &CanonicalRequest) -> JsonValue {
    let (history, current) = shaped_messages(req);

    let mut history_entries = Vec::new();
    let mut system_slot = req.system.as_deref();
    let mut expect_user = true;
    for message in &history {
        if expect_user && message.role == Role::Assistant {
            // History must open each pair with a user turn.
            history_entries.push(user_input_message(
                &Message::user(vec![ContentPart::text(CONTINUE_PROMPT)]),
                model,
                system_slot.take(),
                None,
            ));
        }
        match message.role {
            Role::User => {
                history_entries.push(user_input_message(message, model, system_slot.take(), None));
                expect_user = false;
            }
            Role::Assistant => {
                history_entries.push(assistant_response_message(message));
                expect_user = true;
            }
        }
    }

    let current_obj = user_input_message(&current, model, system_slot.take(), Some(req));

    let mut body = json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": uuid::Uuid::new_v4().to_string(),
            "currentMessage": current_obj,
            "history": history_entries,
        }
    });
    if let Some(profile_arn) = &record.profile_arn {
        body["profileArn"] = json!(profile_arn);
    }
    body
}

// ---- response assembly ----

#[derive(Debug, Default)]
struct PendingTool {
    id: String,
    name: String,
    input: String,
}

fn dedup_key(name: &str, args: &JsonValue) -> String {
    format!("{name}\u{0}{args}")
}

fn finish_tool(pending: PendingTool, seen: &mut HashSet<String>) -> Option<ContentPart> {
    let input = repair_json(&pending.input);
    if !seen.insert(dedup_key(&pending.name, &input)) {
        return None;
    }
    Some(ContentPart::ToolUse {
        id: pending.id,
        name: pending.name,
        input,
    })
}

fn assemble_response(
    model: &str,
    req: &CanonicalRequest,
    records: Vec<KiroRecord>,
) -> CanonicalResponse {
    let mut text = String::new();
    let mut tools: Vec<ContentPart> = Vec::new();
    let mut seen = HashSet::new();
    let mut pending: Option<PendingTool> = None;
    let mut context_pct: Option<f64> = None;
    let mut tool_seq = 0u32;

    for record in records {
        match record {
            KiroRecord::Content(delta) => text.push_str(&delta),
            KiroRecord::ToolStart {
                name,
                tool_use_id,
                input,
                stop,
            } => {
                if let Some(open) = pending.take()
                    && let Some(part) = finish_tool(open, &mut seen)
                {
                    tools.push(part);
                }
                let tool = PendingTool {
                    id: tool_use_id,
                    name,
                    input,
                };
                if stop {
                    if let Some(part) = finish_tool(tool, &mut seen) {
                        tools.push(part);
                    }
                } else {
                    pending = Some(tool);
                }
            }
            KiroRecord::ToolInput(delta) => {
                if let Some(open) = pending.as_mut() {
                    open.input.push_str(&delta);
                }
            }
            KiroRecord::ToolStop => {
                if let Some(open) = pending.take()
                    && let Some(part) = finish_tool(open, &mut seen)
                {
                    tools.push(part);
                }
            }
            KiroRecord::ContextUsage(pct) => context_pct = Some(pct),
        }
    }
    if let Some(open) = pending.take()
        && let Some(part) = finish_tool(open, &mut seen)
    {
        tools.push(part);
    }

    // Inline bracket calls: strip from text, dedup against structured calls.
    let (cleaned, bracket_calls) = extract_bracket_calls(&text);
    for BracketCall { name, args } in bracket_calls {
        if seen.insert(dedup_key(&name, &args)) {
            tool_seq += 1;
            tools.push(ContentPart::ToolUse {
                id: format!("bracket-{tool_seq}"),
                name,
                input: args,
            });
        }
    }

    let input_tokens = context_pct
        .map(context_usage_to_input_tokens)
        .unwrap_or_else(|| counting::count_request_tokens(req));
    let output_tokens = counting::count_text(&cleaned);

    let mut content = Vec::new();
    if !cleaned.is_empty() {
        content.push(ContentPart::text(cleaned));
    }
    let has_tools = !tools.is_empty();
    content.extend(tools);

    CanonicalResponse {
        id: uuid::Uuid::new_v4().to_string(),
        model: model.to_string(),
        content,
        stop_reason: if has_tools {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        },
        usage: TokenUsage {
            input_tokens,
            output_tokens,
        },
    }
}

#[async_trait]
impl Adapter for KiroAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::ClaudeKiroOauth
    }

    fn default_health_model(&self) -> &'static str {
        "claude-haiku-4-5"
    }

    async fn initialize(&self, record: &ProviderRecord) -> ProviderResult<()> {
        if record.has_usable_credential() {
            Ok(())
        } else {
            Err(ProviderError::CredentialMissing(format!(
                "provider {} has no usable Kiro credential",
                record.uuid
            )))
        }
    }

    async fn generate(
        &self,
        record: &ProviderRecord,
        model: &str,
        req: &CanonicalRequest,
    ) -> ProviderResult<CanonicalResponse> {
        let headers = build_headers(record)?;
        let body = build_request_body(record, model, req);
        let bytes = http::post_json(&self.ctx, &self.api_url(record), &headers, &body).await?;
        let mut decoder = KiroStreamDecoder::new();
        let mut records = decoder.feed(&bytes);
        records.extend(decoder.finish());
        if records.is_empty() {
            return Err(ProviderError::Protocol(format!(
                "no payload records in {}-byte event stream",
                bytes.len()
            )));
        }
        Ok(assemble_response(model, req, records))
    }

    async fn stream(
        &self,
        record: &ProviderRecord,
        model: &str,
        req: &CanonicalRequest,
    ) -> ProviderResult<StreamReceiver> {
        let headers = build_headers(record)?;
        let body = build_request_body(record, model, req);
        let mut byte_rx = http::post_stream(&self.ctx, &self.api_url(record), &headers, &body).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<StreamEvent>(32);
        let model = model.to_string();
        let local_input = counting::count_request_tokens(req);
        tokio::spawn(async move {
            let mut decoder = KiroStreamDecoder::new();
            let mut filter = BracketFilter::new();
            let mut emitted_text = String::new();
            let mut pending: Option<PendingTool> = None;
            let mut seen = HashSet::new();
            let mut saw_tool = false;
            let mut context_pct: Option<f64> = None;
            let mut bracket_seq = 0u32;

            if tx
                .send(StreamEvent::Start {
                    id: uuid::Uuid::new_v4().to_string(),
                    model: model.clone(),
                })
                .await
                .is_err()
            {
                return;
            }

            'outer: loop {
                let records = match byte_rx.recv().await {
                    Some(chunk) => decoder.feed(&chunk),
                    None => break,
                };
                for record in records {
                    if !handle_stream_record(
                        &tx,
                        record,
                        &mut filter,
                        &mut emitted_text,
                        &mut pending,
                        &mut seen,
                        &mut saw_tool,
                        &mut context_pct,
                        &mut bracket_seq,
                    )
                    .await
                    {
                        break 'outer;
                    }
                }
            }
            for record in decoder.finish() {
                if !handle_stream_record(
                    &tx,
                    record,
                    &mut filter,
                    &mut emitted_text,
                    &mut pending,
                    &mut seen,
                    &mut saw_tool,
                    &mut context_pct,
                    &mut bracket_seq,
                )
                .await
                {
                    return;
                }
            }

            // Close any still-open structured tool.
            if let Some(open) = pending.take() {
                saw_tool = true;
                seen.insert(dedup_key(&open.name, &repair_json(&open.input)));
                let _ = tx.send(StreamEvent::ToolUseStop { id: open.id }).await;
            }
            // Flush withheld text and any trailing bracket calls.
            let (tail, calls) = filter.finish();
            if !tail.is_empty() {
                emitted_text.push_str(&tail);
                let _ = tx.send(StreamEvent::TextDelta { text: tail }).await;
            }
            for call in calls {
                if seen.insert(dedup_key(&call.name, &call.args)) {
                    bracket_seq += 1;
                    saw_tool = true;
                    let id = format!("bracket-{bracket_seq}");
                    let _ = tx
                        .send(StreamEvent::ToolUseStart {
                            id: id.clone(),
                            name: call.name,
                        })
                        .await;
                    let _ = tx
                        .send(StreamEvent::ToolUseDelta {
                            id: id.clone(),
                            partial_json: call.args.to_string(),
                        })
                        .await;
                    let _ = tx.send(StreamEvent::ToolUseStop { id }).await;
                }
            }

            let input_tokens = context_pct
                .map(context_usage_to_input_tokens)
                .unwrap_or(local_input);
            let _ = tx
                .send(StreamEvent::Finish {
                    stop_reason: if saw_tool {
                        StopReason::ToolUse
                    } else {
                        StopReason::EndTurn
                    },
                    usage: TokenUsage {
                        input_tokens,
                        output_tokens: counting::count_text(&emitted_text),
                    },
                })
                .await;
        });
        Ok(rx)
    }

    async fn count_tokens(&self, _record: &ProviderRecord, req: &CanonicalRequest) -> u32 {
        counting::count_request_tokens(req)
    }

    async fn list_models(&self, _record: &ProviderRecord) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }

    async fn usage_limits(&self, record: &ProviderRecord) -> ProviderResult<JsonValue> {
        usage::fetch_usage_limits(&self.ctx, &self.usage_url(record), record).await
    }
}

/// Feed one decoded record into the canonical event stream. Returns false
/// when the receiver is gone.
#[allow(clippy::too_many_arguments)]
async fn handle_stream_record(
    tx: &tokio::sync::mpsc::Sender<StreamEvent>,
    record: KiroRecord,
    filter: &mut BracketFilter,
    emitted_text: &mut String,
    pending: &mut Option<PendingTool>,
    seen: &mut HashSet<String>,
    saw_tool: &mut bool,
    context_pct: &mut Option<f64>,
    bracket_seq: &mut u32,
) -> bool {
    match record {
        KiroRecord::Content(delta) => {
            let (out, calls) = filter.feed(&delta);
            if !out.is_empty() {
                emitted_text.push_str(&out);
                if tx.send(StreamEvent::TextDelta { text: out }).await.is_err() {
                    return false;
                }
            }
            for call in calls {
                if seen.insert(dedup_key(&call.name, &call.args)) {
                    *bracket_seq += 1;
                    *saw_tool = true;
                    let id = format!("bracket-{bracket_seq}");
                    if tx
                        .send(StreamEvent::ToolUseStart {
                            id: id.clone(),
                            name: call.name,
                        })
                        .await
                        .is_err()
                    {
                        return false;
                    }
                    let _ = tx
                        .send(StreamEvent::ToolUseDelta {
                            id: id.clone(),
                            partial_json: call.args.to_string(),
                        })
                        .await;
                    if tx.send(StreamEvent::ToolUseStop { id }).await.is_err() {
                        return false;
                    }
                }
            }
            true
        }
        KiroRecord::ToolStart {
            name,
            tool_use_id,
            input,
            stop,
        } => {
            if let Some(open) = pending.take() {
                seen.insert(dedup_key(&open.name, &repair_json(&open.input)));
                if tx
                    .send(StreamEvent::ToolUseStop { id: open.id })
                    .await
                    .is_err()
                {
                    return false;
                }
            }
            *saw_tool = true;
            if tx
                .send(StreamEvent::ToolUseStart {
                    id: tool_use_id.clone(),
                    name: name.clone(),
                })
                .await
                .is_err()
            {
                return false;
            }
            if !input.is_empty()
                && tx
                    .send(StreamEvent::ToolUseDelta {
                        id: tool_use_id.clone(),
                        partial_json: input.clone(),
                    })
                    .await
                    .is_err()
            {
                return false;
            }
            if stop {
                seen.insert(dedup_key(&name, &repair_json(&input)));
                if tx
                    .send(StreamEvent::ToolUseStop { id: tool_use_id })
                    .await
                    .is_err()
                {
                    return false;
                }
            } else {
                *pending = Some(PendingTool {
                    id: tool_use_id,
                    name,
                    input,
                });
            }
            true
        }
        KiroRecord::ToolInput(delta) => {
            if let Some(open) = pending.as_mut() {
                open.input.push_str(&delta);
                if tx
                    .send(StreamEvent::ToolUseDelta {
                        id: open.id.clone(),
                        partial_json: delta,
                    })
                    .await
                    .is_err()
                {
                    return false;
                }
            }
            true
        }
        KiroRecord::ToolStop => {
            if let Some(open) = pending.take() {
                seen.insert(dedup_key(&open.name, &repair_json(&open.input)));
                if tx
                    .send(StreamEvent::ToolUseStop { id: open.id })
                    .await
                    .is_err()
                {
                    return false;
                }
            }
            true
        }
        KiroRecord::ContextUsage(pct) => {
            *context_pct = Some(pct);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_usage_percentage_maps_to_tokens() {
        assert_eq!(context_usage_to_input_tokens(12.5), 25_000);
        assert_eq!(context_usage_to_input_tokens(0.0), 0);
        assert_eq!(context_usage_to_input_tokens(100.0), 200_000);
    }

    #[test]
    fn machine_id_is_stable_per_credential() {
        let mut a = ProviderRecord::new(ProviderType::ClaudeKiroOauth);
        a.uuid = "u1".to_string();
        a.profile_arn = Some("arn:aws:x".to_string());
        let id1 = machine_id(&a);
        let id2 = machine_id(&a);
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);

        let mut b = a.clone();
        b.uuid = "u2".to_string();
        assert_ne!(machine_id(&a), machine_id(&b));
    }

    fn req_with(messages: Vec<Message>) -> CanonicalRequest {
        let mut req = CanonicalRequest::new("claude-opus-4-5");
        req.messages = messages;
        req
    }

    #[test]
    fn request_body_ends_history_on_assistant_and_current_on_user() {
        let req = req_with(vec![
            Message::user(vec![ContentPart::text("one")]),
            Message::assistant(vec![ContentPart::text("two")]),
        ]);
        let record = ProviderRecord::new(ProviderType::ClaudeKiroOauth);
        let body = build_request_body(&record, "claude-opus-4-5", &req);
        let state = &body["conversationState"];
        assert_eq!(state["history"].as_array().unwrap().len(), 2);
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["content"],
            CONTINUE_PROMPT
        );
    }

    #[test]
    fn system_prompt_lands_in_first_user_turn() {
        let mut req = req_with(vec![
            Message::user(vec![ContentPart::text("hi")]),
            Message::assistant(vec![ContentPart::text("hello")]),
            Message::user(vec![ContentPart::text("again")]),
        ]);
        req.system = Some("be kind".to_string());
        let record = ProviderRecord::new(ProviderType::ClaudeKiroOauth);
        let body = build_request_body(&record, "m", &req);
        let history = body["conversationState"]["history"].as_array().unwrap();
        let first = history[0]["userInputMessage"]["content"].as_str().unwrap();
        assert!(first.starts_with("be kind"));
        let current = body["conversationState"]["currentMessage"]["userInputMessage"]["content"]
            .as_str()
            .unwrap();
        assert_eq!(current, "again");
    }

    #[test]
    fn tool_result_only_turn_gets_filler_content() {
        let req = req_with(vec![
            Message::user(vec![ContentPart::text("go")]),
            Message::assistant(vec![ContentPart::ToolUse {
                id: "t1".to_string(),
                name: "run".to_string(),
                input: json!({"cmd": "ls"}),
            }]),
            Message::user(vec![ContentPart::ToolResult {
                tool_use_id: "t1".to_string(),
                content: vec![ContentPart::text("files")],
                is_error: false,
            }]),
        ]);
        let record = ProviderRecord::new(ProviderType::ClaudeKiroOauth);
        let body = build_request_body(&record, "m", &req);
        let current = &body["conversationState"]["currentMessage"]["userInputMessage"];
        assert_eq!(current["content"], TOOL_RESULTS_PROMPT);
        assert_eq!(
            current["userInputMessageContext"]["toolResults"][0]["toolUseId"],
            "t1"
        );
    }

    #[test]
    fn assemble_strips_bracket_calls_and_dedups() {
        let req = req_with(vec![Message::user(vec![ContentPart::text("q")])]);
        let records = vec![
            KiroRecord::Content("ok ".to_string()),
            KiroRecord::Content("[Called search with args: {\"q\":\"x\"}]".to_string()),
            KiroRecord::Content(" done".to_string()),
            KiroRecord::ToolStart {
                name: "search".to_string(),
                tool_use_id: "tu1".to_string(),
                input: "{\"q\":\"x\"}".to_string(),
                stop: true,
            },
            KiroRecord::ContextUsage(12.5),
        ];
        let resp = assemble_response("m", &req, records);
        assert_eq!(resp.usage.input_tokens, 25_000);
        let texts: Vec<&ContentPart> = resp
            .content
            .iter()
            .filter(|p| matches!(p, ContentPart::Text { .. }))
            .collect();
        let tools: Vec<&ContentPart> = resp
            .content
            .iter()
            .filter(|p| matches!(p, ContentPart::ToolUse { .. }))
            .collect();
        assert_eq!(texts.len(), 1);
        if let ContentPart::Text { text } = texts[0] {
            assert_eq!(text, "ok  done");
        }
        // Structured and bracket forms of the same call collapse to one.
        assert_eq!(tools.len(), 1);
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn assemble_reconstructs_split_tool_input() {
        let req = req_with(vec![Message::user(vec![ContentPart::text("q")])]);
        let records = vec![
            KiroRecord::ToolStart {
                name: "write".to_string(),
                tool_use_id: "tu2".to_string(),
                input: "{\"path\":".to_string(),
                stop: false,
            },
            KiroRecord::ToolInput("\"/tmp/x\"}".to_string()),
            KiroRecord::ToolStop,
        ];
        let resp = assemble_response("m", &req, records);
        let ContentPart::ToolUse { input, .. } = &resp.content[0] else {
            panic!("expected tool use");
        };
        assert_eq!(input["path"], "/tmp/x");
    }
}
