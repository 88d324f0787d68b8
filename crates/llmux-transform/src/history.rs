//! Conversation-history shaping applied before a request is handed to
//! providers that require strictly alternating turns (Kiro in particular).

use std::collections::HashSet;

use crate::{ContentPart, Message, Role};

/// How many trailing turns keep their images; older images are replaced
/// with a textual placeholder.
pub const IMAGE_RETENTION_TURNS: usize = 5;

/// Synthesized current-turn text when the conversation would otherwise end
/// on an assistant message.
pub const CONTINUE_PROMPT: &str = "Continue";

/// Merge consecutive messages that share a role. Content arrays are
/// concatenated; when two text parts meet at the seam they are joined with a
/// newline instead of producing adjacent fragments.
pub fn merge_adjacent_roles(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match out.last_mut() {
            Some(last) if last.role == message.role => {
                append_merged(&mut last.content, message.content);
            }
            _ => out.push(message),
        }
    }
    out
}

fn append_merged(target: &mut Vec<ContentPart>, extra: Vec<ContentPart>) {
    let mut extra = extra.into_iter();
    if let Some(first) = extra.next() {
        match (target.last_mut(), first) {
            (Some(ContentPart::Text { text: left }), ContentPart::Text { text: right }) => {
                left.push('\n');
                left.push_str(&right);
            }
            (_, first) => target.push(first),
        }
    }
    target.extend(extra);
}

/// Drop a trailing assistant message whose entire content is the literal
/// placeholder `"{"` that some clients append while waiting for a reply.
pub fn drop_placeholder_tail(messages: &mut Vec<Message>) {
    if let Some(last) = messages.last()
        && last.role == Role::Assistant
        && last.content.len() == 1
        && matches!(&last.content[0], ContentPart::Text { text } if text.trim() == "{")
    {
        messages.pop();
    }
}

/// Split a merged message list into `(history, current)` where `current` is
/// always a user turn. A trailing assistant message moves into history and a
/// `"Continue"` user turn is synthesized in its place.
pub fn split_history_current(mut messages: Vec<Message>) -> (Vec<Message>, Message) {
    match messages.last() {
        Some(last) if last.role == Role::User => {
            let current = messages.pop().unwrap_or_else(|| {
                Message::user(vec![ContentPart::text(CONTINUE_PROMPT)])
            });
            (messages, current)
        }
        Some(_) => {
            let current = Message::user(vec![ContentPart::text(CONTINUE_PROMPT)]);
            (messages, current)
        }
        None => (
            Vec::new(),
            Message::user(vec![ContentPart::text(CONTINUE_PROMPT)]),
        ),
    }
}

/// Keep images only in the last [`IMAGE_RETENTION_TURNS`] turns; older ones
/// become a placeholder noting how many were elided from that turn.
pub fn retain_recent_images(messages: &mut [Message]) {
    let len = messages.len();
    let cutoff = len.saturating_sub(IMAGE_RETENTION_TURNS);
    for message in messages.iter_mut().take(cutoff) {
        let dropped = message
            .content
            .iter()
            .filter(|part| matches!(part, ContentPart::Image { .. }))
            .count();
        if dropped == 0 {
            continue;
        }
        message
            .content
            .retain(|part| !matches!(part, ContentPart::Image { .. }));
        let noun = if dropped == 1 { "image" } else { "images" };
        message
            .content
            .push(ContentPart::text(format!("[... {dropped} {noun} ...]")));
    }
}

/// Within one message, keep only the first tool result per `toolUseId`.
pub fn dedup_tool_results(message: &mut Message) {
    let mut seen: HashSet<String> = HashSet::new();
    message.content.retain(|part| match part {
        ContentPart::ToolResult { tool_use_id, .. } => seen.insert(tool_use_id.clone()),
        _ => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_msg(role: Role, text: &str) -> Message {
        Message {
            role,
            content: vec![ContentPart::text(text)],
        }
    }

    #[test]
    fn adjacent_user_messages_merge_with_newline() {
        let merged = merge_adjacent_roles(vec![
            text_msg(Role::User, "one"),
            text_msg(Role::User, "two"),
            text_msg(Role::Assistant, "ack"),
            text_msg(Role::Assistant, "more"),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].joined_text(), "one\ntwo");
        assert_eq!(merged[1].joined_text(), "ack\nmore");
    }

    #[test]
    fn non_text_seams_concatenate() {
        let merged = merge_adjacent_roles(vec![
            Message::user(vec![ContentPart::text("see:")]),
            Message::user(vec![ContentPart::Image {
                media_type: "image/png".to_string(),
                data: "QQ==".to_string(),
            }]),
        ]);
        assert_eq!(merged[0].content.len(), 2);
    }

    #[test]
    fn placeholder_tail_is_dropped() {
        let mut messages = vec![
            text_msg(Role::User, "hi"),
            text_msg(Role::Assistant, "{"),
        ];
        drop_placeholder_tail(&mut messages);
        assert_eq!(messages.len(), 1);

        let mut keep = vec![text_msg(Role::Assistant, "{ not placeholder")];
        drop_placeholder_tail(&mut keep);
        assert_eq!(keep.len(), 1);
    }

    #[test]
    fn assistant_tail_synthesizes_continue() {
        let (history, current) = split_history_current(vec![
            text_msg(Role::User, "hi"),
            text_msg(Role::Assistant, "partial answer"),
        ]);
        assert_eq!(history.len(), 2);
        assert_eq!(current.role, Role::User);
        assert_eq!(current.joined_text(), CONTINUE_PROMPT);
    }

    #[test]
    fn user_tail_becomes_current() {
        let (history, current) = split_history_current(vec![
            text_msg(Role::User, "hi"),
            text_msg(Role::Assistant, "yes"),
            text_msg(Role::User, "again"),
        ]);
        assert_eq!(history.len(), 2);
        assert_eq!(current.joined_text(), "again");
    }

    #[test]
    fn old_images_become_placeholders() {
        let image = ContentPart::Image {
            media_type: "image/png".to_string(),
            data: "QQ==".to_string(),
        };
        let mut messages: Vec<Message> = (0..10)
            .map(|i| {
                if i == 0 || i == 9 {
                    Message::user(vec![ContentPart::text("t"), image.clone()])
                } else {
                    text_msg(Role::User, "t")
                }
            })
            .collect();
        retain_recent_images(&mut messages);
        assert_eq!(messages[0].joined_text(), "t\n[... 1 image ...]");
        assert!(
            messages[9]
                .content
                .iter()
                .any(|part| matches!(part, ContentPart::Image { .. }))
        );
    }

    #[test]
    fn duplicate_tool_results_are_removed() {
        let result = |id: &str| ContentPart::ToolResult {
            tool_use_id: id.to_string(),
            content: vec![ContentPart::text("ok")],
            is_error: false,
        };
        let mut message = Message::user(vec![result("a"), result("a"), result("b")]);
        dedup_tool_results(&mut message);
        assert_eq!(message.content.len(), 2);
    }
}
