//! Optional gateway-level system prompt injection.

use llmux_transform::CanonicalRequest;

use crate::config::SystemPromptMode;

pub fn apply_system_prompt(
    req: &mut CanonicalRequest,
    text: Option<&str>,
    mode: SystemPromptMode,
) {
    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return;
    };
    match mode {
        SystemPromptMode::Off => {}
        SystemPromptMode::Override => req.system = Some(text.to_string()),
        SystemPromptMode::Append => {
            req.system = Some(match req.system.take() {
                Some(existing) if !existing.is_empty() => format!("{existing}\n\n{text}"),
                _ => text.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_behave_as_named() {
        let mut req = CanonicalRequest::new("m");
        req.system = Some("original".to_string());

        apply_system_prompt(&mut req, Some("extra"), SystemPromptMode::Off);
        assert_eq!(req.system.as_deref(), Some("original"));

        apply_system_prompt(&mut req, Some("extra"), SystemPromptMode::Append);
        assert_eq!(req.system.as_deref(), Some("original\n\nextra"));

        apply_system_prompt(&mut req, Some("forced"), SystemPromptMode::Override);
        assert_eq!(req.system.as_deref(), Some("forced"));
    }
}
