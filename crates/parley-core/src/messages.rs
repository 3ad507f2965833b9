use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    /// Roles whose content is subject to moderation.
    pub fn is_conversational(self) -> bool {
        matches!(self, Self::User | Self::Assistant)
    }
}

/// One message of a conversation as received from the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub parts: Vec<Part>,
}

/// One typed fragment of a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    DiagnosticReport {
        summary: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        paths: Vec<String>,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: ToolCallId,
        tool_name: String,
        input: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: ToolCallId,
        tool_name: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Render a diagnostic report as the plain-text prompt the model sees.
pub fn render_diagnostic_report(summary: &str, paths: &[String]) -> String {
    let mut out = String::from("The following errors were reported:\n```\n");
    out.push_str(summary);
    out.push_str("\n```\n");
    if !paths.is_empty() {
        out.push_str("Affected files:\n```\n");
        out.push_str(&paths.join("\n"));
        out.push_str("\n```\n");
    }
    out.push_str("Please fix these errors.");
    out
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { id: None, role, parts }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::text(text)])
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Concatenated `Text` parts, newline separated. Other parts contribute nothing.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_client_message() {
        let json = serde_json::json!({
            "id": "1",
            "role": "user",
            "parts": [{"type": "text", "text": "hello"}]
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        assert_eq!(msg.id.as_deref(), Some("1"));
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.parts, vec![Part::text("hello")]);
    }

    #[test]
    fn diagnostic_report_paths_optional() {
        let json = serde_json::json!({
            "role": "user",
            "parts": [{"type": "diagnostic-report", "summary": "build failed"}]
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        assert_eq!(
            msg.parts[0],
            Part::DiagnosticReport { summary: "build failed".into(), paths: vec![] }
        );
        assert!(msg.id.is_none());
    }

    #[test]
    fn tool_parts_use_camel_case_fields() {
        let part = Part::ToolCall {
            tool_call_id: ToolCallId::from_raw("toolu_1"),
            tool_name: "search".into(),
            input: serde_json::json!({"q": "rust"}),
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "tool-call");
        assert_eq!(json["toolCallId"], "toolu_1");
        assert_eq!(json["toolName"], "search");
    }

    #[test]
    fn unknown_role_rejected() {
        let json = serde_json::json!({"role": "tool", "parts": []});
        assert!(serde_json::from_value::<Message>(json).is_err());
    }

    #[test]
    fn text_content_joins_text_parts_only() {
        let msg = Message::new(
            Role::User,
            vec![
                Part::text("first"),
                Part::Reasoning {
                    text: "hidden".into(),
                    signature: None,
                },
                Part::text("second"),
            ],
        );
        assert_eq!(msg.text_content(), "first\nsecond");
    }

    #[test]
    fn reasoning_signature_is_optional_on_the_wire() {
        let part: Part = serde_json::from_value(serde_json::json!({
            "type": "reasoning",
            "text": "hmm"
        }))
        .unwrap();
        assert_eq!(
            part,
            Part::Reasoning {
                text: "hmm".into(),
                signature: None
            }
        );
        assert!(serde_json::to_value(&part).unwrap().get("signature").is_none());

        let signed = Part::Reasoning {
            text: "hmm".into(),
            signature: Some("EqQB".into()),
        };
        assert_eq!(serde_json::to_value(&signed).unwrap()["signature"], "EqQB");
    }

    #[test]
    fn diagnostic_report_template_without_paths() {
        let text = render_diagnostic_report("E0308 mismatched types", &[]);
        assert_eq!(
            text,
            "The following errors were reported:\n```\nE0308 mismatched types\n```\nPlease fix these errors."
        );
    }

    #[test]
    fn diagnostic_report_template_lists_paths() {
        let text = render_diagnostic_report("boom", &["src/a.rs".into(), "src/b.rs".into()]);
        assert!(text.contains("Affected files:\n```\nsrc/a.rs\nsrc/b.rs\n```\n"));
        assert!(text.ends_with("Please fix these errors."));
    }

    #[test]
    fn conversational_roles() {
        assert!(Role::User.is_conversational());
        assert!(Role::Assistant.is_conversational());
        assert!(!Role::System.is_conversational());
    }
}
