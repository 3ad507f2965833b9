use parley_core::messages::{render_diagnostic_report, Message, Part};

/// Rewrite every diagnostic report into a plain text instruction.
///
/// Total and idempotent: the output contains no `DiagnosticReport` parts, and
/// every other part, along with each message's id and role, is kept as is.
pub fn transform(messages: &[Message]) -> Vec<Message> {
    messages.iter().map(transform_message).collect()
}

fn transform_message(message: &Message) -> Message {
    Message {
        id: message.id.clone(),
        role: message.role,
        parts: message.parts.iter().map(transform_part).collect(),
    }
}

fn transform_part(part: &Part) -> Part {
    match part {
        Part::DiagnosticReport { summary, paths } => Part::text(render_diagnostic_report(summary, paths)),
        Part::Text { .. }
        | Part::Reasoning { .. }
        | Part::ToolCall { .. }
        | Part::ToolResult { .. } => part.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::ToolCallId;
    use parley_core::messages::Role;

    fn report(summary: &str, paths: &[&str]) -> Part {
        Part::DiagnosticReport {
            summary: summary.into(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn diagnostic_report_becomes_single_text_part() {
        let input = vec![Message::new(Role::User, vec![report("X failed", &["a.ts", "b.ts"])]).with_id("7")];
        let out = transform(&input);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id.as_deref(), Some("7"));
        assert_eq!(out[0].role, Role::User);
        assert_eq!(out[0].parts.len(), 1);
        let Part::Text { text } = &out[0].parts[0] else {
            panic!("expected text part, got {:?}", out[0].parts[0]);
        };
        assert!(text.starts_with("The following errors were reported:\n```\nX failed\n```\n"));
        assert!(text.contains("Affected files:\n```\na.ts\nb.ts\n```"));
        assert!(text.ends_with("Please fix these errors."));
    }

    #[test]
    fn empty_paths_omit_file_block() {
        let out = transform(&[Message::new(Role::User, vec![report("boom", &[])])]);
        let Part::Text { text } = &out[0].parts[0] else {
            panic!("expected text part");
        };
        assert!(!text.contains("Affected files:"));
        assert_eq!(text.matches("```").count(), 2);
    }

    #[test]
    fn other_parts_pass_through_in_order() {
        let call = Part::ToolCall {
            tool_call_id: ToolCallId::from_raw("toolu_1"),
            tool_name: "lookup".into(),
            input: serde_json::json!({}),
        };
        let input = vec![Message::new(
            Role::Assistant,
            vec![
                Part::text("before"),
                Part::Reasoning {
                    text: "thinking".into(),
                    signature: Some("sig".into()),
                },
                report("err", &[]),
                call.clone(),
            ],
        )];
        let out = transform(&input);
        let parts = &out[0].parts;
        assert_eq!(parts[0], Part::text("before"));
        assert_eq!(parts[1], input[0].parts[1]);
        assert!(matches!(parts[2], Part::Text { .. }));
        assert_eq!(parts[3], call);
    }

    #[test]
    fn idempotent() {
        let input = vec![
            Message::user_text("hi").with_id("1"),
            Message::new(Role::User, vec![report("X failed", &["a.ts"]), Part::text("also")]),
            Message::assistant_text("ok"),
        ];
        let once = transform(&input);
        let twice = transform(&once);
        assert_eq!(once, twice);
        assert!(once
            .iter()
            .flat_map(|m| &m.parts)
            .all(|p| !matches!(p, Part::DiagnosticReport { .. })));
    }

    #[test]
    fn empty_input() {
        assert!(transform(&[]).is_empty());
    }
}
