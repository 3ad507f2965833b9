use serde_json::{json, Value};

use parley_core::context::ModelContext;
use parley_core::messages::{render_diagnostic_report, Message, Part, Role};
use parley_core::provider::StreamOptions;

use crate::models::ModelEntry;

/// Convert a [`ModelContext`] into an Anthropic Messages API request body.
pub fn build_request_body(context: &ModelContext, options: &StreamOptions, model: &ModelEntry) -> Value {
    let mut body = json!({
        "model": model.id,
        "stream": true,
    });

    let thinking_budget = options
        .reasoning_effort
        .filter(|_| model.supports_reasoning)
        .map(|effort| effort.thinking_budget());

    let mut max_tokens = options.max_tokens.unwrap_or(model.max_output);
    if let Some(budget) = thinking_budget {
        // max_tokens must leave room for the answer after the thinking budget
        max_tokens = max_tokens.max(budget + 1_024);
        body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
    } else if let Some(temp) = options.temperature {
        body["temperature"] = json!(temp);
    }
    body["max_tokens"] = json!(max_tokens);

    let system = system_text(context);
    if !system.is_empty() {
        body["system"] = json!(system);
    }

    body["messages"] = json!(convert_messages(&context.messages));

    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

/// The configured system prompt followed by the text of any system-role messages.
fn system_text(context: &ModelContext) -> String {
    let mut sections: Vec<String> = context.system_prompt.iter().cloned().collect();
    sections.extend(
        context
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(Message::text_content)
            .filter(|t| !t.is_empty()),
    );
    sections.join("\n\n")
}

/// Convert conversation messages, merging consecutive same-role turns so the
/// result strictly alternates.
fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut result: Vec<(&'static str, Vec<Value>)> = Vec::new();

    let mut push = |role: &'static str, blocks: Vec<Value>| {
        if blocks.is_empty() {
            return;
        }
        match result.last_mut() {
            Some((last_role, content)) if *last_role == role => content.extend(blocks),
            _ => result.push((role, blocks)),
        }
    };

    for msg in messages {
        match msg.role {
            Role::System => {}
            Role::User => push("user", msg.parts.iter().filter_map(convert_part).collect()),
            Role::Assistant => {
                let (results, content): (Vec<&Part>, Vec<&Part>) = msg
                    .parts
                    .iter()
                    .partition(|p| matches!(p, Part::ToolResult { .. }));
                push("assistant", content.into_iter().filter_map(convert_part).collect());
                push("user", results.into_iter().filter_map(convert_part).collect());
            }
        }
    }

    result
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

fn convert_part(part: &Part) -> Option<Value> {
    match part {
        Part::Text { text } if text.is_empty() => None,
        Part::Text { text } => Some(json!({"type": "text", "text": text})),
        Part::DiagnosticReport { summary, paths } => Some(json!({
            "type": "text",
            "text": render_diagnostic_report(summary, paths),
        })),
        Part::Reasoning {
            text,
            signature: Some(signature),
        } => Some(json!({
            "type": "thinking",
            "thinking": text,
            "signature": signature,
        })),
        // unsigned thinking is rejected by the API
        Part::Reasoning { signature: None, .. } => None,
        Part::ToolCall {
            tool_call_id,
            tool_name,
            input,
        } => Some(json!({
            "type": "tool_use",
            "id": tool_call_id.as_str(),
            "name": tool_name,
            "input": input,
        })),
        Part::ToolResult {
            tool_call_id,
            output,
            is_error,
            ..
        } => Some(json!({
            "type": "tool_result",
            "tool_use_id": tool_call_id.as_str(),
            "content": output,
            "is_error": is_error,
        })),
    }
}
