use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

use super::base::{Completion, CompletionChunk, Prompt, Usage};
use crate::errors::{GatewayError, GatewayResult};
use crate::models::tool::{Tool, ToolCall};

/// Convert a prompt to OpenAI's chat message specification, system prompt first
pub fn messages_to_openai_spec(prompt: &Prompt) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    if !prompt.system.trim().is_empty() {
        messages_spec.push(json!({
            "role": "system",
            "content": prompt.system,
        }));
    }

    for message in &prompt.messages {
        if message.is_blank() {
            continue;
        }
        messages_spec.push(json!({
            "role": message.role(),
            "content": message.content(),
        }));
    }

    // Each executed tool call is replayed as the assistant request followed by its result
    for round in &prompt.tool_rounds {
        messages_spec.push(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": round.call.id,
                "type": "function",
                "function": {
                    "name": sanitize_function_name(&round.call.name),
                    "arguments": round.call.arguments.to_string(),
                }
            }]
        }));
        messages_spec.push(json!({
            "role": "tool",
            "content": round.output,
            "tool_call_id": round.call.id,
        }));
    }

    messages_spec
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> GatewayResult<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(GatewayError::InvalidRequest(format!(
                "Duplicate tool name: {}",
                tool.name
            )));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": sanitize_function_name(&tool.name),
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

/// Convert OpenAI's API response to a completion
pub fn openai_response_to_completion(response: &Value) -> GatewayResult<Completion> {
    let original = response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| GatewayError::FatalUpstream("No choices in response".to_string()))?;

    let text = original
        .get("content")
        .and_then(|content| content.as_str())
        .unwrap_or_default()
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = original.get("tool_calls").and_then(|calls| calls.as_array()) {
        for call in calls {
            let id = call["id"].as_str().unwrap_or_default().to_string();
            let name = call["function"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let raw_arguments = call["function"]["arguments"].as_str().unwrap_or("{}");

            if !is_valid_function_name(&name) {
                return Err(GatewayError::FatalUpstream(format!(
                    "The provided function name '{}' had invalid characters",
                    name
                )));
            }

            let arguments = serde_json::from_str::<Value>(raw_arguments).map_err(|e| {
                GatewayError::FatalUpstream(format!(
                    "Could not interpret tool use parameters for id {}: {}",
                    id, e
                ))
            })?;
            tool_calls.push(ToolCall::new(id, name, arguments));
        }
    }

    let model = response
        .get("model")
        .and_then(|model| model.as_str())
        .unwrap_or("unknown")
        .to_string();

    Ok(Completion {
        text,
        usage: get_usage(response).unwrap_or_default(),
        model,
        tool_calls,
    })
}

/// Extract token usage, deriving the total when only the parts are reported
pub fn get_usage(data: &Value) -> Option<Usage> {
    // Groq reports streaming usage under `x_groq`
    let usage = data
        .get("usage")
        .filter(|usage| !usage.is_null())
        .or_else(|| data.get("x_groq").and_then(|x| x.get("usage")))?;

    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_i64())
        .and_then(|v| i32::try_from(v).ok());

    let output_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .and_then(|v| i32::try_from(v).ok());

    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .and_then(|v| i32::try_from(v).ok())
        .or_else(|| match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input.saturating_add(output)),
            _ => None,
        });

    Some(Usage::new(input_tokens, output_tokens, total_tokens))
}

/// A decoded server-sent event from a streaming chat completion
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(CompletionChunk),
    Done,
}

/// Parse one `data:` line of an OpenAI-compatible stream. Other SSE fields are ignored.
pub fn parse_stream_line(line: &str) -> GatewayResult<Option<StreamEvent>> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    if data == "[DONE]" {
        return Ok(Some(StreamEvent::Done));
    }

    let value: Value = serde_json::from_str(data)
        .map_err(|e| GatewayError::FatalUpstream(format!("Malformed stream event: {}", e)))?;

    if let Some(error) = value.get("error") {
        return Err(GatewayError::FatalUpstream(format!(
            "Stream reported an error: {}",
            error
        )));
    }

    let text = value["choices"][0]["delta"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let usage = get_usage(&value);
    let model = value
        .get("model")
        .and_then(|model| model.as_str())
        .map(String::from);

    Ok(Some(StreamEvent::Chunk(CompletionChunk { text, usage, model })))
}

/// Accumulates raw bytes and hands back complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }

    /// Whatever is left once the body ends without a trailing newline
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).trim_end().to_string())
    }
}

pub fn sanitize_function_name(name: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let re = INVALID.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("static regex"));
    re.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    static VALID: OnceLock<Regex> = OnceLock::new();
    let re = VALID.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static regex"));
    re.is_match(name)
}
