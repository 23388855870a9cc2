//! Anthropic Messages API streaming provider.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::TurnstileError;
use crate::types::*;

use super::http::{
    anthropic_headers, open_stream, shared_client, sse_data, stream_ended_early, SseFrame,
};
use super::{ModelProvider, ProviderRequest};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    model: String,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(model: impl Into<String>, api_key: String, base_url: Option<String>) -> Self {
        Self {
            model: model.into(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    fn build_request_body(&self, request: &ProviderRequest) -> Value {
        let mut system_parts = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => system_parts.push(msg.text()),
                Role::User => messages.push(json!({
                    "role": "user",
                    "content": msg.text(),
                })),
                Role::Assistant => {
                    let content: Vec<Value> = msg
                        .content
                        .iter()
                        .filter_map(|part| match part {
                            ContentPart::Text { text } if !text.is_empty() => {
                                Some(json!({"type": "text", "text": text}))
                            }
                            ContentPart::ToolCall(tc) => Some(json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.name,
                                "input": tc.arguments,
                            })),
                            _ => None,
                        })
                        .collect();
                    if !content.is_empty() {
                        messages.push(json!({"role": "assistant", "content": content}));
                    }
                }
                Role::Tool => {
                    let blocks: Vec<Value> = msg
                        .content
                        .iter()
                        .filter_map(|part| match part {
                            ContentPart::ToolResult(tr) => Some(json!({
                                "type": "tool_result",
                                "tool_use_id": tr.tool_call_id,
                                "content": match &tr.result {
                                    Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                },
                                "is_error": tr.is_error,
                            })),
                            _ => None,
                        })
                        .collect();
                    // Consecutive tool results share one user turn.
                    let merged = match messages.last_mut() {
                        Some(last) if is_tool_result_turn(last) => {
                            last.get_mut("content").and_then(Value::as_array_mut)
                        }
                        _ => None,
                    };
                    match merged {
                        Some(existing) => existing.extend(blocks),
                        None => messages.push(json!({"role": "user", "content": blocks})),
                    }
                }
            }
        }

        let settings = &request.settings;
        let mut body = serde_json::Map::new();
        body.insert("model".into(), self.model.clone().into());
        body.insert("messages".into(), messages.into());
        body.insert("stream".into(), true.into());
        body.insert(
            "max_tokens".into(),
            settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS).into(),
        );
        if !system_parts.is_empty() {
            body.insert("system".into(), system_parts.join("\n\n").into());
        }
        if let Some(temp) = settings.temperature {
            body.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = settings.top_p {
            body.insert("top_p".into(), top_p.into());
        }
        if let Some(ref stops) = settings.stop_sequences {
            body.insert("stop_sequences".into(), json!(stops));
        }
        if let Some(ref tools) = request.tools {
            if !tools.is_empty() {
                let defs: Vec<Value> = tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect();
                body.insert("tools".into(), defs.into());
            }
        }
        Value::Object(body)
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<RawStream, TurnstileError> {
        let body = self.build_request_body(request);
        let url = format!("{}/messages", self.base_url);

        debug!(model = %self.model, "opening messages stream");

        let resp = open_stream(
            shared_client()
                .post(&url)
                .headers(anthropic_headers(&self.api_key, API_VERSION))
                .json(&body),
        )
        .await?;

        let mut data = sse_data(resp);
        let stream = async_stream::stream! {
            let mut input_tokens = 0u32;
            let mut stopped = false;
            while let Some(item) = data.next().await {
                let payload = match item {
                    Ok(SseFrame::Data(payload)) => payload,
                    Ok(SseFrame::Done) => break,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                let event: Value = match serde_json::from_str(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(TurnstileError::UpstreamStream(format!("unreadable stream event: {e}")));
                        return;
                    }
                };
                if event.get("type").and_then(Value::as_str) == Some("message_stop") {
                    stopped = true;
                }
                match parse_event(&event, &mut input_tokens) {
                    Ok(fragments) => {
                        for fragment in fragments {
                            yield Ok(fragment);
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
            if !stopped {
                yield Err(stream_ended_early());
            }
        };
        Ok(stream.boxed())
    }
}

fn is_tool_result_turn(message: &Value) -> bool {
    message["role"] == "user"
        && message["content"]
            .as_array()
            .is_some_and(|c| c.iter().all(|b| b["type"] == "tool_result"))
}

/// Map one Anthropic stream event to raw fragments.
fn parse_event(event: &Value, input_tokens: &mut u32) -> Result<Vec<RawFragment>, TurnstileError> {
    let index = event.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
    let mut out = Vec::new();
    match event.get("type").and_then(Value::as_str).unwrap_or("") {
        "message_start" => {
            if let Some(tokens) = event
                .pointer("/message/usage/input_tokens")
                .and_then(Value::as_u64)
            {
                *input_tokens = tokens as u32;
            }
        }
        "content_block_start" => {
            let block = event.get("content_block").cloned().unwrap_or(Value::Null);
            if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                out.push(RawFragment::ToolCallDelta {
                    index,
                    id: block.get("id").and_then(Value::as_str).map(str::to_string),
                    name: block.get("name").and_then(Value::as_str).map(str::to_string),
                    arguments: String::new(),
                });
            }
        }
        "content_block_delta" => {
            let delta = event.get("delta").cloned().unwrap_or(Value::Null);
            let text_of = |key: &str| delta.get(key).and_then(Value::as_str).map(str::to_string);
            match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                "text_delta" => {
                    if let Some(text) = text_of("text") {
                        out.push(RawFragment::Text(text));
                    }
                }
                "thinking_delta" => {
                    if let Some(thinking) = text_of("thinking") {
                        out.push(RawFragment::Reasoning(thinking));
                    }
                }
                "input_json_delta" => {
                    if let Some(json) = text_of("partial_json") {
                        out.push(RawFragment::ToolCallDelta {
                            index,
                            id: None,
                            name: None,
                            arguments: json,
                        });
                    }
                }
                _ => {}
            }
        }
        "message_delta" => {
            let stop = event.pointer("/delta/stop_reason").and_then(Value::as_str);
            let output_tokens = event
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            out.push(RawFragment::Finish {
                finish_reason: stop.and_then(FinishReason::from_provider),
                usage: Some(Usage {
                    input_tokens: *input_tokens,
                    output_tokens,
                    total_tokens: *input_tokens + output_tokens,
                    ..Default::default()
                }),
            });
        }
        "error" => {
            let message = event
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("upstream reported an error");
            return Err(TurnstileError::UpstreamStream(message.to_string()));
        }
        _ => {}
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ToolDefinition;

    #[test]
    fn tool_use_block_maps_to_indexed_deltas() {
        let mut input = 0;
        let start = json!({"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"lookup","input":{}}});
        let delta = json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}});
        assert_eq!(
            parse_event(&start, &mut input).unwrap(),
            vec![RawFragment::ToolCallDelta {
                index: 1,
                id: Some("toolu_1".into()),
                name: Some("lookup".into()),
                arguments: String::new(),
            }]
        );
        assert_eq!(
            parse_event(&delta, &mut input).unwrap(),
            vec![RawFragment::ToolCallDelta {
                index: 1,
                id: None,
                name: None,
                arguments: "{\"q\":".into(),
            }]
        );
    }

    #[test]
    fn usage_combines_start_and_delta() {
        let mut input = 0;
        parse_event(
            &json!({"type":"message_start","message":{"usage":{"input_tokens":12}}}),
            &mut input,
        )
        .unwrap();
        let finish = parse_event(
            &json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":3}}),
            &mut input,
        )
        .unwrap();
        match &finish[0] {
            RawFragment::Finish {
                finish_reason,
                usage: Some(usage),
            } => {
                assert_eq!(*finish_reason, Some(FinishReason::ToolCalls));
                assert_eq!(usage.total_tokens, 15);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_event_is_upstream_failure() {
        let mut input = 0;
        let err = parse_event(
            &json!({"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}),
            &mut input,
        )
        .unwrap_err();
        assert!(matches!(err, TurnstileError::UpstreamStream(m) if m == "Overloaded"));
    }

    #[test]
    fn request_body_merges_tool_results_and_lifts_system() {
        let provider = AnthropicProvider::new("claude-test", "k".into(), None);
        let request = ProviderRequest {
            messages: vec![
                ModelMessage::system("be brief"),
                ModelMessage::user("hi"),
                ModelMessage::assistant_with_tool_calls(
                    "",
                    vec![
                        AgentToolCall {
                            id: "a".into(),
                            name: "f".into(),
                            arguments: json!({}),
                        },
                        AgentToolCall {
                            id: "b".into(),
                            name: "g".into(),
                            arguments: json!({}),
                        },
                    ],
                ),
                ModelMessage::tool_result("a", json!("1"), false),
                ModelMessage::tool_result("b", json!("2"), true),
            ],
            settings: GenerationSettings::default(),
            tools: Some(vec![ToolDefinition {
                name: "f".into(),
                description: "d".into(),
                parameters: json!({"type": "object"}),
            }]),
        };
        let body = provider.build_request_body(&request);
        assert_eq!(body["system"], "be brief");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(messages[2]["content"][1]["is_error"], true);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }
}
