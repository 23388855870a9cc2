//! OpenAI Chat Completions streaming provider.
//!
//! Also serves every OpenAI-compatible endpoint (Groq, OpenRouter, Together,
//! vLLM, Ollama's `/v1`), which differ only in base URL and credentials.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::TurnstileError;
use crate::types::*;

use super::http::{
    bearer_headers, open_stream, shared_client, sse_data, stream_ended_early, SseFrame,
};
use super::{ModelProvider, ProviderRequest};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    provider: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    include_usage: bool,
}

impl OpenAiProvider {
    pub fn new(model: impl Into<String>, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            provider: "openai".into(),
            model: model.into(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            include_usage: true,
        }
    }

    /// An OpenAI-compatible endpoint registered under another provider name.
    pub fn compatible(
        provider: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        base_url: String,
    ) -> Self {
        Self {
            provider: provider.into(),
            // Not every compatible server accepts `stream_options`.
            include_usage: false,
            ..Self::new(model, api_key, Some(base_url))
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request_body(&self, request: &ProviderRequest) -> Value {
        let messages = request
            .messages
            .iter()
            .flat_map(message_to_openai)
            .collect::<Vec<_>>();

        let mut body = serde_json::Map::new();
        body.insert("model".into(), self.model.clone().into());
        body.insert("messages".into(), messages.into());
        body.insert("stream".into(), true.into());
        if self.include_usage {
            body.insert("stream_options".into(), json!({"include_usage": true}));
        }

        let settings = &request.settings;
        if let Some(max) = settings.max_tokens {
            body.insert("max_tokens".into(), max.into());
        }
        if let Some(temp) = settings.temperature {
            body.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = settings.top_p {
            body.insert("top_p".into(), top_p.into());
        }
        if let Some(ref stops) = settings.stop_sequences {
            body.insert("stop".into(), json!(stops));
        }
        if let Some(seed) = settings.seed {
            body.insert("seed".into(), seed.into());
        }
        if let Some(ref user) = settings.user {
            body.insert("user".into(), user.clone().into());
        }

        if let Some(ref tools) = request.tools {
            if !tools.is_empty() {
                let tool_defs: Vec<Value> = tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect();
                body.insert("tools".into(), tool_defs.into());
            }
        }

        Value::Object(body)
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<RawStream, TurnstileError> {
        let body = self.build_request_body(request);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(provider = %self.provider, model = %self.model, "opening chat completions stream");

        let resp = open_stream(
            shared_client()
                .post(&url)
                .headers(bearer_headers(self.api_key.as_deref()))
                .json(&body),
        )
        .await?;

        let mut data = sse_data(resp);
        let stream = async_stream::stream! {
            // Either `[DONE]` or a choice with a finish reason ends a turn.
            let mut finished = false;
            while let Some(item) = data.next().await {
                let payload = match item {
                    Ok(SseFrame::Data(payload)) => payload,
                    Ok(SseFrame::Done) => {
                        finished = true;
                        break;
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                let (fragments, finishes) = parse_chunk(&payload);
                finished |= finishes;
                for fragment in fragments {
                    let failed = fragment.is_err();
                    yield fragment;
                    if failed {
                        return;
                    }
                }
            }
            if !finished {
                yield Err(stream_ended_early());
            }
        };
        Ok(stream.boxed())
    }
}

type ParsedChunk = (Vec<Result<RawFragment, TurnstileError>>, bool);

/// Map one `data:` payload to raw fragments, and report whether it carried
/// a finish reason.
fn parse_chunk(data: &str) -> ParsedChunk {
    let chunk: OpenAiStreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            return (
                vec![Err(TurnstileError::UpstreamStream(format!(
                    "unreadable stream chunk: {e}"
                )))],
                false,
            )
        }
    };
    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return (vec![Err(TurnstileError::UpstreamStream(message))], false);
    }

    let mut out = Vec::new();
    let mut finish_reason = None;
    if let Some(choice) = chunk.choices.into_iter().next() {
        let delta = choice.delta;
        if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning) {
            if !reasoning.is_empty() {
                out.push(Ok(RawFragment::Reasoning(reasoning)));
            }
        }
        if let Some(text) = delta.content {
            if !text.is_empty() {
                out.push(Ok(RawFragment::Text(text)));
            }
        }
        for call in delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match call.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            out.push(Ok(RawFragment::ToolCallDelta {
                index: call.index,
                id: call.id,
                name,
                arguments,
            }));
        }
        finish_reason = choice.finish_reason;
    }

    let usage = chunk.usage.map(|u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
        ..Default::default()
    });
    let finishes = finish_reason.is_some();
    if finishes || usage.is_some() {
        out.push(Ok(RawFragment::Finish {
            finish_reason: finish_reason.as_deref().and_then(FinishReason::from_provider),
            usage,
        }));
    }
    (out, finishes)
}

/// One history message becomes one OpenAI message, except a message holding
/// several tool results, which becomes one `tool` message per result.
fn message_to_openai(msg: &ModelMessage) -> Vec<Value> {
    match msg.role {
        Role::Tool => msg
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult(tr) => Some(json!({
                    "role": "tool",
                    "tool_call_id": tr.tool_call_id,
                    "content": tool_result_content(&tr.result),
                })),
                _ => None,
            })
            .collect(),
        Role::Assistant if !msg.tool_calls().is_empty() => {
            let tool_calls: Vec<Value> = msg
                .tool_calls()
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let text = msg.text();
            vec![json!({
                "role": "assistant",
                "content": if text.is_empty() { Value::Null } else { Value::String(text) },
                "tool_calls": tool_calls,
            })]
        }
        role => {
            let role = match role {
                Role::System => "system",
                Role::User => "user",
                _ => "assistant",
            };
            vec![json!({ "role": role, "content": msg.text() })]
        }
    }
}

fn tool_result_content(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    reasoning: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Deserialize)]
struct OpenAiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}
