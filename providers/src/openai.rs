//! OpenAI-compatible chat completions client.
//!
//! Speaks the streaming `chat/completions` wire format (`stream: true`):
//! text arrives as content deltas and tool calls arrive as fragmented
//! argument deltas keyed by choice index. The parser reassembles the
//! fragments and emits one [`StreamEvent::ToolCall`] per call, in the order
//! the model started them, so downstream consumers never deal with partial
//! arguments.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Value, json};

use tether_types::{Message, Role, StreamEvent, ToolCall, ToolDefinition};

use crate::{
    Result, SseAction, SseParser, http_client, mpsc, pump_sse_stream, read_capped_error_body,
    send_event, stream_idle_timeout,
};

/// Canonical OpenAI chat completions endpoint.
pub const OPENAI_CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

const STREAM_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection settings for an OpenAI-compatible chat endpoint.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl ChatConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: OPENAI_CHAT_COMPLETIONS_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Point the client at a non-default endpoint (proxy, compatible server).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Streaming chat client.
///
/// [`ChatClient::open_stream`] spawns the request task and hands back the
/// receiving end of the event channel; dropping the receiver cancels
/// delivery (the task notices the closed channel and stops).
#[derive(Debug, Clone)]
pub struct ChatClient {
    config: ChatConfig,
}

impl ChatClient {
    #[must_use]
    pub fn new(config: ChatConfig) -> Self {
        Self { config }
    }

    pub fn open_stream(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_EVENT_CHANNEL_CAPACITY);
        let config = self.config.clone();
        tokio::spawn(async move {
            if let Err(e) = send_chat(&config, &messages, &tools, &tx).await {
                tracing::error!("Chat stream task failed: {e}");
                let _ = send_event(&tx, StreamEvent::Error(format!("Stream failed: {e}"))).await;
            }
        });
        rx
    }
}

/// Send one chat request and pump its SSE response into `tx`.
pub async fn send_chat(
    config: &ChatConfig,
    messages: &[Message],
    tools: &[ToolDefinition],
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<()> {
    let body = build_request_body(&config.model, messages, tools);

    let response = http_client()
        .post(&config.base_url)
        .bearer_auth(&config.api_key)
        .json(&body)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            let _ = send_event(tx, StreamEvent::Error(format!("Request failed: {e}"))).await;
            return Ok(());
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let error_text = read_capped_error_body(response).await;
        let _ = send_event(
            tx,
            StreamEvent::Error(format!("API error {status}: {error_text}")),
        )
        .await;
        return Ok(());
    }

    let mut parser = ChatCompletionsParser::default();
    pump_sse_stream(response, &mut parser, tx, stream_idle_timeout()).await
}

fn build_request_body(model: &str, messages: &[Message], tools: &[ToolDefinition]) -> Value {
    let mut api_messages: Vec<Value> = Vec::with_capacity(messages.len());

    for message in messages {
        if message.role == Role::Assistant && !message.tool_invocations.is_empty() {
            let tool_calls: Vec<Value> = message
                .tool_invocations
                .iter()
                .map(|inv| {
                    json!({
                        "id": inv.tool_call_id,
                        "type": "function",
                        "function": {
                            "name": inv.tool_name,
                            "arguments": inv.args.to_string(),
                        },
                    })
                })
                .collect();

            let content = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };
            api_messages.push(json!({
                "role": "assistant",
                "content": content,
                "tool_calls": tool_calls,
            }));

            // Completed invocations get their own tool-role entries so the
            // model sees the results alongside the calls.
            for inv in &message.tool_invocations {
                if let Some(result) = &inv.result {
                    api_messages.push(json!({
                        "role": "tool",
                        "tool_call_id": inv.tool_call_id,
                        "content": result.to_string(),
                    }));
                }
            }
        } else {
            api_messages.push(json!({
                "role": message.role.as_str(),
                "content": message.content,
            }));
        }
    }

    let mut body = json!({
        "model": model,
        "messages": api_messages,
        "stream": true,
    });

    if !tools.is_empty() {
        let api_tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    },
                })
            })
            .collect();
        body["tools"] = Value::Array(api_tools);
    }

    body
}

// ========================================================================
// Chat completions SSE parser
// ========================================================================

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallFragment>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Assembles fragmented tool-call deltas keyed by choice index.
#[derive(Default)]
struct ChatCompletionsParser {
    partial: BTreeMap<u32, PartialCall>,
}

impl ChatCompletionsParser {
    fn accumulate(&mut self, fragment: ToolCallFragment) {
        let entry = self.partial.entry(fragment.index).or_default();
        if let Some(id) = fragment.id.filter(|s| !s.is_empty()) {
            entry.id = Some(id);
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name.filter(|s| !s.is_empty()) {
                entry.name = Some(name);
            }
            if let Some(arguments) = function.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
    }

    /// Emit every fully assembled call, in the order the model started them.
    fn flush(&mut self) -> Vec<StreamEvent> {
        let partial = std::mem::take(&mut self.partial);
        let mut events = Vec::with_capacity(partial.len());
        for (index, call) in partial {
            let (Some(id), Some(name)) = (call.id, call.name) else {
                tracing::warn!(index, "Dropping tool call fragment without id/name");
                continue;
            };
            let arguments = if call.arguments.trim().is_empty() {
                json!({})
            } else {
                match serde_json::from_str(&call.arguments) {
                    Ok(value) => value,
                    Err(e) => {
                        // Schema validation downstream rejects the null and
                        // surfaces an error tool result to the model.
                        tracing::warn!(%e, tool = %name, "Tool call arguments were not valid JSON");
                        Value::Null
                    }
                }
            };
            events.push(StreamEvent::ToolCall(ToolCall::new(id, name, arguments)));
        }
        events
    }
}

impl SseParser for ChatCompletionsParser {
    fn parse(&mut self, json: &Value) -> SseAction {
        let chunk: ChatChunk = match serde_json::from_value(json.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!("Unrecognized chat completions chunk: {e}");
                return SseAction::Continue;
            }
        };

        let Some(choice) = chunk.choices.into_iter().next() else {
            return SseAction::Continue;
        };

        let mut events = Vec::new();
        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            events.push(StreamEvent::TextDelta(content));
        }
        for fragment in choice.delta.tool_calls {
            self.accumulate(fragment);
        }

        if choice.finish_reason.is_some() {
            // Assembled calls are flushed by `finish` on the Done path.
            return SseAction::Done;
        }

        if events.is_empty() {
            SseAction::Continue
        } else {
            SseAction::Emit(events)
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        self.flush()
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}
