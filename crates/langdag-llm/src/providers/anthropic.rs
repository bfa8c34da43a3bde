use std::collections::{BTreeMap, VecDeque};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use langdag_core::config::AnthropicConfig;
use langdag_core::error::{LangdagError, Result};
use langdag_core::traits::Provider;
use langdag_core::types::*;

use crate::streaming::{SseEvent, SseStream};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    http: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn from_config(config: &AnthropicConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LangdagError::Config("Anthropic API key not set".into()))?;
        let mut provider = Self::new(api_key);
        if let Some(url) = &config.base_url {
            provider.base_url = url.clone();
        }
        Ok(provider)
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let body = AnthropicRequest::from_request(request, stream);

        let response = self
            .http
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LangdagError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(LangdagError::Provider(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

impl AnthropicRequest {
    fn from_request(req: &CompletionRequest, stream: bool) -> Self {
        Self {
            model: req.model.clone(),
            max_tokens: req.max_tokens,
            temperature: req.temperature.filter(|t| *t > 0.0),
            messages: req
                .messages
                .iter()
                .map(|m| ApiMessage {
                    role: match m.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    content: m.content.clone(),
                })
                .collect(),
            system: req.system.clone().filter(|s| !s.is_empty()),
            stream,
            tools: req
                .tools
                .iter()
                .map(|t| ApiTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: if t.input_schema.is_null() {
                        serde_json::json!({"type": "object", "properties": {}})
                    } else {
                        t.input_schema.clone()
                    },
                })
                .collect(),
        }
    }
}

// Anthropic API response types
#[derive(Deserialize, Debug)]
struct ApiResponse {
    id: String,
    model: String,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: UsageInfo,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum SseData {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageInfo },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { index: usize, content_block: ContentBlockInfo },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: DeltaInfo },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: MessageDeltaInfo, usage: Option<UsageInfo> },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "ping")]
    Ping {},
    #[serde(rename = "error")]
    Error { error: ApiError },
}

#[derive(Deserialize, Debug)]
struct MessageInfo {
    id: String,
    #[serde(default)]
    model: String,
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug, Default)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ContentBlockInfo {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum DeltaInfo {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Deserialize, Debug)]
struct MessageDeltaInfo {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

/// A content block still receiving deltas.
enum PartialBlock {
    Text(String),
    ToolUse { id: String, name: String, json: String },
}

/// Folds SSE events into provider events and the final response.
#[derive(Default)]
struct ResponseBuilder {
    id: String,
    model: String,
    usage: Usage,
    stop_reason: Option<StopReason>,
    open: BTreeMap<usize, PartialBlock>,
    content: Vec<ContentBlock>,
    finished: bool,
}

impl ResponseBuilder {
    fn handle(&mut self, event: SseEvent) -> Vec<ProviderEvent> {
        if event.data.trim() == "[DONE]" {
            return vec![];
        }

        let data: SseData = match serde_json::from_str(&event.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(data = %event.data, error = %e, "Failed to parse SSE data");
                return vec![];
            }
        };

        match data {
            SseData::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                if let Some(usage) = message.usage {
                    self.usage.input_tokens = usage.input_tokens;
                    self.usage.output_tokens = usage.output_tokens;
                }
                vec![ProviderEvent::Start]
            }
            SseData::ContentBlockStart {
                index,
                content_block,
            } => {
                let block = match content_block {
                    ContentBlockInfo::Text { text } => PartialBlock::Text(text),
                    ContentBlockInfo::ToolUse { id, name } => PartialBlock::ToolUse {
                        id,
                        name,
                        json: String::new(),
                    },
                };
                self.open.insert(index, block);
                vec![]
            }
            SseData::ContentBlockDelta { index, delta } => match (self.open.get_mut(&index), delta) {
                (Some(PartialBlock::Text(buf)), DeltaInfo::TextDelta { text }) => {
                    buf.push_str(&text);
                    vec![ProviderEvent::Delta(text)]
                }
                (Some(PartialBlock::ToolUse { json, .. }), DeltaInfo::InputJsonDelta { partial_json }) => {
                    json.push_str(&partial_json);
                    vec![]
                }
                _ => vec![],
            },
            SseData::ContentBlockStop { index } => {
                let block = match self.open.remove(&index) {
                    Some(PartialBlock::Text(text)) => ContentBlock::Text { text },
                    Some(PartialBlock::ToolUse { id, name, json }) => {
                        let input = if json.trim().is_empty() {
                            serde_json::json!({})
                        } else {
                            serde_json::from_str(&json).unwrap_or_else(|e| {
                                warn!(tool = %name, error = %e, "Malformed tool input JSON");
                                serde_json::json!({})
                            })
                        };
                        ContentBlock::ToolUse { id, name, input }
                    }
                    None => return vec![],
                };
                self.content.push(block.clone());
                vec![ProviderEvent::ContentDone(block)]
            }
            SseData::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.stop_reason = StopReason::parse(reason);
                }
                if let Some(usage) = usage {
                    self.usage.output_tokens = usage.output_tokens;
                    if usage.input_tokens > 0 {
                        self.usage.input_tokens = usage.input_tokens;
                    }
                    debug!(
                        input_tokens = self.usage.input_tokens,
                        output_tokens = self.usage.output_tokens,
                        "Token usage"
                    );
                }
                vec![]
            }
            SseData::MessageStop {} => {
                self.finished = true;
                vec![ProviderEvent::Done(CompletionResponse {
                    id: std::mem::take(&mut self.id),
                    model: std::mem::take(&mut self.model),
                    content: std::mem::take(&mut self.content),
                    stop_reason: self.stop_reason.take(),
                    usage: self.usage,
                })]
            }
            SseData::Ping {} => vec![],
            SseData::Error { error } => {
                self.finished = true;
                vec![ProviderEvent::Error(LangdagError::ProviderStream(error.message))]
            }
        }
    }
}

/// Turn a stream of SSE events into provider events. A stream that ends
/// without `message_stop` yields a trailing error.
fn provider_events<S>(sse: S) -> impl Stream<Item = ProviderEvent>
where
    S: Stream<Item = Result<SseEvent>> + Unpin,
{
    struct State<S> {
        sse: S,
        builder: ResponseBuilder,
        pending: VecDeque<ProviderEvent>,
        done: bool,
    }

    let state = State {
        sse,
        builder: ResponseBuilder::default(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((event, st));
            }
            if st.done {
                return None;
            }
            match st.sse.next().await {
                Some(Ok(event)) => {
                    st.pending.extend(st.builder.handle(event));
                    st.done = st.builder.finished;
                }
                Some(Err(e)) => {
                    st.pending.push_back(ProviderEvent::Error(e));
                    st.done = true;
                }
                None => {
                    st.pending.push_back(ProviderEvent::Error(LangdagError::ProviderStream(
                        "stream ended before message_stop".into(),
                    )));
                    st.done = true;
                }
            }
        }
    })
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn models(&self) -> Vec<ModelInfo> {
        [
            ("claude-sonnet-4-20250514", "Claude Sonnet 4"),
            ("claude-opus-4-20250514", "Claude Opus 4"),
            ("claude-haiku-3-5-20241022", "Claude Haiku 3.5"),
        ]
        .into_iter()
        .map(|(id, name)| ModelInfo {
            id: id.to_string(),
            name: name.to_string(),
            context_window: 200_000,
            max_output: 8192,
        })
        .collect()
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            let response = self.send(&request, false).await?;
            let body: ApiResponse = response
                .json()
                .await
                .map_err(|e| LangdagError::Provider(format!("bad response body: {e}")))?;

            Ok(CompletionResponse {
                id: body.id,
                model: body.model,
                content: body.content,
                stop_reason: body.stop_reason.as_deref().and_then(StopReason::parse),
                usage: Usage {
                    input_tokens: body.usage.input_tokens,
                    output_tokens: body.usage.output_tokens,
                },
            })
        })
    }

    fn stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, ProviderEvent>>> {
        Box::pin(async move {
            let response = self.send(&request, true).await?;
            let sse = SseStream::new(response.bytes_stream());
            Ok(Box::pin(provider_events(sse)) as BoxStream<'_, ProviderEvent>)
        })
    }
}
