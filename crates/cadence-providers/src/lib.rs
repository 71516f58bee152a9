use std::collections::HashMap;
use std::sync::Arc;
use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use cadence_types::LLMUsage;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        args_delta: String,
    },
    ToolCallEnd {
        id: String,
    },
    Done {
        finish_reason: String,
        usage: Option<LLMUsage>,
    },
}

pub type ChatStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct GenerateTextRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub system: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerateTextResponse {
    pub text: String,
    pub usage: LLMUsage,
}

#[derive(Debug, Clone)]
pub struct GenerateStructuredRequest {
    pub messages: Vec<ChatMessage>,
    pub schema: Value,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct GenerateStructuredResponse {
    pub object: Value,
    pub usage: LLMUsage,
}

#[derive(Debug, Clone, Default)]
pub struct ChatStreamRequest {
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub tools: Option<Vec<ToolSchema>>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

/// The sole capability the gateway is allowed to invoke a model through.
///
/// The wire spec describes `createChatStream` as taking an `onFinish`
/// callback; here the final usage rides in the stream's terminal
/// `StreamChunk::Done` instead — the gateway's streaming commit path reads
/// it off the stream rather than being handed a callback.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn provider(&self) -> &str;
    fn default_model(&self) -> &str;
    async fn generate_text(&self, req: GenerateTextRequest) -> anyhow::Result<GenerateTextResponse>;
    async fn generate_structured(
        &self,
        req: GenerateStructuredRequest,
    ) -> anyhow::Result<GenerateStructuredResponse>;
    async fn create_chat_stream(
        &self,
        req: ChatStreamRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChatStream>;
}

#[derive(Clone)]
pub struct ModelClientRegistry {
    clients: Arc<RwLock<Vec<Arc<dyn ModelClient>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ModelClientRegistry {
    pub fn new(config: AppConfig) -> Self {
        let clients = build_clients(&config);
        Self {
            clients: Arc::new(RwLock::new(clients)),
            default_provider: Arc::new(RwLock::new(config.default_provider)),
        }
    }

    pub async fn reload(&self, config: AppConfig) {
        let rebuilt = build_clients(&config);
        *self.clients.write().await = rebuilt;
        *self.default_provider.write().await = config.default_provider;
    }

    pub async fn list(&self) -> Vec<String> {
        self.clients
            .read()
            .await
            .iter()
            .map(|c| c.provider().to_string())
            .collect()
    }

    pub async fn select(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn ModelClient>> {
        let clients = self.clients.read().await;
        let available = clients.iter().map(|c| c.provider()).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(client) = clients.iter().find(|c| c.provider() == id) {
                return Ok(client.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(client) = clients.iter().find(|c| c.provider() == default_id) {
                return Ok(client.clone());
            }
        };

        let Some(client) = clients.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(client.clone())
    }
}

fn build_clients(config: &AppConfig) -> Vec<Arc<dyn ModelClient>> {
    let mut clients: Vec<Arc<dyn ModelClient>> = Vec::new();

    add_openai_compatible(
        config,
        &mut clients,
        "ollama",
        "http://127.0.0.1:11434/v1",
        "llama3.1:8b",
        false,
    );
    add_openai_compatible(
        config,
        &mut clients,
        "openai",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        true,
    );
    add_openai_compatible(
        config,
        &mut clients,
        "openrouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
        true,
    );
    add_openai_compatible(
        config,
        &mut clients,
        "groq",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
        true,
    );
    add_openai_compatible(
        config,
        &mut clients,
        "mistral",
        "https://api.mistral.ai/v1",
        "mistral-small-latest",
        true,
    );
    add_openai_compatible(
        config,
        &mut clients,
        "together",
        "https://api.together.xyz/v1",
        "meta-llama/Llama-3.1-8B-Instruct-Turbo",
        true,
    );

    if let Some(anthropic) = config.providers.get("anthropic") {
        clients.push(Arc::new(AnthropicClient {
            api_key: anthropic
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| {
                    std::env::var("ANTHROPIC_API_KEY")
                        .ok()
                        .filter(|v| !v.trim().is_empty())
                }),
            default_model: anthropic
                .default_model
                .clone()
                .unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string()),
            client: Client::new(),
        }));
    }
    if let Some(cohere) = config.providers.get("cohere") {
        clients.push(Arc::new(CohereClient {
            api_key: cohere
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| {
                    std::env::var("COHERE_API_KEY")
                        .ok()
                        .filter(|v| !v.trim().is_empty())
                }),
            base_url: normalize_plain_base(
                cohere.url.as_deref().unwrap_or("https://api.cohere.com/v2"),
            ),
            default_model: cohere
                .default_model
                .clone()
                .unwrap_or_else(|| "command-r-plus".to_string()),
            client: Client::new(),
        }));
    }

    if clients.is_empty() {
        clients.push(Arc::new(LocalEchoClient));
    }

    clients
}

fn add_openai_compatible(
    config: &AppConfig,
    clients: &mut Vec<Arc<dyn ModelClient>>,
    id: &str,
    default_url: &str,
    default_model: &str,
    use_api_key: bool,
) {
    let Some(entry) = config.providers.get(id) else {
        return;
    };
    clients.push(Arc::new(OpenAICompatibleClient {
        id: id.to_string(),
        base_url: normalize_base(entry.url.as_deref().unwrap_or(default_url)),
        api_key: if use_api_key {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| env_api_key_for_provider(id))
        } else {
            None
        },
        default_model: entry
            .default_model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        client: Client::new(),
    }));
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "together" => Some("TOGETHER_API_KEY"),
        _ => None,
    }?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn provider_api_key_env_hint(id: &str) -> &'static str {
    match id {
        "openrouter" => "OPENROUTER_API_KEY",
        "openai" => "OPENAI_API_KEY",
        "anthropic" => "ANTHROPIC_API_KEY",
        "groq" => "GROQ_API_KEY",
        "mistral" => "MISTRAL_API_KEY",
        "cohere" => "COHERE_API_KEY",
        _ => "provider API key",
    }
}

fn render_prompt(req: &GenerateTextRequest) -> String {
    let mut out = String::new();
    if let Some(system) = &req.system {
        out.push_str("system: ");
        out.push_str(system);
        out.push('\n');
    }
    for message in &req.messages {
        out.push_str(&message.role);
        out.push_str(": ");
        out.push_str(&message.content);
        out.push('\n');
    }
    out
}

struct LocalEchoClient;

#[async_trait]
impl ModelClient for LocalEchoClient {
    fn provider(&self) -> &str {
        "local"
    }

    fn default_model(&self) -> &str {
        "echo-1"
    }

    async fn generate_text(&self, req: GenerateTextRequest) -> anyhow::Result<GenerateTextResponse> {
        let prompt = render_prompt(&req);
        let prompt_tokens = estimate_tokens(&prompt);
        let text = format!("Echo: {prompt}");
        let completion_tokens = estimate_tokens(&text);
        Ok(GenerateTextResponse {
            text,
            usage: LLMUsage {
                provider: self.provider().to_string(),
                model: self.default_model().to_string(),
                prompt_tokens,
                completion_tokens,
                total_tokens: None,
                cost: None,
                raw: None,
            }
            .normalized(),
        })
    }

    async fn generate_structured(
        &self,
        req: GenerateStructuredRequest,
    ) -> anyhow::Result<GenerateStructuredResponse> {
        let prompt = req
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        let prompt_tokens = estimate_tokens(&prompt);
        Ok(GenerateStructuredResponse {
            object: json!({ "echo": prompt }),
            usage: LLMUsage {
                provider: self.provider().to_string(),
                model: self.default_model().to_string(),
                prompt_tokens,
                completion_tokens: 1,
                total_tokens: None,
                cost: None,
                raw: None,
            }
            .normalized(),
        })
    }

    async fn create_chat_stream(
        &self,
        req: ChatStreamRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChatStream> {
        let prompt = req
            .messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let text = format!("Echo: {prompt}");
        let usage = LLMUsage {
            provider: self.provider().to_string(),
            model: self.default_model().to_string(),
            prompt_tokens: estimate_tokens(&prompt),
            completion_tokens: estimate_tokens(&text),
            total_tokens: None,
            cost: None,
            raw: None,
        }
        .normalized();
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(text)),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: Some(usage),
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

fn estimate_tokens(text: &str) -> i64 {
    ((text.chars().count() as f64) / 4.0).ceil() as i64
}

struct OpenAICompatibleClient {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleClient {
    fn resolve_model<'a>(&'a self, model_override: &'a Option<String>) -> &'a str {
        model_override
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
    }

    fn decorate(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = if self.id == "openrouter" {
            req.header("HTTP-Referer", "https://cadence.frumu.ai")
                .header("X-Title", "Cadence")
        } else {
            req
        };
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl ModelClient for OpenAICompatibleClient {
    fn provider(&self) -> &str {
        &self.id
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn generate_text(&self, req: GenerateTextRequest) -> anyhow::Result<GenerateTextResponse> {
        let model = self.resolve_model(&req.model).to_string();
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(
            req.messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content})),
        );
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": req.temperature,
            "stream": false,
        });
        let response = self.decorate(self.client.post(url).json(&body)).send().await?;
        let status = response.status();
        let value: Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {}", status));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }

        let Some(text) = extract_openai_text(&value) else {
            let body_preview = truncate_for_error(&value.to_string(), 500);
            anyhow::bail!(
                "provider returned no completion content for model `{}` (response: {})",
                model,
                body_preview
            );
        };

        let usage = extract_usage(&value, &self.id, &model, Some(value.clone()));
        Ok(GenerateTextResponse { text, usage })
    }

    async fn generate_structured(
        &self,
        req: GenerateStructuredRequest,
    ) -> anyhow::Result<GenerateStructuredResponse> {
        let model = self.resolve_model(&req.model).to_string();
        let mut messages = req
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();
        messages.push(json!({
            "role": "system",
            "content": format!(
                "Respond with a single JSON object conforming to this schema: {}",
                req.schema
            ),
        }));
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": req.temperature,
            "response_format": {"type": "json_object"},
            "stream": false,
        });
        let response = self.decorate(self.client.post(url).json(&body)).send().await?;
        let status = response.status();
        let value: Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {}", status));
            anyhow::bail!(detail);
        }

        let Some(text) = extract_openai_text(&value) else {
            anyhow::bail!("provider returned no structured content for model `{}`", model);
        };
        let object: Value = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("model response was not valid JSON: {e}"))?;

        let usage = extract_usage(&value, &self.id, &model, Some(value.clone()));
        Ok(GenerateStructuredResponse { object, usage })
    }

    async fn create_chat_stream(
        &self,
        req: ChatStreamRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChatStream> {
        let model = self.resolve_model(&req.model).to_string();
        let url = format!("{}/chat/completions", self.base_url);
        let mut wire_messages = Vec::new();
        if let Some(system) = &req.system {
            wire_messages.push(json!({"role": "system", "content": system}));
        }
        wire_messages.extend(
            req.messages
                .into_iter()
                .map(|m| json!({"role": m.role, "content": m.content})),
        );

        let wire_tools = req
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "temperature": req.temperature,
            "stream": true,
        });
        if !wire_tools.is_empty() {
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        let resp = self.decorate(self.client.post(url).json(&body)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if text.contains("Failed to authenticate request with Clerk") {
                let key_hint = provider_api_key_env_hint(&self.id);
                anyhow::bail!(
                    "provider authentication failed ({}) for `{}`. Verify the provider API key (set `{}`) and retry.",
                    status,
                    self.id,
                    key_hint
                );
            }
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let provider_id = self.id.clone();
        let model_name = model.clone();
        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    };
                    break;
                }

                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        if !line.starts_with("data: ") {
                            continue;
                        }
                        let payload = line.trim_start_matches("data: ").trim();
                        if payload == "[DONE]" {
                            yield StreamChunk::Done {
                                finish_reason: "stop".to_string(),
                                usage: None,
                            };
                            continue;
                        }

                        let Ok(value) = serde_json::from_str::<Value>(payload) else {
                            continue;
                        };

                        if let Some(detail) = extract_openai_error(&value) {
                            Err(anyhow::anyhow!(detail))?;
                        }

                        let choices = value
                            .get("choices")
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default();
                        for choice in choices {
                            let delta = choice.get("delta").cloned().unwrap_or_default();

                            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                                if !text.is_empty() {
                                    yield StreamChunk::TextDelta(text.to_string());
                                }
                            }

                            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                                for call in tool_calls {
                                    let id = call
                                        .get("id")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string();
                                    let function = call.get("function").cloned().unwrap_or_default();
                                    let name = function
                                        .get("name")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string();
                                    let args_delta = function
                                        .get("arguments")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string();

                                    if !id.is_empty() && !name.is_empty() {
                                        yield StreamChunk::ToolCallStart {
                                            id: id.clone(),
                                            name,
                                        };
                                    }
                                    if !id.is_empty() && !args_delta.is_empty() {
                                        yield StreamChunk::ToolCallDelta {
                                            id: id.clone(),
                                            args_delta,
                                        };
                                    }
                                    if !id.is_empty() {
                                        yield StreamChunk::ToolCallEnd { id };
                                    }
                                }
                            }

                            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                                if !reason.is_empty() {
                                    let usage = extract_usage_opt(&value, &provider_id, &model_name);
                                    yield StreamChunk::Done {
                                        finish_reason: reason.to_string(),
                                        usage,
                                    };
                                }
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

struct AnthropicClient {
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

struct CohereClient {
    api_key: Option<String>,
    base_url: String,
    default_model: String,
    client: Client,
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn generate_text(&self, req: GenerateTextRequest) -> anyhow::Result<GenerateTextResponse> {
        let model = req
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string();
        let mut wire_req = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": model,
                "max_tokens": 1024,
                "system": req.system,
                "messages": req.messages.iter().map(|m| json!({"role": m.role, "content": m.content})).collect::<Vec<_>>(),
            }));
        if let Some(key) = &self.api_key {
            wire_req = wire_req.header("x-api-key", key);
        }
        let value: Value = wire_req.send().await?.json().await?;
        let text = value["content"][0]["text"]
            .as_str()
            .unwrap_or("No completion content.")
            .to_string();
        let usage = extract_usage(&value, "anthropic", &model, Some(value.clone()));
        Ok(GenerateTextResponse { text, usage })
    }

    async fn generate_structured(
        &self,
        req: GenerateStructuredRequest,
    ) -> anyhow::Result<GenerateStructuredResponse> {
        let text_req = GenerateTextRequest {
            messages: {
                let mut messages = req.messages.clone();
                messages.push(ChatMessage {
                    role: "user".to_string(),
                    content: format!(
                        "Respond with a single JSON object conforming to this schema: {}",
                        req.schema
                    ),
                });
                messages
            },
            model: req.model,
            temperature: req.temperature,
            system: None,
        };
        let response = self.generate_text(text_req).await?;
        let object: Value = serde_json::from_str(&response.text)
            .map_err(|e| anyhow::anyhow!("model response was not valid JSON: {e}"))?;
        Ok(GenerateStructuredResponse {
            object,
            usage: response.usage,
        })
    }

    async fn create_chat_stream(
        &self,
        req: ChatStreamRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChatStream> {
        let model = req
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string();
        let mut wire_req = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": model,
                "max_tokens": 1024,
                "stream": true,
                "system": req.system,
                "messages": req.messages
                    .into_iter()
                    .map(|m| json!({"role": m.role, "content": m.content}))
                    .collect::<Vec<_>>(),
            }));
        if let Some(key) = &self.api_key {
            wire_req = wire_req.header("x-api-key", key);
        }

        let resp = wire_req.send().await?;
        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    };
                    break;
                }
                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        if !line.starts_with("data: ") {
                            continue;
                        }
                        let payload = line.trim_start_matches("data: ").trim();
                        if payload == "[DONE]" {
                            yield StreamChunk::Done {
                                finish_reason: "stop".to_string(),
                                usage: None,
                            };
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<Value>(payload) else {
                            continue;
                        };
                        match value.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
                            "content_block_delta" => {
                                if let Some(delta) = value.get("delta").and_then(|v| v.get("text")).and_then(|v| v.as_str()) {
                                    yield StreamChunk::TextDelta(delta.to_string());
                                }
                                if let Some(reasoning) = value.get("delta").and_then(|v| v.get("thinking")).and_then(|v| v.as_str()) {
                                    yield StreamChunk::ReasoningDelta(reasoning.to_string());
                                }
                            }
                            "message_stop" => {
                                yield StreamChunk::Done {
                                    finish_reason: "stop".to_string(),
                                    usage: None,
                                };
                            }
                            _ => {}
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ModelClient for CohereClient {
    fn provider(&self) -> &str {
        "cohere"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn generate_text(&self, req: GenerateTextRequest) -> anyhow::Result<GenerateTextResponse> {
        let model = req
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string();
        let mut wire_req = self
            .client
            .post(format!("{}/chat", self.base_url))
            .json(&json!({
                "model": model,
                "messages": req.messages.iter().map(|m| json!({"role": m.role, "content": m.content})).collect::<Vec<_>>(),
            }));
        if let Some(key) = &self.api_key {
            wire_req = wire_req.bearer_auth(key);
        }
        let value: Value = wire_req.send().await?.json().await?;
        let text = value["message"]["content"][0]["text"]
            .as_str()
            .or_else(|| value["text"].as_str())
            .unwrap_or("No completion content.")
            .to_string();
        let usage = extract_usage(&value, "cohere", &model, Some(value.clone()));
        Ok(GenerateTextResponse { text, usage })
    }

    async fn generate_structured(
        &self,
        req: GenerateStructuredRequest,
    ) -> anyhow::Result<GenerateStructuredResponse> {
        let text_req = GenerateTextRequest {
            messages: {
                let mut messages = req.messages.clone();
                messages.push(ChatMessage {
                    role: "user".to_string(),
                    content: format!(
                        "Respond with a single JSON object conforming to this schema: {}",
                        req.schema
                    ),
                });
                messages
            },
            model: req.model,
            temperature: req.temperature,
            system: None,
        };
        let response = self.generate_text(text_req).await?;
        let object: Value = serde_json::from_str(&response.text)
            .map_err(|e| anyhow::anyhow!("model response was not valid JSON: {e}"))?;
        Ok(GenerateStructuredResponse {
            object,
            usage: response.usage,
        })
    }

    async fn create_chat_stream(
        &self,
        req: ChatStreamRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChatStream> {
        let response = self
            .generate_text(GenerateTextRequest {
                messages: req.messages,
                model: req.model,
                temperature: req.temperature,
                system: req.system,
            })
            .await?;
        let usage = response.usage;
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(response.text)),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: Some(usage),
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn normalize_plain_base(input: &str) -> String {
    input.trim_end_matches('/').to_string()
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

fn extract_usage(value: &Value, provider: &str, model: &str, raw: Option<Value>) -> LLMUsage {
    let usage = value.get("usage");
    let prompt_tokens = usage
        .and_then(|u| u.get("prompt_tokens").or_else(|| u.get("input_tokens")))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let completion_tokens = usage
        .and_then(|u| u.get("completion_tokens").or_else(|| u.get("output_tokens")))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let total_tokens = usage
        .and_then(|u| u.get("total_tokens"))
        .and_then(|v| v.as_i64());
    LLMUsage {
        provider: provider.to_string(),
        model: model.to_string(),
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cost: None,
        raw,
    }
    .normalized()
}

fn extract_usage_opt(value: &Value, provider: &str, model: &str) -> Option<LLMUsage> {
    if value.get("usage").is_none() {
        return None;
    }
    Some(extract_usage(value, provider, model, Some(value.clone())))
}

fn collect_text_fragments(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Array(arr) => {
            for item in arr {
                collect_text_fragments(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
            if let Some(text) = map.get("output_text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
            if let Some(content) = map.get("content") {
                collect_text_fragments(content, out);
            }
            if let Some(delta) = map.get("delta") {
                collect_text_fragments(delta, out);
            }
            if let Some(message) = map.get("message") {
                collect_text_fragments(message, out);
            }
        }
        _ => {}
    }
}

fn extract_openai_text(value: &Value) -> Option<String> {
    let mut out = String::new();

    if let Some(choice) = value.get("choices").and_then(|v| v.get(0)) {
        collect_text_fragments(choice, &mut out);
        if !out.trim().is_empty() {
            return Some(out);
        }
    }

    if let Some(text) = value
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("text"))
        .and_then(|v| v.as_str())
    {
        return Some(text.to_string());
    }

    if let Some(output) = value.get("output") {
        collect_text_fragments(output, &mut out);
        if !out.trim().is_empty() {
            return Some(out);
        }
    }

    if let Some(content) = value.get("content") {
        collect_text_fragments(content, &mut out);
        if !out.trim().is_empty() {
            return Some(out);
        }
    }

    if let Some(text) = value.get("output_text").and_then(|v| v.as_str()) {
        return Some(text.to_string());
    }

    None
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(
        provider_ids: &[&str],
        default_provider: Option<&str>,
        include_openai_key: bool,
    ) -> AppConfig {
        let mut providers = HashMap::new();
        for id in provider_ids {
            let api_key = if *id == "openai" && include_openai_key {
                Some("sk-test".to_string())
            } else {
                None
            };
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key,
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        AppConfig {
            providers,
            default_provider: default_provider.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn explicit_provider_wins_over_default_provider() {
        let registry = ModelClientRegistry::new(cfg(&["openai", "openrouter"], Some("openai"), true));
        let client = registry.select(Some("openrouter")).await.expect("client");
        assert_eq!(client.provider(), "openrouter");
    }

    #[tokio::test]
    async fn uses_default_provider_when_explicit_provider_missing() {
        let registry =
            ModelClientRegistry::new(cfg(&["openai", "openrouter"], Some("openrouter"), true));
        let client = registry.select(None).await.expect("client");
        assert_eq!(client.provider(), "openrouter");
    }

    #[tokio::test]
    async fn falls_back_to_first_provider_when_default_provider_missing() {
        let registry = ModelClientRegistry::new(cfg(&["openai"], Some("anthropic"), true));
        let client = registry.select(None).await.expect("client");
        assert_eq!(client.provider(), "openai");
    }

    #[tokio::test]
    async fn explicit_unknown_provider_errors() {
        let registry = ModelClientRegistry::new(cfg(&["openai"], None, true));
        let err = registry
            .select(Some("openruter"))
            .await
            .err()
            .expect("expected error");
        assert!(err
            .to_string()
            .contains("provider `openruter` is not configured"));
    }

    #[tokio::test]
    async fn local_echo_client_is_deterministic() {
        let client = LocalEchoClient;
        let req = GenerateTextRequest {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hello".to_string(),
            }],
            ..Default::default()
        };
        let resp = client.generate_text(req).await.expect("response");
        assert_eq!(resp.text, "Echo: user: hello\n");
        assert!(resp.usage.prompt_tokens > 0);
    }
}
