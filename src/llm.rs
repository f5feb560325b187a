//! Chat-completion providers and the gateway that dispatches between them.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ModelConfig, ProviderConfig};
use crate::error::{BloomError, Result};
use crate::message::{ConversationMessage, Role};
use crate::telemetry::TelemetryCollector;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Google,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenAi, Provider::Anthropic, Provider::Google];

    pub fn key(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Anthropic => "Anthropic Claude",
            Provider::Google => "Google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Provider {
    type Err = BloomError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            "google" | "gemini" => Ok(Provider::Google),
            other => Err(BloomError::InvalidProvider(other.to_string())),
        }
    }
}

/// Per-call overrides; unset fields fall back to provider defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl GenerationOptions {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
        }
    }

    fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Provider-independent completion result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub model: String,
    pub provider: Provider,
}

/// One remote chat-completion API.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Whether a credential (or proxy) is available. Reachability is not checked.
    fn is_configured(&self) -> bool {
        true
    }

    async fn complete_chat(
        &self,
        messages: &[ConversationMessage],
        options: &GenerationOptions,
    ) -> Result<LlmResponse>;
}

fn coalesce_error(status: reqwest::StatusCode, body: &str, provider: &str) -> BloomError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return BloomError::LanguageModel(format!("{provider} rate limit exceeded: {body}"));
    }
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|parsed| {
            parsed["error"]["message"]
                .as_str()
                .or_else(|| parsed["error"].as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    BloomError::LanguageModel(format!("{provider} request failed: {detail}"))
}

fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .build()
        .map_err(|err| BloomError::LanguageModel(format!("http client error: {err}")))
}

async fn read_json(resp: reqwest::Response, provider: &str) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(coalesce_error(status, &body, provider));
    }
    resp.json().await.map_err(|err| {
        BloomError::LanguageModel(format!("{provider} response parse error: {err}"))
    })
}

#[derive(Clone)]
pub struct OpenAIClient {
    http: reqwest::Client,
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
}

impl OpenAIClient {
    pub const DEFAULT_MODEL: &'static str = "gpt-4-turbo-preview";
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";
    pub const DEFAULT_MAX_TOKENS: u32 = 4000;

    pub fn from_config(http: reqwest::Client, cfg: &ProviderConfig) -> Self {
        Self {
            http,
            model: cfg.model.clone().unwrap_or_else(|| Self::DEFAULT_MODEL.into()),
            api_key: cfg.api_key.clone(),
            base_url: cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_BASE_URL.into()),
            max_tokens: cfg.max_tokens.unwrap_or(Self::DEFAULT_MAX_TOKENS),
        }
    }

    fn build_payload(&self, messages: &[ConversationMessage], options: &GenerationOptions) -> Value {
        let messages: Vec<OpenAiMessage> = messages
            .iter()
            .map(|message| OpenAiMessage {
                role: message.role.as_str().to_string(),
                content: message.content.clone(),
            })
            .collect();
        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": options.max_tokens.unwrap_or(self.max_tokens),
            "temperature": options.temperature(),
            "stream": false,
        })
    }

    fn parse_response(&self, body: OpenAiResponse) -> LlmResponse {
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        LlmResponse {
            content,
            usage: Some(body.usage.map(Into::into).unwrap_or_default()),
            model: body.model.unwrap_or_else(|| self.model.clone()),
            provider: Provider::OpenAi,
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete_chat(
        &self,
        messages: &[ConversationMessage],
        options: &GenerationOptions,
    ) -> Result<LlmResponse> {
        let api_key = self.api_key.as_ref().ok_or_else(|| BloomError::MissingCredential {
            provider: Provider::OpenAi.key().into(),
        })?;

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {api_key}"))
            .json(&self.build_payload(messages, options))
            .send()
            .await
            .map_err(|err| BloomError::LanguageModel(format!("OpenAI request error: {err}")))?;

        let body: OpenAiResponse = serde_json::from_value(read_json(resp, "openai").await?)
            .map_err(|err| BloomError::LanguageModel(format!("OpenAI response parse error: {err}")))?;
        Ok(self.parse_response(body))
    }
}

/// Anthropic either directly (`x-api-key`) or through the back-end proxy,
/// which holds the credential itself.
#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    model: String,
    api_key: Option<String>,
    endpoint: String,
    proxy_url: Option<String>,
    max_tokens: u32,
}

impl AnthropicClient {
    pub const DEFAULT_MODEL: &'static str = "claude-3-5-sonnet-20241022";
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.anthropic.com/v1/messages";
    pub const DEFAULT_MAX_TOKENS: u32 = 8000;

    pub fn from_config(http: reqwest::Client, cfg: &ProviderConfig) -> Self {
        Self {
            http,
            model: cfg.model.clone().unwrap_or_else(|| Self::DEFAULT_MODEL.into()),
            api_key: cfg.api_key.clone(),
            endpoint: cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_ENDPOINT.into()),
            proxy_url: cfg.proxy_url.clone(),
            max_tokens: cfg.max_tokens.unwrap_or(Self::DEFAULT_MAX_TOKENS),
        }
    }

    fn system_prompt(messages: &[ConversationMessage]) -> String {
        messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    /// Non-system turns, starting at the first user turn, with consecutive
    /// same-role turns merged.
    fn to_turns(messages: &[ConversationMessage]) -> Vec<AnthropicMessage> {
        let mut turns: Vec<AnthropicMessage> = Vec::new();
        for message in messages.iter().filter(|m| m.role != Role::System) {
            let role = match message.role {
                Role::Assistant => "assistant",
                _ => "user",
            };
            if turns.is_empty() && role == "assistant" {
                continue;
            }
            match turns.last_mut() {
                Some(last) if last.role == role => {
                    last.content.push_str("\n\n");
                    last.content.push_str(&message.content);
                }
                _ => turns.push(AnthropicMessage {
                    role: role.to_string(),
                    content: message.content.clone(),
                }),
            }
        }
        turns
    }

    fn build_payload(&self, messages: &[ConversationMessage], options: &GenerationOptions) -> Value {
        let max_tokens = options.max_tokens.unwrap_or(self.max_tokens);
        if self.proxy_url.is_some() {
            return json!({
                "provider": "anthropic",
                "model": self.model,
                "system": Self::system_prompt(messages),
                "messages": Self::to_turns(messages),
                "options": {
                    "maxTokens": max_tokens,
                    "temperature": options.temperature(),
                },
            });
        }
        json!({
            "model": self.model,
            "system": Self::system_prompt(messages),
            "messages": Self::to_turns(messages),
            "max_tokens": max_tokens,
            "temperature": options.temperature(),
        })
    }

    fn parse_direct(&self, body: AnthropicResponse) -> LlmResponse {
        let content = body
            .content
            .iter()
            .filter_map(|block| block.text.clone())
            .collect::<Vec<String>>()
            .join("");
        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            })
            .unwrap_or_default();
        LlmResponse {
            content,
            usage: Some(usage),
            model: body.model.unwrap_or_else(|| self.model.clone()),
            provider: Provider::Anthropic,
        }
    }

    fn parse_proxy(&self, body: ProxyResponse) -> LlmResponse {
        LlmResponse {
            content: body.content.unwrap_or_default(),
            usage: Some(body.usage.unwrap_or_default()),
            model: body.model.unwrap_or_else(|| self.model.clone()),
            provider: Provider::Anthropic,
        }
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    fn is_configured(&self) -> bool {
        self.api_key.is_some() || self.proxy_url.is_some()
    }

    async fn complete_chat(
        &self,
        messages: &[ConversationMessage],
        options: &GenerationOptions,
    ) -> Result<LlmResponse> {
        let payload = self.build_payload(messages, options);

        if let Some(proxy) = &self.proxy_url {
            debug!(model = %self.model, "calling Anthropic via proxy");
            let resp = self
                .http
                .post(format!("{}/llm/chat", proxy.trim_end_matches('/')))
                .json(&payload)
                .send()
                .await
                .map_err(|err| BloomError::LanguageModel(format!("LLM proxy request error: {err}")))?;
            let body: ProxyResponse = serde_json::from_value(read_json(resp, "anthropic").await?)
                .map_err(|err| BloomError::LanguageModel(format!("LLM proxy parse error: {err}")))?;
            return Ok(self.parse_proxy(body));
        }

        let api_key = self.api_key.as_ref().ok_or_else(|| BloomError::MissingCredential {
            provider: Provider::Anthropic.key().into(),
        })?;
        let resp = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await
            .map_err(|err| BloomError::LanguageModel(format!("Anthropic request error: {err}")))?;

        let body: AnthropicResponse = serde_json::from_value(read_json(resp, "anthropic").await?)
            .map_err(|err| {
                BloomError::LanguageModel(format!("Anthropic response parse error: {err}"))
            })?;
        Ok(self.parse_direct(body))
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    model: String,
    api_key: Option<String>,
    endpoint: String,
    max_tokens: u32,
}

impl GeminiClient {
    pub const DEFAULT_MODEL: &'static str = "gemini-pro";
    pub const DEFAULT_ENDPOINT: &'static str = "https://generativelanguage.googleapis.com/v1beta";
    pub const DEFAULT_MAX_TOKENS: u32 = 4000;

    pub fn from_config(http: reqwest::Client, cfg: &ProviderConfig) -> Self {
        Self {
            http,
            model: cfg.model.clone().unwrap_or_else(|| Self::DEFAULT_MODEL.into()),
            api_key: cfg.api_key.clone(),
            endpoint: cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_ENDPOINT.into()),
            max_tokens: cfg.max_tokens.unwrap_or(Self::DEFAULT_MAX_TOKENS),
        }
    }

    fn build_payload(&self, messages: &[ConversationMessage], options: &GenerationOptions) -> Value {
        let contents: Vec<GeminiMessage> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|message| GeminiMessage {
                role: match message.role {
                    Role::User => "user",
                    _ => "model",
                }
                .to_string(),
                parts: vec![GeminiPart {
                    text: message.content.clone(),
                }],
            })
            .collect();
        let system: Vec<GeminiPart> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| GeminiPart {
                text: m.content.clone(),
            })
            .collect();

        let mut payload = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": options.max_tokens.unwrap_or(self.max_tokens),
                "temperature": options.temperature(),
            },
        });
        if !system.is_empty() {
            payload["systemInstruction"] = json!({ "parts": system });
        }
        payload
    }

    fn parse_response(&self, body: GeminiResponse) -> LlmResponse {
        let content = body
            .candidates
            .first()
            .and_then(|cand| cand.content.parts.first())
            .map(|part| part.text.clone())
            .unwrap_or_default();
        let usage = body
            .usage_metadata
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            })
            .unwrap_or_default();
        LlmResponse {
            content,
            usage: Some(usage),
            model: self.model.clone(),
            provider: Provider::Google,
        }
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete_chat(
        &self,
        messages: &[ConversationMessage],
        options: &GenerationOptions,
    ) -> Result<LlmResponse> {
        let api_key = self.api_key.as_ref().ok_or_else(|| BloomError::MissingCredential {
            provider: Provider::Google.key().into(),
        })?;
        let resp = self
            .http
            .post(format!(
                "{}/models/{}:generateContent?key={}",
                self.endpoint,
                self.model,
                urlencoding::encode(api_key)
            ))
            .json(&self.build_payload(messages, options))
            .send()
            .await
            .map_err(|err| BloomError::LanguageModel(format!("Gemini request error: {err}")))?;

        let body: GeminiResponse = serde_json::from_value(read_json(resp, "google").await?)
            .map_err(|err| BloomError::LanguageModel(format!("Gemini response parse error: {err}")))?;
        Ok(self.parse_response(body))
    }
}

/// A deterministic model used for tests and demos.
///
/// Each call pops the next scripted reply; `Err` entries surface as
/// language-model failures.
pub struct StubModel {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    received: Mutex<Vec<Vec<ConversationMessage>>>,
    configured: bool,
    delay: Option<Duration>,
}

impl StubModel {
    pub fn new(responses: Vec<std::result::Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            received: Mutex::new(Vec::new()),
            configured: true,
            delay: None,
        }
    }

    pub fn replying(responses: Vec<&str>) -> Self {
        Self::new(responses.into_iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self::new(vec![Err(reason.into())])
    }

    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Message lists passed to each call, in order.
    pub fn received(&self) -> Vec<Vec<ConversationMessage>> {
        self.received
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn complete_chat(
        &self,
        messages: &[ConversationMessage],
        _options: &GenerationOptions,
    ) -> Result<LlmResponse> {
        if let Ok(mut calls) = self.received.lock() {
            calls.push(messages.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| BloomError::LanguageModel("stub model poisoned".into()))?
            .pop_front()
            .ok_or_else(|| {
                BloomError::LanguageModel("StubModel ran out of scripted responses".into())
            })?;

        match next {
            Ok(content) => Ok(LlmResponse {
                content,
                usage: None,
                model: "stub-model".into(),
                provider: Provider::OpenAi,
            }),
            Err(reason) => Err(BloomError::LanguageModel(reason)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    pub key: String,
    pub name: String,
    pub configured: bool,
}

/// Routes completions to the currently selected provider.
///
/// Switching providers only affects calls that start afterwards.
pub struct LlmGateway {
    clients: HashMap<Provider, Arc<dyn LanguageModel>>,
    active: RwLock<Provider>,
    timeout: Duration,
    telemetry: Option<TelemetryCollector>,
}

impl LlmGateway {
    pub fn new(default_provider: Provider, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            active: RwLock::new(default_provider),
            timeout,
            telemetry: None,
        }
    }

    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let http = build_http_client()?;
        Ok(Self::new(cfg.default_provider, cfg.timeout())
            .with_client(
                Provider::OpenAi,
                Arc::new(OpenAIClient::from_config(http.clone(), &cfg.openai)),
            )
            .with_client(
                Provider::Anthropic,
                Arc::new(AnthropicClient::from_config(http.clone(), &cfg.anthropic)),
            )
            .with_client(
                Provider::Google,
                Arc::new(GeminiClient::from_config(http, &cfg.google)),
            ))
    }

    pub fn with_client(mut self, provider: Provider, client: Arc<dyn LanguageModel>) -> Self {
        self.clients.insert(provider, client);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn current_provider(&self) -> Provider {
        *self.active.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_provider(&self, provider: Provider) {
        *self.active.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = provider;
        info!(provider = %provider, "switched LLM provider");
        if let Some(telemetry) = &self.telemetry {
            telemetry.record("provider_switched", json!({ "provider": provider.key() }));
        }
    }

    pub fn set_provider_by_name(&self, name: &str) -> Result<Provider> {
        let provider = name.parse::<Provider>()?;
        self.set_provider(provider);
        Ok(provider)
    }

    pub fn available_providers(&self) -> Vec<ProviderStatus> {
        Provider::ALL
            .iter()
            .map(|provider| ProviderStatus {
                key: provider.key().to_string(),
                name: provider.display_name().to_string(),
                configured: self
                    .clients
                    .get(provider)
                    .map_or(false, |client| client.is_configured()),
            })
            .collect()
    }

    pub async fn generate_response(
        &self,
        messages: &[ConversationMessage],
        options: &GenerationOptions,
    ) -> Result<LlmResponse> {
        self.generate_response_cancellable(messages, options, &CancellationToken::new())
            .await
    }

    /// Single attempt against the active provider, bounded by the gateway
    /// timeout and abandoned as soon as `cancel` fires.
    pub async fn generate_response_cancellable(
        &self,
        messages: &[ConversationMessage],
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        let provider = self.current_provider();
        let client = self
            .clients
            .get(&provider)
            .filter(|client| client.is_configured())
            .ok_or_else(|| BloomError::MissingCredential {
                provider: provider.key().into(),
            })?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(BloomError::Cancelled),
            result = tokio::time::timeout(self.timeout, client.complete_chat(messages, options)) => {
                result.unwrap_or(Err(BloomError::Timeout(self.timeout)))
            }
        };

        match outcome {
            Ok(mut response) => {
                response.provider = provider;
                Ok(response)
            }
            Err(err) => {
                warn!(provider = %provider, error = %err, "LLM API error");
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_failure(format!("llm:{provider}"), err.to_string(), 0);
                }
                Err(err)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<OpenAiUsage> for TokenUsage {
    fn from(usage: OpenAiUsage) -> Self {
        TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProxyResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiMessage {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiCandidateContent,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> Vec<ConversationMessage> {
        vec![
            ConversationMessage::system("be kind"),
            ConversationMessage::assistant("welcome"),
            ConversationMessage::user("hello"),
            ConversationMessage::user("context: none"),
            ConversationMessage::assistant("hi"),
        ]
    }

    fn provider_config(api_key: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            api_key: api_key.map(str::to_string),
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn parses_provider_names() {
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!("gemini".parse::<Provider>().unwrap(), Provider::Google);
        assert!(matches!(
            "mistral".parse::<Provider>(),
            Err(BloomError::InvalidProvider(_))
        ));
    }

    #[test]
    fn openai_payload_keeps_every_role() {
        let client = OpenAIClient::from_config(reqwest::Client::new(), &provider_config(Some("k")));
        let payload = client.build_payload(&transcript(), &GenerationOptions::new(0.3, 1000));
        assert_eq!(payload["model"], OpenAIClient::DEFAULT_MODEL);
        assert_eq!(payload["messages"].as_array().unwrap().len(), 5);
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["max_tokens"], 1000);
        assert!((payload["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn default_options_use_provider_caps() {
        let client = OpenAIClient::from_config(reqwest::Client::new(), &provider_config(Some("k")));
        let payload = client.build_payload(&transcript(), &GenerationOptions::default());
        assert_eq!(payload["max_tokens"], OpenAIClient::DEFAULT_MAX_TOKENS);
        assert!((payload["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn anthropic_turns_start_with_user_and_merge() {
        let turns = AnthropicClient::to_turns(&transcript());
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[0].content, "hello\n\ncontext: none");
        assert_eq!(turns[1].role, "assistant");
    }

    #[test]
    fn anthropic_proxy_payload_shape() {
        let cfg = ProviderConfig {
            proxy_url: Some("http://localhost:5000/api".into()),
            ..ProviderConfig::default()
        };
        let client = AnthropicClient::from_config(reqwest::Client::new(), &cfg);
        assert!(client.is_configured());
        let payload = client.build_payload(&transcript(), &GenerationOptions::default());
        assert_eq!(payload["provider"], "anthropic");
        assert_eq!(payload["system"], "be kind");
        assert_eq!(payload["options"]["maxTokens"], AnthropicClient::DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn gemini_payload_moves_system_to_instruction() {
        let client = GeminiClient::from_config(reqwest::Client::new(), &provider_config(Some("k")));
        let payload = client.build_payload(&transcript(), &GenerationOptions::new(0.1, 50));
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[0]["role"], "model");
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "be kind");
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], 50);
    }

    #[test]
    fn error_bodies_are_coalesced() {
        let err = coalesce_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"bad model"}}"#,
            "openai",
        );
        assert_eq!(err.to_string(), "language model error: openai request failed: bad model");

        let err = coalesce_error(reqwest::StatusCode::BAD_GATEWAY, "<html>", "google");
        assert!(err.to_string().contains("HTTP 502"));
    }

    #[tokio::test]
    async fn gateway_requires_credentials_for_active_provider() {
        let gateway = LlmGateway::new(Provider::Anthropic, Duration::from_secs(1)).with_client(
            Provider::Anthropic,
            Arc::new(StubModel::replying(vec!["hi"]).unconfigured()),
        );
        let err = gateway
            .generate_response(&transcript(), &GenerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "API key not configured for anthropic");
    }

    #[tokio::test]
    async fn provider_switch_affects_subsequent_calls() {
        let gateway = LlmGateway::new(Provider::OpenAi, Duration::from_secs(1))
            .with_client(Provider::OpenAi, Arc::new(StubModel::replying(vec!["from openai"])))
            .with_client(Provider::Google, Arc::new(StubModel::replying(vec!["from google"])));

        let first = gateway
            .generate_response(&transcript(), &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(first.provider, Provider::OpenAi);

        gateway.set_provider_by_name("google").unwrap();
        let second = gateway
            .generate_response(&transcript(), &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(second.content, "from google");
        assert_eq!(second.provider, Provider::Google);
    }

    #[test]
    fn reports_configured_providers() {
        let gateway = LlmGateway::new(Provider::OpenAi, Duration::from_secs(1))
            .with_client(Provider::OpenAi, Arc::new(StubModel::replying(vec![])))
            .with_client(
                Provider::Google,
                Arc::new(StubModel::replying(vec![]).unconfigured()),
            );
        let statuses = gateway.available_providers();
        assert_eq!(statuses.len(), 3);
        assert!(statuses[0].configured);
        assert!(!statuses[1].configured);
        assert!(!statuses[2].configured);
        assert_eq!(statuses[1].name, "Anthropic Claude");
    }

    #[tokio::test]
    async fn gateway_enforces_timeout() {
        let gateway = LlmGateway::new(Provider::OpenAi, Duration::from_millis(20)).with_client(
            Provider::OpenAi,
            Arc::new(StubModel::replying(vec!["late"]).with_delay(Duration::from_millis(500))),
        );
        let err = gateway
            .generate_response(&transcript(), &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BloomError::Timeout(_)));
    }

    #[tokio::test]
    async fn gateway_honors_cancellation() {
        let gateway = LlmGateway::new(Provider::OpenAi, Duration::from_secs(5)).with_client(
            Provider::OpenAi,
            Arc::new(StubModel::replying(vec!["late"]).with_delay(Duration::from_secs(2))),
        );
        let token = CancellationToken::new();
        token.cancel();
        let err = gateway
            .generate_response_cancellable(&transcript(), &GenerationOptions::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, BloomError::Cancelled));
    }
}
