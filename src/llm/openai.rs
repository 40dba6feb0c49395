//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；请求带 temperature / max_tokens，累计 token 用量。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{Generation, GenerationRequest, LlmClient, LlmError, Message, Role, TokenUsage};

/// Token 使用统计（累计值，可跨任务共享）
#[derive(Debug, Clone, Default)]
pub struct UsageCounter {
    prompt_tokens: Arc<AtomicU64>,
    completion_tokens: Arc<AtomicU64>,
}

impl UsageCounter {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> TokenUsage {
        TokenUsage::new(
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    usage: UsageCounter,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let base_url = base_url
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: UsageCounter::default(),
            timeout: Duration::from_secs(300),
        }
    }

    /// 单次请求超时，超时按可重试的 Request 错误返回
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn to_openai_message(message: &Message) -> Result<ChatCompletionRequestMessage, LlmError> {
        let content = message.content.clone();
        let built = match message.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()
                .map(ChatCompletionRequestMessage::System),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()
                .map(ChatCompletionRequestMessage::User),
            Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                .content(content)
                .build()
                .map(ChatCompletionRequestMessage::Assistant),
        };
        built.map_err(|e| LlmError::InvalidRequest(e.to_string()))
    }
}

fn map_openai_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::InvalidArgument(msg) => LlmError::InvalidRequest(msg),
        other => {
            let msg = other.to_string();
            if msg.contains("rate limit") || msg.contains("429") {
                LlmError::RateLimited {
                    retry_after_ms: 1000,
                }
            } else {
                LlmError::Request(msg)
            }
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, LlmError> {
        let messages = request
            .to_messages()
            .iter()
            .map(Self::to_openai_message)
            .collect::<Result<Vec<_>, _>>()?;

        let api_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(request.temperature)
            .max_completion_tokens(request.max_tokens)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        tracing::debug!(
            model = %self.model,
            temperature = request.temperature,
            max_tokens = request.max_tokens,
            prompt_chars = request.prompt.chars().count(),
            "Sending chat completion request"
        );

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(api_request))
            .await
            .map_err(|_| LlmError::Request(format!("timed out after {}s", self.timeout.as_secs())))?
            .map_err(map_openai_error)?;

        let usage = match &response.usage {
            Some(usage) => {
                let usage = TokenUsage::new(
                    usage.prompt_tokens as u64,
                    usage.completion_tokens as u64,
                );
                self.usage.add(usage.prompt_tokens, usage.completion_tokens);
                usage
            }
            None => TokenUsage::default(),
        };

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or(LlmError::EmptyResponse)?;

        Ok(Generation {
            content,
            model: response.model,
            usage,
        })
    }

    fn token_usage(&self) -> TokenUsage {
        self.usage.get()
    }
}
