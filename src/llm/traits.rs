//! 生成服务客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::generate；RetryingLlmClient 在任意客户端外包一层
//! 有界重试 + 指数退避，重试耗尽后返回 LlmError::RetriesExhausted，不向上泄露原始传输错误。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::Message;

/// 单次生成请求
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_message: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_message: String::new(),
            temperature: 0.8,
            max_tokens: 8000,
        }
    }

    pub fn with_system(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = system_message.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// 转为消息列表：有 system_message 时在前
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if !self.system_message.is_empty() {
            messages.push(Message::system(self.system_message.clone()));
        }
        messages.push(Message::user(self.prompt.clone()));
        messages
    }
}

/// Token 使用统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// 一次成功生成的结果
#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// 生成服务错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Empty response from model")]
    EmptyResponse,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<LlmError> },
}

impl LlmError {
    /// 瞬时错误可重试；请求本身非法或已耗尽重试则不再重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Request(_) | LlmError::RateLimited { .. } | LlmError::EmptyResponse
        )
    }
}

/// 生成服务客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 单次生成（不含重试）
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, LlmError>;

    /// 累计 token 使用统计，默认全 0，具体实现可覆盖
    fn token_usage(&self) -> TokenUsage {
        TokenUsage::default()
    }
}

/// 重试策略：最多 max_attempts 次，第 n 次失败后等待 initial_backoff * 2^(n-1)，不超过 max_backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// 第 `attempt` 次（从 1 开始）失败后的等待时长
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.initial_backoff.saturating_mul(1u32 << exp);
        delay.min(self.max_backoff)
    }
}

/// 带重试的客户端包装
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, LlmError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.inner.generate(request).await {
                Ok(generation) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Generation succeeded after retry");
                    }
                    return Ok(generation);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                tracing::warn!(attempt, error = %err, "Generation failed, not retryable");
                return Err(err);
            }

            tracing::warn!(attempt, max_attempts, error = %err, "Generation failed");
            if attempt >= max_attempts {
                return Err(LlmError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let mut delay = self.config.backoff_for(attempt);
            if let LlmError::RateLimited { retry_after_ms } = err {
                delay = delay.max(Duration::from_millis(retry_after_ms));
            }
            tokio::time::sleep(delay).await;
        }
    }

    fn token_usage(&self) -> TokenUsage {
        self.inner.token_usage()
    }
}
