//! 生成服务：智能体面向的窄接口
//!
//! generate(prompt, system_message, temperature, max_tokens) -> GenerationOutcome { success, content | error }；
//! 内部统一走 RetryingLlmClient，重试耗尽才向调用方报告失败。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::{Generation, GenerationRequest, LlmClient, LlmError, RetryConfig, RetryingLlmClient, TokenUsage};

/// 对外的生成结果（成功带 content，失败带 error）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub success: bool,
    pub content: Option<String>,
    pub error: Option<String>,
}

impl From<Result<Generation, LlmError>> for GenerationOutcome {
    fn from(result: Result<Generation, LlmError>) -> Self {
        match result {
            Ok(generation) => Self {
                success: true,
                content: Some(generation.content),
                error: None,
            },
            Err(err) => Self {
                success: false,
                content: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// 生成服务：所有智能体共享同一实例（Clone 仅复制 Arc）
#[derive(Clone)]
pub struct GenerationService {
    client: Arc<dyn LlmClient>,
}

impl GenerationService {
    /// 以重试策略包装任意客户端
    pub fn new(client: Arc<dyn LlmClient>, retry: RetryConfig) -> Self {
        Self {
            client: Arc::new(RetryingLlmClient::new(client, retry)),
        }
    }

    /// 直接使用客户端，不再包装重试（客户端自身已带重试或测试场景）
    pub fn without_retry(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        system_message: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> GenerationOutcome {
        let request = GenerationRequest::new(prompt)
            .with_system(system_message)
            .with_temperature(temperature)
            .with_max_tokens(max_tokens);
        self.client.generate(&request).await.into()
    }

    /// 返回 Result 的版本，供智能体内部用 `?` 传播
    pub async fn complete(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let generation = self.client.generate(request).await?;
        if generation.content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(generation.content)
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.client.token_usage()
    }
}
