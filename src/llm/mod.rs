//! 生成服务层：客户端抽象、重试包装与实现（OpenAI 兼容 / Mock）

pub mod message;
pub mod mock;
pub mod openai;
pub mod service;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use service::{GenerationOutcome, GenerationService};
pub use traits::{
    Generation, GenerationRequest, LlmClient, LlmError, RetryConfig, RetryingLlmClient, TokenUsage,
};

use crate::config::AppConfig;

/// 根据配置与环境变量选择后端：provider 为 mock 或缺少 OPENAI_API_KEY 时使用 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_key = std::env::var("OPENAI_API_KEY").is_ok();

    if provider != "mock" && has_key {
        let base = cfg.llm.base_url.as_deref();
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        Arc::new(
            OpenAiClient::new(base, &cfg.llm.model, None)
                .with_timeout(Duration::from_secs(cfg.llm.timeouts.request)),
        )
    } else {
        if provider != "mock" {
            tracing::warn!("OPENAI_API_KEY not set, using Mock LLM");
        }
        Arc::new(MockLlmClient::new())
    }
}
