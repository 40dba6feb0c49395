//! 流水线与智能体错误类型
//!
//! AgentError 只在智能体内部流转，出边界前由 AgentCore::finish 转成 AgentResult::failure；
//! PipelineError 描述编排器终止流水线的原因，其 Display 即失败结果的 message。

use thiserror::Error;

use crate::core::PipelineStage;
use crate::llm::LlmError;

/// 智能体内部错误（网络、输入、处理）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Generation failed: {0}")]
    Generation(#[from] LlmError),

    #[error("Processing failed: {0}")]
    Processing(String),
}

/// 流水线致命错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// 请求不完整或越界，任何智能体运行之前即拒绝
    #[error("Validation error: {0}")]
    Validation(String),

    /// 必需阶段返回失败
    #[error("Stage '{stage}' failed: {message}")]
    StageFailure {
        stage: PipelineStage,
        message: String,
    },
}

impl PipelineError {
    pub fn stage_failure(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self::StageFailure {
            stage,
            message: message.into(),
        }
    }

    /// 失败发生的阶段；校验错误归为 Validated 之前
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            PipelineError::Validation(_) => None,
            PipelineError::StageFailure { stage, .. } => Some(*stage),
        }
    }
}
