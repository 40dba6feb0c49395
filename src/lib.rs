//! Quill - Rust 多智能体续写系统
//!
//! 模块划分：
//! - **agents**: 智能体契约与六个阶段实现（知识库、策略、章节规划、内容、质量、展示）
//! - **config**: 应用配置加载（TOML + 环境变量）与校验
//! - **core**: 请求与结果信封、阶段状态、通信通道、改进循环、编排器
//! - **llm**: 生成服务（客户端抽象、重试、OpenAI 兼容 / Mock）
//! - **observability**: 日志初始化
//! - **output**: 结果落盘
//! - **prompts**: 各角色提示词模板

pub mod agents;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod output;
pub mod prompts;

pub use crate::core::{AgentResult, Orchestrator, PipelineOutput, PipelineRequest};
