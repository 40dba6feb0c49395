//! 状态定义：流水线阶段与智能体状态记录
//!
//! 编排器持有 PipelineStage；每个智能体持有一条 StatusRecord，每次迁移都打时间戳，供监控与测试读取。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 流水线阶段：Validated → Preprocessing → Planning → ContentGeneration → QualityLoop → Formatting → Completed，
/// 任一阶段不可恢复失败进入 Errored
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Validated,
    Preprocessing,
    Planning,
    ContentGeneration,
    QualityLoop,
    Formatting,
    Completed,
    Errored,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Validated => "validated",
            PipelineStage::Preprocessing => "preprocessing",
            PipelineStage::Planning => "planning",
            PipelineStage::ContentGeneration => "content_generation",
            PipelineStage::QualityLoop => "quality_loop",
            PipelineStage::Formatting => "formatting",
            PipelineStage::Completed => "completed",
            PipelineStage::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Completed | PipelineStage::Errored)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 智能体状态：initialized → working(子状态) → completed | error
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum AgentStatus {
    Initialized,
    Working(String),
    Completed,
    Error(String),
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Initialized => f.write_str("initialized"),
            AgentStatus::Working(step) => write!(f, "working: {}", step),
            AgentStatus::Completed => f.write_str("completed"),
            AgentStatus::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// 状态快照
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusRecord {
    pub agent: String,
    pub status: AgentStatus,
    pub updated_at: DateTime<Utc>,
    /// 自创建以来的迁移次数
    pub transitions: u32,
}

impl StatusRecord {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            status: AgentStatus::Initialized,
            updated_at: Utc::now(),
            transitions: 0,
        }
    }

    pub fn transition(&mut self, status: AgentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        self.transitions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_updates_timestamp_and_count() {
        let mut record = StatusRecord::new("content");
        let before = record.updated_at;
        record.transition(AgentStatus::Working("generating chapter 81".into()));
        record.transition(AgentStatus::Completed);
        assert_eq!(record.transitions, 2);
        assert_eq!(record.status, AgentStatus::Completed);
        assert!(record.updated_at >= before);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(PipelineStage::QualityLoop.to_string(), "quality_loop");
        assert!(PipelineStage::Errored.is_terminal());
        assert!(!PipelineStage::Formatting.is_terminal());
    }
}
