//! 智能体：统一契约与各阶段实现
//!
//! 每个智能体实现 [`Agent::process`]，输入输出按阶段强类型；内部任何失败（含生成服务重试耗尽）
//! 都在边界处转成 `AgentResult { success: false }`，不会向编排器抛出。
//! [`AgentCore`] 提供名字、状态迁移、可选的通信通道与反馈历史。

pub mod chapter_plan;
pub mod content;
pub mod knowledge;
pub mod presentation;
pub mod quality;
pub mod strategy;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::core::{
    AgentError, AgentMessage, AgentResult, AgentStatus, CommunicationChannel, MessageType,
    PipelineRequest, StatusRecord,
};

pub use chapter_plan::{ChapterBlueprint, ChapterPlan, ChapterPlanAgent, ChapterPlanInput};
pub use content::{ChapterText, ContentAgent, ContentInput, ContentPayload, ImprovementContext};
pub use knowledge::{CharacterProfile, KnowledgeAgent, KnowledgeBase, TextStatistics};
pub use presentation::{Presentation, PresentationAgent, PresentationInput};
pub use quality::{Dimension, QualityAgent, QualityLevel, QualityReport, QualityWeights};
pub use strategy::{Strategy, StrategyAgent};

/// 智能体契约
#[async_trait]
pub trait Agent: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn core(&self) -> &AgentCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn status(&self) -> StatusRecord {
        self.core().status()
    }

    /// 处理一次输入；失败以 success=false 返回
    async fn process(&self, input: Self::Input) -> AgentResult<Self::Output>;
}

pub type KnowledgeStage = Arc<dyn Agent<Input = PipelineRequest, Output = KnowledgeBase>>;
pub type StrategyStage = Arc<dyn Agent<Input = PipelineRequest, Output = Strategy>>;
pub type ChapterPlanStage = Arc<dyn Agent<Input = ChapterPlanInput, Output = ChapterPlan>>;
pub type ContentStage = Arc<dyn Agent<Input = ContentInput, Output = ContentPayload>>;
pub type QualityStage = Arc<dyn Agent<Input = ContentPayload, Output = QualityReport>>;
pub type PresentationStage = Arc<dyn Agent<Input = PresentationInput, Output = Presentation>>;

/// 反馈历史保留的最近条数
const FEEDBACK_HISTORY_LIMIT: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 智能体公共部分：名字、状态记录、通道、已读反馈
pub struct AgentCore {
    name: String,
    status: Mutex<StatusRecord>,
    channel: Option<Arc<CommunicationChannel>>,
    feedback: Mutex<VecDeque<AgentMessage>>,
}

impl AgentCore {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            status: Mutex::new(StatusRecord::new(name.clone())),
            name,
            channel: None,
            feedback: Mutex::new(VecDeque::new()),
        }
    }

    /// 接入通信通道并注册邮箱
    pub fn with_channel(mut self, channel: Arc<CommunicationChannel>) -> Self {
        channel.register(&self.name);
        self.channel = Some(channel);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> Option<&Arc<CommunicationChannel>> {
        self.channel.as_ref()
    }

    pub fn status(&self) -> StatusRecord {
        lock(&self.status).clone()
    }

    /// 记录状态迁移；接入通道时顺带广播一条状态更新，广播结果不影响调用方
    pub fn update_status(&self, status: AgentStatus) {
        tracing::debug!(agent = %self.name, status = %status, "Agent status");
        let text = status.to_string();
        lock(&self.status).transition(status);
        if let Some(channel) = &self.channel {
            channel.broadcast_status(&self.name, text);
        }
    }

    pub fn working(&self, step: impl Into<String>) {
        self.update_status(AgentStatus::Working(step.into()));
    }

    /// 取走邮箱中的新消息；其中的反馈与改写请求追加到有界的反馈历史
    pub fn drain_feedback(&self) -> Vec<AgentMessage> {
        let Some(channel) = &self.channel else {
            return Vec::new();
        };
        let messages = channel.poll(&self.name);
        let mut history = lock(&self.feedback);
        for message in messages.iter().filter(|m| {
            matches!(
                m.message_type(),
                MessageType::Feedback | MessageType::RevisionRequest
            )
        }) {
            if history.len() >= FEEDBACK_HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(message.clone());
        }
        messages
    }

    pub fn feedback_history(&self) -> Vec<AgentMessage> {
        lock(&self.feedback).iter().cloned().collect()
    }

    /// 将内部结果转成 AgentResult 并落定状态
    pub fn finish<T>(
        &self,
        result: Result<T, AgentError>,
        message: impl FnOnce(&T) -> String,
    ) -> AgentResult<T> {
        match result {
            Ok(data) => {
                let msg = message(&data);
                self.update_status(AgentStatus::Completed);
                AgentResult::ok(data, msg)
            }
            Err(e) => {
                tracing::warn!(agent = %self.name, error = %e, "Agent failed");
                self.update_status(AgentStatus::Error(e.to_string()));
                AgentResult::failure(format!("{}: {}", self.name, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MessagePayload;

    #[test]
    fn test_finish_records_status() {
        let core = AgentCore::new("strategy");
        let ok = core.finish(Ok(1), |n| format!("got {}", n));
        assert!(ok.success);
        assert_eq!(ok.message, "got 1");
        assert_eq!(core.status().status, AgentStatus::Completed);

        let err: AgentResult<i32> =
            core.finish(Err(AgentError::InvalidInput("empty".into())), |_| String::new());
        assert!(!err.success);
        assert!(err.message.starts_with("strategy:"));
        assert!(matches!(core.status().status, AgentStatus::Error(_)));
        assert_eq!(core.status().transitions, 2);
    }

    #[test]
    fn test_status_broadcast_reaches_other_agents() {
        let channel = Arc::new(CommunicationChannel::new());
        let a = AgentCore::new("a").with_channel(channel.clone());
        let _b = AgentCore::new("b").with_channel(channel.clone());
        let _c = AgentCore::new("c").with_channel(channel.clone());
        channel.subscribe_status("b");
        a.working("planning");
        let polled = channel.poll("b");
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].message_type(), MessageType::StatusUpdate);
        assert!(channel.poll("a").is_empty());
        assert_eq!(channel.pending("c"), 0);
    }

    #[test]
    fn test_drain_feedback_appends_history() {
        let channel = Arc::new(CommunicationChannel::new());
        let core = AgentCore::new("content").with_channel(channel.clone());
        channel.send_feedback(
            "quality",
            "content",
            MessagePayload::Feedback {
                issues: vec!["style".into()],
                suggestions: vec![],
                target_score: 7.0,
            },
        );
        assert_eq!(core.drain_feedback().len(), 1);
        assert!(core.drain_feedback().is_empty());
        assert_eq!(core.feedback_history().len(), 1);
    }

    #[test]
    fn test_feedback_history_keeps_recent_feedback_only() {
        let channel = Arc::new(CommunicationChannel::new());
        let core = AgentCore::new("content").with_channel(channel.clone());
        channel.subscribe_status("content");
        let other = AgentCore::new("quality").with_channel(channel.clone());

        for round in 0..FEEDBACK_HISTORY_LIMIT + 10 {
            other.working(format!("round {}", round));
            channel.request_revision("quality", "content", format!("round {}", round), vec![]);
            core.drain_feedback();
        }

        let history = core.feedback_history();
        assert_eq!(history.len(), FEEDBACK_HISTORY_LIMIT);
        assert!(history
            .iter()
            .all(|m| m.message_type() == MessageType::RevisionRequest));
        match &history[FEEDBACK_HISTORY_LIMIT - 1].payload {
            MessagePayload::RevisionRequest { reason, .. } => {
                assert_eq!(reason, &format!("round {}", FEEDBACK_HISTORY_LIMIT + 9))
            }
            payload => panic!("unexpected payload {:?}", payload),
        }
    }

    #[test]
    fn test_unwired_core_has_no_feedback() {
        let core = AgentCore::new("solo");
        core.working("x");
        assert!(core.drain_feedback().is_empty());
    }
}
