//! 编排器：驱动整条续写流水线
//!
//! 校验 → 知识库与策略并发预处理 → 章节规划 → 内容生成 → 迭代改进 → 排版。
//! `run` 从不返回错误：致命失败以 success=false 的 AgentResult 带回已完成阶段的产物，
//! 排版失败则降级为原始内容与质量数据。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::agents::{
    ChapterPlan, ChapterPlanAgent, ChapterPlanInput, ChapterPlanStage, ContentAgent, ContentInput,
    ContentPayload, ContentStage, KnowledgeAgent, KnowledgeBase, KnowledgeStage, Presentation,
    PresentationAgent, PresentationInput, PresentationStage, QualityAgent, QualityReport,
    QualityStage, Strategy, StrategyAgent, StrategyStage,
};
use crate::config::{AppConfig, ConfigError};
use crate::core::refinement::{RefinementContext, RefinementLoop};
use crate::core::{
    AgentResult, CommunicationChannel, MessageType, PipelineError, PipelineRequest, PipelineStage,
    StatusRecord, ORCHESTRATOR,
};
use crate::llm::{GenerationService, LlmClient};

/// 流水线用到的六个智能体
#[derive(Clone)]
pub struct AgentSet {
    pub knowledge: KnowledgeStage,
    pub strategy: StrategyStage,
    pub chapter_plan: ChapterPlanStage,
    pub content: ContentStage,
    pub quality: QualityStage,
    pub presentation: PresentationStage,
}

impl AgentSet {
    /// 按配置构建标准智能体，全部接入同一通道
    pub fn standard(
        service: GenerationService,
        cfg: &AppConfig,
        channel: &Arc<CommunicationChannel>,
    ) -> Result<Self, ConfigError> {
        let weights = cfg.quality.weights()?;
        let words = cfg.generation.words_per_chapter;
        Ok(Self {
            knowledge: Arc::new(
                KnowledgeAgent::new(service.clone())
                    .with_source_file(cfg.generation.source_file.clone())
                    .with_channel(channel.clone()),
            ),
            strategy: Arc::new(
                StrategyAgent::new(service.clone())
                    .with_words_per_chapter(words)
                    .with_channel(channel.clone()),
            ),
            chapter_plan: Arc::new(ChapterPlanAgent::new(service.clone()).with_channel(channel.clone())),
            content: Arc::new(
                ContentAgent::new(service.clone())
                    .with_words_per_chapter(words)
                    .with_sampling(cfg.generation.temperature, cfg.generation.max_tokens)
                    .with_channel(channel.clone()),
            ),
            quality: Arc::new(
                QualityAgent::new(service)
                    .with_weights(weights)
                    .with_suggestion_threshold(cfg.quality.suggestion_threshold)
                    .with_channel(channel.clone()),
            ),
            presentation: Arc::new(PresentationAgent::new().with_channel(channel.clone())),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineOptions {
    /// 改进循环中内容生成次数的上限（含初次生成）
    pub max_iterations: u32,
    /// 为 false 时章节规划失败只记录告警，内容按策略大纲生成
    pub require_chapter_plan: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            require_chapter_plan: true,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_iterations: cfg.quality.max_iterations,
            require_chapter_plan: cfg.pipeline.require_chapter_plan,
        }
    }
}

/// 排版结果；排版失败时退回原始数据
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresentationView {
    Formatted(Presentation),
    Raw {
        content: Option<ContentPayload>,
        quality: Option<QualityReport>,
    },
}

/// 流水线聚合产物；未运行或非致命失败的阶段为 None
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub knowledge_base: Option<KnowledgeBase>,
    pub strategy: Option<Strategy>,
    pub chapter_plan: Option<ChapterPlan>,
    pub content: Option<ContentPayload>,
    pub quality: Option<QualityReport>,
    pub presentation: Option<PresentationView>,
}

/// 各阶段耗时
struct StageTimer {
    started: HashMap<PipelineStage, Instant>,
    durations: BTreeMap<String, Duration>,
}

impl StageTimer {
    fn new() -> Self {
        Self {
            started: HashMap::new(),
            durations: BTreeMap::new(),
        }
    }

    fn start(&mut self, stage: PipelineStage) {
        self.started.insert(stage, Instant::now());
    }

    fn end(&mut self, stage: PipelineStage) -> Option<Duration> {
        let elapsed = self.started.remove(&stage)?.elapsed();
        self.durations.insert(stage.as_str().to_string(), elapsed);
        Some(elapsed)
    }

    fn millis(&self) -> BTreeMap<String, u64> {
        self.durations
            .iter()
            .map(|(k, d)| (k.clone(), d.as_millis() as u64))
            .collect()
    }
}

/// 取出阶段数据；失败或缺数据时记下原因
fn take_data<T>(name: &str, result: AgentResult<T>, errors: &mut Vec<String>) -> Option<T> {
    if !result.success {
        errors.push(result.message);
        return None;
    }
    let message = result.message;
    let data = result.data;
    if data.is_none() {
        errors.push(format!("{}: returned no data ({})", name, message));
    }
    data
}

pub struct Orchestrator {
    agents: AgentSet,
    channel: Arc<CommunicationChannel>,
    options: PipelineOptions,
    stage: Mutex<PipelineStage>,
}

impl Orchestrator {
    pub fn new(agents: AgentSet, channel: Arc<CommunicationChannel>, options: PipelineOptions) -> Self {
        channel.register(ORCHESTRATOR);
        Self {
            agents,
            channel,
            options,
            stage: Mutex::new(PipelineStage::Idle),
        }
    }

    /// 校验配置后按配置装配整套智能体
    pub fn from_config(cfg: &AppConfig, client: Arc<dyn LlmClient>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let channel = Arc::new(CommunicationChannel::with_capacity(cfg.pipeline.channel_capacity));
        let service = GenerationService::new(client, cfg.llm.retry.to_retry_config());
        let agents = AgentSet::standard(service, cfg, &channel)?;
        Ok(Self::new(agents, channel, PipelineOptions::from_config(cfg)))
    }

    pub fn stage(&self) -> PipelineStage {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_stage(&self, stage: PipelineStage) {
        tracing::debug!(stage = %stage, "Pipeline stage");
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner) = stage;
    }

    pub fn channel(&self) -> &Arc<CommunicationChannel> {
        &self.channel
    }

    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    /// 各智能体当前状态
    pub fn agents_status(&self) -> Vec<StatusRecord> {
        vec![
            self.agents.knowledge.status(),
            self.agents.strategy.status(),
            self.agents.chapter_plan.status(),
            self.agents.content.status(),
            self.agents.quality.status(),
            self.agents.presentation.status(),
        ]
    }

    fn fail(
        &self,
        output: PipelineOutput,
        error: PipelineError,
        timer: &StageTimer,
    ) -> AgentResult<PipelineOutput> {
        tracing::error!(error = %error, "Pipeline failed");
        self.set_stage(PipelineStage::Errored);
        let failed_stage = error.stage().map_or("validation", |s| s.as_str());
        AgentResult::failure_with(output, error.to_string())
            .with_metadata("failed_stage", failed_stage)
            .with_metadata("stage_timings_ms", timer.millis())
    }

    /// 运行一次完整流水线
    pub async fn run(&self, request: PipelineRequest) -> AgentResult<PipelineOutput> {
        let mut timer = StageTimer::new();
        let mut output = PipelineOutput::default();

        if let Err(e) = request.validate() {
            return self.fail(output, e, &timer);
        }
        self.set_stage(PipelineStage::Validated);
        tracing::info!(
            chapters = request.chapter_count,
            threshold = request.quality_threshold,
            start = request.start_chapter_index,
            "Pipeline started"
        );

        // 预处理：知识库与策略互不依赖，各拿一份请求副本并发执行
        self.set_stage(PipelineStage::Preprocessing);
        timer.start(PipelineStage::Preprocessing);
        let (knowledge_result, strategy_result) = tokio::join!(
            self.agents.knowledge.process(request.clone()),
            self.agents.strategy.process(request.clone()),
        );
        timer.end(PipelineStage::Preprocessing);

        let mut errors = Vec::new();
        let knowledge = take_data("knowledge", knowledge_result, &mut errors);
        let strategy = take_data("strategy", strategy_result, &mut errors);
        output.knowledge_base = knowledge.clone();
        output.strategy = strategy.clone();
        let (Some(knowledge), Some(strategy)) = (knowledge, strategy) else {
            let error = PipelineError::stage_failure(PipelineStage::Preprocessing, errors.join("; "));
            return self.fail(output, error, &timer);
        };

        self.set_stage(PipelineStage::Planning);
        timer.start(PipelineStage::Planning);
        let plan_result = self
            .agents
            .chapter_plan
            .process(ChapterPlanInput {
                request: request.clone(),
                strategy: strategy.clone(),
                knowledge_base: knowledge.clone(),
            })
            .await;
        timer.end(PipelineStage::Planning);

        let mut errors = Vec::new();
        let chapter_plan = take_data("chapter_plan", plan_result, &mut errors);
        if chapter_plan.is_none() {
            let message = errors.join("; ");
            if self.options.require_chapter_plan {
                let error = PipelineError::stage_failure(PipelineStage::Planning, message);
                return self.fail(output, error, &timer);
            }
            tracing::warn!(error = %message, "Chapter planning failed, generating from strategy outline");
        }
        output.chapter_plan = chapter_plan.clone();

        self.set_stage(PipelineStage::ContentGeneration);
        timer.start(PipelineStage::ContentGeneration);
        let content_result = self
            .agents
            .content
            .process(ContentInput::Fresh {
                request: request.clone(),
                knowledge_base: knowledge.clone(),
                strategy: strategy.clone(),
                chapter_plan,
            })
            .await;
        timer.end(PipelineStage::ContentGeneration);

        let mut errors = Vec::new();
        let Some(initial) = take_data("content", content_result, &mut errors) else {
            let error = PipelineError::stage_failure(PipelineStage::ContentGeneration, errors.join("; "));
            return self.fail(output, error, &timer);
        };

        self.set_stage(PipelineStage::QualityLoop);
        timer.start(PipelineStage::QualityLoop);
        let refinement = RefinementLoop::new(
            &self.agents.content,
            &self.agents.quality,
            &self.channel,
            self.options.max_iterations,
            request.quality_threshold,
        );
        let outcome = refinement
            .run(
                initial,
                &RefinementContext {
                    desired_ending: request.desired_ending.clone(),
                    knowledge_base: knowledge,
                    strategy,
                },
            )
            .await;
        timer.end(PipelineStage::QualityLoop);

        let quality_alerts = self
            .channel
            .poll(ORCHESTRATOR)
            .iter()
            .filter(|m| m.message_type() == MessageType::QualityAlert)
            .count();
        let threshold_met = outcome.threshold_met(request.quality_threshold);
        output.content = Some(outcome.content.clone());
        output.quality = outcome.quality.clone();

        self.set_stage(PipelineStage::Formatting);
        timer.start(PipelineStage::Formatting);
        let presentation_result = self
            .agents
            .presentation
            .process(PresentationInput {
                content: outcome.content.clone(),
                quality: outcome.quality.clone(),
                request: request.clone(),
            })
            .await;
        timer.end(PipelineStage::Formatting);

        let formatting_degraded = !presentation_result.success || presentation_result.data.is_none();
        output.presentation = Some(match presentation_result.into_data() {
            Some(presentation) => PresentationView::Formatted(presentation),
            None => {
                tracing::warn!("Formatting failed, returning raw content and quality");
                PresentationView::Raw {
                    content: output.content.clone(),
                    quality: output.quality.clone(),
                }
            }
        });

        self.set_stage(PipelineStage::Completed);
        let message = match &outcome.quality {
            Some(q) if threshold_met => format!("续写完成，综合 {:.1} 分（{}）", q.overall_score, q.quality_level.label()),
            Some(q) => format!(
                "续写完成，但质量未达阈值（{:.1} < {:.1}）",
                q.overall_score, request.quality_threshold
            ),
            None => "续写完成，质量评估不可用".to_string(),
        };
        tracing::info!(
            exit = outcome.exit.as_str(),
            threshold_met,
            formatting_degraded,
            "Pipeline completed"
        );

        AgentResult::ok(output, message)
            .with_metadata("threshold_met", threshold_met)
            .with_metadata("iterations", outcome.iterations)
            .with_metadata("content_generations", outcome.content_generations)
            .with_metadata("quality_assessments", outcome.quality_assessments)
            .with_metadata("score_history", &outcome.score_history)
            .with_metadata("formatting_degraded", formatting_degraded)
            .with_metadata("refinement_outcome", outcome.exit.as_str())
            .with_metadata("quality_alerts", quality_alerts)
            .with_metadata("stage_timings_ms", timer.millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[tokio::test]
    async fn test_mock_pipeline_completes() {
        let cfg = AppConfig::default();
        let orchestrator = Orchestrator::from_config(&cfg, Arc::new(MockLlmClient::new())).unwrap();
        let result = orchestrator.run(PipelineRequest::new("宝黛终成眷属", 2)).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(orchestrator.stage(), PipelineStage::Completed);

        let output = result.data.as_ref().unwrap();
        assert_eq!(output.content.as_ref().unwrap().chapters.len(), 2);
        assert!(matches!(output.presentation, Some(PresentationView::Formatted(_))));
        assert_eq!(result.metadata["formatting_degraded"], false);
        assert!(result.metadata.contains_key("stage_timings_ms"));
        assert_eq!(orchestrator.agents_status().len(), 6);
    }

    #[tokio::test]
    async fn test_invalid_request_fails_before_agents_run() {
        let orchestrator = Orchestrator::from_config(&AppConfig::default(), Arc::new(MockLlmClient::new())).unwrap();
        let result = orchestrator.run(PipelineRequest::new("  ", 1)).await;
        assert!(!result.success);
        assert_eq!(result.metadata["failed_stage"], "validation");
        assert_eq!(orchestrator.stage(), PipelineStage::Errored);
        assert!(orchestrator
            .agents_status()
            .iter()
            .all(|s| s.transitions == 0));
    }

    #[test]
    fn test_stage_timer_records_durations() {
        let mut timer = StageTimer::new();
        timer.start(PipelineStage::Planning);
        assert!(timer.end(PipelineStage::Planning).is_some());
        assert!(timer.end(PipelineStage::Formatting).is_none());
        assert!(timer.millis().contains_key("planning"));
    }
}
