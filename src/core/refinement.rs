//! 迭代改进循环：评估 → 未达标则反馈并改写 → 再评估
//!
//! 初次生成的内容算作第 1 次生成；整个循环中生成与评估次数都不超过 max_iterations。
//! 循环从不返回错误，每个出口都带回目前最好的内容与质量报告。

use serde::{Deserialize, Serialize};

use crate::agents::{
    ContentInput, ContentPayload, ContentStage, ImprovementContext, KnowledgeBase, QualityReport,
    QualityStage, Strategy,
};
use crate::core::{CommunicationChannel, MessagePayload};

/// 循环出口
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementExit {
    /// 达到阈值
    Passed,
    /// 用完迭代次数仍未达标（尽力而为的结果）
    Exhausted,
    /// 评估失败
    QualityFailed,
    /// 改写失败，保留上一版
    RegenerationFailed,
}

impl RefinementExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefinementExit::Passed => "passed",
            RefinementExit::Exhausted => "exhausted",
            RefinementExit::QualityFailed => "quality_failed",
            RefinementExit::RegenerationFailed => "regeneration_failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RefinementOutcome {
    pub content: ContentPayload,
    /// 评估从未成功时为 None
    pub quality: Option<QualityReport>,
    pub exit: RefinementExit,
    /// 完成的改写轮数
    pub iterations: u32,
    pub content_generations: u32,
    pub quality_assessments: u32,
    pub score_history: Vec<f64>,
    pub alerts_sent: u32,
}

impl RefinementOutcome {
    pub fn threshold_met(&self, threshold: f64) -> bool {
        self.quality.as_ref().is_some_and(|q| q.meets(threshold))
    }
}

/// 改写时需要的不变上下文
#[derive(Clone, Debug)]
pub struct RefinementContext {
    pub desired_ending: String,
    pub knowledge_base: KnowledgeBase,
    pub strategy: Strategy,
}

pub struct RefinementLoop<'a> {
    content_agent: &'a ContentStage,
    quality_agent: &'a QualityStage,
    channel: &'a CommunicationChannel,
    max_iterations: u32,
    threshold: f64,
}

impl<'a> RefinementLoop<'a> {
    pub fn new(
        content_agent: &'a ContentStage,
        quality_agent: &'a QualityStage,
        channel: &'a CommunicationChannel,
        max_iterations: u32,
        threshold: f64,
    ) -> Self {
        Self {
            content_agent,
            quality_agent,
            channel,
            max_iterations: max_iterations.max(1),
            threshold,
        }
    }

    async fn assess(&self, content: &ContentPayload, counters: &mut Counters) -> Option<QualityReport> {
        counters.quality_assessments += 1;
        let result = self.quality_agent.process(content.clone()).await;
        if !result.success {
            tracing::warn!(message = %result.message, "Quality assessment failed");
        }
        result.into_data()
    }

    /// 未达标时通知编排器，并把问题与建议发给内容智能体
    fn send_feedback(&self, iteration: u32, report: &QualityReport, counters: &mut Counters) {
        let quality = self.quality_agent.name();
        let dimension_scores = report
            .dimension_scores
            .iter()
            .map(|(d, s)| (d.key().to_string(), *s))
            .collect();
        self.channel.send_quality_alert(
            quality,
            MessagePayload::QualityAlert {
                iteration,
                score: report.overall_score,
                threshold: self.threshold,
                dimension_scores,
            },
        );
        counters.alerts_sent += 1;
        self.channel.send_feedback(
            quality,
            self.content_agent.name(),
            MessagePayload::Feedback {
                issues: report.issues(self.threshold),
                suggestions: report.suggestions.clone(),
                target_score: self.threshold,
            },
        );
    }

    pub async fn run(&self, initial: ContentPayload, ctx: &RefinementContext) -> RefinementOutcome {
        let mut counters = Counters {
            content_generations: 1,
            ..Default::default()
        };
        let mut content = initial;
        let mut last_report: Option<QualityReport> = None;
        let mut iteration: u32 = 0;

        let exit = loop {
            let Some(report) = self.assess(&content, &mut counters).await else {
                break RefinementExit::QualityFailed;
            };
            counters.score_history.push(report.overall_score);
            tracing::info!(
                iteration,
                score = report.overall_score,
                threshold = self.threshold,
                "Refinement round assessed"
            );

            if report.meets(self.threshold) {
                last_report = Some(report);
                break RefinementExit::Passed;
            }
            if iteration + 1 >= self.max_iterations {
                last_report = Some(report);
                break RefinementExit::Exhausted;
            }

            self.send_feedback(iteration, &report, &mut counters);
            let improvement = ImprovementContext {
                previous: content.clone(),
                suggestions: report.suggestions.clone(),
                quality_feedback: report.clone(),
                target_score: self.threshold,
                iteration: iteration + 1,
                desired_ending: ctx.desired_ending.clone(),
                knowledge_base: ctx.knowledge_base.clone(),
                strategy: ctx.strategy.clone(),
            };
            last_report = Some(report);

            counters.content_generations += 1;
            let regenerated = self
                .content_agent
                .process(ContentInput::Improvement(improvement))
                .await;
            match regenerated.into_data() {
                Some(next) => {
                    content = next;
                    iteration += 1;
                }
                None => {
                    tracing::warn!(iteration, "Content regeneration failed, keeping previous content");
                    break RefinementExit::RegenerationFailed;
                }
            }
        };

        // 评估失败时重试一次，改写失败时对保留的内容做最终评估；
        // 这两个出口的评估次数此前都小于上限，不会越过 max_iterations
        if matches!(exit, RefinementExit::QualityFailed | RefinementExit::RegenerationFailed) {
            let reassessed = self.assess(&content, &mut counters).await;
            if let Some(report) = &reassessed {
                counters.score_history.push(report.overall_score);
            }
            // 改写失败时内容未变，上一份报告仍然有效
            last_report = match exit {
                RefinementExit::RegenerationFailed => reassessed.or(last_report),
                _ => reassessed,
            };
        }

        tracing::info!(
            exit = exit.as_str(),
            iterations = iteration,
            generations = counters.content_generations,
            assessments = counters.quality_assessments,
            "Refinement finished"
        );

        RefinementOutcome {
            content,
            quality: last_report,
            exit,
            iterations: iteration,
            content_generations: counters.content_generations,
            quality_assessments: counters.quality_assessments,
            score_history: counters.score_history,
            alerts_sent: counters.alerts_sent,
        }
    }
}

#[derive(Default)]
struct Counters {
    content_generations: u32,
    quality_assessments: u32,
    score_history: Vec<f64>,
    alerts_sent: u32,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::agents::strategy::{character_arcs, check_compatibility, OverallStrategy};
    use crate::agents::{Agent, AgentCore, ChapterText, Dimension, QualityWeights};
    use crate::core::{AgentResult, MessageType, ORCHESTRATOR};

    /// 依次返回给定分数；None 表示该次评估失败
    struct ScriptedQuality {
        core: AgentCore,
        scores: Mutex<Vec<Option<f64>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Agent for ScriptedQuality {
        type Input = ContentPayload;
        type Output = QualityReport;

        fn core(&self) -> &AgentCore {
            &self.core
        }

        async fn process(&self, _input: ContentPayload) -> AgentResult<QualityReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut scores = self.scores.lock().unwrap();
                if scores.len() > 1 {
                    scores.remove(0)
                } else {
                    scores.first().copied().flatten()
                }
            };
            match next {
                Some(score) => {
                    let scores: BTreeMap<Dimension, f64> =
                        Dimension::ALL.iter().map(|d| (*d, score)).collect();
                    AgentResult::ok(QualityReport::from_scores(scores, &QualityWeights::default(), 7.0), "ok")
                }
                None => AgentResult::failure("quality: scripted failure"),
            }
        }
    }

    struct ScriptedContent {
        core: AgentCore,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Agent for ScriptedContent {
        type Input = ContentInput;
        type Output = ContentPayload;

        fn core(&self) -> &AgentCore {
            &self.core
        }

        async fn process(&self, input: ContentInput) -> AgentResult<ContentPayload> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return AgentResult::failure("content: scripted failure");
            }
            let ContentInput::Improvement(ctx) = input else {
                return AgentResult::failure("content: expected improvement input");
            };
            let mut chapters = ctx.previous.chapters.clone();
            chapters[0].text = format!("revision {}", n);
            AgentResult::ok(ContentPayload::new(chapters, Some(ctx.iteration)), "ok")
        }
    }

    struct Fixture {
        channel: Arc<CommunicationChannel>,
        quality: Arc<ScriptedQuality>,
        content: Arc<ScriptedContent>,
    }

    fn fixture(scores: Vec<Option<f64>>, fail_content: bool) -> Fixture {
        let channel = Arc::new(CommunicationChannel::new());
        channel.register(ORCHESTRATOR);
        Fixture {
            quality: Arc::new(ScriptedQuality {
                core: AgentCore::new("quality").with_channel(channel.clone()),
                scores: Mutex::new(scores),
                calls: AtomicUsize::new(0),
            }),
            content: Arc::new(ScriptedContent {
                core: AgentCore::new("content").with_channel(channel.clone()),
                fail: fail_content,
                calls: AtomicUsize::new(0),
            }),
            channel,
        }
    }

    fn initial() -> ContentPayload {
        ContentPayload::new(
            vec![ChapterText {
                chapter_number: 81,
                title: "第81回".into(),
                text: "initial".into(),
                fallback: false,
            }],
            None,
        )
    }

    fn context() -> RefinementContext {
        RefinementContext {
            desired_ending: "X".into(),
            knowledge_base: KnowledgeBase::default(),
            strategy: Strategy {
                desired_ending: "X".into(),
                compatibility: check_compatibility("X"),
                overall: OverallStrategy::default(),
                plot_outline: vec![],
                character_arcs: character_arcs(),
            },
        }
    }

    async fn run(f: &Fixture, max_iterations: u32) -> RefinementOutcome {
        let content: ContentStage = f.content.clone();
        let quality: QualityStage = f.quality.clone();
        RefinementLoop::new(&content, &quality, &f.channel, max_iterations, 7.0)
            .run(initial(), &context())
            .await
    }

    #[tokio::test]
    async fn test_loop_stops_at_iteration_ceiling() {
        let f = fixture(vec![Some(5.0)], false);
        let outcome = run(&f, 3).await;
        assert_eq!(outcome.exit, RefinementExit::Exhausted);
        assert_eq!(outcome.content_generations, 3);
        assert_eq!(outcome.quality_assessments, 3);
        assert_eq!(f.content.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.quality.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.content.chapters[0].text, "revision 2");
        assert!(!outcome.threshold_met(7.0));
    }

    #[tokio::test]
    async fn test_loop_exits_early_on_pass() {
        let f = fixture(vec![Some(5.0), Some(7.0)], false);
        let outcome = run(&f, 3).await;
        assert_eq!(outcome.exit, RefinementExit::Passed);
        assert_eq!(outcome.content_generations, 2);
        assert_eq!(outcome.quality_assessments, 2);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.score_history, vec![5.0, 7.0]);
    }

    #[tokio::test]
    async fn test_failed_regeneration_keeps_previous_content() {
        let f = fixture(vec![Some(5.0)], true);
        let outcome = run(&f, 3).await;
        assert_eq!(outcome.exit, RefinementExit::RegenerationFailed);
        assert_eq!(outcome.content.chapters[0].text, "initial");
        assert_eq!(outcome.quality.as_ref().map(|q| q.overall_score), Some(5.0));
        assert_eq!(outcome.quality_assessments, 2);
        assert_eq!(outcome.content_generations, 2);
        assert_eq!(outcome.score_history, vec![5.0, 5.0]);
    }

    #[tokio::test]
    async fn test_final_assessment_after_failed_regeneration_respects_ceiling() {
        let f = fixture(vec![Some(5.0)], true);
        let outcome = run(&f, 2).await;
        assert_eq!(outcome.exit, RefinementExit::RegenerationFailed);
        assert_eq!(outcome.quality_assessments, 2);
        assert_eq!(f.quality.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_assessment_is_retried_once() {
        let f = fixture(vec![None, Some(8.0)], false);
        let outcome = run(&f, 3).await;
        assert_eq!(outcome.exit, RefinementExit::QualityFailed);
        assert_eq!(outcome.quality_assessments, 2);
        assert_eq!(outcome.quality.map(|q| q.overall_score), Some(8.0));
        assert_eq!(f.content.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_below_threshold_sends_alert_and_feedback() {
        let f = fixture(vec![Some(5.0), Some(9.0)], false);
        let outcome = run(&f, 3).await;
        assert_eq!(outcome.alerts_sent, 1);
        let alerts: Vec<_> = f
            .channel
            .poll(ORCHESTRATOR)
            .into_iter()
            .filter(|m| m.message_type() == MessageType::QualityAlert)
            .collect();
        assert_eq!(alerts.len(), 1);
        let feedback = f
            .channel
            .history(Some("content"))
            .into_iter()
            .filter(|m| m.message_type() == MessageType::Feedback)
            .count();
        assert_eq!(feedback, 1);
    }
}
