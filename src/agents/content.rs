//! 内容生成智能体：按章节规划逐回生成正文，或依据质量反馈改写上一版
//!
//! 输入有两种形态：[`ContentInput::Fresh`] 从规划生成，[`ContentInput::Improvement`] 在上一版基础上改写。
//! 单回调用失败时，新生成用占位回目顶上，改写则保留原文；全部失败才算本阶段失败。

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::agents::{Agent, AgentCore, ChapterPlan, KnowledgeBase, QualityReport, Strategy};
use crate::core::{AgentError, AgentMessage, AgentResult, CommunicationChannel, MessagePayload, PipelineRequest};
use crate::llm::GenerationService;
use crate::prompts;

/// 改写时低于此分的维度会在提示中单独列出
const DIMENSION_TARGET: f64 = 7.0;
/// 上一回末尾带入下一回提示的字数
const CONTEXT_TAIL_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterText {
    pub chapter_number: u32,
    pub title: String,
    pub text: String,
    /// 生成失败后的占位内容
    pub fallback: bool,
}

impl ChapterText {
    /// 章回体排版：回数、回目、正文
    pub fn formatted(&self) -> String {
        format!("**第{}回**\n\n### {}\n\n{}", self.chapter_number, self.title, self.text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentStats {
    pub chapters: usize,
    pub fallback_chapters: usize,
    pub total_chars: usize,
    pub average_chars: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPayload {
    pub chapters: Vec<ChapterText>,
    /// 改写轮次；初次生成为 None
    pub improvement_iteration: Option<u32>,
    pub stats: ContentStats,
    pub generated_at: DateTime<Utc>,
}

impl ContentPayload {
    pub fn new(chapters: Vec<ChapterText>, improvement_iteration: Option<u32>) -> Self {
        let total_chars: usize = chapters.iter().map(|c| c.text.chars().count()).sum();
        let fallback_chapters = chapters.iter().filter(|c| c.fallback).count();
        let count = chapters.len();
        let stats = ContentStats {
            chapters: count,
            fallback_chapters,
            total_chars,
            average_chars: if count == 0 { 0.0 } else { total_chars as f64 / count as f64 },
            success_rate: if count == 0 {
                0.0
            } else {
                (count - fallback_chapters) as f64 / count as f64
            },
        };
        Self {
            chapters,
            improvement_iteration,
            stats,
            generated_at: Utc::now(),
        }
    }

    /// 全部章回排版后拼接
    pub fn joined_text(&self) -> String {
        self.chapters
            .iter()
            .map(ChapterText::formatted)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }
}

/// 改写所需的上下文：上一版内容与针对它的质量反馈
#[derive(Debug, Clone)]
pub struct ImprovementContext {
    pub previous: ContentPayload,
    pub quality_feedback: QualityReport,
    pub suggestions: Vec<String>,
    pub target_score: f64,
    pub iteration: u32,
    pub desired_ending: String,
    pub knowledge_base: KnowledgeBase,
    pub strategy: Strategy,
}

#[derive(Debug, Clone)]
pub enum ContentInput {
    Fresh {
        request: PipelineRequest,
        knowledge_base: KnowledgeBase,
        strategy: Strategy,
        /// 缺省时按策略大纲生成
        chapter_plan: Option<ChapterPlan>,
    },
    Improvement(ImprovementContext),
}

static BLANK_LINES: OnceLock<Option<Regex>> = OnceLock::new();

/// 压缩连续空行，去掉 \r
fn clean_text(raw: &str) -> String {
    let text = raw.replace('\r', "");
    let collapsed = match BLANK_LINES.get_or_init(|| Regex::new(r"\n{3,}").ok()) {
        Some(re) => re.replace_all(&text, "\n\n").into_owned(),
        None => text,
    };
    collapsed.trim().to_string()
}

fn fallback_chapter(number: u32, title: &str) -> ChapterText {
    ChapterText {
        chapter_number: number,
        title: title.to_string(),
        text: format!(
            "[第{}回备用内容]\n\n话说{}，众人各怀心事，一时无话。正是：世事洞明皆学问，人情练达即文章。",
            number, title
        ),
        fallback: true,
    }
}

fn tail(text: &str, chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(chars)).collect()
}

/// 本回写作要点，取自章节规划或策略大纲
struct ChapterBrief {
    number: u32,
    title: String,
    phase: String,
    events: String,
    characters: String,
    themes: String,
}

fn chapter_briefs(
    request: &PipelineRequest,
    strategy: &Strategy,
    plan: Option<&ChapterPlan>,
    knowledge: &KnowledgeBase,
) -> Vec<ChapterBrief> {
    (0..request.chapter_count)
        .map(|i| {
            let number = request.chapter_number(i);
            let outline = strategy.outline_for(number);
            let themes = outline
                .map(|o| o.themes.join("、"))
                .unwrap_or_else(|| knowledge.themes.join("、"));
            if let Some(bp) = plan.and_then(|p| p.chapter(number)) {
                return ChapterBrief {
                    number,
                    title: bp.title.clone(),
                    phase: bp.narrative_phase.clone(),
                    events: bp.plot_points.join("；"),
                    characters: bp.character_names().join("、"),
                    themes,
                };
            }
            match outline {
                Some(o) => ChapterBrief {
                    number,
                    title: o.title.clone(),
                    phase: o.phase.clone(),
                    events: o.key_events.join("；"),
                    characters: knowledge.character_names().join("、"),
                    themes,
                },
                None => ChapterBrief {
                    number,
                    title: format!("第{}回", number),
                    phase: String::new(),
                    events: String::new(),
                    characters: knowledge.character_names().join("、"),
                    themes,
                },
            }
        })
        .collect()
}

/// 邮箱中的反馈与修订请求转成提示文本；状态广播忽略，known 中已列出的建议不再重复
fn feedback_notes(messages: &[AgentMessage], known: &[String]) -> Vec<String> {
    let mut notes = Vec::new();
    let fresh = |s: &&String| !known.contains(*s);
    for message in messages {
        match &message.payload {
            MessagePayload::Feedback {
                issues, suggestions, ..
            } => {
                notes.extend(issues.iter().map(|i| format!("问题：{}", i)));
                notes.extend(suggestions.iter().filter(fresh).map(|s| format!("建议：{}", s)));
            }
            MessagePayload::RevisionRequest { reason, suggestions } => {
                notes.push(format!("修订要求：{}", reason));
                notes.extend(suggestions.iter().filter(fresh).map(|s| format!("建议：{}", s)));
            }
            _ => {}
        }
    }
    notes
}

/// 改写提示中的反馈段落
fn improvement_feedback(ctx: &ImprovementContext, chapter: &ChapterText, notes: &[String]) -> String {
    let mut lines = vec![format!(
        "请根据以下质量反馈改进第{}回（第{}轮修订，目标 {:.1} 分以上）：",
        chapter.chapter_number, ctx.iteration, ctx.target_score
    )];
    for (i, s) in ctx.suggestions.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, s));
    }
    let weak: Vec<String> = ctx
        .quality_feedback
        .dimension_scores
        .iter()
        .filter(|(_, score)| **score < DIMENSION_TARGET)
        .map(|(d, score)| format!("- {}: 当前{:.1}/10，需要提升至{:.1}以上", d.label(), score, DIMENSION_TARGET))
        .collect();
    if !weak.is_empty() {
        lines.push("需要重点提升的方面：".to_string());
        lines.extend(weak);
    }
    if !notes.is_empty() {
        lines.push("其他反馈：".to_string());
        lines.extend(notes.iter().cloned());
    }
    lines.push(format!("结局方向：{}", ctx.desired_ending));
    lines.join("\n")
}

pub struct ContentAgent {
    core: AgentCore,
    service: GenerationService,
    words_per_chapter: u32,
    temperature: f32,
    max_tokens: u32,
}

impl ContentAgent {
    pub fn new(service: GenerationService) -> Self {
        Self {
            core: AgentCore::new("content"),
            service,
            words_per_chapter: 2500,
            temperature: prompts::CONTENT.temperature,
            max_tokens: prompts::CONTENT.max_tokens,
        }
    }

    /// 覆盖新生成时的采样参数
    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_channel(mut self, channel: Arc<CommunicationChannel>) -> Self {
        self.core = self.core.with_channel(channel);
        self
    }

    pub fn with_words_per_chapter(mut self, words: u32) -> Self {
        self.words_per_chapter = words;
        self
    }

    async fn generate_fresh(
        &self,
        request: &PipelineRequest,
        knowledge: &KnowledgeBase,
        strategy: &Strategy,
        plan: Option<&ChapterPlan>,
        notes: &[String],
    ) -> Result<ContentPayload, AgentError> {
        let words = self.words_per_chapter.to_string();
        let mut chapters: Vec<ChapterText> = Vec::with_capacity(request.chapter_count as usize);

        for brief in chapter_briefs(request, strategy, plan, knowledge) {
            self.core.working(format!("writing chapter {}", brief.number));

            let mut context = vec![
                format!("前情：{}", knowledge.summary),
                format!("人物性格：{}", knowledge.personality_digest(5)),
            ];
            if let Some(prev) = chapters.last() {
                context.push(format!("上一回结尾：{}", tail(&prev.text, CONTEXT_TAIL_CHARS)));
            }
            context.extend(notes.iter().cloned());
            let context = context.join("\n");

            let chapter = brief.number.to_string();
            let req = prompts::CONTENT.request(&[
                ("chapter", chapter.as_str()),
                ("title", brief.title.as_str()),
                ("words", words.as_str()),
                ("phase", brief.phase.as_str()),
                ("events", brief.events.as_str()),
                ("characters", brief.characters.as_str()),
                ("themes", brief.themes.as_str()),
                ("ending", request.desired_ending.as_str()),
                ("context", context.as_str()),
            ])
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);

            let text = match self.service.complete(&req).await {
                Ok(raw) => ChapterText {
                    chapter_number: brief.number,
                    title: brief.title.clone(),
                    text: clean_text(&raw),
                    fallback: false,
                },
                Err(e) => {
                    tracing::warn!(chapter = brief.number, error = %e, "Chapter generation failed, using placeholder");
                    fallback_chapter(brief.number, &brief.title)
                }
            };
            chapters.push(text);
        }

        if chapters.is_empty() || chapters.iter().all(|c| c.fallback) {
            return Err(AgentError::Processing("no chapter could be generated".into()));
        }
        Ok(ContentPayload::new(chapters, None))
    }

    async fn improve(&self, ctx: &ImprovementContext, notes: &[String]) -> Result<ContentPayload, AgentError> {
        if ctx.previous.is_empty() {
            return Err(AgentError::InvalidInput("previous content has no chapters".into()));
        }

        let mut chapters = Vec::with_capacity(ctx.previous.chapters.len());
        let mut rewritten = 0usize;
        for chapter in &ctx.previous.chapters {
            self.core.working(format!(
                "revising chapter {} (round {})",
                chapter.chapter_number, ctx.iteration
            ));
            let feedback = improvement_feedback(ctx, chapter, notes);
            let req = prompts::IMPROVEMENT.request(&[
                ("feedback", feedback.as_str()),
                ("original", chapter.text.as_str()),
            ]);
            match self.service.complete(&req).await {
                Ok(raw) => {
                    rewritten += 1;
                    chapters.push(ChapterText {
                        text: clean_text(&raw),
                        fallback: false,
                        ..chapter.clone()
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        chapter = chapter.chapter_number,
                        error = %e,
                        "Chapter revision failed, keeping previous text"
                    );
                    chapters.push(chapter.clone());
                }
            }
        }

        if rewritten == 0 {
            return Err(AgentError::Processing("no chapter could be revised".into()));
        }
        tracing::info!(iteration = ctx.iteration, rewritten, "Content revised");
        Ok(ContentPayload::new(chapters, Some(ctx.iteration)))
    }
}

#[async_trait]
impl Agent for ContentAgent {
    type Input = ContentInput;
    type Output = ContentPayload;

    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, input: ContentInput) -> AgentResult<ContentPayload> {
        let known: &[String] = match &input {
            ContentInput::Improvement(ctx) => &ctx.suggestions,
            ContentInput::Fresh { .. } => &[],
        };
        let notes = feedback_notes(&self.core.drain_feedback(), known);
        let result = match &input {
            ContentInput::Fresh {
                request,
                knowledge_base,
                strategy,
                chapter_plan,
            } => {
                self.core.working("generating content");
                self.generate_fresh(request, knowledge_base, strategy, chapter_plan.as_ref(), &notes)
                    .await
            }
            ContentInput::Improvement(ctx) => {
                self.core.working("improving content");
                self.improve(ctx, &notes).await
            }
        };
        self.core.finish(result, |payload| match payload.improvement_iteration {
            Some(round) => format!("第{}轮修订完成，共{}回", round, payload.chapters.len()),
            None => format!("成功生成{}回内容", payload.chapters.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::knowledge::builtin_characters;
    use crate::agents::quality::{Dimension, QualityWeights};
    use crate::agents::strategy::{character_arcs, check_compatibility, plot_outline, OverallStrategy};
    use crate::llm::{Generation, GenerationRequest, LlmClient, LlmError, MockLlmClient};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 第 fail_on 次调用失败，其余返回固定文本
    struct FlakyClient {
        calls: AtomicUsize,
        fail_on: Option<usize>,
        reply: &'static str,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn generate(&self, _request: &GenerationRequest) -> Result<Generation, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.map_or(true, |f| f == n) {
                return Err(LlmError::Request("boom".into()));
            }
            Ok(Generation {
                content: self.reply.to_string(),
                model: "flaky".into(),
                usage: Default::default(),
            })
        }
    }

    fn knowledge() -> KnowledgeBase {
        KnowledgeBase {
            characters: builtin_characters(),
            themes: vec!["爱情".into()],
            summary: "前情".into(),
            ..Default::default()
        }
    }

    fn strategy(request: &PipelineRequest) -> Strategy {
        let overall = OverallStrategy {
            key_themes: vec!["爱情".into()],
            ..Default::default()
        };
        Strategy {
            desired_ending: request.desired_ending.clone(),
            compatibility: check_compatibility(&request.desired_ending),
            plot_outline: plot_outline(request, &overall, 2500),
            overall,
            character_arcs: character_arcs(),
        }
    }

    fn fresh(chapters: u32) -> ContentInput {
        let request = PipelineRequest::new("宝黛团圆", chapters);
        ContentInput::Fresh {
            strategy: strategy(&request),
            knowledge_base: knowledge(),
            chapter_plan: None,
            request,
        }
    }

    fn report(score: f64) -> QualityReport {
        let scores: BTreeMap<Dimension, f64> = Dimension::ALL.iter().map(|d| (*d, score)).collect();
        QualityReport::from_scores(scores, &QualityWeights::default(), 7.0)
    }

    fn improvement(previous: ContentPayload) -> ContentInput {
        let request = PipelineRequest::new("宝黛团圆", 1);
        ContentInput::Improvement(ImprovementContext {
            previous,
            quality_feedback: report(5.0),
            suggestions: vec!["加强人物心理描写".into()],
            target_score: 7.0,
            iteration: 1,
            desired_ending: request.desired_ending.clone(),
            knowledge_base: knowledge(),
            strategy: strategy(&request),
        })
    }

    #[test]
    fn test_clean_text_collapses_blank_lines() {
        assert_eq!(clean_text("话说\r\n\n\n\n却说\n"), "话说\n\n却说");
    }

    #[tokio::test]
    async fn test_fresh_generation_numbers_chapters() {
        let agent = ContentAgent::new(GenerationService::without_retry(Arc::new(MockLlmClient::new())));
        let result = agent.process(fresh(2)).await;
        assert!(result.success);
        let payload = result.into_data().unwrap();
        assert_eq!(payload.chapters.len(), 2);
        assert_eq!(payload.chapters[0].chapter_number, 81);
        assert_eq!(payload.chapters[1].chapter_number, 82);
        assert!(payload.improvement_iteration.is_none());
        assert!(payload.joined_text().contains("**第82回**"));
    }

    #[tokio::test]
    async fn test_single_failed_chapter_uses_placeholder() {
        let client = FlakyClient {
            calls: AtomicUsize::new(0),
            fail_on: Some(1),
            reply: "话说宝玉",
        };
        let agent = ContentAgent::new(GenerationService::without_retry(Arc::new(client)));
        let payload = agent.process(fresh(2)).await.into_data().unwrap();
        assert!(payload.chapters[0].fallback);
        assert!(!payload.chapters[1].fallback);
        assert_eq!(payload.stats.fallback_chapters, 1);
        assert_eq!(payload.stats.success_rate, 0.5);
    }

    #[tokio::test]
    async fn test_all_chapters_failing_fails_stage() {
        let client = FlakyClient {
            calls: AtomicUsize::new(0),
            fail_on: None,
            reply: "",
        };
        let agent = ContentAgent::new(GenerationService::without_retry(Arc::new(client)));
        let result = agent.process(fresh(2)).await;
        assert!(!result.success);
        assert!(result.message.starts_with("content:"));
    }

    #[tokio::test]
    async fn test_improvement_rewrites_previous_chapters() {
        let previous = ContentPayload::new(vec![fallback_chapter(81, "第81回")], None);
        let agent = ContentAgent::new(GenerationService::without_retry(Arc::new(MockLlmClient::with_reply(
            "却说改写之后",
        ))));
        let payload = agent.process(improvement(previous)).await.into_data().unwrap();
        assert_eq!(payload.improvement_iteration, Some(1));
        assert_eq!(payload.chapters[0].text, "却说改写之后");
        assert_eq!(payload.chapters[0].chapter_number, 81);
        assert!(!payload.chapters[0].fallback);
    }

    #[tokio::test]
    async fn test_improvement_fails_when_no_rewrite_succeeds() {
        let previous = ContentPayload::new(vec![fallback_chapter(81, "第81回")], None);
        let client = FlakyClient {
            calls: AtomicUsize::new(0),
            fail_on: None,
            reply: "",
        };
        let agent = ContentAgent::new(GenerationService::without_retry(Arc::new(client)));
        assert!(!agent.process(improvement(previous)).await.success);
    }

    #[test]
    fn test_improvement_feedback_lists_weak_dimensions_and_notes() {
        let previous = ContentPayload::new(vec![fallback_chapter(81, "第81回")], None);
        let ContentInput::Improvement(ctx) = improvement(previous) else {
            unreachable!()
        };
        let chapter = &ctx.previous.chapters[0];
        let text = improvement_feedback(&ctx, chapter, &["问题：节奏拖沓".to_string()]);
        assert!(text.contains("1. 加强人物心理描写"));
        assert!(text.contains("当前5.0/10，需要提升至7.0以上"));
        assert!(text.contains("问题：节奏拖沓"));
        assert!(!text.contains("评分"));
    }

    #[test]
    fn test_channel_suggestions_are_not_repeated_in_improvement_prompt() {
        let previous = ContentPayload::new(vec![fallback_chapter(81, "第81回")], None);
        let ContentInput::Improvement(ctx) = improvement(previous) else {
            unreachable!()
        };
        let message = AgentMessage::new(
            "quality",
            "content",
            MessagePayload::Feedback {
                issues: vec!["人物性格偏离".into()],
                suggestions: vec!["加强人物心理描写".into(), "多用白描".into()],
                target_score: 7.0,
            },
        );
        let notes = feedback_notes(&[message], &ctx.suggestions);
        assert_eq!(notes, vec!["问题：人物性格偏离", "建议：多用白描"]);

        let text = improvement_feedback(&ctx, &ctx.previous.chapters[0], &notes);
        assert_eq!(text.matches("加强人物心理描写").count(), 1);
    }

    #[tokio::test]
    async fn test_channel_feedback_is_drained_on_process() {
        let channel = Arc::new(CommunicationChannel::new());
        let agent = ContentAgent::new(GenerationService::without_retry(Arc::new(MockLlmClient::new())))
            .with_channel(channel.clone());
        channel.send_feedback(
            "quality",
            "content",
            MessagePayload::Feedback {
                issues: vec!["文白失衡".into()],
                suggestions: vec![],
                target_score: 7.0,
            },
        );
        assert!(agent.process(fresh(1)).await.success);
        assert_eq!(channel.pending("content"), 0);
        assert_eq!(agent.core().feedback_history().len(), 1);
    }
}
