//! 质量评估智能体
//!
//! 风格一致性由生成服务给出评语后解析成分数，调用失败时退回文本启发式；
//! 人物、情节、文学性三项是纯文本启发式。综合分与等级见 [`scoring`]。

pub mod scoring;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use crate::agents::knowledge::builtin_characters;
use crate::agents::{Agent, AgentCore, CharacterProfile, ContentPayload};
use crate::core::{AgentError, AgentResult, CommunicationChannel};
use crate::llm::GenerationService;
use crate::prompts;

pub use scoring::{
    improvement_suggestions, Dimension, DimensionScores, QualityLevel, QualityReport,
    QualityWeights, LEVEL_BOUNDS,
};

/// 送去风格评估的最大字数
const STYLE_SAMPLE_CHARS: usize = 3000;

const CLASSICAL_PHRASES: [&str; 7] = ["话说", "原来", "却说", "且听下回分解", "诗曰", "词曰", "只见"];
const WENYAN_CHARS: [char; 7] = ['之', '乎', '者', '也', '矣', '焉', '哉'];
const CONTRADICTIONS: [&str; 3] = ["却又", "但是却", "然而却"];
const TENSION_WORDS: [&str; 5] = ["却", "原来", "突然", "不想", "谁知"];
const ENDING_MARKERS: [&str; 4] = ["且听下回分解", "正是", "后事如何", "下回书交代"];
const IMAGERY: [&str; 5] = ["月下", "花开", "风吹", "雨打", "雪飘"];
const EMOTIONS: [&str; 5] = ["伤感", "喜悦", "悲伤", "思念", "无奈"];
const ARTISTIC: [&str; 4] = ["诗曰", "词曰", "有诗为证", "正是"];

fn occurrences(text: &str, words: &[&str]) -> usize {
    words.iter().map(|w| text.matches(w).count()).sum()
}

fn present(text: &str, words: &[&str]) -> usize {
    words.iter().filter(|w| text.contains(*w)).count()
}

/// 风格启发式：古典惯用语与文言虚词
pub fn style_heuristic(text: &str) -> f64 {
    let phrases = present(text, &CLASSICAL_PHRASES) as f64;
    let wenyan = WENYAN_CHARS.iter().filter(|c| text.contains(**c)).count() as f64;
    (5.0 + (phrases * 0.5).min(3.0) + (wenyan * 0.2).min(1.5)).min(10.0)
}

static SCORE_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

/// 从评语中解析分数；没有明确分数时按褒贬词从 7.0 调整
pub fn parse_style_verdict(verdict: &str) -> f64 {
    let explicit = SCORE_PATTERN
        .get_or_init(|| Regex::new(r"(?:评分|SCORE)\s*[:：]\s*(\d+(?:\.\d+)?)").ok())
        .as_ref()
        .and_then(|re| re.captures(verdict))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());
    if let Some(score) = explicit {
        return score.clamp(0.0, 10.0);
    }

    let mut score: f64 = 7.0;
    if verdict.contains("优秀") || verdict.contains("很好") {
        score += 1.5;
    } else if verdict.contains("良好") || verdict.contains("不错") {
        score += 0.5;
    } else if verdict.contains("一般") {
        score -= 0.5;
    }
    if verdict.contains("不足") || verdict.contains("需要改进") {
        score -= 1.5;
    }
    score.clamp(0.0, 10.0)
}

/// 三字名在行文中常省去姓氏
fn mentioned(text: &str, name: &str) -> bool {
    if text.contains(name) {
        return true;
    }
    let given: String = name.chars().skip(1).collect();
    name.chars().count() == 3 && text.contains(given.as_str())
}

/// 人物启发式：出场人物与其性格特征的契合
pub fn character_accuracy(text: &str, characters: &[CharacterProfile]) -> f64 {
    let mut score = 5.0;
    for profile in characters.iter().filter(|c| mentioned(text, &c.name)) {
        if profile.personality.split_whitespace().any(|trait_| text.contains(trait_)) {
            score += 0.5;
        }
        score += 0.3;
    }
    f64::min(score, 10.0)
}

/// 情节启发式：矛盾转折、衔接、张力、回末收束
pub fn plot_reasonability(text: &str, characters: &[CharacterProfile]) -> f64 {
    let mut score = 5.0;
    if occurrences(text, &CONTRADICTIONS) <= 2 {
        score += 1.5;
    }
    if characters.iter().any(|c| mentioned(text, &c.name)) {
        score += 1.5;
    }
    if occurrences(text, &TENSION_WORDS) >= 3 {
        score += 1.0;
    }
    if present(text, &ENDING_MARKERS) > 0 {
        score += 1.0;
    }
    f64::min(score, 10.0)
}

/// 文学性启发式：篇幅、意象、情感、诗词、文言比例
pub fn literary_quality(text: &str) -> f64 {
    let length = text.chars().count();
    let mut score = 5.0;
    if length > 1000 {
        score += 1.0;
    }
    if occurrences(text, &IMAGERY) >= 2 {
        score += 1.0;
    }
    if occurrences(text, &EMOTIONS) >= 1 {
        score += 1.0;
    }
    if occurrences(text, &ARTISTIC) >= 1 {
        score += 1.0;
    }
    let wenyan = text.chars().filter(|c| WENYAN_CHARS.contains(c)).count();
    if length > 0 && wenyan as f64 / length as f64 >= 0.002 {
        score += 0.5;
    }
    f64::min(score, 10.0)
}

pub struct QualityAgent {
    core: AgentCore,
    service: GenerationService,
    weights: QualityWeights,
    suggestion_threshold: f64,
    characters: Vec<CharacterProfile>,
}

impl QualityAgent {
    pub fn new(service: GenerationService) -> Self {
        Self {
            core: AgentCore::new("quality"),
            service,
            weights: QualityWeights::default(),
            suggestion_threshold: 7.0,
            characters: builtin_characters(),
        }
    }

    pub fn with_channel(mut self, channel: Arc<CommunicationChannel>) -> Self {
        self.core = self.core.with_channel(channel);
        self
    }

    pub fn with_weights(mut self, weights: QualityWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_suggestion_threshold(mut self, threshold: f64) -> Self {
        self.suggestion_threshold = threshold;
        self
    }

    async fn style_score(&self, text: &str) -> f64 {
        let sample: String = text.chars().take(STYLE_SAMPLE_CHARS).collect();
        let req = prompts::QUALITY.request(&[("content", sample.as_str())]);
        match self.service.complete(&req).await {
            Ok(verdict) => parse_style_verdict(&verdict),
            Err(e) => {
                tracing::warn!(error = %e, "Style assessment unavailable, using heuristic");
                style_heuristic(text)
            }
        }
    }

    async fn assess(&self, content: &ContentPayload) -> Result<QualityReport, AgentError> {
        let text = content.joined_text();
        if content.is_empty() || text.trim().is_empty() {
            return Err(AgentError::InvalidInput("no content to assess".into()));
        }

        self.core.working("assessing style");
        let style = self.style_score(&text).await;

        self.core.working("assessing text");
        let scores: DimensionScores = [
            (Dimension::StyleConsistency, style),
            (Dimension::CharacterAccuracy, character_accuracy(&text, &self.characters)),
            (Dimension::PlotReasonability, plot_reasonability(&text, &self.characters)),
            (Dimension::LiteraryQuality, literary_quality(&text)),
        ]
        .into_iter()
        .collect();

        let report = QualityReport::from_scores(scores, &self.weights, self.suggestion_threshold);
        tracing::info!(
            score = report.overall_score,
            level = report.quality_level.label(),
            "Quality assessed"
        );
        Ok(report)
    }
}

#[async_trait]
impl Agent for QualityAgent {
    type Input = ContentPayload;
    type Output = QualityReport;

    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, input: ContentPayload) -> AgentResult<QualityReport> {
        self.core.working("assessing quality");
        let result = self.assess(&input).await;
        self.core.finish(result, |report| {
            format!(
                "质量评估完成，综合 {:.1} 分（{}）",
                report.overall_score,
                report.quality_level.label()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ChapterText;
    use crate::llm::{Generation, GenerationRequest, LlmClient, LlmError, MockLlmClient};

    struct DownClient;

    #[async_trait]
    impl LlmClient for DownClient {
        async fn generate(&self, _request: &GenerationRequest) -> Result<Generation, LlmError> {
            Err(LlmError::Request("offline".into()))
        }
    }

    fn payload(text: &str) -> ContentPayload {
        ContentPayload::new(
            vec![ChapterText {
                chapter_number: 81,
                title: "第81回".into(),
                text: text.into(),
                fallback: false,
            }],
            None,
        )
    }

    const SAMPLE: &str = "话说宝玉月下独坐，风吹花开，思念黛玉，心中伤感。\
        却说黛玉之病渐重，谁知贾母不想竟有此意，原来早有安排。诗曰：花谢花飞飞满天。\
        正是：一番心事向谁言。且听下回分解。";

    #[test]
    fn test_parse_explicit_verdict() {
        assert_eq!(parse_style_verdict("评分: 8.5\n古韵十足"), 8.5);
        assert_eq!(parse_style_verdict("评分：12"), 10.0);
    }

    #[test]
    fn test_parse_verdict_keywords() {
        assert_eq!(parse_style_verdict("整体优秀"), 8.5);
        assert_eq!(parse_style_verdict("风格一般，细节不足"), 5.0);
        assert_eq!(parse_style_verdict("无从判断"), 7.0);
    }

    #[test]
    fn test_heuristics_reward_classical_text() {
        let characters = builtin_characters();
        assert!(style_heuristic(SAMPLE) > style_heuristic("今天天气很好"));
        assert!(character_accuracy(SAMPLE, &characters) > 5.0);
        assert_eq!(plot_reasonability(SAMPLE, &characters), 10.0);
        assert!(literary_quality(SAMPLE) >= 8.0);
        assert_eq!(plot_reasonability("", &characters), 6.5);
    }

    #[tokio::test]
    async fn test_assessment_uses_model_style_score() {
        let agent = QualityAgent::new(GenerationService::without_retry(Arc::new(MockLlmClient::new())));
        let report = agent.process(payload(SAMPLE)).await.into_data().unwrap();
        assert_eq!(report.score(Dimension::StyleConsistency), Some(7.5));
        assert_eq!(report.dimension_scores.len(), 4);
        assert!((0.0..=10.0).contains(&report.overall_score));
    }

    #[tokio::test]
    async fn test_style_falls_back_to_heuristic() {
        let agent = QualityAgent::new(GenerationService::without_retry(Arc::new(DownClient)));
        let result = agent.process(payload(SAMPLE)).await;
        assert!(result.success);
        let report = result.into_data().unwrap();
        assert_eq!(report.score(Dimension::StyleConsistency), Some(style_heuristic(&payload(SAMPLE).joined_text())));
    }

    #[tokio::test]
    async fn test_empty_content_fails() {
        let agent = QualityAgent::new(GenerationService::without_retry(Arc::new(MockLlmClient::new())));
        let result = agent.process(ContentPayload::new(vec![], None)).await;
        assert!(!result.success);
        assert!(result.message.starts_with("quality:"));
    }
}
