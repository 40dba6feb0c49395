//! 策略智能体：结局兼容性检查、总体策略、分阶段情节大纲、人物弧线
//!
//! 兼容性分数从 1.0 起扣：人物冲突 high -0.3 / medium -0.15，主题冲突 high -0.25 / medium -0.1，
//! 截断到 [0, 1]；低于 0.7 视为与原著冲突，本阶段失败。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::{Agent, AgentCore};
use crate::core::{AgentError, AgentResult, CommunicationChannel, PipelineRequest};
use crate::llm::GenerationService;
use crate::prompts;

/// 兼容性通过线
pub const COMPATIBILITY_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub subject: String,
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compatibility {
    pub compatible: bool,
    pub score: f64,
    pub character_conflicts: Vec<Conflict>,
    pub theme_conflicts: Vec<Conflict>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallStrategy {
    pub approach: String,
    pub key_themes: Vec<String>,
    pub narrative_style: String,
    pub emotional_arc: Vec<String>,
    /// 总体思路是否来自生成服务
    pub generated: bool,
}

/// 大纲中的一回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineEntry {
    pub chapter_number: u32,
    pub title: String,
    pub phase: String,
    pub focus: String,
    pub key_events: Vec<String>,
    pub themes: Vec<String>,
    pub word_estimate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub desired_ending: String,
    pub compatibility: Compatibility,
    pub overall: OverallStrategy,
    pub plot_outline: Vec<OutlineEntry>,
    pub character_arcs: BTreeMap<String, Vec<String>>,
}

impl Strategy {
    pub fn outline_for(&self, chapter_number: u32) -> Option<&OutlineEntry> {
        self.plot_outline
            .iter()
            .find(|e| e.chapter_number == chapter_number)
    }
}

/// 叙事阶段：名称、重点、关键事件
struct Phase {
    name: &'static str,
    focus: &'static str,
    events: [&'static str; 3],
}

const PHASES: [Phase; 4] = [
    Phase {
        name: "前期铺垫",
        focus: "爱情发展",
        events: ["宝黛情意渐深", "家常琐事", "诗词唱和"],
    },
    Phase {
        name: "中期冲突",
        focus: "考验与磨难",
        events: ["外部压力", "内心冲突", "误会丛生"],
    },
    Phase {
        name: "后期高潮",
        focus: "爱情圆满",
        events: ["困境化解", "真相大白", "情感升华"],
    },
    Phase {
        name: "大结局",
        focus: "幸福美满",
        events: ["终得团圆", "家道重振", "人生感悟"],
    },
];

/// 按位置把第 index 回（共 total 回）分到四个阶段之一
fn phase_for(index: usize, total: usize) -> &'static Phase {
    let slot = if total == 0 { 0 } else { index * PHASES.len() / total };
    &PHASES[slot.min(PHASES.len() - 1)]
}

fn contains_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

fn character_conflicts(ending: &str) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    if ending.contains("宝玉") && contains_any(ending, &["皇帝", "权臣", "富商"]) {
        conflicts.push(Conflict {
            subject: "贾宝玉".to_string(),
            description: "宝玉厌弃功名的性情与追逐权势富贵相冲突".to_string(),
            severity: Severity::High,
        });
    }
    if ending.contains("黛玉") && contains_any(ending, &["世故", "圆滑", "适应"]) {
        conflicts.push(Conflict {
            subject: "林黛玉".to_string(),
            description: "黛玉孤高自许的性情与世故圆滑相冲突".to_string(),
            severity: Severity::Medium,
        });
    }
    conflicts
}

fn theme_conflicts(ending: &str) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    if ending.contains("皆大欢喜") && ending.contains("白茫茫大地") {
        conflicts.push(Conflict {
            subject: "人生无常".to_string(),
            description: "「白茫茫大地真干净」的归结与皆大欢喜的圆满相抵触".to_string(),
            severity: Severity::Medium,
        });
    }
    conflicts
}

fn compatibility_score(characters: &[Conflict], themes: &[Conflict]) -> f64 {
    let character_penalty: f64 = characters
        .iter()
        .map(|c| match c.severity {
            Severity::High => 0.3,
            Severity::Medium => 0.15,
        })
        .sum();
    let theme_penalty: f64 = themes
        .iter()
        .map(|c| match c.severity {
            Severity::High => 0.25,
            Severity::Medium => 0.1,
        })
        .sum();
    (1.0 - character_penalty - theme_penalty).clamp(0.0, 1.0)
}

/// 检查期望结局与原著人物、主题的兼容性
pub fn check_compatibility(ending: &str) -> Compatibility {
    let character_conflicts = character_conflicts(ending);
    let theme_conflicts = theme_conflicts(ending);
    let score = compatibility_score(&character_conflicts, &theme_conflicts);
    let reason = if score >= 0.8 {
        "结局与原著高度兼容".to_string()
    } else if score >= 0.6 {
        "结局基本兼容，存在性格或主题上的冲突，建议适当调整".to_string()
    } else {
        let details: Vec<&str> = character_conflicts
            .iter()
            .chain(theme_conflicts.iter())
            .map(|c| c.description.as_str())
            .collect();
        format!("结局与原著存在明显冲突: {}", details.join("; "))
    };
    Compatibility {
        // 浮点扣分后与阈值比较，留出舍入误差
        compatible: score + 1e-9 >= COMPATIBILITY_THRESHOLD,
        score,
        character_conflicts,
        theme_conflicts,
        reason,
    }
}

fn fallback_strategy() -> OverallStrategy {
    OverallStrategy {
        approach: "尊重原著精神，循序推进至期望结局".to_string(),
        key_themes: vec![
            "爱情".to_string(),
            "命运".to_string(),
            "家族".to_string(),
            "觉醒".to_string(),
        ],
        narrative_style: "古典章回小说风格，第三人称全知视角".to_string(),
        emotional_arc: vec![
            "铺垫".to_string(),
            "发展".to_string(),
            "高潮".to_string(),
            "结局".to_string(),
        ],
        generated: false,
    }
}

/// 人物弧线
pub fn character_arcs() -> BTreeMap<String, Vec<String>> {
    let arcs: [(&str, [&str; 4]); 3] = [
        ("贾宝玉", ["纯真少年", "叛逆青年", "觉醒者", "精神解脱"]),
        ("林黛玉", ["聪慧少女", "多愁佳人", "坚守理想", "灵魂升华"]),
        ("薛宝钗", ["贤淑闺秀", "世故妇人", "顺应时势", "通达人生"]),
    ];
    arcs.iter()
        .map(|(name, stages)| {
            (
                name.to_string(),
                stages.iter().map(|s| s.to_string()).collect(),
            )
        })
        .collect()
}

/// 为 request 指定的回数生成分阶段大纲
pub fn plot_outline(request: &PipelineRequest, overall: &OverallStrategy, words: u32) -> Vec<OutlineEntry> {
    let total = request.chapter_count as usize;
    let themes: Vec<String> = overall.key_themes.iter().take(3).cloned().collect();
    (0..total)
        .map(|i| {
            let phase = phase_for(i, total);
            let number = request.chapter_number(i as u32);
            OutlineEntry {
                chapter_number: number,
                title: format!("第{}回", number),
                phase: phase.name.to_string(),
                focus: phase.focus.to_string(),
                key_events: phase.events.iter().map(|e| e.to_string()).collect(),
                themes: themes.clone(),
                word_estimate: words,
            }
        })
        .collect()
}

pub struct StrategyAgent {
    core: AgentCore,
    service: GenerationService,
    words_per_chapter: u32,
}

impl StrategyAgent {
    pub fn new(service: GenerationService) -> Self {
        Self {
            core: AgentCore::new("strategy"),
            service,
            words_per_chapter: 2500,
        }
    }

    pub fn with_channel(mut self, channel: Arc<CommunicationChannel>) -> Self {
        self.core = self.core.with_channel(channel);
        self
    }

    pub fn with_words_per_chapter(mut self, words: u32) -> Self {
        self.words_per_chapter = words;
        self
    }

    async fn overall_strategy(&self, request: &PipelineRequest) -> OverallStrategy {
        let chapters = request.chapter_count.to_string();
        let start = request.start_chapter_index.to_string();
        let req = prompts::STRATEGY.request(&[
            ("ending", request.desired_ending.as_str()),
            ("chapters", chapters.as_str()),
            ("start", start.as_str()),
        ]);
        match self.service.complete(&req).await {
            Ok(text) => {
                let mut strategy = fallback_strategy();
                if let Some(line) = text.lines().map(str::trim).find(|l| !l.is_empty()) {
                    strategy.approach = line.chars().take(80).collect();
                    strategy.generated = true;
                }
                strategy
            }
            Err(e) => {
                tracing::warn!(error = %e, "Strategy generation failed, using fallback strategy");
                fallback_strategy()
            }
        }
    }

    async fn plan(&self, request: &PipelineRequest) -> Result<Strategy, AgentError> {
        if request.desired_ending.trim().is_empty() {
            return Err(AgentError::InvalidInput("desired ending is empty".into()));
        }

        self.core.working("checking compatibility");
        let compatibility = check_compatibility(&request.desired_ending);
        tracing::info!(
            score = compatibility.score,
            compatible = compatibility.compatible,
            "Ending compatibility"
        );
        if !compatibility.compatible {
            return Err(AgentError::Processing(format!(
                "结局与原著存在冲突: {}",
                compatibility.reason
            )));
        }

        self.core.working("drafting strategy");
        let overall = self.overall_strategy(request).await;

        self.core.working("designing plot outline");
        let outline = plot_outline(request, &overall, self.words_per_chapter);

        Ok(Strategy {
            desired_ending: request.desired_ending.clone(),
            compatibility,
            overall,
            plot_outline: outline,
            character_arcs: character_arcs(),
        })
    }
}

#[async_trait]
impl Agent for StrategyAgent {
    type Input = PipelineRequest;
    type Output = Strategy;

    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, input: PipelineRequest) -> AgentResult<Strategy> {
        self.core.working("planning");
        let result = self.plan(&input).await;
        self.core.finish(result, |s| {
            format!("续写策略规划完成，大纲 {} 回", s.plot_outline.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn agent() -> StrategyAgent {
        StrategyAgent::new(GenerationService::without_retry(Arc::new(MockLlmClient::new())))
    }

    #[test]
    fn test_plain_ending_fully_compatible() {
        let c = check_compatibility("宝玉黛玉终成眷属");
        assert!(c.compatible);
        assert_eq!(c.score, 1.0);
    }

    #[test]
    fn test_single_high_conflict_still_passes() {
        let c = check_compatibility("宝玉做了皇帝");
        assert_eq!(c.character_conflicts.len(), 1);
        assert!((c.score - 0.7).abs() < 1e-9);
        assert!(c.compatible);
    }

    #[test]
    fn test_multiple_conflicts_fail() {
        let c = check_compatibility("宝玉成了权臣，黛玉变得世故圆滑");
        assert!((c.score - 0.55).abs() < 1e-9);
        assert!(!c.compatible);
        assert!(c.reason.contains("明显冲突"));
    }

    #[test]
    fn test_outline_phases_by_position() {
        let request = PipelineRequest::new("团圆", 4).with_start_chapter(81);
        let outline = plot_outline(&request, &fallback_strategy(), 2500);
        let phases: Vec<_> = outline.iter().map(|e| e.phase.as_str()).collect();
        assert_eq!(phases, vec!["前期铺垫", "中期冲突", "后期高潮", "大结局"]);
        assert_eq!(outline[3].chapter_number, 84);
    }

    #[tokio::test]
    async fn test_incompatible_ending_fails_stage() {
        let result = agent()
            .process(PipelineRequest::new("宝玉成了权臣，黛玉变得世故圆滑", 1))
            .await;
        assert!(!result.success);
        assert!(result.message.contains("冲突"));
    }

    #[tokio::test]
    async fn test_strategy_outline_matches_request() {
        let result = agent()
            .process(PipelineRequest::new("宝黛团圆", 2).with_start_chapter(90))
            .await;
        let strategy = result.into_data().unwrap();
        assert_eq!(strategy.plot_outline.len(), 2);
        assert!(strategy.outline_for(91).is_some());
        assert!(strategy.overall.generated);
        assert_eq!(strategy.character_arcs.len(), 3);
    }
}
