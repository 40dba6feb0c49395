//! 章节规划智能体：逐回蓝图、人物分布统计、一致性校验

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::{Agent, AgentCore, KnowledgeBase, Strategy};
use crate::core::{AgentError, AgentResult, CommunicationChannel, PipelineRequest};
use crate::llm::GenerationService;
use crate::prompts;

const MAX_TITLE_CHARS: usize = 40;

#[derive(Debug, Clone)]
pub struct ChapterPlanInput {
    pub request: PipelineRequest,
    pub strategy: Strategy,
    pub knowledge_base: KnowledgeBase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Primary,
    Secondary,
    Minor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRole {
    pub name: String,
    pub importance: Importance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterBlueprint {
    pub chapter_number: u32,
    pub title: String,
    pub narrative_phase: String,
    pub focus: String,
    pub main_characters: Vec<CharacterRole>,
    pub plot_points: Vec<String>,
    pub literary_elements: Vec<String>,
    pub title_generated: bool,
}

impl ChapterBlueprint {
    pub fn character_names(&self) -> Vec<&str> {
        self.main_characters.iter().map(|c| c.name.as_str()).collect()
    }
}

/// 单个人物在各回中的出场情况
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterAppearance {
    pub total: usize,
    pub primary: Vec<u32>,
    pub secondary: Vec<u32>,
    pub minor: Vec<u32>,
    pub absent: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanValidation {
    pub is_consistent: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterPlan {
    pub start_chapter: u32,
    pub end_chapter: u32,
    pub chapters: Vec<ChapterBlueprint>,
    pub character_distribution: BTreeMap<String, CharacterAppearance>,
    /// 主要人物出场均衡度（0–1，越接近 1 越均衡）
    pub distribution_balance: f64,
    pub validation: PlanValidation,
}

impl ChapterPlan {
    pub fn chapter(&self, number: u32) -> Option<&ChapterBlueprint> {
        self.chapters.iter().find(|c| c.chapter_number == number)
    }
}

fn literary_elements(phase: &str) -> Vec<String> {
    let extra = match phase {
        "前期铺垫" => "伏笔",
        "中期冲突" => "梦境",
        "后期高潮" => "象征",
        _ => "照应",
    };
    vec!["诗词".to_string(), "景物烘托".to_string(), extra.to_string()]
}

fn cast_for(index: usize, knowledge: &KnowledgeBase) -> Vec<CharacterRole> {
    let mut cast = vec![
        CharacterRole {
            name: "贾宝玉".to_string(),
            importance: Importance::Primary,
        },
        CharacterRole {
            name: "林黛玉".to_string(),
            importance: Importance::Primary,
        },
        CharacterRole {
            name: "薛宝钗".to_string(),
            importance: Importance::Secondary,
        },
    ];
    // 其余人物轮流作为次要角色出场
    let others: Vec<&str> = knowledge
        .character_names()
        .into_iter()
        .filter(|n| !cast.iter().any(|c| c.name == *n))
        .collect();
    if !others.is_empty() {
        cast.push(CharacterRole {
            name: others[index % others.len()].to_string(),
            importance: Importance::Minor,
        });
    }
    cast
}

/// 统计人物出场分布
pub fn distribute_characters(chapters: &[ChapterBlueprint]) -> BTreeMap<String, CharacterAppearance> {
    let mut stats: BTreeMap<String, CharacterAppearance> = BTreeMap::new();
    for chapter in chapters {
        for role in &chapter.main_characters {
            let entry = stats.entry(role.name.clone()).or_default();
            entry.total += 1;
            match role.importance {
                Importance::Primary => entry.primary.push(chapter.chapter_number),
                Importance::Secondary => entry.secondary.push(chapter.chapter_number),
                Importance::Minor => entry.minor.push(chapter.chapter_number),
            }
        }
    }
    for appearance in stats.values_mut() {
        appearance.absent = chapters
            .iter()
            .map(|c| c.chapter_number)
            .filter(|n| {
                !appearance.primary.contains(n)
                    && !appearance.secondary.contains(n)
                    && !appearance.minor.contains(n)
            })
            .collect();
    }
    stats
}

/// 宝、黛、钗三人出场次数的方差换算为均衡度
pub fn distribution_balance(stats: &BTreeMap<String, CharacterAppearance>) -> f64 {
    let counts: Vec<f64> = ["贾宝玉", "林黛玉", "薛宝钗"]
        .iter()
        .filter_map(|name| stats.get(*name))
        .map(|a| a.total as f64)
        .collect();
    if counts.is_empty() {
        return 0.0;
    }
    let avg = counts.iter().sum::<f64>() / counts.len() as f64;
    let variance = counts.iter().map(|c| (c - avg).powi(2)).sum::<f64>() / counts.len() as f64;
    let balance = 1.0 / (1.0 + variance / 100.0);
    (balance * 100.0).round() / 100.0
}

/// 校验：回目编号连续，每回都有标题、人物与情节点
pub fn validate_plan(chapters: &[ChapterBlueprint]) -> PlanValidation {
    let mut issues = Vec::new();
    for pair in chapters.windows(2) {
        if pair[1].chapter_number != pair[0].chapter_number + 1 {
            issues.push(format!(
                "第{}回与第{}回编号不连续",
                pair[0].chapter_number, pair[1].chapter_number
            ));
        }
    }
    for chapter in chapters {
        let n = chapter.chapter_number;
        if chapter.title.trim().is_empty() {
            issues.push(format!("第{}回缺少标题", n));
        }
        if chapter.main_characters.is_empty() {
            issues.push(format!("第{}回缺少主要人物", n));
        }
        if chapter.plot_points.is_empty() {
            issues.push(format!("第{}回缺少情节点", n));
        }
    }
    PlanValidation {
        is_consistent: issues.is_empty(),
        issues,
    }
}

/// 回目只接受单行短句，去掉外层引号
fn clean_title(raw: &str) -> Option<String> {
    let line = raw.trim();
    if line.is_empty() || line.contains('\n') {
        return None;
    }
    let title = line
        .trim_matches(|c: char| matches!(c, '「' | '」' | '"' | '“' | '”'))
        .trim();
    if title.is_empty() || title.chars().count() > MAX_TITLE_CHARS {
        return None;
    }
    Some(title.to_string())
}

pub struct ChapterPlanAgent {
    core: AgentCore,
    service: GenerationService,
}

impl ChapterPlanAgent {
    pub fn new(service: GenerationService) -> Self {
        Self {
            core: AgentCore::new("chapter_plan"),
            service,
        }
    }

    pub fn with_channel(mut self, channel: Arc<CommunicationChannel>) -> Self {
        self.core = self.core.with_channel(channel);
        self
    }

    async fn chapter_title(&self, number: u32, phase: &str, focus: &str, events: &str) -> Option<String> {
        let chapter = number.to_string();
        let req = prompts::CHAPTER_PLAN.request(&[
            ("chapter", chapter.as_str()),
            ("phase", phase),
            ("focus", focus),
            ("events", events),
        ]);
        match self.service.complete(&req).await {
            Ok(text) => clean_title(&text),
            Err(e) => {
                tracing::warn!(chapter = number, error = %e, "Chapter title generation failed");
                None
            }
        }
    }

    async fn plan(&self, input: &ChapterPlanInput) -> Result<ChapterPlan, AgentError> {
        let request = &input.request;
        let mut chapters = Vec::with_capacity(request.chapter_count as usize);

        self.core.working("planning chapter details");
        for i in 0..request.chapter_count {
            let number = request.chapter_number(i);
            let entry = input.strategy.outline_for(number).ok_or_else(|| {
                AgentError::InvalidInput(format!("strategy outline has no entry for chapter {}", number))
            })?;
            let events = entry.key_events.join("；");
            let generated = self
                .chapter_title(number, &entry.phase, &entry.focus, &events)
                .await;
            chapters.push(ChapterBlueprint {
                chapter_number: number,
                title_generated: generated.is_some(),
                title: generated.unwrap_or_else(|| entry.title.clone()),
                narrative_phase: entry.phase.clone(),
                focus: entry.focus.clone(),
                main_characters: cast_for(i as usize, &input.knowledge_base),
                plot_points: entry.key_events.clone(),
                literary_elements: literary_elements(&entry.phase),
            });
        }

        self.core.working("distributing characters");
        let character_distribution = distribute_characters(&chapters);
        let distribution_balance = distribution_balance(&character_distribution);

        self.core.working("validating consistency");
        let validation = validate_plan(&chapters);
        if !validation.is_consistent {
            return Err(AgentError::Processing(validation.issues.join("; ")));
        }

        Ok(ChapterPlan {
            start_chapter: request.start_chapter_index,
            end_chapter: request.chapter_number(request.chapter_count.saturating_sub(1)),
            chapters,
            character_distribution,
            distribution_balance,
            validation,
        })
    }
}

#[async_trait]
impl Agent for ChapterPlanAgent {
    type Input = ChapterPlanInput;
    type Output = ChapterPlan;

    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, input: ChapterPlanInput) -> AgentResult<ChapterPlan> {
        self.core.working("planning");
        let result = self.plan(&input).await;
        self.core.finish(result, |plan| {
            format!("成功规划{}回章节内容", plan.chapters.len())
        })
    }
}
