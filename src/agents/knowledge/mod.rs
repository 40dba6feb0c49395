//! 知识库智能体：整理前八十回的人物、情节线与主题
//!
//! 人物表、情节线、主题为内置数据；配置了原著文本时另外统计文本与人物频次，并按频次排列人物，
//! 原著文本读取失败则本阶段失败。局面概要由生成服务给出，调用失败时退回内置概要，不使本阶段失败。

pub mod source;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::{Agent, AgentCore};
use crate::core::{AgentError, AgentResult, CommunicationChannel, PipelineRequest};
use crate::llm::GenerationService;
use crate::prompts;

pub use source::{load_source, split_chapters, SourceChapter, SourceText, TextStatistics};

/// 概要提示中附带的原文节选字数
const CONTEXT_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    pub personality: String,
    pub situation: String,
    /// 续写中的发展方向
    pub direction: String,
    pub relations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub characters: Vec<CharacterProfile>,
    pub plotlines: Vec<String>,
    pub themes: Vec<String>,
    pub style_notes: Vec<String>,
    pub summary: String,
    /// 概要是否来自生成服务（否则为内置概要）
    pub summary_generated: bool,
    /// 未配置原著文本时为 None
    pub text_statistics: Option<TextStatistics>,
}

impl KnowledgeBase {
    pub fn character(&self, name: &str) -> Option<&CharacterProfile> {
        self.characters.iter().find(|c| c.name == name)
    }

    pub fn character_names(&self) -> Vec<&str> {
        self.characters.iter().map(|c| c.name.as_str()).collect()
    }

    /// 供提示词使用的人物性格摘要（最多 limit 位）
    pub fn personality_digest(&self, limit: usize) -> String {
        self.characters
            .iter()
            .take(limit)
            .map(|c| format!("{}: {}", c.name, c.personality))
            .collect::<Vec<_>>()
            .join("；")
    }
}

const FALLBACK_SUMMARY: &str = "前八十回终了，贾府外强中干，宝黛情深而多阻，宝钗深得长辈欢心，诸般伏线尚待收束。";

fn profile(name: &str, personality: &str, situation: &str, direction: &str, relations: &[&str]) -> CharacterProfile {
    CharacterProfile {
        name: name.to_string(),
        personality: personality.to_string(),
        situation: situation.to_string(),
        direction: direction.to_string(),
        relations: relations.iter().map(|r| r.to_string()).collect(),
    }
}

/// 内置人物表
pub fn builtin_characters() -> Vec<CharacterProfile> {
    vec![
        profile(
            "贾宝玉",
            "纯真多情 厌弃功名",
            "屡经变故，对仕途经济愈发疏离",
            "寻求精神解脱",
            &["林黛玉", "薛宝钗", "贾母", "王夫人", "贾政"],
        ),
        profile(
            "林黛玉",
            "聪慧敏感 孤高自许",
            "体弱多病，寄人篱下，心事难言",
            "坚守真情",
            &["贾宝玉", "贾母", "紫鹃"],
        ),
        profile(
            "薛宝钗",
            "端庄稳重 通达世故",
            "深得长辈喜爱，金玉之说流传府中",
            "顺应礼法安排",
            &["贾宝玉", "王夫人", "薛姨妈", "香菱"],
        ),
        profile(
            "王熙凤",
            "精明强干 机变权谋",
            "掌家多年，亏空渐显",
            "权势由盛转衰",
            &["贾琏", "贾母", "平儿"],
        ),
        profile(
            "贾母",
            "慈爱通达 重视门第",
            "年事渐高，仍为府中主心骨",
            "护佑儿孙而力不从心",
            &["贾宝玉", "林黛玉", "王熙凤"],
        ),
    ]
}

fn builtin_knowledge() -> KnowledgeBase {
    KnowledgeBase {
        characters: builtin_characters(),
        plotlines: vec![
            "宝黛爱情线：相思、误会、和解、考验".to_string(),
            "贾府兴衰线：预兆、危机、崩溃、归结".to_string(),
            "金玉良缘线：长辈属意与宝玉本心的冲突".to_string(),
        ],
        themes: vec![
            "爱情与婚姻".to_string(),
            "家族兴衰".to_string(),
            "封建礼教".to_string(),
            "个人命运".to_string(),
            "人生哲理".to_string(),
        ],
        style_notes: vec![
            "章回体，回首「话说」「却说」，回末「且听下回分解」".to_string(),
            "诗词穿插，以景写情".to_string(),
            "第三人称全知视角，详略得当".to_string(),
        ],
        summary: FALLBACK_SUMMARY.to_string(),
        summary_generated: false,
        text_statistics: None,
    }
}

/// 按原文出现频次重排人物，频次相同保持原顺序
fn rank_characters(characters: &mut [CharacterProfile], stats: &TextStatistics) {
    characters.sort_by_key(|c| std::cmp::Reverse(stats.frequency(&c.name)));
}

pub struct KnowledgeAgent {
    core: AgentCore,
    service: GenerationService,
    source_file: Option<PathBuf>,
}

impl KnowledgeAgent {
    pub fn new(service: GenerationService) -> Self {
        Self {
            core: AgentCore::new("knowledge"),
            service,
            source_file: None,
        }
    }

    /// 原著文本路径（按「第N回」标题分回）
    pub fn with_source_file(mut self, path: Option<PathBuf>) -> Self {
        self.source_file = path;
        self
    }

    pub fn with_channel(mut self, channel: Arc<CommunicationChannel>) -> Self {
        self.core = self.core.with_channel(channel);
        self
    }

    async fn build(&self, request: &PipelineRequest) -> Result<KnowledgeBase, AgentError> {
        let mut knowledge = builtin_knowledge();

        let mut context = String::from("（未提供原文）");
        if let Some(path) = &self.source_file {
            self.core.working("loading source text");
            let source = load_source(path).await?;
            rank_characters(&mut knowledge.characters, &source.stats);
            let excerpt = source.closing_excerpt(CONTEXT_EXCERPT_CHARS);
            if !excerpt.is_empty() {
                context = excerpt;
            }
            knowledge.text_statistics = Some(source.stats);
        }

        self.core.working("summarizing");
        let names = knowledge.character_names().join("、");
        let summary_request = prompts::KNOWLEDGE.request(&[
            ("characters", names.as_str()),
            ("ending", request.desired_ending.as_str()),
            ("context", context.as_str()),
        ]);
        match self.service.complete(&summary_request).await {
            Ok(summary) => {
                knowledge.summary = summary.trim().to_string();
                knowledge.summary_generated = true;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Knowledge summary unavailable, using built-in summary");
            }
        }
        Ok(knowledge)
    }
}

#[async_trait]
impl Agent for KnowledgeAgent {
    type Input = PipelineRequest;
    type Output = KnowledgeBase;

    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, input: PipelineRequest) -> AgentResult<KnowledgeBase> {
        self.core.working("building knowledge base");
        let result = self.build(&input).await;
        self.core.finish(result, |kb| match &kb.text_statistics {
            Some(stats) => format!(
                "知识库构建完成，人物 {} 位，原文 {} 回",
                kb.characters.len(),
                stats.chapter_count
            ),
            None => format!("知识库构建完成，人物 {} 位", kb.characters.len()),
        })
    }
}
