//! 展示智能体：把最终内容与质量报告排成 markdown，并给出一行摘要

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::{Agent, AgentCore, ContentPayload, Dimension, QualityReport};
use crate::core::{AgentError, AgentResult, CommunicationChannel, PipelineRequest};

#[derive(Debug, Clone)]
pub struct PresentationInput {
    pub content: ContentPayload,
    pub quality: Option<QualityReport>,
    pub request: PipelineRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presentation {
    pub markdown: String,
    pub summary: String,
}

fn quality_section(report: &QualityReport, threshold: f64) -> String {
    let mut lines = vec![
        "## 质量评估".to_string(),
        String::new(),
        format!(
            "综合评分：**{:.1}/10**（{}）{}",
            report.overall_score,
            report.quality_level.label(),
            if report.meets(threshold) { "" } else { "，未达到质量阈值" }
        ),
        String::new(),
        "| 维度 | 分数 |".to_string(),
        "| --- | --- |".to_string(),
    ];
    for d in Dimension::ALL {
        if let Some(score) = report.score(d) {
            lines.push(format!("| {} | {:.1} |", d.label(), score));
        }
    }
    if !report.suggestions.is_empty() {
        lines.push(String::new());
        lines.push("### 改进建议".to_string());
        lines.push(String::new());
        lines.extend(report.suggestions.iter().map(|s| format!("- {}", s)));
    }
    lines.join("\n")
}

/// 排版；无章节时报错
pub fn render(input: &PresentationInput) -> Result<Presentation, AgentError> {
    if input.content.is_empty() {
        return Err(AgentError::InvalidInput("nothing to present".into()));
    }

    let mut sections = vec![
        "# 红楼梦续写".to_string(),
        format!("> 期望结局：{}", input.request.desired_ending),
        input.content.joined_text(),
    ];
    if let Some(report) = &input.quality {
        sections.push(quality_section(report, input.request.quality_threshold));
    }

    let first = input.content.chapters.first().map_or(0, |c| c.chapter_number);
    let last = input.content.chapters.last().map_or(0, |c| c.chapter_number);
    let summary = match &input.quality {
        Some(report) => format!(
            "第{}回至第{}回，共{}字，综合 {:.1} 分（{}）",
            first,
            last,
            input.content.stats.total_chars,
            report.overall_score,
            report.quality_level.label()
        ),
        None => format!(
            "第{}回至第{}回，共{}字，未经质量评估",
            first, last, input.content.stats.total_chars
        ),
    };

    Ok(Presentation {
        markdown: sections.join("\n\n"),
        summary,
    })
}

pub struct PresentationAgent {
    core: AgentCore,
}

impl PresentationAgent {
    pub fn new() -> Self {
        Self {
            core: AgentCore::new("presentation"),
        }
    }

    pub fn with_channel(mut self, channel: Arc<CommunicationChannel>) -> Self {
        self.core = self.core.with_channel(channel);
        self
    }
}

impl Default for PresentationAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for PresentationAgent {
    type Input = PresentationInput;
    type Output = Presentation;

    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process(&self, input: PresentationInput) -> AgentResult<Presentation> {
        self.core.working("formatting");
        let result = render(&input);
        self.core.finish(result, |p| p.summary.clone())
    }
}
