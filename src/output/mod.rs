//! 结果落盘：把流水线聚合结果写成目录
//!
//! ```text
//! <dir>/summary.json          成功与否、消息、时间、元数据
//! <dir>/details.json          完整聚合结果（仅成功时）
//! <dir>/chapters/chapter_NNN.md
//! <dir>/strategy_outline.md
//! <dir>/quality_report.md
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde_json::json;
use thiserror::Error;

use crate::agents::{ChapterText, QualityReport, Strategy};
use crate::core::{AgentResult, PipelineOutput};

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// `<output_dir>/continuation_<YYYYmmdd_HHMMSS>`
pub fn default_dir(output_dir: &Path) -> PathBuf {
    output_dir.join(format!("continuation_{}", Local::now().format("%Y%m%d_%H%M%S")))
}

fn chapter_markdown(chapter: &ChapterText) -> String {
    format!("# 第{}回 {}\n\n{}\n", chapter.chapter_number, chapter.title, chapter.text)
}

fn strategy_markdown(strategy: &Strategy) -> String {
    let mut lines = vec![
        "# 续写策略".to_string(),
        String::new(),
        format!("- 期望结局：{}", strategy.desired_ending),
        format!(
            "- 兼容性：{:.2}（{}）",
            strategy.compatibility.score, strategy.compatibility.reason
        ),
        format!("- 总体思路：{}", strategy.overall.approach),
        format!("- 核心主题：{}", strategy.overall.key_themes.join("、")),
        format!("- 叙事风格：{}", strategy.overall.narrative_style),
        String::new(),
        "## 情节大纲".to_string(),
        String::new(),
    ];
    for entry in &strategy.plot_outline {
        lines.push(format!(
            "- 第{}回 [{}] {}：{}",
            entry.chapter_number,
            entry.phase,
            entry.focus,
            entry.key_events.join("；")
        ));
    }
    lines.push(String::new());
    lines.push("## 人物弧线".to_string());
    lines.push(String::new());
    for (name, stages) in &strategy.character_arcs {
        lines.push(format!("- {}：{}", name, stages.join(" → ")));
    }
    lines.join("\n") + "\n"
}

fn quality_markdown(report: &QualityReport) -> String {
    let mut lines = vec![
        "# 质量报告".to_string(),
        String::new(),
        format!(
            "综合评分：{:.1}/10（{}）",
            report.overall_score,
            report.quality_level.label()
        ),
        String::new(),
    ];
    for (dimension, score) in &report.dimension_scores {
        lines.push(format!("- {}：{:.1}", dimension.label(), score));
    }
    if !report.suggestions.is_empty() {
        lines.push(String::new());
        lines.push("## 改进建议".to_string());
        lines.push(String::new());
        lines.extend(report.suggestions.iter().map(|s| format!("- {}", s)));
    }
    lines.join("\n") + "\n"
}

/// 结果写入器
pub struct ResultWriter;

impl ResultWriter {
    /// 写入 dir（不存在则创建），返回写出的文件列表
    pub fn save(result: &AgentResult<PipelineOutput>, dir: &Path) -> Result<Vec<PathBuf>, OutputError> {
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        let mut write = |name: PathBuf, body: String| -> Result<(), OutputError> {
            fs::write(&name, body)?;
            written.push(name);
            Ok(())
        };

        let output = result.data.as_ref();
        let summary = json!({
            "success": result.success,
            "message": result.message,
            "timestamp": Local::now().to_rfc3339(),
            "chapters": output.and_then(|o| o.content.as_ref()).map_or(0, |c| c.chapters.len()),
            "overall_score": output.and_then(|o| o.quality.as_ref()).map(|q| q.overall_score),
            "metadata": result.metadata,
        });
        write(dir.join("summary.json"), serde_json::to_string_pretty(&summary)?)?;

        let Some(output) = output else {
            tracing::info!(dir = %dir.display(), "Saved failure summary");
            return Ok(written);
        };
        if result.success {
            write(dir.join("details.json"), serde_json::to_string_pretty(output)?)?;
        }

        if let Some(content) = &output.content {
            let chapters_dir = dir.join("chapters");
            fs::create_dir_all(&chapters_dir)?;
            for chapter in &content.chapters {
                write(
                    chapters_dir.join(format!("chapter_{:03}.md", chapter.chapter_number)),
                    chapter_markdown(chapter),
                )?;
            }
        }
        if let Some(strategy) = &output.strategy {
            write(dir.join("strategy_outline.md"), strategy_markdown(strategy))?;
        }
        if let Some(quality) = &output.quality {
            write(dir.join("quality_report.md"), quality_markdown(quality))?;
        }

        tracing::info!(dir = %dir.display(), files = written.len(), "Results saved");
        Ok(written)
    }
}
