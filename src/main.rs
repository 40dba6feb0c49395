//! Quill 命令行入口：运行续写流水线或检查配置

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quill::config::{load_config, AppConfig};
use quill::core::{Orchestrator, PipelineRequest, PresentationView};
use quill::llm::create_llm_from_config;
use quill::output::{default_dir, ResultWriter};

/// Quill - 多智能体古典小说续写
#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(version, about = "Multi-agent classical novel continuation with quality feedback")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 运行续写流水线
    Run {
        /// 期望的结局
        #[arg(short, long)]
        ending: String,

        /// 续写回数
        #[arg(short = 'n', long)]
        chapters: Option<u32>,

        /// 质量阈值（0-10）
        #[arg(short, long)]
        threshold: Option<f64>,

        /// 起始回数
        #[arg(long)]
        start_chapter: Option<u32>,

        /// 输出目录，默认 <output_dir>/continuation_<时间戳>
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 配置文件路径
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// 使用离线 Mock 生成服务
        #[arg(long)]
        mock: bool,
    },
    /// 加载并校验配置
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load(path: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    let cfg = load_config(path).context("Failed to load configuration")?;
    cfg.validate().context("Invalid configuration")?;
    Ok(cfg)
}

async fn run(
    ending: String,
    chapters: Option<u32>,
    threshold: Option<f64>,
    start_chapter: Option<u32>,
    output: Option<PathBuf>,
    mut cfg: AppConfig,
    mock: bool,
) -> anyhow::Result<bool> {
    if mock {
        cfg.llm.provider = "mock".to_string();
    }
    let orchestrator = Orchestrator::from_config(&cfg, create_llm_from_config(&cfg))
        .context("Failed to build orchestrator")?;

    let request = PipelineRequest::new(ending, chapters.unwrap_or(cfg.generation.chapters))
        .with_threshold(threshold.unwrap_or(cfg.quality.min_score_threshold))
        .with_start_chapter(start_chapter.unwrap_or(cfg.generation.start_chapter));

    println!(
        "开始续写：第{}回起，共{}回，质量阈值 {:.1}",
        request.start_chapter_index, request.chapter_count, request.quality_threshold
    );
    let result = orchestrator.run(request).await;

    println!("\n智能体状态：");
    for record in orchestrator.agents_status() {
        println!("  {:<14} {}", record.agent, record.status);
    }
    println!("\n{}", result.message);
    if let Some(PresentationView::Formatted(p)) = result.data.as_ref().and_then(|o| o.presentation.as_ref()) {
        println!("{}", p.summary);
    }
    for key in ["refinement_outcome", "iterations", "threshold_met", "formatting_degraded"] {
        if let Some(value) = result.metadata.get(key) {
            println!("  {}: {}", key, value);
        }
    }

    let dir = output.unwrap_or_else(|| default_dir(&cfg.app.output_dir));
    ResultWriter::save(&result, &dir)
        .with_context(|| format!("Failed to save results to {}", dir.display()))?;
    println!("\n结果已保存到 {}", dir.display());

    Ok(result.success)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    // 先以默认级别启动日志，加载配置时的告警才能输出
    let log = quill::observability::init("info");

    match cli.command {
        Command::Run {
            ending,
            chapters,
            threshold,
            start_chapter,
            output,
            config,
            mock,
        } => {
            let cfg = load(config)?;
            log.set_level(&cfg.app.log_level);
            let ok = run(ending, chapters, threshold, start_chapter, output, cfg, mock).await?;
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::CheckConfig { config } => {
            let cfg = load(config)?;
            let weights = cfg.quality.weights()?;
            println!("配置有效");
            println!("  provider: {} ({})", cfg.llm.provider, cfg.llm.model);
            for dimension in quill::agents::Dimension::ALL {
                println!("  {:<20} {:.2}", dimension.key(), weights.weight(dimension));
            }
            println!("  threshold: {:.1}", cfg.quality.min_score_threshold);
            println!("  max_iterations: {}", cfg.quality.max_iterations);
            Ok(ExitCode::SUCCESS)
        }
    }
}
