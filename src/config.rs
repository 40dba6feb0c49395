//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `QUILL__*` 覆盖（双下划线表示嵌套，如 `QUILL__QUALITY__MIN_SCORE_THRESHOLD=7.5`）。
//! 启动时必须调用 [`AppConfig::validate`]：质量权重之和不为 1.0 等非法配置直接拒绝。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agents::quality::QualityWeights;
use crate::llm::RetryConfig;

/// 配置加载或校验失败
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Quality weights must be non-negative and sum to 1.0 (got {sum:.4})")]
    InvalidWeights { sum: f64 },

    #[error("Quality threshold must be within [0, 10] (got {0})")]
    InvalidThreshold(f64),

    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub generation: GenerationSection,
    pub quality: QualitySection,
    pub pipeline: PipelineSection,
}

/// [app] 段：应用名、日志级别、输出目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 默认日志级别，RUST_LOG 可覆盖
    pub log_level: String,
    /// 结果输出根目录
    pub output_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            log_level: "info".to_string(),
            output_dir: PathBuf::from("output"),
        }
    }
}

/// [llm] 段：后端、模型与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock；openai 在缺少 OPENAI_API_KEY 时回退到 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub retry: RetrySection,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            retry: RetrySection::default(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

/// [llm.retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 300 }
    }
}

/// [generation] 段：原著文本、章节数、起始回目与采样参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    /// 前八十回原文；未配置时知识库只用内置人物表
    pub source_file: Option<PathBuf>,
    pub chapters: u32,
    pub start_chapter: u32,
    pub words_per_chapter: u32,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            source_file: None,
            chapters: 1,
            start_chapter: 81,
            words_per_chapter: 2500,
            temperature: 0.8,
            max_tokens: 8000,
        }
    }
}

/// [quality] 段：四维权重、通过阈值、维度建议阈值、最大迭代次数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualitySection {
    pub style_weight: f64,
    pub character_weight: f64,
    pub plot_weight: f64,
    pub literary_weight: f64,
    pub min_score_threshold: f64,
    /// 维度分数低于此值时给出该维度的改进建议
    pub suggestion_threshold: f64,
    pub max_iterations: u32,
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            style_weight: 0.30,
            character_weight: 0.30,
            plot_weight: 0.25,
            literary_weight: 0.15,
            min_score_threshold: 7.0,
            suggestion_threshold: 7.0,
            max_iterations: 3,
        }
    }
}

impl QualitySection {
    pub fn weights(&self) -> Result<QualityWeights, ConfigError> {
        QualityWeights::new(
            self.style_weight,
            self.character_weight,
            self.plot_weight,
            self.literary_weight,
        )
    }
}

/// [pipeline] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// 章节规划是否为内容生成的硬依赖；false 时规划失败仍可按策略大纲生成
    pub require_chapter_plan: bool,
    /// 通信通道每个收件箱的容量上限
    pub channel_capacity: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            require_chapter_plan: true,
            channel_capacity: 256,
        }
    }
}

fn check_score_range(value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=10.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold(value))
    }
}

impl AppConfig {
    /// 启动期校验，任一项不合法即拒绝整份配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quality.weights()?;
        check_score_range(self.quality.min_score_threshold)?;
        check_score_range(self.quality.suggestion_threshold)?;
        if self.quality.max_iterations == 0 {
            return Err(ConfigError::InvalidValue(
                "quality.max_iterations must be at least 1".into(),
            ));
        }
        if self.llm.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "llm.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "pipeline.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 QUILL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 QUILL__*（双下划线表示嵌套键）
///
/// 只负责加载，校验由调用方显式调用 validate。
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, ignoring", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("QUILL")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.quality.max_iterations, 3);
        assert!(cfg.pipeline.require_chapter_plan);
    }

    #[test]
    fn test_weights_not_summing_to_one_rejected() {
        let mut cfg = AppConfig::default();
        cfg.quality.literary_weight = 0.25;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWeights { .. }));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut cfg = AppConfig::default();
        cfg.quality.min_score_threshold = 11.0;
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::InvalidThreshold(_)
        ));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let mut cfg = AppConfig::default();
        cfg.quality.max_iterations = 0;
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::InvalidValue(_)
        ));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[generation]\nsource_file = \"data/raw/hongloumeng_80.md\"\n\n\
             [quality]\nmin_score_threshold = 8.0\nmax_iterations = 5\n\n[pipeline]\nrequire_chapter_plan = false"
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.quality.min_score_threshold, 8.0);
        assert_eq!(cfg.quality.max_iterations, 5);
        assert!(!cfg.pipeline.require_chapter_plan);
        assert_eq!(
            cfg.generation.source_file.as_deref(),
            Some(std::path::Path::new("data/raw/hongloumeng_80.md"))
        );
        // 未出现的键保留默认值
        assert_eq!(cfg.quality.style_weight, 0.30);
        assert!(cfg.validate().is_ok());
    }
}
