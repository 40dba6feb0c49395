//! 质量评分：维度、权重、综合分、等级与改进建议
//!
//! 综合分 = Σ(维度分 × 权重)，保留一位小数，恒在 [0, 10]；权重必须非负且和为 1.0。
//! 等级是综合分的阶梯函数，分界 [`LEVEL_BOUNDS`] 严格递减，覆盖整个 [0, 10]。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    StyleConsistency,
    CharacterAccuracy,
    PlotReasonability,
    LiteraryQuality,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::StyleConsistency,
        Dimension::CharacterAccuracy,
        Dimension::PlotReasonability,
        Dimension::LiteraryQuality,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Dimension::StyleConsistency => "style_consistency",
            Dimension::CharacterAccuracy => "character_accuracy",
            Dimension::PlotReasonability => "plot_reasonability",
            Dimension::LiteraryQuality => "literary_quality",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Dimension::StyleConsistency => "风格一致性",
            Dimension::CharacterAccuracy => "人物准确性",
            Dimension::PlotReasonability => "情节合理性",
            Dimension::LiteraryQuality => "文学性",
        }
    }

    fn suggestions(&self) -> [&'static str; 3] {
        match self {
            Dimension::StyleConsistency => [
                "多用古典小说惯用语，如「话说」「原来」",
                "注意文白比例，避免现代口语",
                "加强比喻、对仗等修辞",
            ],
            Dimension::CharacterAccuracy => [
                "贴合人物既有性格，避免行为前后矛盾",
                "对话要合乎身份，避免千人一面",
                "人物变化要有铺垫",
            ],
            Dimension::PlotReasonability => [
                "理顺情节因果，避免突兀转折",
                "加强与前文的衔接照应",
                "把握叙事节奏，张弛有度",
            ],
            Dimension::LiteraryQuality => [
                "增加景物与意象描写",
                "深化情感表达，避免流于表面",
                "适当融入诗词等古典元素",
            ],
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

pub type DimensionScores = BTreeMap<Dimension, f64>;

/// 四维权重
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    style: f64,
    character: f64,
    plot: f64,
    literary: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            style: 0.30,
            character: 0.30,
            plot: 0.25,
            literary: 0.15,
        }
    }
}

impl QualityWeights {
    /// 权重须为非负有限值且和为 1.0
    pub fn new(style: f64, character: f64, plot: f64, literary: f64) -> Result<Self, ConfigError> {
        let weights = [style, character, plot, literary];
        let sum: f64 = weights.iter().sum();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::InvalidWeights { sum });
        }
        Ok(Self {
            style,
            character,
            plot,
            literary,
        })
    }

    pub fn weight(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::StyleConsistency => self.style,
            Dimension::CharacterAccuracy => self.character,
            Dimension::PlotReasonability => self.plot,
            Dimension::LiteraryQuality => self.literary,
        }
    }

    /// 加权综合分；缺失维度按 0 分计
    pub fn overall_score(&self, scores: &DimensionScores) -> f64 {
        let total: f64 = Dimension::ALL
            .iter()
            .map(|d| scores.get(d).copied().unwrap_or(0.0).clamp(0.0, 10.0) * self.weight(*d))
            .sum();
        ((total * 10.0).round() / 10.0).clamp(0.0, 10.0)
    }
}

/// 等级分界（自高到低）
pub const LEVEL_BOUNDS: [f64; 5] = [9.0, 8.0, 7.0, 6.0, 5.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    NeedsRewrite,
    NeedsImprovement,
    Passable,
    Good,
    Excellent,
    Masterful,
}

impl QualityLevel {
    /// 与 LEVEL_BOUNDS 一一对应
    const DESCENDING: [QualityLevel; 5] = [
        QualityLevel::Masterful,
        QualityLevel::Excellent,
        QualityLevel::Good,
        QualityLevel::Passable,
        QualityLevel::NeedsImprovement,
    ];

    pub fn from_score(score: f64) -> Self {
        LEVEL_BOUNDS
            .iter()
            .zip(Self::DESCENDING)
            .find(|(bound, _)| score >= **bound)
            .map(|(_, level)| level)
            .unwrap_or(QualityLevel::NeedsRewrite)
    }

    pub fn label(&self) -> &'static str {
        match self {
            QualityLevel::Masterful => "大师级",
            QualityLevel::Excellent => "优秀",
            QualityLevel::Good => "良好",
            QualityLevel::Passable => "合格",
            QualityLevel::NeedsImprovement => "待改进",
            QualityLevel::NeedsRewrite => "需要重写",
        }
    }
}

/// 低于 sub_threshold 的维度各给三条建议，再按综合分给一条整体建议
pub fn improvement_suggestions(scores: &DimensionScores, overall: f64, sub_threshold: f64) -> Vec<String> {
    let mut suggestions: Vec<String> = scores
        .iter()
        .filter(|(_, score)| **score < sub_threshold)
        .flat_map(|(d, _)| d.suggestions())
        .map(String::from)
        .collect();

    let holistic = if overall < 7.0 {
        "重新构思章节结构，提升故事的艺术张力"
    } else if overall < 8.0 {
        "加强人物心理描写，深化情感表达"
    } else {
        "整体质量良好，可进一步打磨语言细节"
    };
    suggestions.push(holistic.to_string());
    suggestions
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub overall_score: f64,
    pub dimension_scores: DimensionScores,
    pub suggestions: Vec<String>,
    pub quality_level: QualityLevel,
    pub assessed_at: DateTime<Utc>,
}

impl QualityReport {
    pub fn from_scores(scores: DimensionScores, weights: &QualityWeights, sub_threshold: f64) -> Self {
        let overall_score = weights.overall_score(&scores);
        Self {
            suggestions: improvement_suggestions(&scores, overall_score, sub_threshold),
            quality_level: QualityLevel::from_score(overall_score),
            overall_score,
            dimension_scores: scores,
            assessed_at: Utc::now(),
        }
    }

    /// 阈值比较为包含式
    pub fn meets(&self, threshold: f64) -> bool {
        self.overall_score >= threshold
    }

    /// 低于 sub_threshold 的维度描述
    pub fn issues(&self, sub_threshold: f64) -> Vec<String> {
        self.dimension_scores
            .iter()
            .filter(|(_, s)| **s < sub_threshold)
            .map(|(d, s)| format!("{}({}) 当前 {:.1}/10", d.label(), d.key(), s))
            .collect()
    }

    pub fn score(&self, dimension: Dimension) -> Option<f64> {
        self.dimension_scores.get(&dimension).copied()
    }
}
