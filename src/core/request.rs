//! 续写请求：接受后不可变，运行任何智能体之前先校验

use serde::{Deserialize, Serialize};

use crate::core::PipelineError;

/// 默认质量阈值（0–10）
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 7.0;
/// 默认起始回目
pub const DEFAULT_START_CHAPTER: u32 = 81;
/// 单次请求最多续写的回数
pub const MAX_CHAPTER_COUNT: u32 = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub desired_ending: String,
    pub chapter_count: u32,
    pub quality_threshold: f64,
    pub start_chapter_index: u32,
}

impl PipelineRequest {
    pub fn new(desired_ending: impl Into<String>, chapter_count: u32) -> Self {
        Self {
            desired_ending: desired_ending.into(),
            chapter_count,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            start_chapter_index: DEFAULT_START_CHAPTER,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    pub fn with_start_chapter(mut self, start: u32) -> Self {
        self.start_chapter_index = start;
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.desired_ending.trim().is_empty() {
            return Err(PipelineError::Validation(
                "desired_ending is required".into(),
            ));
        }
        if self.chapter_count == 0 {
            return Err(PipelineError::Validation(
                "chapter_count must be at least 1".into(),
            ));
        }
        if self.chapter_count > MAX_CHAPTER_COUNT {
            return Err(PipelineError::Validation(format!(
                "chapter_count must be at most {}, got {}",
                MAX_CHAPTER_COUNT, self.chapter_count
            )));
        }
        if self.start_chapter_index.checked_add(self.chapter_count).is_none() {
            return Err(PipelineError::Validation(format!(
                "start_chapter_index {} leaves no room for {} chapters",
                self.start_chapter_index, self.chapter_count
            )));
        }
        if !self.quality_threshold.is_finite() || !(0.0..=10.0).contains(&self.quality_threshold) {
            return Err(PipelineError::Validation(format!(
                "quality_threshold must be within [0, 10], got {}",
                self.quality_threshold
            )));
        }
        Ok(())
    }

    /// 第 i 章（从 0 开始）的回目编号；validate 通过后不会饱和
    pub fn chapter_number(&self, offset: u32) -> u32 {
        self.start_chapter_index.saturating_add(offset)
    }
}
