//! Mock 生成客户端（用于测试与离线运行，无需 API）
//!
//! 未指定固定回复时，根据请求内容给出确定性的文本：评估类请求返回带分数的评语，概要与回目请求返回短句，
//! 其余返回一段古典小说风格的正文。

use async_trait::async_trait;

use crate::llm::{Generation, GenerationRequest, LlmClient, LlmError, TokenUsage};

/// Mock 客户端
#[derive(Debug, Default, Clone)]
pub struct MockLlmClient {
    reply: Option<String>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有请求都返回同一段文本
    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
        }
    }

    fn compose(request: &GenerationRequest) -> String {
        let prompt = request.prompt.as_str();
        if prompt.contains("评分") || prompt.contains("SCORE") {
            return "评分: 7.5\n语言风格良好，古典韵味尚可，可进一步锤炼辞藻。".to_string();
        }
        if prompt.contains("概要") {
            return "本回承接前文，人物心事渐显，家族境况暗生波澜。".to_string();
        }
        if prompt.contains("回目") {
            return "感秋声抚琴悲往事 坐禅寂走火入邪魔".to_string();
        }
        let opening = prompt
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("续写")
            .trim();
        format!(
            "话说{opening}，却说园中月下花开，风吹竹影。宝玉独自思念黛玉，心中伤感，只见紫鹃走来。\n\n\
             原来贾母早有安排，谁知事出突然，众人不想竟有此变。诗曰：\n\n\
             花谢花飞飞满天，红消香断有谁怜。\n\n\
             正是：悲喜千般同幻渺，古今一梦尽荒唐。欲知后事如何，且听下回分解。"
        )
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, LlmError> {
        let content = match &self.reply {
            Some(reply) => reply.clone(),
            None => Self::compose(request),
        };
        let usage = TokenUsage::new(
            request.prompt.chars().count() as u64,
            content.chars().count() as u64,
        );
        Ok(Generation {
            content,
            model: "mock".to_string(),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_scoring_reply() {
        let client = MockLlmClient::new();
        let gen = client
            .generate(&GenerationRequest::new("请给出评分"))
            .await
            .unwrap();
        assert!(gen.content.contains("评分"));
    }

    #[tokio::test]
    async fn test_mock_chapter_title_reply() {
        let client = MockLlmClient::new();
        let gen = client
            .generate(&GenerationRequest::new("请只输出本回回目"))
            .await
            .unwrap();
        assert_eq!(gen.content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_mock_fixed_reply() {
        let client = MockLlmClient::with_reply("fixed");
        let gen = client.generate(&GenerationRequest::new("anything")).await.unwrap();
        assert_eq!(gen.content, "fixed");
        assert_eq!(gen.model, "mock");
    }
}
