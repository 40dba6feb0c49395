//! 提示词模板：每个角色一套 system + user 模板
//!
//! user 模板中的 `{key}` 由 [`PromptTemplate::render`] 替换；未提供的占位符原样保留。

use crate::llm::GenerationRequest;

/// 单个角色的提示词模板与采样参数
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub name: &'static str,
    pub system_message: &'static str,
    pub user_template: &'static str,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl PromptTemplate {
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        vars.iter().fold(self.user_template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{}}}", key), value)
        })
    }

    /// 渲染并带上本模板的 system 消息与采样参数
    pub fn request(&self, vars: &[(&str, &str)]) -> GenerationRequest {
        GenerationRequest::new(self.render(vars))
            .with_system(self.system_message)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }
}

pub const KNOWLEDGE: PromptTemplate = PromptTemplate {
    name: "红楼梦知识专家",
    system_message: "你熟读《红楼梦》前八十回，能准确概括人物性格、人物关系与各条情节线索的现状。",
    user_template: "原文末尾节选：{context}\n\
        请用三五句话概要前八十回结束时的局面，重点说明以下人物的处境：{characters}。\n\
        读者期望的结局是：{ending}。只输出概要正文。",
    temperature: 0.3,
    max_tokens: 2000,
};

pub const STRATEGY: PromptTemplate = PromptTemplate {
    name: "续写策略规划师",
    system_message: "你是红楼梦研究者与古典小说作者，负责为后续回目设计整体续写策略，\
        要求继承原著的现实主义精神与人物性格，保持家族兴衰与宝黛爱情两条主线。",
    user_template: "读者期望的结局：{ending}\n需要续写 {chapters} 回，从第{start}回开始。\n\
        请给出：总体思路（一句话）、三到四个核心主题、叙事风格、情感走向。",
    temperature: 0.7,
    max_tokens: 4000,
};

pub const CHAPTER_PLAN: PromptTemplate = PromptTemplate {
    name: "章节规划师",
    system_message: "你负责为古典章回小说规划回目，每回给出对仗的上下句回目名。",
    user_template: "第{chapter}回处于「{phase}」阶段，重点是{focus}。\n\
        关键事件：{events}\n请只输出本回回目，格式为「上句 下句」。",
    temperature: 0.7,
    max_tokens: 300,
};

pub const CONTENT: PromptTemplate = PromptTemplate {
    name: "古典文学创作者",
    system_message: "你是精通明清白话小说的作家，用雅致古朴的章回体语言续写《红楼梦》，\
        开篇用「话说」「却说」，回末以「且听下回分解」收束，适当穿插诗词。",
    user_template: "请创作第{chapter}回「{title}」，约{words}字。\n\
        本回阶段：{phase}\n关键情节：{events}\n出场人物：{characters}\n主题：{themes}\n\
        读者期望的结局：{ending}\n\n参考上下文：\n{context}",
    temperature: 0.8,
    max_tokens: 8000,
};

pub const IMPROVEMENT: PromptTemplate = PromptTemplate {
    name: "古典文学修订者",
    system_message: "你是精通明清白话小说的作家，根据评审意见修订已有章回，保留原有情节脉络，只改进表达。",
    user_template: "{feedback}\n\n原始章节内容：\n{original}\n\n\
        请在保持情节连贯的前提下重写本回，提升古典韵味与人物刻画，直接输出修订后的正文。",
    temperature: 0.7,
    max_tokens: 4000,
};

pub const QUALITY: PromptTemplate = PromptTemplate {
    name: "文学评论家",
    system_message: "你是古典文学评论家，评判续写文本与《红楼梦》原著语言风格的一致程度。",
    user_template: "请评估下面这段续写的语言风格是否具有古典小说特征。\n\
        先给出一行「评分: X」（0 到 10 分），再用一两句话说明理由。\n\n{content}",
    temperature: 0.4,
    max_tokens: 1500,
};
