//! 原著文本：读取、按回拆分、文本统计与人物出现频次
//!
//! 分词用 jieba，先把书中人名登记为词，避免「贾宝玉」被切成「贾」「宝玉」。

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use jieba_rs::Jieba;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 登记到分词词典并统计出现频次的人名
pub const TRACKED_NAMES: &[&str] = &[
    "贾宝玉", "林黛玉", "薛宝钗", "王熙凤", "贾母", "贾政", "王夫人", "贾琏", "贾珍", "贾蓉",
    "史湘云", "妙玉", "贾探春", "贾迎春", "贾惜春", "尤二姐", "尤三姐", "秦可卿", "李纨", "平儿",
    "鸳鸯", "袭人", "晴雯", "紫鹃", "小红", "茗烟", "焦大", "刘姥姥", "板儿", "贾雨村", "甄士隐",
    "英莲", "香菱", "金钏", "玉钏", "薛姨妈",
];

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn jieba() -> &'static Jieba {
    JIEBA.get_or_init(|| {
        let mut jieba = Jieba::new();
        for name in TRACKED_NAMES {
            jieba.add_word(name, None, Some("nr"));
        }
        jieba
    })
}

/// 回目标题行，可带 Markdown 标题前缀，如 `### 第八十回 美香菱屈受贪夫棒`
fn heading_regex() -> Option<&'static Regex> {
    static HEADING: OnceLock<Option<Regex>> = OnceLock::new();
    HEADING
        .get_or_init(|| {
            Regex::new(r"(?m)^[ \t]*(?:#{1,6}[ \t]*)?(第[一二三四五六七八九十百零〇\d]+回)[^\n]*$").ok()
        })
        .as_ref()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceChapter {
    /// 在原文中的顺序，从 1 开始
    pub index: usize,
    pub heading: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextStatistics {
    pub char_count: usize,
    pub word_count: usize,
    pub chapter_count: usize,
    pub avg_chapter_length: usize,
    /// 只含出现过的人名
    pub character_frequency: BTreeMap<String, usize>,
}

impl TextStatistics {
    pub fn frequency(&self, name: &str) -> usize {
        self.character_frequency.get(name).copied().unwrap_or(0)
    }

    /// 出现最多的 n 个人名，频次相同按名字排序
    pub fn most_frequent(&self, n: usize) -> Vec<(&str, usize)> {
        let mut ranked: Vec<(&str, usize)> = self
            .character_frequency
            .iter()
            .map(|(name, count)| (name.as_str(), *count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked.truncate(n);
        ranked
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceText {
    pub chapters: Vec<SourceChapter>,
    pub stats: TextStatistics,
}

/// 按回目标题拆分；标题之前的前言不计入任何一回
pub fn split_chapters(text: &str) -> Vec<SourceChapter> {
    let Some(heading) = heading_regex() else {
        return Vec::new();
    };
    let matches: Vec<_> = heading.find_iter(text).collect();
    matches
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let end = matches.get(i + 1).map_or(text.len(), |next| next.start());
            SourceChapter {
                index: i + 1,
                heading: m.as_str().trim().trim_start_matches('#').trim().to_string(),
                body: text[m.end()..end].trim().to_string(),
            }
        })
        .collect()
}

impl SourceText {
    pub fn parse(text: &str) -> Self {
        let chapters = split_chapters(text);
        let tracked: HashSet<&str> = TRACKED_NAMES.iter().copied().collect();

        let mut word_count = 0;
        let mut character_frequency = BTreeMap::new();
        for word in jieba().cut(text, false) {
            if word.trim().is_empty() {
                continue;
            }
            word_count += 1;
            if tracked.contains(word) {
                *character_frequency.entry(word.to_string()).or_insert(0) += 1;
            }
        }

        let char_count = text.chars().count();
        let chapter_count = chapters.len();
        let stats = TextStatistics {
            char_count,
            word_count,
            chapter_count,
            avg_chapter_length: if chapter_count > 0 { char_count / chapter_count } else { 0 },
            character_frequency,
        };
        Self { chapters, stats }
    }

    /// 最后一回结尾的 max_chars 个字，作为续写衔接的原文节选
    pub fn closing_excerpt(&self, max_chars: usize) -> String {
        let Some(last) = self.chapters.last() else {
            return String::new();
        };
        let total = last.body.chars().count();
        last.body.chars().skip(total.saturating_sub(max_chars)).collect()
    }
}

/// 读取并解析原著文本；文件缺失、不可读或为空都视为输入错误
pub async fn load_source(path: &Path) -> Result<SourceText, AgentError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        AgentError::InvalidInput(format!("cannot read source text {}: {}", path.display(), e))
    })?;
    if text.trim().is_empty() {
        return Err(AgentError::InvalidInput(format!(
            "source text {} is empty",
            path.display()
        )));
    }
    // 分词是 CPU 密集操作，放到阻塞线程池
    let source = tokio::task::spawn_blocking(move || SourceText::parse(&text))
        .await
        .map_err(|e| AgentError::Processing(format!("source parsing aborted: {}", e)))?;
    tracing::info!(
        path = %path.display(),
        chapters = source.stats.chapter_count,
        words = source.stats.word_count,
        "Source text loaded"
    );
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "红楼梦\n\n### 第一回 甄士隐梦幻识通灵\n\n甄士隐梦中得见一僧一道。\n\n\
        ### 第二回 贾夫人仙逝扬州城\n\n贾宝玉与林黛玉初会，贾宝玉摔玉。\n";

    #[test]
    fn test_split_chapters_by_heading() {
        let chapters = split_chapters(SAMPLE);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].index, 1);
        assert_eq!(chapters[0].heading, "第一回 甄士隐梦幻识通灵");
        assert_eq!(chapters[0].body, "甄士隐梦中得见一僧一道。");
        assert!(chapters[1].body.starts_with("贾宝玉与林黛玉初会"));
    }

    #[test]
    fn test_plain_and_numeric_headings() {
        let chapters = split_chapters("第80回 美香菱屈受贪夫棒\n正文\n第八十一回 占旺相四美钓游鱼\n续文");
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1].body, "续文");
        assert!(split_chapters("没有回目的文字").is_empty());
    }

    #[test]
    fn test_statistics_count_tracked_names() {
        let source = SourceText::parse(SAMPLE);
        assert_eq!(source.stats.chapter_count, 2);
        assert_eq!(source.stats.frequency("贾宝玉"), 2);
        assert_eq!(source.stats.frequency("林黛玉"), 1);
        assert_eq!(source.stats.frequency("王熙凤"), 0);
        assert!(!source.stats.character_frequency.contains_key("王熙凤"));
        assert_eq!(source.stats.most_frequent(1), vec![("贾宝玉", 2)]);
        assert!(source.stats.word_count > 0);
        assert_eq!(source.stats.avg_chapter_length, SAMPLE.chars().count() / 2);
    }

    #[test]
    fn test_closing_excerpt_takes_tail_of_last_chapter() {
        let source = SourceText::parse(SAMPLE);
        assert_eq!(source.closing_excerpt(3), "摔玉。");
        assert_eq!(SourceText::parse("无回目").closing_excerpt(10), "");
    }

    #[tokio::test]
    async fn test_load_source_rejects_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_source(&dir.path().join("absent.md")).await.unwrap_err();
        assert!(matches!(missing, AgentError::InvalidInput(_)));

        let empty = dir.path().join("empty.md");
        std::fs::write(&empty, "  \n").unwrap();
        assert!(matches!(load_source(&empty).await, Err(AgentError::InvalidInput(_))));

        let novel = dir.path().join("novel.md");
        std::fs::write(&novel, SAMPLE).unwrap();
        assert_eq!(load_source(&novel).await.unwrap().chapters.len(), 2);
    }
}
