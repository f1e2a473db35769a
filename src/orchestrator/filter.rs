// 思考内容过滤：逐分片清洗模型输出，拦截不应触达用户的推理文本。
use crate::schemas::RawChunk;
use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

/// 正文判定阈值：累计文本超过该长度即认定真实内容已开始。
const CONTENT_LATCH_CHARS: usize = 50;

fn bold_thinking_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| compile_regex(r"(?i)\*\*Thinking\.{3,}\*\*", "bold_thinking"))
        .as_ref()
}

fn plain_thinking_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| compile_regex(r"(?i)Thinking\.{3,}", "plain_thinking"))
        .as_ref()
}

fn compile_regex(pattern: &str, label: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!("过滤正则编译失败({label}): {err}");
            None
        }
    }
}

/// 单次轮次内使用的有状态过滤器，流结束后即丢弃，不跨轮复用。
pub struct TokenFilter {
    accumulated_text: String,
    has_seen_content: bool,
}

impl TokenFilter {
    pub fn new() -> Self {
        Self {
            accumulated_text: String::new(),
            has_seen_content: false,
        }
    }

    /// 处理一个原始分片。文本分片按思考标记清洗，可能整体吞掉；
    /// 非文本分片（工具调用）原样透传，保持宽松不失败。
    pub fn apply(&mut self, chunk: RawChunk) -> Option<RawChunk> {
        match chunk {
            RawChunk::TextDelta { text } => self
                .apply_text(&text)
                .map(|cleaned| RawChunk::TextDelta { text: cleaned }),
            other => Some(other),
        }
    }

    pub fn has_seen_content(&self) -> bool {
        self.has_seen_content
    }

    fn apply_text(&mut self, delta: &str) -> Option<String> {
        if delta.contains("**Thinking")
            || delta.contains("Thinking...")
            || delta.trim_start().starts_with('>')
            || (!self.has_seen_content && delta.trim().is_empty())
        {
            return None;
        }

        self.accumulated_text.push_str(delta);

        // 标题标记或累计长度超阈值即视为正文开始；单向闭锁，后续不再回退。
        if delta.contains('#') || self.accumulated_text.len() > CONTENT_LATCH_CHARS {
            self.has_seen_content = true;
        }
        if !self.has_seen_content {
            return None;
        }

        let mut cleaned = delta.to_string();
        if let Some(regex) = bold_thinking_regex() {
            cleaned = regex.replace_all(&cleaned, "").into_owned();
        }
        if let Some(regex) = plain_thinking_regex() {
            cleaned = regex.replace_all(&cleaned, "").into_owned();
        }
        let cleaned = cleaned
            .split('\n')
            .filter(|line| !line.trim_start().starts_with('>'))
            .collect::<Vec<_>>()
            .join("\n");

        if cleaned.trim().is_empty() {
            None
        } else {
            Some(cleaned)
        }
    }
}

impl Default for TokenFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> RawChunk {
        RawChunk::TextDelta {
            text: value.to_string(),
        }
    }

    fn apply_text(filter: &mut TokenFilter, value: &str) -> Option<String> {
        match filter.apply(text(value)) {
            Some(RawChunk::TextDelta { text }) => Some(text),
            Some(_) => panic!("unexpected chunk variant"),
            None => None,
        }
    }

    #[test]
    fn suppresses_everything_before_latch() {
        let mut filter = TokenFilter::new();
        assert_eq!(apply_text(&mut filter, "short"), None);
        assert!(!filter.has_seen_content());
    }

    #[test]
    fn latch_is_monotonic() {
        let mut filter = TokenFilter::new();
        apply_text(&mut filter, "# Answer\n");
        assert!(filter.has_seen_content());
        // 闭锁后即使是单字分片也照常放行。
        assert_eq!(apply_text(&mut filter, "ok"), Some("ok".to_string()));
        assert!(filter.has_seen_content());
    }

    #[test]
    fn drops_thinking_marker_chunks_entirely() {
        let mut filter = TokenFilter::new();
        apply_text(&mut filter, "# Answer\n");
        assert_eq!(apply_text(&mut filter, "**Thinking...** still"), None);
        assert_eq!(apply_text(&mut filter, "Thinking... about it"), None);
    }

    #[test]
    fn strips_blockquote_reasoning_lines() {
        let mut filter = TokenFilter::new();
        apply_text(&mut filter, "# Answer\n");
        let cleaned = apply_text(&mut filter, "keep this\n> internal note\nalso keep");
        assert_eq!(cleaned, Some("keep this\nalso keep".to_string()));
    }

    #[test]
    fn blockquote_only_chunk_is_dropped() {
        let mut filter = TokenFilter::new();
        apply_text(&mut filter, "# Answer\n");
        assert_eq!(apply_text(&mut filter, "> purely internal"), None);
    }

    #[test]
    fn long_accumulation_triggers_latch() {
        let mut filter = TokenFilter::new();
        let first = "a".repeat(40);
        assert_eq!(apply_text(&mut filter, &first), None);
        let second = "b".repeat(20);
        // 累计超过 50 字符后，该分片开始放行。
        assert_eq!(apply_text(&mut filter, &second), Some(second.clone()));
    }

    #[test]
    fn tool_call_chunks_pass_through() {
        let mut filter = TokenFilter::new();
        let chunk = RawChunk::ToolCall {
            call_id: "call_1".to_string(),
            name: "create_document".to_string(),
            arguments: serde_json::json!({"title": "t", "kind": "code"}),
        };
        assert!(matches!(
            filter.apply(chunk),
            Some(RawChunk::ToolCall { .. })
        ));
    }

    #[test]
    fn output_never_contains_marker_substring() {
        let mut filter = TokenFilter::new();
        apply_text(&mut filter, "# A\n");
        for input in ["plain text", "mid Thinking..... tail", "> quoted"] {
            if let Some(cleaned) = apply_text(&mut filter, input) {
                assert!(!cleaned.contains("Thinking..."));
            }
        }
    }
}
