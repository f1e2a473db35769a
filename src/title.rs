// 会话标题生成：首条用户消息后的单次模型调用，至多一次，失败保留默认标题。
use crate::llm::ModelProvider;
use anyhow::{anyhow, Result};
use std::sync::Arc;

pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

const TITLE_SYSTEM_PROMPT: &str = "\
- you will generate a short title based on the first message a user begins a conversation with
- ensure it is not more than 4 words long
- the title should be a summary of the user's message
- do not use quotes or colons";

const MAX_TITLE_CHARS: usize = 80;

pub struct TitleGenerator {
    provider: Arc<dyn ModelProvider>,
}

impl TitleGenerator {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }

    pub async fn generate(&self, first_message: &str) -> Result<String> {
        let raw = self
            .provider
            .complete(TITLE_SYSTEM_PROMPT.to_string(), first_message.to_string())
            .await?;
        let title = sanitize_title(&raw);
        if title.is_empty() {
            return Err(anyhow!("模型返回空标题"));
        }
        Ok(title)
    }
}

/// 模型偶尔无视格式约束，兜底去掉引号、冒号并收敛长度。
fn sanitize_title(raw: &str) -> String {
    let cleaned = raw
        .replace(['"', '\'', ':', '：'], "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut title = cleaned.trim().to_string();
    if title.len() > MAX_TITLE_CHARS {
        let cut = title
            .char_indices()
            .take_while(|(index, _)| *index < MAX_TITLE_CHARS)
            .last()
            .map(|(index, ch)| index + ch.len_utf8())
            .unwrap_or(0);
        title.truncate(cut);
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_removes_quotes_and_colons() {
        assert_eq!(sanitize_title("\"Trip: Plan\""), "Trip Plan");
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitize_title("  a \n b  "), "a b");
    }
}
