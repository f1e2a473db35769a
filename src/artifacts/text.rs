// 文本工件处理器。增量约定：纯文本流，发送真实的增量片段。
use super::HandlerContext;
use crate::schemas::RawChunk;
use anyhow::Result;
use futures::StreamExt;
use serde_json::json;

const CREATE_SYSTEM_PROMPT: &str = "Write about the given topic. Markdown is supported. Use headings wherever appropriate.";

pub(super) async fn on_create(ctx: &HandlerContext, title: &str) -> Result<String> {
    stream_markdown(ctx, CREATE_SYSTEM_PROMPT.to_string(), title.to_string()).await
}

pub(super) async fn on_update(
    ctx: &HandlerContext,
    prior_content: &str,
    instruction: &str,
) -> Result<String> {
    stream_markdown(
        ctx,
        super::update_prompt(prior_content),
        instruction.to_string(),
    )
    .await
}

async fn stream_markdown(ctx: &HandlerContext, system: String, prompt: String) -> Result<String> {
    let messages = vec![
        json!({ "role": "system", "content": system }),
        json!({ "role": "user", "content": prompt }),
    ];
    let mut stream = ctx.provider.stream_text(messages, Vec::new()).await?;
    let mut draft = String::new();
    while let Some(item) = stream.next().await {
        // 取消后立即停止消费后续 token，带着已累计内容返回。
        if ctx.cancelled() {
            break;
        }
        let chunk = item?;
        if let RawChunk::TextDelta { text } = chunk {
            draft.push_str(&text);
            ctx.emit_delta(text)?;
        }
    }
    Ok(draft)
}
