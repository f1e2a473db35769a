// 代码工件处理器。增量约定：结构化对象流，每次发送 code 字段的累计快照。
use super::HandlerContext;
use anyhow::Result;
use futures::StreamExt;
use serde_json::{json, Value};

const CREATE_SYSTEM_PROMPT: &str = "Generate code based on the given title. Respond with a JSON object of the form {\"code\": \"...\"} containing a single self-contained snippet with comments where helpful.";

pub(super) async fn on_create(ctx: &HandlerContext, title: &str) -> Result<String> {
    stream_code(ctx, CREATE_SYSTEM_PROMPT.to_string(), title.to_string()).await
}

pub(super) async fn on_update(
    ctx: &HandlerContext,
    prior_content: &str,
    instruction: &str,
) -> Result<String> {
    let system = format!(
        "{}\nRespond with a JSON object of the form {{\"code\": \"...\"}}.",
        super::update_prompt(prior_content)
    );
    stream_code(ctx, system, instruction.to_string()).await
}

async fn stream_code(ctx: &HandlerContext, system: String, prompt: String) -> Result<String> {
    let schema = json!({
        "type": "object",
        "properties": { "code": { "type": "string" } },
        "required": ["code"]
    });
    let mut stream = ctx.provider.stream_object(system, prompt, schema).await?;
    let mut draft = String::new();
    while let Some(item) = stream.next().await {
        if ctx.cancelled() {
            break;
        }
        let snapshot = item?;
        let Some(code) = snapshot.get("code").and_then(Value::as_str) else {
            continue;
        };
        // 部分对象快照本身即累计值，整体替换而非拼接。
        if !code.is_empty() && code != draft {
            draft = code.to_string();
            ctx.emit_delta(draft.clone())?;
        }
    }
    Ok(draft)
}
