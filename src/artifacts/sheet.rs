// 表格工件处理器。增量约定：结构化对象流，每次发送 csv 字段的累计快照。
use super::HandlerContext;
use anyhow::Result;
use futures::StreamExt;
use serde_json::{json, Value};

const CREATE_SYSTEM_PROMPT: &str = "Create a spreadsheet for the given prompt. Respond with a JSON object of the form {\"csv\": \"...\"} where the value is CSV data with meaningful column headers.";

pub(super) async fn on_create(ctx: &HandlerContext, title: &str) -> Result<String> {
    stream_sheet(ctx, CREATE_SYSTEM_PROMPT.to_string(), title.to_string()).await
}

pub(super) async fn on_update(
    ctx: &HandlerContext,
    prior_content: &str,
    instruction: &str,
) -> Result<String> {
    let system = format!(
        "{}\nRespond with a JSON object of the form {{\"csv\": \"...\"}}.",
        super::update_prompt(prior_content)
    );
    stream_sheet(ctx, system, instruction.to_string()).await
}

async fn stream_sheet(ctx: &HandlerContext, system: String, prompt: String) -> Result<String> {
    let schema = json!({
        "type": "object",
        "properties": { "csv": { "type": "string" } },
        "required": ["csv"]
    });
    let mut stream = ctx.provider.stream_object(system, prompt, schema).await?;
    let mut draft = String::new();
    while let Some(item) = stream.next().await {
        if ctx.cancelled() {
            break;
        }
        let snapshot = item?;
        let Some(csv) = snapshot.get("csv").and_then(Value::as_str) else {
            continue;
        };
        if !csv.is_empty() && csv != draft {
            draft = csv.to_string();
            ctx.emit_delta(draft.clone())?;
        }
    }
    Ok(draft)
}
