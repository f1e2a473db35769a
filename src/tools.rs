// 工件编排工具：分配工件身份、查找文档处理器、驱动生成直至完成或取消。
use crate::artifacts::{self, HandlerContext};
use crate::llm::ModelProvider;
use crate::orchestrator::{CancelToken, StreamWriter};
use crate::schemas::{ArtifactKind, StreamEvent, ToolSpec};
use crate::storage::StorageBackend;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub const CREATE_DOCUMENT_TOOL: &str = "create_document";
pub const UPDATE_DOCUMENT_TOOL: &str = "update_document";

pub fn is_artifact_tool(name: &str) -> bool {
    name == CREATE_DOCUMENT_TOOL || name == UPDATE_DOCUMENT_TOOL
}

pub fn artifact_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: CREATE_DOCUMENT_TOOL.to_string(),
            description: "Create a document for writing or content creation activities. The document contents are generated from the title and kind and shown to the user as they stream.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "Document title, also used as the generation prompt"},
                    "kind": {"type": "string", "enum": ["text", "code", "sheet", "image"]}
                },
                "required": ["title", "kind"]
            }),
        },
        ToolSpec {
            name: UPDATE_DOCUMENT_TOOL.to_string(),
            description: "Update an existing document with the given change description. The full updated contents are re-streamed to the user.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string", "description": "Identity of the document to update"},
                    "description": {"type": "string", "description": "What to change"}
                },
                "required": ["id", "description"]
            }),
        },
    ]
}

#[derive(Debug, Clone)]
pub struct ArtifactToolOutcome {
    pub call_id: String,
    pub name: String,
    pub result: Value,
}

/// 执行一次工件工具调用。状态机：派发 -> 生成 -> 完成，取消随时可达；
/// 无论成败，凡是发出过 Begin 的工件一定会收到 Finish。
pub async fn run_artifact_tool(
    provider: Arc<dyn ModelProvider>,
    storage: Arc<dyn StorageBackend>,
    writer: StreamWriter,
    cancel: CancelToken,
    call_id: String,
    name: String,
    arguments: Value,
) -> ArtifactToolOutcome {
    let result = match name.as_str() {
        CREATE_DOCUMENT_TOOL => run_create(provider, writer, cancel, &arguments).await,
        UPDATE_DOCUMENT_TOOL => run_update(provider, storage, writer, cancel, &arguments).await,
        other => json!({ "error": format!("unknown tool: {other}") }),
    };
    ArtifactToolOutcome {
        call_id,
        name,
        result,
    }
}

async fn run_create(
    provider: Arc<dyn ModelProvider>,
    writer: StreamWriter,
    cancel: CancelToken,
    arguments: &Value,
) -> Value {
    let title = arguments
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Untitled")
        .to_string();
    let kind_raw = arguments
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let Some(kind) = ArtifactKind::parse(&kind_raw) else {
        // 配置性错误：以工具结果上报，主文本流不受影响。
        return json!({ "error": format!("no handler for kind {kind_raw}") });
    };
    let doc_id = format!("doc_{}", Uuid::new_v4().simple());

    drive_handler(provider, writer, cancel, doc_id, kind, title, None).await
}

async fn run_update(
    provider: Arc<dyn ModelProvider>,
    storage: Arc<dyn StorageBackend>,
    writer: StreamWriter,
    cancel: CancelToken,
    arguments: &Value,
) -> Value {
    let doc_id = arguments
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if doc_id.is_empty() {
        return json!({ "error": "document id is required" });
    }
    let instruction = arguments
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let lookup_id = doc_id.clone();
    let prior = match tokio::task::spawn_blocking(move || storage.get_latest_document(&lookup_id))
        .await
    {
        Ok(Ok(Some(record))) => record,
        Ok(Ok(None)) => {
            return json!({ "error": format!("document not found: {doc_id}") });
        }
        Ok(Err(err)) => {
            warn!("读取文档版本失败: {doc_id}: {err}");
            return json!({ "error": format!("failed to load document: {doc_id}") });
        }
        Err(err) => {
            warn!("读取文档版本失败: {doc_id}: {err}");
            return json!({ "error": format!("failed to load document: {doc_id}") });
        }
    };
    let Some(kind) = ArtifactKind::parse(&prior.kind) else {
        return json!({ "error": format!("no handler for kind {}", prior.kind) });
    };

    drive_handler(
        provider,
        writer,
        cancel,
        doc_id,
        kind,
        prior.title.clone(),
        Some((prior.content, instruction)),
    )
    .await
}

async fn drive_handler(
    provider: Arc<dyn ModelProvider>,
    writer: StreamWriter,
    cancel: CancelToken,
    doc_id: String,
    kind: ArtifactKind,
    title: String,
    update: Option<(String, String)>,
) -> Value {
    let begin_ok = writer
        .emit(StreamEvent::ArtifactBegin {
            id: doc_id.clone(),
            kind,
            title: title.clone(),
        })
        .and_then(|_| {
            // 即便是更新也先清空：处理器整体重播内容而非打补丁。
            writer.emit(StreamEvent::ArtifactClear {
                id: doc_id.clone(),
            })
        })
        .is_ok();
    if !begin_ok {
        finish_artifact(&writer, &doc_id);
        return json!({ "error": "stream transport closed" });
    }

    let ctx = HandlerContext {
        provider,
        writer: writer.clone(),
        cancel,
        doc_id: doc_id.clone(),
    };
    let outcome = match &update {
        None => artifacts::create_document(kind, &ctx, &title).await,
        Some((prior_content, instruction)) => {
            artifacts::update_document(kind, &ctx, prior_content, instruction).await
        }
    };

    match outcome {
        Ok(_content) => {
            finish_artifact(&writer, &doc_id);
            let confirmation = if update.is_some() {
                "The document has been updated and is visible to the user."
            } else {
                "A document was created and is now visible to the user."
            };
            // 工具结果只带确认语，不回传完整内容，避免对话记录无界膨胀。
            json!({
                "id": doc_id,
                "title": title,
                "kind": kind.as_str(),
                "content": confirmation,
            })
        }
        Err(err) => {
            // 子调用失败：以 Error 事件告知客户端，工件以部分内容收口。
            let _ = writer.emit(StreamEvent::Error {
                message: err.to_string(),
            });
            finish_artifact(&writer, &doc_id);
            warn!("工件生成失败: {doc_id}: {err}");
            json!({
                "id": doc_id,
                "title": title,
                "kind": kind.as_str(),
                "error": format!("document generation failed: {err}"),
            })
        }
    }
}

fn finish_artifact(writer: &StreamWriter, doc_id: &str) {
    // 传输失败也要写日志侧，保证持久化状态不会停在生成中。
    let _ = writer.emit(StreamEvent::ArtifactFinish {
        id: doc_id.to_string(),
    });
}
