// 文档处理器注册表：按工件类型分发创建/更新操作，穷举匹配保证编译期覆盖。
use crate::llm::ModelProvider;
use crate::orchestrator::{CancelToken, StreamWriter};
use crate::schemas::{ArtifactKind, StreamEvent};
use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;

mod code;
mod image;
mod sheet;
mod text;

/// 文档处理器执行上下文：模型子调用入口、共享写入端与取消令牌。
pub struct HandlerContext {
    pub provider: Arc<dyn ModelProvider>,
    pub writer: StreamWriter,
    pub cancel: CancelToken,
    pub doc_id: String,
}

impl HandlerContext {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn emit_delta(&self, content: String) -> Result<()> {
        self.writer.emit(StreamEvent::ArtifactDelta {
            id: self.doc_id.clone(),
            content,
        })?;
        Ok(())
    }
}

/// 创建指定类型的文档，返回终态内容。取消时返回已累计的部分内容。
pub async fn create_document(
    kind: ArtifactKind,
    ctx: &HandlerContext,
    title: &str,
) -> Result<String> {
    match kind {
        ArtifactKind::Text => text::on_create(ctx, title).await,
        ArtifactKind::Code => code::on_create(ctx, title).await,
        ArtifactKind::Sheet => sheet::on_create(ctx, title).await,
        ArtifactKind::Image => image::on_create(ctx, title).await,
    }
}

/// 基于既有内容与修改说明更新文档。处理器整体重播内容而非打补丁。
pub async fn update_document(
    kind: ArtifactKind,
    ctx: &HandlerContext,
    prior_content: &str,
    instruction: &str,
) -> Result<String> {
    match kind {
        ArtifactKind::Text => text::on_update(ctx, prior_content, instruction).await,
        ArtifactKind::Code => code::on_update(ctx, prior_content, instruction).await,
        ArtifactKind::Sheet => sheet::on_update(ctx, prior_content, instruction).await,
        ArtifactKind::Image => image::on_update(ctx, prior_content, instruction).await,
    }
}

pub(crate) fn update_prompt(prior_content: &str) -> String {
    format!(
        "Improve the following contents of the document based on the given prompt.\n\n{prior_content}"
    )
}
