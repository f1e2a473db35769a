use super::*;

const PRIMARY_SYSTEM_PROMPT: &str = "You are a friendly assistant. Keep your responses concise and helpful. \
When the user asks for a substantial piece of writing, code, a spreadsheet, or an image, \
call the create_document tool instead of inlining the content; \
use update_document with the document id when the user asks to change an existing document. \
Do not repeat document contents in your reply after calling a tool.";

const DEFAULT_MAX_ROUNDS: u32 = 4;
const CANCEL_POLL_MS: u64 = 200;

struct RoundOutcome {
    text: String,
    tool_calls: Vec<(String, String, Value)>,
    tool_outcomes: Vec<tools::ArtifactToolOutcome>,
}

impl Orchestrator {
    pub(super) async fn run_turn(
        &self,
        prepared: PreparedTurn,
        writer: StreamWriter,
        cancel: CancelToken,
    ) {
        let mut tool_outcomes = Vec::new();
        let result = self
            .execute_turn(&prepared, &writer, &cancel, &mut tool_outcomes)
            .await;
        if let Err(err) = &result {
            // 取消是正常收口路径，不作为错误回报给客户端。
            if err.code() != "CANCELLED" {
                let _ = writer.emit(StreamEvent::Error {
                    message: err.message().to_string(),
                });
                warn!(
                    "轮次执行失败: chat_id={}, turn_id={}, error={err}",
                    prepared.chat_id, prepared.turn_id
                );
            }
        }
        if let Err(err) = self.finalize_turn(&prepared, &writer, &tool_outcomes) {
            // 客户端已渲染的流不回收，但要告知本轮可能无法在刷新后恢复。
            let _ = writer.emit(StreamEvent::Error {
                message: format!("轮次保存失败: {err}"),
            });
            error!("轮次持久化失败: chat_id={}, error={err}", prepared.chat_id);
        }
    }

    async fn execute_turn(
        &self,
        prepared: &PreparedTurn,
        writer: &StreamWriter,
        cancel: &CancelToken,
        tool_outcomes: &mut Vec<tools::ArtifactToolOutcome>,
    ) -> Result<(), TurnError> {
        if prepared.persist_user_message {
            self.storage
                .save_messages(std::slice::from_ref(&prepared.user_message))
                .map_err(|err| TurnError::internal(err.to_string()))?;
        }
        if prepared.spawn_title {
            self.spawn_title_task(prepared);
        }

        let mut messages = self.build_model_messages(prepared)?;
        let tool_specs = tools::artifact_tool_specs();
        // 过滤器随整轮存活：闭锁跨模型往返保持，轮次结束即丢弃。
        let mut token_filter = filter::TokenFilter::new();
        let max_rounds = self
            .config
            .resolve_model(None)
            .and_then(|(_, model)| model.max_rounds)
            .unwrap_or(DEFAULT_MAX_ROUNDS)
            .max(1);

        for _round in 1..=max_rounds {
            Self::ensure_not_cancelled(cancel)?;
            let stream = self
                .providers
                .chat
                .stream_text(messages.clone(), tool_specs.clone())
                .await
                .map_err(|err| TurnError::llm_unavailable(err.to_string()))?;
            let round = self
                .consume_round(stream, &mut token_filter, writer, cancel)
                .await;
            let round = match round {
                Ok(round) => round,
                Err(err) => {
                    return Err(err);
                }
            };
            tool_outcomes.extend(round.tool_outcomes.iter().cloned());
            if round.tool_calls.is_empty() {
                break;
            }

            // 将工具调用与结果回灌对话，驱动模型给出后续文本。
            let calls = round
                .tool_calls
                .iter()
                .map(|(call_id, name, arguments)| {
                    json!({
                        "id": call_id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": arguments.to_string(),
                        }
                    })
                })
                .collect::<Vec<_>>();
            messages.push(json!({
                "role": "assistant",
                "content": round.text,
                "tool_calls": calls,
            }));
            for outcome in &round.tool_outcomes {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": outcome.call_id,
                    "content": outcome.result.to_string(),
                }));
            }
        }
        Ok(())
    }

    async fn consume_round(
        &self,
        mut stream: futures::stream::BoxStream<'static, anyhow::Result<RawChunk>>,
        token_filter: &mut filter::TokenFilter,
        writer: &StreamWriter,
        cancel: &CancelToken,
    ) -> Result<RoundOutcome, TurnError> {
        let mut text = String::new();
        let mut tool_calls: Vec<(String, String, Value)> = Vec::new();
        let mut tasks: Vec<JoinHandle<tools::ArtifactToolOutcome>> = Vec::new();
        let mut inline_outcomes: Vec<tools::ArtifactToolOutcome> = Vec::new();
        let mut failure: Option<TurnError> = None;

        loop {
            if cancel.load(AtomicOrdering::SeqCst) {
                failure = Some(TurnError::cancelled("轮次已取消".to_string()));
                break;
            }
            // 模型长时间无输出时仍要响应取消，按固定间隔轮询。
            let item = tokio::select! {
                item = stream.next() => item,
                _ = tokio::time::sleep(std::time::Duration::from_millis(CANCEL_POLL_MS)) => continue,
            };
            let Some(item) = item else {
                break;
            };
            match item {
                Ok(chunk) => match token_filter.apply(chunk) {
                    Some(RawChunk::TextDelta { text: delta }) => {
                        text.push_str(&delta);
                        let emitted = writer.emit(StreamEvent::TextDelta { text: delta });
                        if emitted.is_err() {
                            // 传输失败等同用户取消：让在途子任务也尽快停。
                            cancel.store(true, AtomicOrdering::SeqCst);
                            failure =
                                Some(TurnError::cancelled("客户端传输已断开".to_string()));
                            break;
                        }
                    }
                    Some(RawChunk::ToolCall {
                        call_id,
                        name,
                        arguments,
                    }) => {
                        tool_calls.push((call_id.clone(), name.clone(), arguments.clone()));
                        if tools::is_artifact_tool(&name) {
                            // 工具任务与剩余文本流并发推进，共用同一个写入端。
                            tasks.push(tokio::spawn(tools::run_artifact_tool(
                                self.providers.artifact.clone(),
                                self.storage.clone(),
                                writer.clone(),
                                cancel.clone(),
                                call_id,
                                name,
                                arguments,
                            )));
                        } else {
                            inline_outcomes.push(tools::ArtifactToolOutcome {
                                call_id,
                                result: json!({ "error": format!("unknown tool: {name}") }),
                                name,
                            });
                        }
                    }
                    None => {}
                },
                Err(err) => {
                    // Error 事件由 run_turn 统一发射，这里只结束本轮消费。
                    failure = Some(TurnError::llm_unavailable(err.to_string()));
                    break;
                }
            }
        }

        // 先等全部工具任务收口再判定成败：取消路径也要让 Finish 落进日志。
        let mut tool_outcomes = inline_outcomes;
        for task in tasks {
            match task.await {
                Ok(outcome) => tool_outcomes.push(outcome),
                Err(err) => warn!("工具任务异常退出: {err}"),
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(RoundOutcome {
            text,
            tool_calls,
            tool_outcomes,
        })
    }

    fn build_model_messages(&self, prepared: &PreparedTurn) -> Result<Vec<Value>, TurnError> {
        let mut messages = vec![json!({ "role": "system", "content": PRIMARY_SYSTEM_PROMPT })];
        let history = self
            .storage
            .load_chat_messages(&prepared.chat_id, self.config.server.max_history_messages)
            .map_err(|err| TurnError::internal(err.to_string()))?;
        for record in history {
            // 本轮用户消息已落库，跳过后统一追加到末尾。
            if record.message_id == prepared.user_message.message_id {
                continue;
            }
            let content = request::text_of_parts(&record.parts);
            if content.is_empty() {
                continue;
            }
            messages.push(json!({ "role": record.role, "content": content }));
        }
        messages.push(json!({
            "role": "user",
            "content": request::text_of_parts(&prepared.user_message.parts),
        }));
        Ok(messages)
    }

    fn finalize_turn(
        &self,
        prepared: &PreparedTurn,
        writer: &StreamWriter,
        tool_outcomes: &[tools::ArtifactToolOutcome],
    ) -> Result<(), TurnError> {
        let snapshot = writer.snapshot();
        if snapshot.text.is_empty() && snapshot.artifacts.is_empty() {
            return Ok(());
        }
        let now = now_ts();

        let mut parts = Vec::new();
        if !snapshot.text.is_empty() {
            parts.push(json!({ "type": "text", "text": snapshot.text }));
        }
        for outcome in tool_outcomes {
            parts.push(json!({
                "type": "tool-invocation",
                "call_id": outcome.call_id,
                "tool_name": outcome.name,
                "result": outcome.result,
            }));
        }
        for artifact in &snapshot.artifacts {
            parts.push(json!({
                "type": "artifact",
                "id": artifact.id,
                "kind": artifact.kind.as_str(),
                "title": artifact.title,
            }));
        }

        let record = MessageRecord {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            chat_id: prepared.chat_id.clone(),
            role: "assistant".to_string(),
            parts: Value::Array(parts),
            created_at: now,
        };
        self.storage
            .save_messages(std::slice::from_ref(&record))
            .map_err(|err| TurnError::internal(err.to_string()))?;

        for artifact in &snapshot.artifacts {
            if !artifact.finished {
                warn!(
                    "工件未收到 Finish 即进入落库: chat_id={}, doc_id={}",
                    prepared.chat_id, artifact.id
                );
            }
            self.storage
                .save_document_version(&DocumentVersionRecord {
                    doc_id: artifact.id.clone(),
                    chat_id: prepared.chat_id.clone(),
                    user_id: prepared.user_id.clone(),
                    kind: artifact.kind.as_str().to_string(),
                    title: artifact.title.clone(),
                    content: artifact.content.clone(),
                    created_at: now,
                })
                .map_err(|err| TurnError::internal(err.to_string()))?;
        }

        // 会话排序按最后活动时间刷新，失败只记日志。
        if let Ok(Some(mut chat)) = self.storage.get_chat(&prepared.chat_id) {
            chat.updated_at = now;
            if let Err(err) = self.storage.save_chat(&chat) {
                warn!("刷新会话时间失败: chat_id={}, error={err}", prepared.chat_id);
            }
        }
        Ok(())
    }

    fn spawn_title_task(&self, prepared: &PreparedTurn) {
        let titles = self.titles.clone();
        let storage = self.storage.clone();
        let chat_id = prepared.chat_id.clone();
        let content = request::text_of_parts(&prepared.user_message.parts);
        tokio::spawn(async move {
            match titles.generate(&content).await {
                Ok(title) => {
                    if let Err(err) = storage.update_chat_title(&chat_id, &title, now_ts()) {
                        warn!("保存会话标题失败: chat_id={chat_id}, error={err}");
                    }
                }
                // 标题生成失败非致命，会话保留默认标题。
                Err(err) => warn!("标题生成失败: chat_id={chat_id}, error={err}"),
            }
        });
    }
}
