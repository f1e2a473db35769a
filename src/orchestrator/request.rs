use super::*;

pub(super) struct PreparedTurn {
    pub chat_id: String,
    pub user_id: String,
    pub turn_id: String,
    pub user_message: MessageRecord,
    pub persist_user_message: bool,
    pub spawn_title: bool,
}

/// 轮次结束时从在途表摘除登记，任何退出路径都不遗留占用。
pub(super) struct TurnGuard {
    active: Arc<DashMap<String, ActiveTurn>>,
    chat_id: String,
    turn_id: String,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.chat_id, |_, active| active.turn_id == self.turn_id);
    }
}

/// 取出消息分段里的纯文本内容，工件引用展开为占位行供模型参考。
pub(super) fn text_of_parts(parts: &Value) -> String {
    let Some(items) = parts.as_array() else {
        return String::new();
    };
    let mut collected = Vec::new();
    for part in items {
        match part.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    collected.push(text.to_string());
                }
            }
            Some("artifact") => {
                let id = part.get("id").and_then(Value::as_str).unwrap_or("");
                let kind = part.get("kind").and_then(Value::as_str).unwrap_or("");
                let title = part.get("title").and_then(Value::as_str).unwrap_or("");
                collected.push(format!("[document {id}: {title} ({kind})]"));
            }
            _ => {}
        }
    }
    collected.join("\n")
}

impl Orchestrator {
    /// 启动一轮会话，返回投递给客户端传输层的有序事件流。
    /// 同一会话同时只允许一个在途轮次，重复提交直接拒绝。
    pub async fn stream(
        &self,
        request: TurnRequest,
    ) -> Result<tokio_stream::wrappers::ReceiverStream<StreamEvent>, TurnError> {
        let chat_id = request.chat_id.trim().to_string();
        if chat_id.is_empty() {
            return Err(TurnError::invalid_request("chat_id 不能为空".to_string()));
        }
        let turn_id = format!("turn_{}", Uuid::new_v4().simple());
        let cancel: CancelToken = Arc::new(AtomicBool::new(false));

        // 登记必须先于任何校验与存储写入：并发提交在这里就被拒绝，
        // 重新生成的截断操作也不会波及在途轮次。
        match self.active_turns.entry(chat_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TurnError::user_busy("会话已有在途轮次".to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(ActiveTurn {
                    turn_id: turn_id.clone(),
                    cancel: cancel.clone(),
                });
            }
        }
        let guard = TurnGuard {
            active: self.active_turns.clone(),
            chat_id: chat_id.clone(),
            turn_id: turn_id.clone(),
        };

        // 校验失败时 guard 随错误返回一并释放登记。
        let prepared = self.prepare_turn(request, turn_id)?;

        let (event_tx, event_rx) = mpsc::channel(self.config.server.stream_queue_size.max(1));
        let writer = StreamWriter::new(Some(event_tx));
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_turn(prepared, writer.clone(), cancel).await;
            // 先摘除在途登记再关闭事件通道，流结束时观察不到残留占用。
            drop(guard);
            drop(writer);
        });

        Ok(tokio_stream::wrappers::ReceiverStream::new(event_rx))
    }

    fn prepare_turn(&self, request: TurnRequest, turn_id: String) -> Result<PreparedTurn, TurnError> {
        let chat_id = request.chat_id.trim().to_string();
        let user_id = request.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(TurnError::invalid_request("user_id 不能为空".to_string()));
        }

        let chat = self
            .storage
            .get_chat(&chat_id)
            .map_err(|err| TurnError::internal(err.to_string()))?;
        let mut spawn_title = false;
        match &chat {
            Some(record) => {
                if record.user_id != user_id {
                    return Err(TurnError::forbidden("会话属于其他用户".to_string()));
                }
            }
            None => {
                // 首条消息时建会话，标题生成在用户消息落库后异步触发。
                let now = now_ts();
                let record = ChatRecord {
                    chat_id: chat_id.clone(),
                    user_id: user_id.clone(),
                    title: crate::title::DEFAULT_CHAT_TITLE.to_string(),
                    visibility: "private".to_string(),
                    created_at: now,
                    updated_at: now,
                };
                self.storage
                    .save_chat(&record)
                    .map_err(|err| TurnError::internal(err.to_string()))?;
                spawn_title = true;
            }
        }

        if let Some(source_message_id) = request
            .source_message_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            // 重新生成：按时间截断该消息之后的全部消息，保持线性历史。
            let source = self
                .storage
                .get_message_by_id(source_message_id)
                .map_err(|err| TurnError::internal(err.to_string()))?
                .ok_or_else(|| TurnError::not_found(format!("消息不存在: {source_message_id}")))?;
            if source.chat_id != chat_id {
                return Err(TurnError::invalid_request(
                    "消息不属于该会话".to_string(),
                ));
            }
            if source.role != "user" {
                return Err(TurnError::invalid_request(
                    "只能从用户消息重新生成".to_string(),
                ));
            }
            self.storage
                .delete_messages_after_timestamp(&chat_id, source.created_at)
                .map_err(|err| TurnError::internal(err.to_string()))?;
            return Ok(PreparedTurn {
                chat_id,
                user_id,
                turn_id,
                user_message: source,
                persist_user_message: false,
                spawn_title: false,
            });
        }

        let content = request.content.trim().to_string();
        if content.is_empty() {
            return Err(TurnError::invalid_request("消息内容不能为空".to_string()));
        }
        let user_message = MessageRecord {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            chat_id: chat_id.clone(),
            role: "user".to_string(),
            parts: json!([{ "type": "text", "text": content }]),
            created_at: now_ts(),
        };
        Ok(PreparedTurn {
            chat_id,
            user_id,
            turn_id,
            user_message,
            persist_user_message: true,
            spawn_title,
        })
    }
}
