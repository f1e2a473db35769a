use super::*;

/// 传输侧已断开（客户端失联或队列写满）。调用方应视同取消信号处理。
#[derive(Debug)]
pub struct TransportClosed;

impl std::fmt::Display for TransportClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("stream transport closed")
    }
}

impl std::error::Error for TransportClosed {}

#[derive(Debug, Clone)]
pub struct ArtifactSnapshot {
    pub id: String,
    pub kind: ArtifactKind,
    pub title: String,
    pub content: String,
    pub finished: bool,
}

/// 轮次结束时用于持久化的终态快照，持久化不得重新调用模型推导内容。
#[derive(Debug, Clone)]
pub struct TurnSnapshot {
    pub text: String,
    pub artifacts: Vec<ArtifactSnapshot>,
}

#[derive(Default)]
struct TurnLog {
    events: Vec<StreamEvent>,
    text: String,
    artifact_order: Vec<String>,
    artifacts: HashMap<String, ArtifactSnapshot>,
}

impl TurnLog {
    fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { text } => self.text.push_str(text),
            StreamEvent::ArtifactBegin { id, kind, title } => {
                if !self.artifacts.contains_key(id) {
                    self.artifact_order.push(id.clone());
                }
                // 更新场景下 Begin 会再次到达，以最新标题与类型为准。
                let entry = self
                    .artifacts
                    .entry(id.clone())
                    .or_insert_with(|| ArtifactSnapshot {
                        id: id.clone(),
                        kind: *kind,
                        title: title.clone(),
                        content: String::new(),
                        finished: false,
                    });
                entry.kind = *kind;
                entry.title = title.clone();
                entry.finished = false;
            }
            StreamEvent::ArtifactDelta { id, content } => {
                if let Some(entry) = self.artifacts.get_mut(id) {
                    if entry.kind.cumulative_deltas() {
                        entry.content = content.clone();
                    } else {
                        entry.content.push_str(content);
                    }
                }
            }
            StreamEvent::ArtifactClear { id } => {
                if let Some(entry) = self.artifacts.get_mut(id) {
                    entry.content.clear();
                }
            }
            StreamEvent::ArtifactFinish { id } => {
                if let Some(entry) = self.artifacts.get_mut(id) {
                    entry.finished = true;
                }
            }
            StreamEvent::Error { .. } => {}
        }
        self.events.push(event.clone());
    }

    fn snapshot(&self) -> TurnSnapshot {
        TurnSnapshot {
            text: self.text.clone(),
            artifacts: self
                .artifact_order
                .iter()
                .filter_map(|id| self.artifacts.get(id).cloned())
                .collect(),
        }
    }
}

/// 多路复用写入端：同一 emit 调用扇出到实时传输与内存日志两个观察者。
/// 日志先行写入，传输失败时已累计内容仍可完整持久化。
#[derive(Clone)]
pub struct StreamWriter {
    transport: Option<mpsc::Sender<StreamEvent>>,
    log: Arc<parking_lot::Mutex<TurnLog>>,
    closed: Arc<AtomicBool>,
}

impl StreamWriter {
    pub fn new(transport: Option<mpsc::Sender<StreamEvent>>) -> Self {
        Self {
            transport,
            log: Arc::new(parking_lot::Mutex::new(TurnLog::default())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 发射一个事件。日志追加总会成功；传输队列关闭或写满时快速失败，
    /// 绝不无限阻塞。
    pub fn emit(&self, event: StreamEvent) -> Result<(), TransportClosed> {
        self.log.lock().apply(&event);
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(TransportClosed);
        }
        match transport.try_send(event) {
            Ok(_) => Ok(()),
            Err(_) => {
                self.closed.store(true, AtomicOrdering::SeqCst);
                Err(TransportClosed)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    /// 读取某工件当前累计内容，供取消路径回填部分结果。
    pub fn artifact_content(&self, id: &str) -> Option<String> {
        self.log
            .lock()
            .artifacts
            .get(id)
            .map(|entry| entry.content.clone())
    }

    pub fn snapshot(&self) -> TurnSnapshot {
        self.log.lock().snapshot()
    }

    pub fn event_count(&self) -> usize {
        self.log.lock().events.len()
    }
}

impl ArtifactKind {
    /// 增量约定：结构化对象流的工件类型发送累计快照，纯文本类型发送
    /// 增量片段。新增类型时必须在此处明确选择。
    pub fn cumulative_deltas(&self) -> bool {
        match self {
            ArtifactKind::Text => false,
            ArtifactKind::Code | ArtifactKind::Sheet | ArtifactKind::Image => true,
        }
    }
}
