// 集成测试公共设施：脚本化模型协作方与最小全栈装配。
#![allow(dead_code)]

use async_trait::async_trait;
use atelier_server::config::Config;
use atelier_server::llm::{ModelProvider, ModelProviders};
use atelier_server::orchestrator::Orchestrator;
use atelier_server::schemas::{RawChunk, StreamEvent, ToolSpec};
use atelier_server::storage::{build_storage, StorageBackend};
use atelier_server::title::TitleGenerator;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const SCRIPTED_TITLE: &str = "Scripted Title";

pub struct TextScript {
    pub chunks: Vec<RawChunk>,
    pub error: Option<String>,
}

pub struct ObjectScript {
    pub snapshots: Vec<Value>,
    pub error: Option<String>,
}

struct Inner {
    text_scripts: Mutex<VecDeque<TextScript>>,
    object_scripts: Mutex<VecDeque<ObjectScript>>,
    delay: Duration,
}

/// 按脚本回放的模型协作方：每次 stream_text/stream_object 调用
/// 依序弹出一份脚本，分片之间可配置节拍以便测试取消时序。
#[derive(Clone)]
pub struct ScriptedProvider {
    inner: Arc<Inner>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                text_scripts: Mutex::new(VecDeque::new()),
                object_scripts: Mutex::new(VecDeque::new()),
                delay,
            }),
        }
    }

    pub fn push_text(&self, chunks: Vec<RawChunk>) {
        self.inner.text_scripts.lock().push_back(TextScript {
            chunks,
            error: None,
        });
    }

    pub fn push_text_error(&self, chunks: Vec<RawChunk>, message: &str) {
        self.inner.text_scripts.lock().push_back(TextScript {
            chunks,
            error: Some(message.to_string()),
        });
    }

    pub fn push_object(&self, snapshots: Vec<Value>) {
        self.inner.object_scripts.lock().push_back(ObjectScript {
            snapshots,
            error: None,
        });
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn stream_text(
        &self,
        _messages: Vec<Value>,
        _tools: Vec<ToolSpec>,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<RawChunk>>> {
        let script = self
            .inner
            .text_scripts
            .lock()
            .pop_front()
            .unwrap_or(TextScript {
                chunks: Vec::new(),
                error: None,
            });
        let delay = self.inner.delay;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in script.chunks {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            if let Some(message) = script.error {
                let _ = tx.send(Err(anyhow::anyhow!(message))).await;
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn stream_object(
        &self,
        _system: String,
        _prompt: String,
        _schema: Value,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Value>>> {
        let script = self
            .inner
            .object_scripts
            .lock()
            .pop_front()
            .unwrap_or(ObjectScript {
                snapshots: Vec::new(),
                error: None,
            });
        let delay = self.inner.delay;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for snapshot in script.snapshots {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(snapshot)).await.is_err() {
                    return;
                }
            }
            if let Some(message) = script.error {
                let _ = tx.send(Err(anyhow::anyhow!(message))).await;
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn complete(&self, _system: String, _prompt: String) -> anyhow::Result<String> {
        Ok(SCRIPTED_TITLE.to_string())
    }
}

pub fn build_stack(
    provider: &ScriptedProvider,
    dir: &tempfile::TempDir,
) -> (Orchestrator, Arc<dyn StorageBackend>) {
    let mut config = Config::default();
    config.storage.db_path = dir
        .path()
        .join("atelier_test.db")
        .to_string_lossy()
        .to_string();
    let storage = build_storage(&config.storage).unwrap();
    let providers = ModelProviders {
        chat: Arc::new(provider.clone()),
        artifact: Arc::new(provider.clone()),
        title: Arc::new(provider.clone()),
    };
    let titles = Arc::new(TitleGenerator::new(providers.title.clone()));
    let orchestrator = Orchestrator::new(config, storage.clone(), providers, titles);
    (orchestrator, storage)
}

pub fn text_delta(text: &str) -> RawChunk {
    RawChunk::TextDelta {
        text: text.to_string(),
    }
}

pub fn tool_call(name: &str, arguments: Value) -> RawChunk {
    RawChunk::ToolCall {
        call_id: format!("call_{}", uuid::Uuid::new_v4().simple()),
        name: name.to_string(),
        arguments,
    }
}

pub async fn collect_events(
    mut stream: ReceiverStream<StreamEvent>,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

pub fn concat_text_deltas(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
