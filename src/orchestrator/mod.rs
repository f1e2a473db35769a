// 轮次调度：负责会话占用、模型流消费、工件工具派发与最终持久化。
use crate::config::Config;
use crate::llm::ModelProviders;
use crate::schemas::{now_ts, ArtifactKind, RawChunk, StreamEvent, TurnRequest};
use crate::storage::{ChatRecord, DocumentVersionRecord, MessageRecord, StorageBackend};
use crate::title::TitleGenerator;
use crate::tools;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

mod error;
mod execute;
pub mod filter;
mod request;
mod writer;

pub use error::TurnError;
pub use writer::{ArtifactSnapshot, StreamWriter, TransportClosed, TurnSnapshot};

use request::PreparedTurn;

/// 整轮共享的协作取消令牌，在每个挂起点检查。
pub type CancelToken = Arc<AtomicBool>;

struct ActiveTurn {
    turn_id: String,
    cancel: CancelToken,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    providers: ModelProviders,
    titles: Arc<TitleGenerator>,
    active_turns: Arc<DashMap<String, ActiveTurn>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        providers: ModelProviders,
        titles: Arc<TitleGenerator>,
    ) -> Self {
        Self {
            config,
            storage,
            providers,
            titles,
            active_turns: Arc::new(DashMap::new()),
        }
    }

    /// 请求取消指定会话的在途轮次；无在途轮次时返回 false。
    pub fn cancel(&self, chat_id: &str) -> bool {
        if let Some(active) = self.active_turns.get(chat_id) {
            active.cancel.store(true, AtomicOrdering::SeqCst);
            return true;
        }
        false
    }

    pub fn is_running(&self, chat_id: &str) -> bool {
        self.active_turns.contains_key(chat_id)
    }

    fn ensure_not_cancelled(cancel: &CancelToken) -> Result<(), TurnError> {
        if cancel.load(AtomicOrdering::SeqCst) {
            return Err(TurnError::cancelled("轮次已取消".to_string()));
        }
        Ok(())
    }
}
