// 流事件与请求/响应数据结构，字段命名与线上接口保持一致。
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 一次会话轮次内复用的流事件联合体。同一工件的事件保持发射顺序；
/// 不同工件之间允许交错。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ArtifactBegin {
        id: String,
        kind: ArtifactKind,
        title: String,
    },
    ArtifactDelta {
        id: String,
        content: String,
    },
    ArtifactClear {
        id: String,
    },
    ArtifactFinish {
        id: String,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    /// SSE 事件名即 serde tag，便于客户端按类型分发。
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::TextDelta { .. } => "text-delta",
            StreamEvent::ArtifactBegin { .. } => "artifact-begin",
            StreamEvent::ArtifactDelta { .. } => "artifact-delta",
            StreamEvent::ArtifactClear { .. } => "artifact-clear",
            StreamEvent::ArtifactFinish { .. } => "artifact-finish",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// 工件类型：决定由哪个文档处理器与模型 Schema 负责生成。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Text,
    Code,
    Sheet,
    Image,
}

impl ArtifactKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "text" => Some(Self::Text),
            "code" => Some(Self::Code),
            "sheet" => Some(Self::Sheet),
            "image" => Some(Self::Image),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Code => "code",
            Self::Sheet => "sheet",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模型主流输出的原始分片：文本增量或内联工具调用。
#[derive(Debug, Clone)]
pub enum RawChunk {
    TextDelta { text: String },
    ToolCall { call_id: String, name: String, arguments: Value },
}

/// 一次用户消息到助手回复的轮次请求。
#[derive(Debug, Clone, Deserialize)]
pub struct TurnRequest {
    pub chat_id: String,
    pub user_id: String,
    pub content: String,
    /// 重新生成时复用的既有消息 id，普通发送为空。
    #[serde(default)]
    pub source_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

pub fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_serializes_with_kebab_tag() {
        let event = StreamEvent::ArtifactBegin {
            id: "doc_1".to_string(),
            kind: ArtifactKind::Code,
            title: "demo".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "artifact-begin");
        assert_eq!(value["kind"], "code");
        assert_eq!(event.event_name(), "artifact-begin");
    }

    #[test]
    fn artifact_kind_parse_rejects_unknown() {
        assert_eq!(ArtifactKind::parse("sheet"), Some(ArtifactKind::Sheet));
        assert_eq!(ArtifactKind::parse("spreadsheet-v2"), None);
    }
}
