// LLM 适配：OpenAI 兼容的 Chat Completions 调用，支持文本流、结构化对象流与单次补全。
use crate::config::{Config, LlmModelConfig};
use crate::schemas::{RawChunk, ToolSpec};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const STREAM_CHANNEL_SIZE: usize = 64;

/// 模型调用协作方接口。主流返回原始分片（文本增量与内联工具调用），
/// 对象流返回累计的部分对象快照，补全用于标题等单次请求。
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream_text(
        &self,
        messages: Vec<Value>,
        tools: Vec<ToolSpec>,
    ) -> Result<BoxStream<'static, Result<RawChunk>>>;

    async fn stream_object(
        &self,
        system: String,
        prompt: String,
        schema: Value,
    ) -> Result<BoxStream<'static, Result<Value>>>;

    async fn complete(&self, system: String, prompt: String) -> Result<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    config: LlmModelConfig,
}

impl LlmClient {
    pub fn new(http: Client, config: LlmModelConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(api_key) = &self.config.api_key {
            if !api_key.is_empty() {
                let value = format!("Bearer {api_key}");
                if let Ok(header_value) = value.parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, header_value);
                }
            }
        }
        headers
    }

    fn build_payload(&self, messages: &[Value], stream: bool) -> Value {
        let temperature = self.config.temperature.unwrap_or(0.7);
        let mut payload = json!({
            "model": self.config.model.clone().unwrap_or_else(|| "gpt-4o".to_string()),
            "messages": messages,
            "temperature": temperature,
            "stream": stream,
        });
        if let Some(max_output) = self.config.max_output {
            if max_output > 0 {
                payload["max_tokens"] = json!(max_output);
            }
        }
        payload
    }

    async fn send(&self, payload: &Value) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .post(self.endpoint())
            .headers(self.headers())
            .json(payload);
        if let Some(timeout_s) = self.config.timeout_s {
            if timeout_s > 0 {
                request = request.timeout(Duration::from_secs(timeout_s));
            }
        }
        let response = request.send().await?;
        Ok(response)
    }
}

#[async_trait]
impl ModelProvider for LlmClient {
    async fn stream_text(
        &self,
        messages: Vec<Value>,
        tools: Vec<ToolSpec>,
    ) -> Result<BoxStream<'static, Result<RawChunk>>> {
        let mut payload = self.build_payload(&messages, true);
        if !tools.is_empty() {
            let entries = tools
                .iter()
                .map(|spec| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": spec.name,
                            "description": spec.description,
                            "parameters": spec.input_schema,
                        }
                    })
                })
                .collect::<Vec<_>>();
            payload["tools"] = json!(entries);
            payload["tool_choice"] = json!("auto");
        }
        let response = self.send(&payload).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("模型流式请求失败: {status} {text}"));
        }

        let (tx, rx) = mpsc::channel::<Result<RawChunk>>(STREAM_CHANNEL_SIZE);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            // 按 index 聚合工具调用分片，流结束时整体下发。
            let mut pending_calls: BTreeMap<u64, (String, String, String)> = BTreeMap::new();
            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = tx.send(Err(anyhow!(err))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer = buffer[pos + 1..].to_string();
                    if line.is_empty() || !line.starts_with("data:") {
                        continue;
                    }
                    let data = line.trim_start_matches("data:").trim();
                    if data == "[DONE]" {
                        flush_tool_calls(&tx, &mut pending_calls).await;
                        return;
                    }
                    let Ok(payload) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    let delta = payload
                        .get("choices")
                        .and_then(|value| value.get(0))
                        .and_then(|value| value.get("delta"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    let content_delta = delta.get("content").and_then(Value::as_str).unwrap_or("");
                    if !content_delta.is_empty() {
                        let chunk = RawChunk::TextDelta {
                            text: content_delta.to_string(),
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                        for call in calls {
                            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                            let entry = pending_calls.entry(index).or_default();
                            if let Some(id) = call.get("id").and_then(Value::as_str) {
                                entry.0 = id.to_string();
                            }
                            if let Some(function) = call.get("function") {
                                if let Some(name) = function.get("name").and_then(Value::as_str) {
                                    entry.1.push_str(name);
                                }
                                if let Some(arguments) =
                                    function.get("arguments").and_then(Value::as_str)
                                {
                                    entry.2.push_str(arguments);
                                }
                            }
                        }
                    }
                    let finish = payload
                        .get("choices")
                        .and_then(|value| value.get(0))
                        .and_then(|value| value.get("finish_reason"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if finish == "tool_calls" {
                        flush_tool_calls(&tx, &mut pending_calls).await;
                    }
                }
            }
            flush_tool_calls(&tx, &mut pending_calls).await;
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn stream_object(
        &self,
        system: String,
        prompt: String,
        _schema: Value,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        let messages = vec![
            json!({ "role": "system", "content": system }),
            json!({ "role": "user", "content": prompt }),
        ];
        let mut payload = self.build_payload(&messages, true);
        payload["response_format"] = json!({ "type": "json_object" });
        let response = self.send(&payload).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("模型对象流请求失败: {status} {text}"));
        }

        let (tx, rx) = mpsc::channel::<Result<Value>>(STREAM_CHANNEL_SIZE);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut raw = String::new();
            let mut last_snapshot: Option<Value> = None;
            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = tx.send(Err(anyhow!(err))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer = buffer[pos + 1..].to_string();
                    if line.is_empty() || !line.starts_with("data:") {
                        continue;
                    }
                    let data = line.trim_start_matches("data:").trim();
                    if data == "[DONE]" {
                        return;
                    }
                    let Ok(payload) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    let content_delta = payload
                        .get("choices")
                        .and_then(|value| value.get(0))
                        .and_then(|value| value.get("delta"))
                        .and_then(|value| value.get("content"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if content_delta.is_empty() {
                        continue;
                    }
                    raw.push_str(content_delta);
                    // 部分对象流是累计快照：每当可解析的前缀变化就下发一次。
                    if let Some(snapshot) = repair_partial_json(&raw) {
                        if last_snapshot.as_ref() != Some(&snapshot) {
                            last_snapshot = Some(snapshot.clone());
                            if tx.send(Ok(snapshot)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn complete(&self, system: String, prompt: String) -> Result<String> {
        let messages = vec![
            json!({ "role": "system", "content": system }),
            json!({ "role": "user", "content": prompt }),
        ];
        let payload = self.build_payload(&messages, false);
        let response = self.send(&payload).await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("模型请求失败: {status} {body}"));
        }
        let content = body
            .get("choices")
            .and_then(|value| value.get(0))
            .and_then(|value| value.get("message"))
            .and_then(|value| value.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Ok(content)
    }
}

async fn flush_tool_calls(
    tx: &mpsc::Sender<Result<RawChunk>>,
    pending: &mut BTreeMap<u64, (String, String, String)>,
) {
    for (_, (call_id, name, arguments)) in std::mem::take(pending) {
        if name.trim().is_empty() {
            continue;
        }
        let arguments =
            serde_json::from_str::<Value>(&arguments).unwrap_or(Value::Object(Map::new()));
        let chunk = RawChunk::ToolCall {
            call_id,
            name,
            arguments,
        };
        if tx.send(Ok(chunk)).await.is_err() {
            return;
        }
    }
}

/// 将 JSON 文本前缀补全为可解析的对象：闭合未完成的字符串与括号。
/// 解析失败时返回 None，调用方等待更多增量。
pub fn repair_partial_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    let start = trimmed.find('{')?;
    let body = &trimmed[start..];

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in body.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut candidate = body.to_string();
    if escaped {
        // 断在转义符中间，去掉孤立的反斜杠再闭合。
        candidate.pop();
    }
    if in_string {
        candidate.push('"');
    }
    let closers: String = stack.iter().rev().collect();

    let attempt = format!("{candidate}{closers}");
    if let Ok(value) = serde_json::from_str::<Value>(&attempt) {
        return Some(value);
    }
    // 断在键名或冒号后：回退掉悬空尾巴再试一次。
    let mut fallback = candidate
        .trim_end()
        .trim_end_matches([',', ':'])
        .trim_end()
        .to_string();
    if fallback.ends_with('"') {
        // 首次解析已失败且以引号收尾，说明是悬空键名，回退到上一个分隔符。
        if let Some(pos) = fallback.rfind(['{', ',']) {
            fallback.truncate(pos + 1);
        }
    }
    let fallback = fallback
        .trim_end()
        .trim_end_matches(',')
        .trim_end()
        .to_string();
    let attempt = format!("{fallback}{closers}");
    serde_json::from_str::<Value>(&attempt).ok()
}

pub fn build_llm_client(config: &LlmModelConfig, http: Client) -> LlmClient {
    LlmClient::new(http, config.clone())
}

/// 三个调用入口各自可配不同模型：主对话、工件子调用与标题生成。
#[derive(Clone)]
pub struct ModelProviders {
    pub chat: Arc<dyn ModelProvider>,
    pub artifact: Arc<dyn ModelProvider>,
    pub title: Arc<dyn ModelProvider>,
}

impl ModelProviders {
    pub fn from_config(config: &Config, http: Client) -> Self {
        let provider_of = |resolved: Option<(String, LlmModelConfig)>| -> Arc<dyn ModelProvider> {
            let model_config = resolved.map(|(_, model_config)| model_config).unwrap_or_default();
            Arc::new(build_llm_client(&model_config, http.clone()))
        };
        Self {
            chat: provider_of(config.resolve_model(None)),
            artifact: provider_of(config.artifact_model()),
            title: provider_of(config.title_model()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repair_handles_unterminated_string() {
        let raw = r#"{"code": "fn main() {"#;
        let value = repair_partial_json(raw).unwrap();
        assert_eq!(value["code"], "fn main() {");
    }

    #[test]
    fn repair_handles_dangling_key() {
        let raw = r#"{"code": "done", "lang"#;
        let value = repair_partial_json(raw).unwrap();
        assert_eq!(value["code"], "done");
    }

    #[test]
    fn repair_handles_complete_object() {
        let raw = r#"{"csv": "a,b\n1,2"}"#;
        let value = repair_partial_json(raw).unwrap();
        assert_eq!(value["csv"], "a,b\n1,2");
    }

    #[test]
    fn repair_waits_for_opening_brace() {
        assert!(repair_partial_json("```json").is_none());
    }
}
