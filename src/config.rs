// 配置读取：服务端、模型、存储与可观测性配置，保持 YAML 格式。
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 单个会话的事件队列容量，写满视为客户端失联。
    pub stream_queue_size: usize,
    pub max_history_messages: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8200,
            stream_queue_size: 256,
            max_history_messages: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// 主对话模型名，指向 models 中的条目。
    #[serde(default)]
    pub default: String,
    /// 工件生成子调用使用的模型名，缺省时回退 default。
    #[serde(default)]
    pub artifact_model: Option<String>,
    /// 标题生成使用的模型名，缺省时回退 default。
    #[serde(default)]
    pub title_model: Option<String>,
    #[serde(default)]
    pub models: HashMap<String, LlmModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmModelConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output: Option<u32>,
    #[serde(default)]
    pub max_rounds: Option<u32>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/atelier.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn resolve_model(&self, name: Option<&str>) -> Option<(String, LlmModelConfig)> {
        let name = name
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.llm.default.as_str());
        if let Some(found) = self.llm.models.get(name) {
            return Some((name.to_string(), found.clone()));
        }
        // 配置了模型但名字不匹配时退回第一个条目，对请求方保持宽容。
        self.llm
            .models
            .iter()
            .next()
            .map(|(fallback, config)| (fallback.clone(), config.clone()))
    }

    pub fn artifact_model(&self) -> Option<(String, LlmModelConfig)> {
        self.resolve_model(self.llm.artifact_model.as_deref())
    }

    pub fn title_model(&self) -> Option<(String, LlmModelConfig)> {
        self.resolve_model(self.llm.title_model.as_deref())
    }
}

pub fn load_config() -> Config {
    let path =
        env::var("ATELIER_CONFIG_PATH").unwrap_or_else(|_| "config/atelier.yaml".to_string());
    match fs::read_to_string(&path) {
        Ok(text) => match serde_yaml::from_str::<Config>(&text) {
            Ok(config) => config,
            Err(err) => {
                warn!("配置解析失败，使用默认配置: {path}: {err}");
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}
