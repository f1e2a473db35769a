// 全局应用状态：集中初始化存储、模型入口与轮次调度器。
use crate::config::Config;
use crate::llm::ModelProviders;
use crate::orchestrator::Orchestrator;
use crate::storage::{build_storage, StorageBackend};
use crate::title::TitleGenerator;
use anyhow::Result;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn StorageBackend>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let storage = build_storage(&config.storage)?;
        let providers = ModelProviders::from_config(&config, reqwest::Client::new());
        let titles = Arc::new(TitleGenerator::new(providers.title.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            storage.clone(),
            providers,
            titles,
        ));
        Ok(Self {
            config,
            storage,
            orchestrator,
        })
    }
}
