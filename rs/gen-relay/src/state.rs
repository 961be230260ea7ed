//! Process-wide shared state, constructed once in `main` and cloned into every handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use genlite::chat::ChatRegistry;
use genlite::endpoint::EndpointPool;
use genlite::identity::{AccountInfo, IdentityBackend, IdentityCache};
use genlite::llm::{HttpLlmClient, LlmClient};
use genlite::metrics::Metrics;
use genlite::role::RoleConfig;
use genlite::session::SharedApi;
use genlite::video::VideoWorker;

use crate::config::Config;

/// Validates a token against the Hugging Face `whoami` endpoint.
pub struct HfIdentityBackend {
    client: reqwest::Client,
}

impl HfIdentityBackend {
    pub fn new() -> Self {
        HfIdentityBackend { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl IdentityBackend for HfIdentityBackend {
    async fn whoami(&self, token: &str) -> Option<AccountInfo> {
        let response = self
            .client
            .get("https://huggingface.co/api/whoami-v2")
            .bearer_auth(token)
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let body: serde_json::Value = response.json().await.ok()?;
        let username = body.get("name").and_then(|v| v.as_str())?.to_string();
        let is_pro = body.get("isPro").and_then(|v| v.as_bool()).unwrap_or(false);
        Some(AccountInfo { username, is_pro })
    }
}

pub struct AppState {
    pub product_name: String,
    pub maintenance_mode: bool,
    pub secret_token: Option<String>,
    pub api: Arc<SharedApi>,
    pub identity: IdentityCache<HfIdentityBackend>,
    pub metrics: Metrics,
    next_connection_id: AtomicU64,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let endpoint_urls = config.endpoints.urls();
        let api = Arc::new(SharedApi {
            endpoints: EndpointPool::new(endpoint_urls),
            video_worker: VideoWorker::new(config.secrets.hf_token.clone()),
            chat: ChatRegistry::new(),
            roles: RoleConfig::default(),
            llm: build_llm_client(config),
        });

        AppState {
            product_name: config.product.product_name.clone(),
            maintenance_mode: config.product.maintenance_mode,
            secret_token: config.secrets.secret_token.clone(),
            api,
            identity: IdentityCache::new(HfIdentityBackend::new(), config.product.admin_accounts.clone()),
            metrics: Metrics::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// A process-unique id for a freshly accepted connection, used as the chat fan-out identity.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn build_llm_client(config: &Config) -> Arc<dyn LlmClient> {
    let endpoint = if config.secrets.text_model.is_empty() {
        "https://api-inference.huggingface.co/models/mistralai/Mistral-7B-Instruct-v0.2".to_string()
    } else {
        format!("https://api-inference.huggingface.co/models/{}", config.secrets.text_model)
    };
    Arc::new(HttpLlmClient::new(endpoint, config.secrets.hf_token.clone()))
}
