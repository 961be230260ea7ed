//! Process configuration, parsed from CLI flags or environment variables.

use std::net::SocketAddr;

/// Top-level process configuration.
#[derive(clap::Parser, Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Directory of static files served at `/{*path}`, falling back to `index.html`.
    #[arg(long, env = "PUBLIC_DIR", default_value = "build/web")]
    pub public_dir: String,

    #[command(flatten)]
    pub product: ProductConfig,

    #[command(flatten)]
    pub secrets: SecretsConfig,

    #[command(flatten)]
    pub endpoints: EndpointsConfig,
}

#[derive(clap::Args, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ProductConfig {
    #[arg(long, env = "PRODUCT_NAME", default_value = "AiTube")]
    #[serde(default = "default_product_name")]
    pub product_name: String,

    /// Reject new connections with a 503-equivalent payload while set.
    #[arg(long, env = "MAINTENANCE_MODE", default_value = "false")]
    #[serde(default)]
    pub maintenance_mode: bool,

    /// Admin usernames, resolved by the identity backend's `whoami`.
    #[arg(long, env = "ADMIN_ACCOUNTS", value_delimiter = ',', default_value = "jbilcke-hf")]
    #[serde(default)]
    pub admin_accounts: Vec<String>,
}

fn default_product_name() -> String {
    "AiTube".to_string()
}

#[derive(clap::Args, Clone, Debug, serde::Serialize, serde::Deserialize, Default)]
pub struct SecretsConfig {
    /// Bearer credential forwarded to the identity backend and video workers.
    #[arg(long, env = "HF_TOKEN")]
    #[serde(skip_serializing)]
    pub hf_token: Option<String>,

    /// Shared secret gating `GET /api/metrics`.
    #[arg(long, env = "SECRET_TOKEN")]
    #[serde(skip_serializing)]
    pub secret_token: Option<String>,

    /// Hosted text-generation model identifier.
    #[arg(long, env = "TEXT_MODEL", default_value = "")]
    #[serde(default)]
    pub text_model: String,
}

#[derive(clap::Args, Clone, Debug, serde::Serialize, serde::Deserialize, Default)]
pub struct EndpointsConfig {
    #[arg(long, env = "MAX_NODES", default_value_t = 8)]
    #[serde(default)]
    pub max_nodes: usize,

    #[arg(long, env = "VIDEO_ROUND_ROBIN_SERVER_1", default_value = "")]
    #[serde(default)]
    pub server_1: String,
    #[arg(long, env = "VIDEO_ROUND_ROBIN_SERVER_2", default_value = "")]
    #[serde(default)]
    pub server_2: String,
    #[arg(long, env = "VIDEO_ROUND_ROBIN_SERVER_3", default_value = "")]
    #[serde(default)]
    pub server_3: String,
    #[arg(long, env = "VIDEO_ROUND_ROBIN_SERVER_4", default_value = "")]
    #[serde(default)]
    pub server_4: String,
    #[arg(long, env = "VIDEO_ROUND_ROBIN_SERVER_5", default_value = "")]
    #[serde(default)]
    pub server_5: String,
    #[arg(long, env = "VIDEO_ROUND_ROBIN_SERVER_6", default_value = "")]
    #[serde(default)]
    pub server_6: String,
    #[arg(long, env = "VIDEO_ROUND_ROBIN_SERVER_7", default_value = "")]
    #[serde(default)]
    pub server_7: String,
    #[arg(long, env = "VIDEO_ROUND_ROBIN_SERVER_8", default_value = "")]
    #[serde(default)]
    pub server_8: String,
}

impl EndpointsConfig {
    /// Filters empty slots, then truncates the survivors to `max_nodes`.
    pub fn urls(&self) -> Vec<String> {
        [
            &self.server_1,
            &self.server_2,
            &self.server_3,
            &self.server_4,
            &self.server_5,
            &self.server_6,
            &self.server_7,
            &self.server_8,
        ]
        .into_iter()
        .filter(|url| !url.is_empty())
        .take(self.max_nodes)
        .cloned()
        .collect()
    }
}
