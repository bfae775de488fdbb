//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/pagewise.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [storage]
//! provider = "fs"          # fs | http
//! root = "./uploads"
//!
//! [embedding]
//! provider = "hash"        # disabled | hash | openai
//! dims = 256
//!
//! [responder]
//! provider = "extractive"  # extractive | openai
//!
//! [chat]
//! page_size = 10
//! ```

use anyhow::{bail, Context, Result};
use pagewise_core::models::MAX_PAGE_SIZE;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_provider")]
    pub provider: String,
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_storage_provider(),
            root: default_storage_root(),
            base_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_storage_provider() -> String {
    "fs".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./uploads")
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_history_messages")]
    pub history_messages: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            history_messages: default_history_messages(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_history_messages() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResponderConfig {
    #[serde(default = "default_responder_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_responder_timeout")]
    pub timeout_secs: u64,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            provider: default_responder_provider(),
            model: default_chat_model(),
            temperature: 0.0,
            timeout_secs: default_responder_timeout(),
        }
    }
}

fn default_responder_provider() -> String {
    "extractive".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_responder_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            server_url: None,
            user_id: None,
        }
    }
}

fn default_page_size() -> usize {
    pagewise_core::models::DEFAULT_PAGE_SIZE
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if !(1..=MAX_PAGE_SIZE).contains(&config.chat.page_size) {
        bail!("chat.page_size must be between 1 and {}", MAX_PAGE_SIZE);
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }

    if config.retrieval.history_messages > MAX_PAGE_SIZE {
        bail!(
            "retrieval.history_messages must be at most {}",
            MAX_PAGE_SIZE
        );
    }

    match config.storage.provider.as_str() {
        "fs" => {}
        "http" => {
            if config.storage.base_url.is_none() {
                bail!("storage.base_url must be set when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown storage provider: '{}'. Must be fs or http.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" => {}
        "hash" => {
            if config.embedding.dims.unwrap_or(0) == 0 {
                bail!("embedding.dims must be > 0 when provider is 'hash'");
            }
        }
        "openai" => {
            if config.embedding.dims.unwrap_or(0) == 0 {
                bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, or openai.",
            other
        ),
    }

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    match config.responder.provider.as_str() {
        "extractive" | "openai" => {}
        other => bail!(
            "Unknown responder provider: '{}'. Must be extractive or openai.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/pagewise.sqlite"

[server]
bind = "127.0.0.1:7340"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.chat.page_size, 10);
        assert_eq!(cfg.retrieval.top_k, 4);
        assert_eq!(cfg.storage.provider, "fs");
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.responder.provider, "extractive");
    }

    #[test]
    fn page_size_is_bounded() {
        let text = format!("{}\n[chat]\npage_size = 101\n", MINIMAL);
        assert!(parse_config(&text).is_err());
        let text = format!("{}\n[chat]\npage_size = 0\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn history_window_fits_one_page() {
        let text = format!("{}\n[retrieval]\nhistory_messages = 150\n", MINIMAL);
        let err = parse_config(&text).unwrap_err().to_string();
        assert!(err.contains("retrieval.history_messages"));

        let text = format!("{}\n[retrieval]\nhistory_messages = 100\n", MINIMAL);
        assert_eq!(parse_config(&text).unwrap().retrieval.history_messages, 100);
        let text = format!("{}\n[retrieval]\nhistory_messages = 0\n", MINIMAL);
        assert_eq!(parse_config(&text).unwrap().retrieval.history_messages, 0);
    }

    #[test]
    fn openai_embedding_needs_model_and_dims() {
        let text = format!("{}\n[embedding]\nprovider = \"openai\"\ndims = 1536\n", MINIMAL);
        let err = parse_config(&text).unwrap_err().to_string();
        assert!(err.contains("embedding.model"));
    }

    #[test]
    fn http_storage_needs_base_url() {
        let text = format!("{}\n[storage]\nprovider = \"http\"\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn unknown_responder_rejected() {
        let text = format!("{}\n[responder]\nprovider = \"magic\"\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }
}
