use serde::{Deserialize, Serialize};
use std::fs;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    #[serde(default = "default_error_backoff")]
    pub error_backoff: u64,
    /// Seconds a single service scan may take; 0 disables the limit.
    #[serde(default = "default_producer_timeout")]
    pub producer_timeout: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
    #[serde(default)]
    pub first_cycle: FirstCyclePolicy,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default = "default_start_on_subscribe")]
    pub start_on_subscribe: bool,
    /// Messages a subscriber may have queued before it is dropped as stalled.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

/// What the very first cycle reports, when there is nothing to diff against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FirstCyclePolicy {
    /// Every record of the first snapshot is reported as new.
    #[default]
    AllNew,
    /// The first snapshot only becomes the baseline.
    Baseline,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            services: default_services(),
            scan_interval: default_scan_interval(),
            error_backoff: default_error_backoff(),
            producer_timeout: default_producer_timeout(),
            stop_timeout: default_stop_timeout(),
            first_cycle: FirstCyclePolicy::default(),
            autostart: false,
            start_on_subscribe: default_start_on_subscribe(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

fn default_services() -> Vec<String> {
    ["s3", "ec2", "iam", "rds"].iter().map(|s| s.to_string()).collect()
}

fn default_scan_interval() -> u64 { 300 }
fn default_error_backoff() -> u64 { 10 }
fn default_producer_timeout() -> u64 { 120 }
fn default_stop_timeout() -> u64 { 5 }
fn default_start_on_subscribe() -> bool { true }
fn default_subscriber_queue() -> usize { 64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        IpcConfig { socket_path: default_socket_path() }
    }
}

pub fn default_socket_path() -> String {
    "/run/driftwatch/driftwatch.sock".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProducerKind {
    #[default]
    Http,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default)]
    pub kind: ProducerKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_directory")]
    pub directory: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            kind: ProducerKind::default(),
            base_url: default_base_url(),
            directory: default_directory(),
            request_timeout: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String { "http://127.0.0.1:8000/api/v1/scan".to_string() }
fn default_directory() -> String { "./fixtures".to_string() }
fn default_request_timeout() -> u64 { 30 }

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path))?;
        Self::parse(&content).with_context(|| format!("parsing config {}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn default_path() -> String {
        std::env::var("DRIFTWATCH_CONFIG")
            .unwrap_or_else(|_| "./config/default.toml".to_string())
    }
}
