//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credential secrets live in the TOML under [[credentials]]; the file is
//! expected to be permissioned accordingly. Secrets are wrapped in
//! `common::Secret` the moment they are deserialized so they never show
//! up in logs or debug output.

use common::Secret;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub responders: Vec<ResponderConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Handler used when a request's model names no configured handler.
    pub default_handler: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// One upstream credential: endpoint, bearer secret, and the model it serves.
#[derive(Debug, Deserialize)]
pub struct CredentialConfig {
    /// Optional stable alias; omitted aliases are generated at registration.
    #[serde(default)]
    pub alias: Option<String>,
    pub url: String,
    /// Inline secret. Takes precedence over `secret_file`.
    #[serde(default)]
    pub secret: Option<Secret<String>>,
    /// Path to a file containing the secret (alternative to inline `secret`).
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
    pub model: String,
    /// Daily request quota. Negative means unlimited.
    #[serde(default = "default_limit")]
    pub limit: i64,
}

/// A named handler backed by rotating credentials. Either a flat alias
/// list or a set of weighted tiers, never both.
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Deserialize)]
pub struct TierConfig {
    pub aliases: Vec<String>,
    /// Temperature applied when the caller did not set one.
    pub temperature: f64,
}

/// A handler that cycles through fixed replies without any upstream call.
#[derive(Debug, Deserialize)]
pub struct ResponderConfig {
    pub name: String,
    #[serde(default)]
    pub replies: Vec<String>,
}

/// Request transform settings, applied in declaration order before dispatch.
#[derive(Debug, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub add_timestamp: bool,
    #[serde(default)]
    pub web_summary: WebSummaryConfig,
    #[serde(default)]
    pub hook: HookConfig,
    #[serde(default)]
    pub query_apis: QueryApisConfig,
}

#[derive(Debug, Deserialize)]
pub struct WebSummaryConfig {
    #[serde(default)]
    pub enable: bool,
    /// Handler that condenses fetched pages. When absent, raw page JSON is
    /// injected instead of a summary.
    #[serde(default)]
    pub summary_handler: Option<String>,
    #[serde(default = "default_reader_url")]
    pub reader_url: String,
    /// Pause between consecutive page fetches.
    #[serde(default = "default_fetch_delay_ms")]
    pub inter_request_delay_ms: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for WebSummaryConfig {
    fn default() -> Self {
        Self {
            enable: false,
            summary_handler: None,
            reader_url: default_reader_url(),
            inter_request_delay_ms: default_fetch_delay_ms(),
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub rules: Vec<HookRuleConfig>,
}

/// First rule whose keyword appears in the latest user message wins.
#[derive(Debug, Clone, Deserialize)]
pub struct HookRuleConfig {
    pub keywords: Vec<String>,
    pub target: String,
    pub temperature: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryApisConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub apis: Vec<QueryApiConfig>,
}

/// GET endpoint invoked when `--<name>` appears in the latest user message.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryApiConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_limit() -> i64 {
    -1
}

fn default_reader_url() -> String {
    "https://r.jina.ai".to_owned()
}

fn default_fetch_delay_ms() -> u64 {
    3000
}

impl Config {
    /// Load configuration from a TOML file, resolve file-based secrets,
    /// and validate cross references.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        for cred in &mut config.credentials {
            if cred.secret.is_some() {
                continue;
            }
            if let Some(ref file) = cred.secret_file {
                let value = std::fs::read_to_string(file).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read secret_file {}: {e}",
                        file.display()
                    ))
                })?;
                let value = value.trim().to_owned();
                if !value.is_empty() {
                    cred.secret = Some(Secret::new(value));
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        for cred in &self.credentials {
            if !cred.url.starts_with("http://") && !cred.url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "credential url must start with http:// or https://, got: {}",
                    cred.url
                )));
            }
            if cred.secret.is_none() {
                return Err(common::Error::Config(format!(
                    "credential for {} has neither secret nor a usable secret_file",
                    cred.url
                )));
            }
        }

        // Handler names are a single namespace shared by pools and responders.
        let mut names = HashSet::new();
        for pool in &self.pools {
            if !names.insert(pool.name.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate handler name: {}",
                    pool.name
                )));
            }
            match (pool.aliases.is_empty(), pool.tiers.is_empty()) {
                (true, true) => {
                    return Err(common::Error::Config(format!(
                        "pool {} must declare aliases or tiers",
                        pool.name
                    )));
                }
                (false, false) => {
                    return Err(common::Error::Config(format!(
                        "pool {} declares both aliases and tiers",
                        pool.name
                    )));
                }
                _ => {}
            }
        }
        for responder in &self.responders {
            if !names.insert(responder.name.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate handler name: {}",
                    responder.name
                )));
            }
        }
        if names.is_empty() {
            return Err(common::Error::Config(
                "at least one pool or responder is required".into(),
            ));
        }

        if !names.contains(self.server.default_handler.as_str()) {
            return Err(common::Error::Config(format!(
                "default_handler {} names no configured pool or responder",
                self.server.default_handler
            )));
        }
        if let Some(ref summary) = self.pipeline.web_summary.summary_handler {
            if !names.contains(summary.as_str()) {
                return Err(common::Error::Config(format!(
                    "summary_handler {summary} names no configured pool or responder"
                )));
            }
        }
        for rule in &self.pipeline.hook.rules {
            if !names.contains(rule.target.as_str()) {
                return Err(common::Error::Config(format!(
                    "hook rule target {} names no configured pool or responder",
                    rule.target
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("keypool-gateway.toml")
    }
}
