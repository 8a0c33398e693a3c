//! Configuration loading from conduit.toml and mcpServers JSON files.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mcp::{ServerConfig, SessionOptions};
use runtime::providers::{AnthropicAuth, DEFAULT_OLLAMA_PORT};
use runtime::{AnthropicBackend, CohereBackend, DEFAULT_MAX_ROUNDS, DirectiveBackend, OllamaBackend};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "conduit.toml";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Model backend.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Orchestration limits.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Tool providers to launch, in priority order.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Which backend adapter to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[default]
    Ollama,
    Cohere,
    Directive,
}

impl Provider {
    fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::Ollama => "qwen3:8b",
            Self::Cohere => "command-r",
            Self::Directive => "gpt-4o-mini",
        }
    }

    /// Environment variables consulted for an API key, in order.
    fn key_vars(self) -> &'static [&'static str] {
        match self {
            Self::Anthropic => &["ANTHROPIC_API_KEY"],
            Self::Ollama => &[],
            Self::Cohere => &["COHERE_API_KEY", "COHERE_TRIAL_KEY"],
            Self::Directive => &["OPENAI_API_KEY"],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
            Self::Cohere => "cohere",
            Self::Directive => "directive",
        };
        f.write_str(name)
    }
}

/// Backend provider configuration.
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub provider: Provider,

    /// Model to use. Defaults per provider.
    pub model: Option<String>,

    /// Host and port of a local backend (ollama).
    pub host: Option<String>,
    pub port: Option<u16>,

    /// Full base URL; overrides host and port.
    pub base_url: Option<String>,

    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,

    /// Request streamed replies where the backend supports it.
    #[serde(default)]
    pub stream: bool,

    /// API key. Falls back to the provider's environment variable.
    pub api_key: Option<String>,

    /// Seeded as the conversation's system message.
    pub system_prompt: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: None,
            host: None,
            port: None,
            base_url: None,
            timeout_secs: default_backend_timeout(),
            stream: false,
            api_key: None,
            system_prompt: None,
        }
    }
}

fn default_backend_timeout() -> u64 {
    runtime::DEFAULT_BACKEND_TIMEOUT.as_secs()
}

/// Orchestration limits.
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            tool_timeout_secs: default_tool_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

fn default_max_rounds() -> usize {
    DEFAULT_MAX_ROUNDS
}

fn default_tool_timeout() -> u64 {
    mcp::DEFAULT_CALL_TIMEOUT.as_secs()
}

fn default_handshake_timeout() -> u64 {
    mcp::DEFAULT_TIMEOUT.as_secs()
}

impl EngineConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            call_timeout: Duration::from_secs(self.tool_timeout_secs),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `conduit.toml` in the
    /// working directory is used if present, and defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::read(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::read(Path::new(DEFAULT_CONFIG_FILE))?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Append the providers listed in an `mcpServers` JSON file.
    pub fn add_servers_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.servers.extend(parse_servers_json(&content)?);
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_rounds == 0 {
            return Err(ConfigError::Invalid("engine.max_rounds must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(ConfigError::Invalid("every server needs a name".into()));
            }
            if server.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("server '{}' has no command", server.name)));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!("server '{}' is configured twice", server.name)));
            }
        }
        Ok(())
    }
}

impl BackendConfig {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(self.provider.default_model())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The configured key, or the first provider variable `lookup` finds.
    pub fn api_key(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.provider
                .key_vars()
                .iter()
                .find_map(|var| lookup(var).filter(|v| !v.is_empty()))
        })
    }

    fn required_key(&self) -> Result<String, ConfigError> {
        self.api_key(env_var).ok_or_else(|| ConfigError::MissingApiKey {
            provider: self.provider,
            vars: self.provider.key_vars().join(" or "),
        })
    }

    pub fn anthropic(&self) -> Result<AnthropicBackend, ConfigError> {
        let mut builder = AnthropicBackend::builder(AnthropicAuth::ApiKey(self.required_key()?), self.model())
            .timeout(self.timeout());
        if let Some(url) = &self.base_url {
            builder = builder.base_url(url);
        }
        Ok(builder.build())
    }

    pub fn ollama(&self) -> OllamaBackend {
        let mut builder = OllamaBackend::builder(self.model())
            .stream(self.stream)
            .timeout(self.timeout());
        builder = match (&self.base_url, &self.host) {
            (Some(url), _) => builder.base_url(url),
            (None, Some(host)) => builder.host(host, self.port.unwrap_or(DEFAULT_OLLAMA_PORT)),
            (None, None) => builder.host("localhost", self.port.unwrap_or(DEFAULT_OLLAMA_PORT)),
        };
        builder.build()
    }

    pub fn cohere(&self) -> Result<CohereBackend, ConfigError> {
        let mut builder = CohereBackend::builder(self.required_key()?, self.model()).timeout(self.timeout());
        if let Some(url) = &self.base_url {
            builder = builder.base_url(url);
        }
        Ok(builder.build())
    }

    pub fn directive(&self) -> DirectiveBackend {
        let mut builder = DirectiveBackend::builder(self.model()).timeout(self.timeout());
        if let Some(url) = &self.base_url {
            builder = builder.base_url(url);
        } else if let Some(host) = &self.host {
            builder = builder.base_url(format!("http://{host}:{}", self.port.unwrap_or(8000)));
        }
        if let Some(key) = self.api_key(env_var) {
            builder = builder.api_key(key);
        }
        builder.build()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// mcpServers JSON
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServersFile {
    mcp_servers: ServerEntries,
}

#[derive(Debug, Deserialize)]
struct LaunchEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    #[serde(default)]
    cwd: Option<PathBuf>,
}

/// Server entries in the order the file lists them.
#[derive(Debug)]
struct ServerEntries(Vec<ServerConfig>);

impl<'de> Deserialize<'de> for ServerEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = ServerEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of server name to launch entry")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ServerEntries, A::Error> {
                let mut servers = Vec::new();
                while let Some((name, entry)) = map.next_entry::<String, LaunchEntry>()? {
                    servers.push(ServerConfig {
                        name,
                        command: entry.command,
                        args: entry.args,
                        env: entry.env.unwrap_or_default(),
                        cwd: entry.cwd,
                    });
                }
                Ok(ServerEntries(servers))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// Parse `{"mcpServers": {"name": {"command", "args", "env"}}}`.
pub fn parse_servers_json(json: &str) -> Result<Vec<ServerConfig>, ConfigError> {
    let file: ServersFile = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
    Ok(file.mcp_servers.0)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("no API key for {provider}: set backend.api_key or {vars}")]
    MissingApiKey { provider: Provider, vars: String },
}
