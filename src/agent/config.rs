use super::error::{AgentError, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "scriptbox")]
#[command(about = "Scriptbox - lets a language model read, write and run scripts inside one directory")]
pub struct CliArgs {
    /// What the model should do
    pub prompt: String,

    /// Log every tool call, tool result and token totals
    #[arg(long)]
    pub verbose: bool,

    /// JSON config file; CLI flags and environment override its values
    #[arg(long, env = "SCRIPTBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory the model is confined to
    #[arg(long, env = "SCRIPTBOX_ROOT")]
    pub root: Option<PathBuf>,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "SCRIPTBOX_MODEL")]
    pub model: Option<String>,

    /// Base URL of the model service
    #[arg(long, env = "SCRIPTBOX_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Directory for rolling log files (console only when unset)
    #[arg(long, env = "SCRIPTBOX_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Maximum tool-dispatch cycles before giving up
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// Characters returned by a file read before truncating
    #[arg(long)]
    pub max_chars: Option<usize>,

    #[arg(long)]
    pub script_timeout_secs: Option<u64>,

    /// Program used to run scripts
    #[arg(long)]
    pub interpreter: Option<String>,

    /// Retries after a transient model failure
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Delay before the first retry; doubles on each further retry
    #[arg(long)]
    pub retry_base_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Prefix the model may put in front of paths; defaults to the root's name.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_script_extension")]
    pub script_extension: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            alias: None,
            model: default_model(),
            endpoint: default_endpoint(),
            api_key: None,
            max_steps: default_max_steps(),
            max_chars: default_max_chars(),
            script_timeout_secs: default_script_timeout_secs(),
            interpreter: default_interpreter(),
            script_extension: default_script_extension(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            log_dir: None,
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("Failed to read config at {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            AgentError::Config(format!("Failed to parse config JSON at {}: {}", path.display(), e))
        })
    }

    /// Defaults, then the config file, then flags and environment.
    pub fn resolve(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, args: &CliArgs) {
        if let Some(root) = &args.root {
            self.root = root.clone();
        }
        if let Some(key) = &args.api_key {
            self.api_key = Some(key.clone());
        }
        if let Some(model) = &args.model {
            self.model = model.clone();
        }
        if let Some(endpoint) = &args.endpoint {
            self.endpoint = endpoint.clone();
        }
        if let Some(dir) = &args.log_dir {
            self.log_dir = Some(dir.clone());
        }
        if let Some(n) = args.max_steps {
            self.max_steps = n;
        }
        if let Some(n) = args.max_chars {
            self.max_chars = n;
        }
        if let Some(n) = args.script_timeout_secs {
            self.script_timeout_secs = n;
        }
        if let Some(interpreter) = &args.interpreter {
            self.interpreter = interpreter.clone();
        }
        if let Some(n) = args.max_retries {
            self.max_retries = n;
        }
        if let Some(n) = args.retry_base_ms {
            self.retry_base_ms = n;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(AgentError::Config("max_steps must be at least 1".to_string()));
        }
        if self.max_chars == 0 {
            return Err(AgentError::Config("max_chars must be at least 1".to_string()));
        }
        if self.script_timeout_secs == 0 {
            return Err(AgentError::Config(
                "script_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.interpreter.trim().is_empty() {
            return Err(AgentError::Config("interpreter must not be empty".to_string()));
        }
        self.endpoint_url()?;
        Ok(())
    }

    /// The model service key. Its absence is fatal before any remote call.
    pub fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AgentError::Config("GEMINI_API_KEY environment variable is required".to_string()))
    }

    /// Endpoint with a trailing slash so API paths join beneath it.
    pub fn endpoint_url(&self) -> Result<Url> {
        let mut raw = self.endpoint.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let url = Url::parse(&raw)
            .map_err(|e| AgentError::Config(format!("Invalid endpoint '{}': {}", self.endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AgentError::Config(format!(
                "Endpoint must be http or https: {}",
                self.endpoint
            )));
        }
        Ok(url)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Show only the ends of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 12 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "<too-short>".to_string()
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./sandbox")
}

fn default_model() -> String {
    "gemini-2.0-flash-001".to_string()
}

fn default_endpoint() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_max_steps() -> usize {
    20
}

fn default_max_chars() -> usize {
    10_000
}

fn default_script_timeout_secs() -> u64 {
    30
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_script_extension() -> String {
    "py".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_request_timeout_secs() -> u64 {
    120
}
