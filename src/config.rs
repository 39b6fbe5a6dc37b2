use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Complete incant configuration (loaded from TOML file)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IncantConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub template: TemplateConfig,
}

/// Artifact store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store root, one directory per fingerprint. Relative paths resolve
    /// against the working directory, keeping the cache inside the
    /// repository.
    #[serde(default = "default_store_dir")]
    pub dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

/// Generation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Backend base URL. When unset, the built-in template generator is used
    /// (offline mode).
    pub url: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry budget for transient failures
    #[serde(default = "default_generator_retries")]
    pub retries: u32,

    /// Base backoff between retries (doubled per attempt, with jitter)
    #[serde(default = "default_generator_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_generator_timeout_secs(),
            retries: default_generator_retries(),
            backoff_ms: default_generator_backoff_ms(),
        }
    }
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Sandbox runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Root for per-execution working directories. Defaults to the system
    /// temp directory.
    pub work_dir: Option<String>,

    /// Wall-clock execution timeout
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,

    /// Timeout for isolated dependency installation
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            timeout_secs: default_sandbox_timeout_secs(),
            install_timeout_secs: default_install_timeout_secs(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

/// Template contract configuration, including the capability ceiling no
/// generated candidate may exceed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Current template version of the generation contract. A major-version
    /// change forces new fingerprints.
    #[serde(default = "default_template_version")]
    pub version: String,

    /// Whether candidates may declare network access at all.
    #[serde(default = "default_true")]
    pub allow_network: bool,

    /// Absolute filesystem scopes candidates may declare. Empty means
    /// candidates are confined to their working directory.
    #[serde(default)]
    pub allowed_fs: Vec<String>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            version: default_template_version(),
            allow_network: default_true(),
            allowed_fs: Vec::new(),
        }
    }
}

impl IncantConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: IncantConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

fn default_store_dir() -> String {
    ".incant/scripts".to_string()
}

fn default_generator_timeout_secs() -> u64 {
    30
}

fn default_generator_retries() -> u32 {
    2
}

fn default_generator_backoff_ms() -> u64 {
    500
}

fn default_sandbox_timeout_secs() -> u64 {
    300
}

fn default_install_timeout_secs() -> u64 {
    120
}

fn default_template_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}
