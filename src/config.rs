use codeloop::backend::{BackendKind, HttpJobConfig, LocalConfig, PollPolicy};
use codeloop::orchestrator::OrchestratorConfig;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    #[serde(rename = "loop")]
    pub loop_: LoopSection,
    pub backend: BackendSection,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSection {
    pub max_iterations: u32,
    pub stale_token_limit: u32,
    pub artifact_type: String,
    pub execution_timeout_ms: u64,
}

impl Default for LoopSection {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            stale_token_limit: 3,
            artifact_type: "analysis_code".to_string(),
            execution_timeout_ms: 60000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub kind: BackendKind,
    pub local: LocalSection,
    pub remote: RemoteSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSection {
    pub interpreter: String,
    pub inline_flag: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    pub max_output_bytes: usize,
    pub kill_grace_ms: u64,
}

impl Default for LocalSection {
    fn default() -> Self {
        let defaults = LocalConfig::default();
        Self {
            interpreter: defaults.interpreter,
            inline_flag: defaults.inline_flag,
            args: defaults.args,
            work_dir: defaults.work_dir,
            max_output_bytes: defaults.max_output_bytes,
            kill_grace_ms: defaults.kill_grace_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    #[serde(flatten)]
    pub http: HttpJobConfig,
    pub poll: PollPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("codeloop"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            loop_: LoopSection::default(),
            backend: BackendSection::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_iterations: self.loop_.max_iterations,
            stale_token_limit: self.loop_.stale_token_limit,
            artifact_type: self.loop_.artifact_type.clone(),
            execution_timeout: Duration::from_millis(self.loop_.execution_timeout_ms),
        }
    }

    pub fn local(&self) -> LocalConfig {
        let section = &self.backend.local;
        LocalConfig {
            interpreter: section.interpreter.clone(),
            inline_flag: section.inline_flag.clone(),
            args: section.args.clone(),
            work_dir: section.work_dir.clone(),
            env: Vec::new(),
            max_output_bytes: section.max_output_bytes,
            kill_grace_ms: section.kill_grace_ms,
        }
    }
}
