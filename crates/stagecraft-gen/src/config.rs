//! Layered configuration system
//!
//! Config is loaded with three layers of precedence (highest wins):
//! 1. Environment variables (process environment, then a `.env` file)
//! 2. Project-local: `.stagecraft/config.toml`
//! 3. Global: `~/.stagecraft/config.toml`
//!
//! The resolved [`StagecraftConfig`] is a plain value. Backends receive their
//! own section by value at construction; nothing reads the environment after
//! loading.

use serde::{Deserialize, Serialize};
use stagecraft_core::{Result, StagecraftError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const HUNYUAN: &str = "hunyuan";
pub const SF3D: &str = "sf3d";
pub const MOCK: &str = "mock";

const DEFAULT_HUNYUAN_REGION: &str = "ap-guangzhou";
const DEFAULT_HUNYUAN_ENDPOINT: &str = "ai3d.tencentcloudapi.com";
const DEFAULT_HUNYUAN_VERSION: &str = "2025-05-13";
const DEFAULT_SF3D_ENDPOINT: &str = "127.0.0.1:8189";

/// Tencent Hunyuan 3D credentials and endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HunyuanConfig {
    pub secret_id: Option<String>,
    pub secret_key: Option<String>,
    pub region: String,
    pub endpoint: String,
    pub api_version: String,
    pub enabled: bool,
}

impl Default for HunyuanConfig {
    fn default() -> Self {
        Self {
            secret_id: None,
            secret_key: None,
            region: DEFAULT_HUNYUAN_REGION.to_string(),
            endpoint: DEFAULT_HUNYUAN_ENDPOINT.to_string(),
            api_version: DEFAULT_HUNYUAN_VERSION.to_string(),
            enabled: true,
        }
    }
}

impl HunyuanConfig {
    /// Both halves of the secret pair present and non-empty
    pub fn check(&self) -> Result<()> {
        if !self.enabled {
            return Err(StagecraftError::Configuration(
                "hunyuan backend is disabled (DISABLE_HUNYUAN_3D)".to_string(),
            ));
        }
        let present = |v: &Option<String>| v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
        if !present(&self.secret_id) || !present(&self.secret_key) {
            return Err(StagecraftError::Configuration(
                "hunyuan credentials not configured. Set HUNYUAN_SECRET_ID and HUNYUAN_SECRET_KEY or add them to .stagecraft/config.toml".to_string(),
            ));
        }
        Ok(())
    }
}

/// Local StableFast3D (ComfyUI) server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sf3dConfig {
    pub endpoint: Option<String>,
    pub workflow_template: Option<PathBuf>,
    pub enabled: bool,
}

impl Default for Sf3dConfig {
    fn default() -> Self {
        Self {
            endpoint: Some(DEFAULT_SF3D_ENDPOINT.to_string()),
            workflow_template: None,
            enabled: true,
        }
    }
}

impl Sf3dConfig {
    pub fn check(&self) -> Result<()> {
        if !self.enabled {
            return Err(StagecraftError::Configuration(
                "sf3d backend is disabled (DISABLE_SF3D)".to_string(),
            ));
        }
        match self.endpoint.as_deref() {
            Some(e) if !e.trim().is_empty() => Ok(()),
            _ => Err(StagecraftError::Configuration(
                "sf3d endpoint not configured. Set COMFYUI_SERVER or backends.sf3d.endpoint".to_string(),
            )),
        }
    }

    /// Base URL with an `http://` scheme added when missing
    pub fn base_url(&self) -> Option<String> {
        self.endpoint.as_deref().map(|e| {
            let e = e.trim_end_matches('/');
            if e.starts_with("http://") || e.starts_with("https://") {
                e.to_string()
            } else {
                format!("http://{}", e)
            }
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendsConfig {
    pub hunyuan: HunyuanConfig,
    pub sf3d: Sf3dConfig,
}

/// Generation defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Canonical order used by `Auto` priority
    pub backend_priority: Vec<String>,
    pub max_parallel: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            backend_priority: vec![HUNYUAN.to_string(), SF3D.to_string()],
            max_parallel: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    pub interval_secs: f64,
    pub max_attempts: u32,
    pub max_wall_clock_secs: u64,
    pub max_consecutive_errors: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3.0,
            max_attempts: 200,
            max_wall_clock_secs: 600,
            max_consecutive_errors: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 500,
            request_timeout_secs: 60,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyConfig {
    pub executable: String,
    pub timeout_secs: u64,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            executable: "blender".to_string(),
            timeout_secs: 300,
        }
    }
}

/// Resolved configuration with environment overrides applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagecraftConfig {
    pub backends: BackendsConfig,
    pub generation: GenerationConfig,
    pub polling: PollingConfig,
    pub transport: TransportConfig,
    pub assembly: AssemblyConfig,
}

// On-disk shape: every field optional so layers only override what they set.

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    backends: BackendsFile,
    #[serde(default)]
    generation: GenerationFile,
    #[serde(default)]
    polling: PollingFile,
    #[serde(default)]
    transport: TransportFile,
    #[serde(default)]
    assembly: AssemblyFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BackendsFile {
    #[serde(default)]
    hunyuan: HunyuanFile,
    #[serde(default)]
    sf3d: Sf3dFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct HunyuanFile {
    secret_id: Option<String>,
    secret_key: Option<String>,
    region: Option<String>,
    endpoint: Option<String>,
    api_version: Option<String>,
    enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Sf3dFile {
    endpoint: Option<String>,
    workflow_template: Option<PathBuf>,
    enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GenerationFile {
    backend_priority: Option<Vec<String>>,
    max_parallel: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PollingFile {
    interval_secs: Option<f64>,
    max_attempts: Option<u32>,
    max_wall_clock_secs: Option<u64>,
    max_consecutive_errors: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TransportFile {
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AssemblyFile {
    executable: Option<String>,
    timeout_secs: Option<u64>,
}

macro_rules! overlay {
    ($target:expr, $source:expr) => {
        if let Some(v) = $source {
            $target = v;
        }
    };
}

impl StagecraftConfig {
    /// Load config with layered precedence: global < project < env vars
    pub fn load() -> Result<Self> {
        let mut files = Vec::new();
        if let Some(global) = Self::global_config_path() {
            files.push(global);
        }
        files.push(PathBuf::from(".stagecraft/config.toml"));
        Self::load_layers(&files, &Self::collect_env())
    }

    /// Load from specific files (lowest precedence first) and an explicit
    /// environment map. Missing files are skipped.
    pub fn load_layers(files: &[PathBuf], env: &HashMap<String, String>) -> Result<Self> {
        let mut config = StagecraftConfig::default();
        for path in files {
            if path.exists() {
                let file = Self::load_file(path)?;
                config.merge(file);
            }
        }
        config.apply_env(env)?;
        Ok(config)
    }

    /// Process environment layered over the `.env` file, if any.
    ///
    /// The `.env` file is read as data; the process environment is not
    /// modified.
    pub fn collect_env() -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Ok(iter) = dotenvy::dotenv_iter() {
            for (key, value) in iter.flatten() {
                env.insert(key, value);
            }
        }
        env.extend(std::env::vars());
        env
    }

    fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".stagecraft").join("config.toml"))
    }

    fn load_file(path: &Path) -> Result<ConfigFile> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            StagecraftError::TomlParse(format!("Failed to parse config {}: {}", path.display(), e))
        })
    }

    fn merge(&mut self, file: ConfigFile) {
        let h = file.backends.hunyuan;
        let hunyuan = &mut self.backends.hunyuan;
        if h.secret_id.is_some() {
            hunyuan.secret_id = h.secret_id;
        }
        if h.secret_key.is_some() {
            hunyuan.secret_key = h.secret_key;
        }
        overlay!(hunyuan.region, h.region);
        overlay!(hunyuan.endpoint, h.endpoint);
        overlay!(hunyuan.api_version, h.api_version);
        overlay!(hunyuan.enabled, h.enabled);

        let s = file.backends.sf3d;
        let sf3d = &mut self.backends.sf3d;
        if s.endpoint.is_some() {
            sf3d.endpoint = s.endpoint;
        }
        if s.workflow_template.is_some() {
            sf3d.workflow_template = s.workflow_template;
        }
        overlay!(sf3d.enabled, s.enabled);

        overlay!(self.generation.backend_priority, file.generation.backend_priority);
        overlay!(self.generation.max_parallel, file.generation.max_parallel);

        overlay!(self.polling.interval_secs, file.polling.interval_secs);
        overlay!(self.polling.max_attempts, file.polling.max_attempts);
        overlay!(self.polling.max_wall_clock_secs, file.polling.max_wall_clock_secs);
        overlay!(self.polling.max_consecutive_errors, file.polling.max_consecutive_errors);

        overlay!(self.transport.max_retries, file.transport.max_retries);
        overlay!(self.transport.retry_base_delay_ms, file.transport.retry_base_delay_ms);
        overlay!(self.transport.request_timeout_secs, file.transport.request_timeout_secs);

        overlay!(self.assembly.executable, file.assembly.executable);
        overlay!(self.assembly.timeout_secs, file.assembly.timeout_secs);
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<()> {
        let get = |key: &str| env.get(key).filter(|v| !v.trim().is_empty()).cloned();

        if let Some(v) = get("HUNYUAN_SECRET_ID") {
            self.backends.hunyuan.secret_id = Some(v);
        }
        if let Some(v) = get("HUNYUAN_SECRET_KEY") {
            self.backends.hunyuan.secret_key = Some(v);
        }
        if let Some(v) = get("HUNYUAN_REGION") {
            self.backends.hunyuan.region = v;
        }
        if let Some(v) = get("COMFYUI_SERVER") {
            self.backends.sf3d.endpoint = Some(v);
        }
        if let Some(v) = get("SF3D_WORKFLOW_TEMPLATE") {
            self.backends.sf3d.workflow_template = Some(PathBuf::from(v));
        }
        if get("DISABLE_HUNYUAN_3D").as_deref().map(is_truthy).unwrap_or(false) {
            self.backends.hunyuan.enabled = false;
        }
        if get("DISABLE_SF3D").as_deref().map(is_truthy).unwrap_or(false) {
            self.backends.sf3d.enabled = false;
        }
        if let Some(v) = get("STAGECRAFT_BACKEND_PRIORITY") {
            let order: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if order.is_empty() {
                return Err(StagecraftError::Configuration(
                    "STAGECRAFT_BACKEND_PRIORITY is set but names no backends".to_string(),
                ));
            }
            self.generation.backend_priority = order;
        }
        Ok(())
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}
