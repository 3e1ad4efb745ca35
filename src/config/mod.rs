use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".drover";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_wait_minutes_per_position")]
    pub wait_minutes_per_position: u64,
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

/// How the agent process is launched and pumped.
///
/// ```toml
/// [session]
/// program = "python3"
/// script = "agent/main.py"
/// poll_interval_ms = 100
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_session_program")]
    pub program: String,
    #[serde(default = "default_session_script")]
    pub script: String,
    /// Interpreter arguments placed before the script.
    #[serde(default = "default_session_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_env_passthrough")]
    pub env_passthrough: Vec<String>,
    #[serde(default = "default_failure_sentinels")]
    pub failure_sentinels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierSettings {
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
    #[serde(default = "default_multiline_idle_threshold_ms")]
    pub multiline_idle_threshold_ms: u64,
    #[serde(default = "default_max_prompt_len")]
    pub max_prompt_len: usize,
    #[serde(default = "default_history")]
    pub history: usize,
    #[serde(default = "default_prompt_patterns")]
    pub prompt_patterns: Vec<String>,
    #[serde(default = "default_restart_pattern")]
    pub restart_pattern: String,
    #[serde(default = "default_multiline_markers")]
    pub multiline_markers: Vec<String>,
    #[serde(default = "default_multiline_prompt")]
    pub multiline_prompt: String,
    #[serde(default = "default_banner_markers")]
    pub banner_markers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSettings {
    /// Overrides the `.drover` state directory discovered next to the config.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8100
}

fn default_max_concurrent() -> usize {
    3
}

fn default_wait_minutes_per_position() -> u64 {
    15
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_session_program() -> String {
    "python3".to_string()
}

fn default_session_script() -> String {
    "main.py".to_string()
}

fn default_session_args() -> Vec<String> {
    vec!["-u".to_string()]
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_env_passthrough() -> Vec<String> {
    [
        "OPENAI_API_KEY",
        "QDRANT_API_KEY",
        "QDRANT_URL",
        "ETHERSCAN_API_KEY",
        "MONGO_URI",
        "WALLET_PRIVATE_KEY",
        "HUGGINGFACE_API_KEY",
        "TOGETHER_API_KEY",
        "REPLICATE_API_TOKEN",
        "KINDO_API_KEY",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_failure_sentinels() -> Vec<String> {
    vec!["GRAPH_RECURSION_LIMIT".to_string()]
}

fn default_idle_threshold_ms() -> u64 {
    300
}

fn default_multiline_idle_threshold_ms() -> u64 {
    500
}

fn default_max_prompt_len() -> usize {
    300
}

fn default_history() -> usize {
    10
}

fn default_prompt_patterns() -> Vec<String> {
    [
        r"Enter the contract name.*:\s*$",
        r"Enter the specific function.*:\s*$",
        r"Enter hypothesis.*:\s*$",
        r"Enter your detailed vulnerability hypothesis.*:\s*$",
        r"\(y/N\):?\s*$",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_restart_pattern() -> String {
    r"(?i)run another".to_string()
}

fn default_multiline_markers() -> Vec<String> {
    vec![
        "press Enter twice when done".to_string(),
        "Enter your detailed vulnerability hypothesis".to_string(),
    ]
}

fn default_multiline_prompt() -> String {
    "Enter your detailed vulnerability hypothesis:".to_string()
}

fn default_banner_markers() -> Vec<String> {
    vec![
        "ANALYSIS SETUP".to_string(),
        "VULNERABILITY HYPOTHESIS".to_string(),
        "Let's focus on".to_string(),
        "============".to_string(),
    ]
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            wait_minutes_per_position: default_wait_minutes_per_position(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            program: default_session_program(),
            script: default_session_script(),
            args: default_session_args(),
            working_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            env_passthrough: default_env_passthrough(),
            failure_sentinels: default_failure_sentinels(),
        }
    }
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            idle_threshold_ms: default_idle_threshold_ms(),
            multiline_idle_threshold_ms: default_multiline_idle_threshold_ms(),
            max_prompt_len: default_max_prompt_len(),
            history: default_history(),
            prompt_patterns: default_prompt_patterns(),
            restart_pattern: default_restart_pattern(),
            multiline_markers: default_multiline_markers(),
            multiline_prompt: default_multiline_prompt(),
            banner_markers: default_banner_markers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl BridgeConfig {
    /// Search upward from `start` for a `.drover/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: BridgeConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((BridgeConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}
