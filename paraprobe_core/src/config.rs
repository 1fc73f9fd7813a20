use serde::Deserialize;
use std::path::PathBuf;

/// Target URL and payload input sources.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub url_file: Option<PathBuf>,
    pub single_url: Option<String>,
    pub payload_file: Option<PathBuf>,
    pub single_payload: Option<String>,
    /// Cap on the number of deduplicated URLs, applied before the payload
    /// cross product.
    pub max_urls: Option<usize>,
}

/// Explicit external-tool locations; environment variables and PATH are
/// consulted when these are unset.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolSettings {
    pub qsreplace_path: Option<PathBuf>,
    pub gf_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub verbose: bool,
}

pub fn default_max_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            dry_run: false,
            resume: false,
            quiet: false,
            verbose: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    /// Defaults to `<dir>/state.json`.
    pub state_file: Option<PathBuf>,
    /// Defaults to `<dir>/rce_params.txt`.
    pub corpus_file: Option<PathBuf>,
    #[serde(default = "default_archive")]
    pub archive: bool,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./paraprobe_results")
}

fn default_archive() -> bool {
    true
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            state_file: None,
            corpus_file: None,
            archive: default_archive(),
        }
    }
}

impl OutputSettings {
    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.dir.join("state.json"))
    }

    pub fn corpus_path(&self) -> PathBuf {
        self.corpus_file
            .clone()
            .unwrap_or_else(|| self.dir.join("rce_params.txt"))
    }
}

/// Full configuration surface for one run, loadable from a TOML file and
/// overridable flag-by-flag at the CLI.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    #[serde(default)]
    pub targets: TargetSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl ProbeConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: ProbeConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
