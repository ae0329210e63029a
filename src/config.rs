use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::cli::RunArgs;
use crate::fetch::FetchConfig;
use crate::retry::RetryConfig;
use crate::types::{FileNamePolicy, SourceKind};

const DEFAULT_KNOWLEDGE_BASE: &str = "knowledge_base";
const DEFAULT_STATE_DIR: &str = "~/.kb-ingest";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_CONCURRENCY: usize = 2;
const MAX_CONCURRENCY: usize = 4;
const DEFAULT_MAX_FILE_SIZE: u64 = 25 * 1024 * 1024;
const DEFAULT_CREDENTIALS: &str = "credentials.json";
const DEFAULT_FULL_RESCAN_SECS: u64 = 3600;
const DEFAULT_EXTENSIONS: &[&str] = &[
    ".txt", ".pdf", ".docx", ".json", ".md", ".csv", ".xlsx", ".pptx",
];

pub const SLACK_TOKEN_ENV: &str = "SLACK_BOT_TOKEN";
pub const GOOGLE_KEY_ENV: &str = "GOOGLE_SERVICE_ACCOUNT_KEY";

/// `"C123"` or `["C123", "C456"]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    knowledge_base: Option<String>,
    state_dir: Option<String>,
    output_log_path: Option<String>,
    poll_interval: Option<u64>,
    concurrency: Option<usize>,
    max_retries: Option<u32>,
    retry_delay: Option<u64>,
    file_name_policy: Option<FileNamePolicy>,
    allowed_extensions: Option<Vec<String>>,
    max_file_size: Option<u64>,
    drive: Option<DriveSection>,
    slack: Option<SlackSection>,
    /// Older layout: `{"output": {"json_file": ...}}`.
    output: Option<OutputSection>,
    /// Older layout: `{"monitoring": {"poll_interval": ...}}`.
    monitoring: Option<MonitoringSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DriveSection {
    enabled: Option<bool>,
    credentials: Option<String>,
    target_folders: Vec<String>,
    allowed_extensions: Option<Vec<String>>,
    max_file_size: Option<u64>,
    /// Seconds between full listings; 0 disables them.
    full_rescan_interval: Option<u64>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct SlackSection {
    enabled: Option<bool>,
    bot_token: Option<String>,
    #[serde(alias = "target_channel")]
    target_channels: Option<OneOrMany>,
    allowed_extensions: Option<Vec<String>>,
    max_file_size: Option<u64>,
    message_log_path: Option<String>,
}

impl std::fmt::Debug for SlackSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackSection")
            .field("enabled", &self.enabled)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("target_channels", &self.target_channels)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OutputSection {
    json_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MonitoringSection {
    poll_interval: Option<u64>,
}

impl FileConfig {
    async fn read(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone)]
pub struct DriveConfig {
    /// Service-account key file.
    pub credentials: PathBuf,
    /// Folder ids to watch; empty watches everything the account can see.
    pub target_folders: Vec<String>,
    pub allowed_extensions: Vec<String>,
    pub max_file_size: Option<u64>,
    /// How often to list everything instead of listing from the watermark.
    pub full_rescan: Option<Duration>,
}

#[derive(Clone)]
pub struct SlackConfig {
    pub bot_token: String,
    pub target_channels: Vec<String>,
    pub allowed_extensions: Vec<String>,
    pub max_file_size: Option<u64>,
    pub message_log: PathBuf,
}

impl std::fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackConfig")
            .field("bot_token", &"<redacted>")
            .field("target_channels", &self.target_channels)
            .field("allowed_extensions", &self.allowed_extensions)
            .field("max_file_size", &self.max_file_size)
            .field("message_log", &self.message_log)
            .finish()
    }
}

/// Resolved configuration: file, then environment, then CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub knowledge_base: PathBuf,
    pub state_dir: PathBuf,
    pub event_log: PathBuf,
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub name_policy: FileNamePolicy,
    pub drive: Option<DriveConfig>,
    pub slack: Option<SlackConfig>,
    pub once: bool,
    pub dry_run: bool,
    pub no_progress_bar: bool,
}

/// Where state and files live; enough for the maintenance commands.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub knowledge_base: PathBuf,
    pub state_dir: PathBuf,
}

impl StorePaths {
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }

    /// Read the paths from `config`, falling back to defaults when the file
    /// does not exist.
    pub async fn load(config: &Path) -> anyhow::Result<Self> {
        let file = if tokio::fs::try_exists(config).await.unwrap_or(false) {
            FileConfig::read(config).await?
        } else {
            FileConfig::default()
        };
        Ok(Self::from_file(&file))
    }

    fn from_file(file: &FileConfig) -> Self {
        Self {
            knowledge_base: expand_tilde(
                file.knowledge_base.as_deref().unwrap_or(DEFAULT_KNOWLEDGE_BASE),
            ),
            state_dir: expand_tilde(file.state_dir.as_deref().unwrap_or(DEFAULT_STATE_DIR)),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Lowercase with a leading dot; `None` means the global list.
fn normalize_extensions(list: Option<&Vec<String>>, fallback: &[String]) -> Vec<String> {
    match list {
        None => fallback.to_vec(),
        Some(list) => list
            .iter()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .map(|e| if e.starts_with('.') { e } else { format!(".{}", e) })
            .collect(),
    }
}

impl Config {
    pub async fn load(
        path: &Path,
        run: &RunArgs,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let file = FileConfig::read(path).await?;
        Self::resolve(file, run, env)
    }

    fn resolve(
        file: FileConfig,
        run: &RunArgs,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let paths = StorePaths::from_file(&file);

        let event_log = file
            .output_log_path
            .as_deref()
            .or(file.output.as_ref().and_then(|o| o.json_file.as_deref()))
            .map(expand_tilde)
            .unwrap_or_else(|| paths.knowledge_base.join("events.jsonl"));

        let poll_interval = run
            .poll_interval
            .or(file.poll_interval)
            .or(file.monitoring.as_ref().and_then(|m| m.poll_interval))
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        if poll_interval == 0 {
            anyhow::bail!("poll_interval must be at least 1 second");
        }

        let concurrency = run
            .concurrency
            .or(file.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY);
        if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
            anyhow::bail!(
                "concurrency must be between 1 and {}, got {}",
                MAX_CONCURRENCY,
                concurrency
            );
        }

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_retries: file.max_retries.unwrap_or(defaults.max_retries),
            base_delay_secs: file.retry_delay.unwrap_or(defaults.base_delay_secs),
            max_delay_secs: defaults.max_delay_secs,
        };

        let global_extensions: Vec<String> = match &file.allowed_extensions {
            Some(list) => normalize_extensions(Some(list), &[]),
            None => DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        };
        let global_max = file.max_file_size.or(Some(DEFAULT_MAX_FILE_SIZE));

        let wanted = |kind: SourceKind| run.sources.is_empty() || run.sources.contains(&kind);

        let drive = match file.drive {
            Some(section) if section.enabled.unwrap_or(true) && wanted(SourceKind::Drive) => {
                let credentials = env(GOOGLE_KEY_ENV)
                    .or(section.credentials)
                    .unwrap_or_else(|| DEFAULT_CREDENTIALS.to_string());
                Some(DriveConfig {
                    credentials: expand_tilde(&credentials),
                    target_folders: section.target_folders,
                    allowed_extensions: normalize_extensions(
                        section.allowed_extensions.as_ref(),
                        &global_extensions,
                    ),
                    max_file_size: section.max_file_size.or(global_max),
                    full_rescan: match section
                        .full_rescan_interval
                        .unwrap_or(DEFAULT_FULL_RESCAN_SECS)
                    {
                        0 => None,
                        secs => Some(Duration::from_secs(secs)),
                    },
                })
            }
            _ => None,
        };

        let slack = match file.slack {
            Some(section) if section.enabled.unwrap_or(true) && wanted(SourceKind::Slack) => {
                let bot_token = env(SLACK_TOKEN_ENV)
                    .or(section.bot_token)
                    .filter(|t| !t.trim().is_empty())
                    .with_context(|| {
                        format!("Slack is enabled but no bot token is set ({})", SLACK_TOKEN_ENV)
                    })?;
                let target_channels: Vec<String> = section
                    .target_channels
                    .map(OneOrMany::into_vec)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|c| !c.trim().is_empty())
                    .collect();
                if target_channels.is_empty() {
                    anyhow::bail!("Slack is enabled but no target_channels are configured");
                }
                let message_log = section
                    .message_log_path
                    .as_deref()
                    .map(expand_tilde)
                    .unwrap_or_else(|| {
                        paths
                            .knowledge_base
                            .join(SourceKind::Slack.as_str())
                            .join("messages.jsonl")
                    });
                Some(SlackConfig {
                    bot_token,
                    target_channels,
                    allowed_extensions: normalize_extensions(
                        section.allowed_extensions.as_ref(),
                        &global_extensions,
                    ),
                    max_file_size: section.max_file_size.or(global_max),
                    message_log,
                })
            }
            _ => None,
        };

        for kind in &run.sources {
            let configured = match kind {
                SourceKind::Drive => drive.is_some(),
                SourceKind::Slack => slack.is_some(),
            };
            if !configured {
                anyhow::bail!("--source {} requested but it is not enabled in the config", kind);
            }
        }
        if drive.is_none() && slack.is_none() {
            anyhow::bail!("No source is enabled; configure \"drive\" and/or \"slack\"");
        }
        for size in [
            drive.as_ref().and_then(|d| d.max_file_size),
            slack.as_ref().and_then(|s| s.max_file_size),
        ]
        .into_iter()
        .flatten()
        {
            if size == 0 {
                anyhow::bail!("max_file_size must be greater than zero");
            }
        }

        Ok(Self {
            knowledge_base: paths.knowledge_base,
            state_dir: paths.state_dir,
            event_log,
            poll_interval: Duration::from_secs(poll_interval),
            concurrency,
            retry,
            name_policy: file.file_name_policy.unwrap_or_default(),
            drive,
            slack,
            once: run.once,
            dry_run: run.dry_run,
            no_progress_bar: run.no_progress_bar,
        })
    }

    pub fn store_paths(&self) -> StorePaths {
        StorePaths {
            knowledge_base: self.knowledge_base.clone(),
            state_dir: self.state_dir.clone(),
        }
    }

    pub fn enabled_sources(&self) -> Vec<SourceKind> {
        SourceKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                SourceKind::Drive => self.drive.is_some(),
                SourceKind::Slack => self.slack.is_some(),
            })
            .collect()
    }

    /// Full-listing interval for one source. Slack history is listed by
    /// message time, which never predates the watermark, so it has none.
    pub fn full_rescan(&self, kind: SourceKind) -> Option<Duration> {
        match kind {
            SourceKind::Drive => self.drive.as_ref().and_then(|d| d.full_rescan),
            SourceKind::Slack => None,
        }
    }

    /// Fetcher settings for one source.
    pub fn fetch_config(&self, kind: SourceKind) -> FetchConfig {
        let (allowed_extensions, max_file_size) = match kind {
            SourceKind::Drive => self
                .drive
                .as_ref()
                .map(|d| (d.allowed_extensions.clone(), d.max_file_size)),
            SourceKind::Slack => self
                .slack
                .as_ref()
                .map(|s| (s.allowed_extensions.clone(), s.max_file_size)),
        }
        .unwrap_or_default();
        FetchConfig {
            dir: self.knowledge_base.join(kind.as_str()),
            allowed_extensions,
            max_file_size,
            retry: self.retry,
            name_policy: self.name_policy,
        }
    }
}
