use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, ValueEnum};
use odm_core::{Backoff, GoogleDriveClient, GraphClient, UploadTarget};

use crate::sync::engine::{EngineError, RunOptions, UploadMode};
use crate::sync::permissions::DomainMap;
use crate::sync::verify::DiffScope;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_ATTEMPTS: u64 = 8;
const DEFAULT_FILETREE: &str = "/var/tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Fetch file content from the source drive into the local tree
    Download,
    /// Report how much a download would transfer and how long it might take
    DownloadEstimate,
    /// Print the path of every matching file
    ListFilenames,
    /// Push the local tree to the destination
    Upload,
    /// Check the local tree against the snapshot
    Verify,
    /// Check the destination against the local tree
    VerifyUpload,
    /// Delete local files that are not in the snapshot
    CleanFiletree,
    /// Render captured notebooks
    ConvertNotebooks,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Action::Download => "download",
            Action::DownloadEstimate => "download-estimate",
            Action::ListFilenames => "list-filenames",
            Action::Upload => "upload",
            Action::Verify => "verify",
            Action::VerifyUpload => "verify-upload",
            Action::CleanFiletree => "clean-filetree",
            Action::ConvertNotebooks => "convert-notebooks",
        }
    }

    pub fn upload_mode(self) -> Option<UploadMode> {
        match self {
            Action::Upload => Some(UploadMode::Upload),
            Action::VerifyUpload => Some(UploadMode::VerifyUpload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Destination {
    #[default]
    Google,
    Local,
}

#[derive(Debug, Parser)]
#[command(name = "odm", version)]
#[command(about = "Migrate a drive tree described by a metadata snapshot", long_about = None)]
pub struct Cli {
    /// Metadata snapshot captured from the source drive
    pub snapshot: PathBuf,
    #[arg(value_enum)]
    pub action: Action,
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
    /// Local tree that mirrors the source drive, /var/tmp unless given (required for clean-filetree)
    #[arg(long, required_if_eq("action", "clean-filetree"))]
    pub filetree: Option<PathBuf>,
    #[arg(long, conflicts_with = "upload_group")]
    pub upload_user: Option<String>,
    #[arg(long)]
    pub upload_group: Option<String>,
    /// Folder below the destination container, e.g. migrated/2024
    #[arg(long)]
    pub upload_path: Option<String>,
    /// Rewrite grantee e-mail domains, e.g. old.com:new.com,legacy.org:new.com
    #[arg(long)]
    pub domain_map: Option<DomainMap>,
    /// Only process items whose path starts with this prefix
    #[arg(long)]
    pub limit: Option<String>,
    /// File listing item paths to exclude, one per line
    #[arg(long)]
    pub exclude: Option<PathBuf>,
    /// Attributes compared when checking files: size, hash or both
    #[arg(long)]
    pub diff: Option<DiffScope>,
    #[arg(long, value_enum, default_value_t)]
    pub destination: Destination,
    /// Root directory of the local destination
    #[arg(long, required_if_eq("destination", "local"))]
    pub upload_root: Option<PathBuf>,
}

impl Cli {
    pub fn run_options(&self) -> Result<RunOptions, EngineError> {
        let exclude = match &self.exclude {
            Some(path) => load_exclusions(path)?,
            None => HashSet::new(),
        };
        Ok(RunOptions {
            dest_root: self.filetree().to_path_buf(),
            exclude,
            limit: self.limit.clone(),
            diff: self.diff.unwrap_or_default(),
        })
    }

    pub fn filetree(&self) -> &Path {
        self.filetree
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_FILETREE))
    }

    pub fn upload_target(&self, settings: &Settings) -> Option<UploadTarget> {
        if let Some(user) = &self.upload_user {
            return Some(UploadTarget::User(settings.qualify(user)));
        }
        self.upload_group
            .as_ref()
            .map(|group| UploadTarget::Group(settings.qualify(group)))
    }
}

pub fn load_exclusions(path: &Path) -> Result<HashSet<String>, EngineError> {
    let raw = std::fs::read_to_string(path).map_err(|source| EngineError::Exclusions {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(raw
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// Service settings taken from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub graph_token: Option<String>,
    pub graph_base_url: Option<String>,
    pub google_token: Option<String>,
    pub google_base_url: Option<String>,
    pub domain: Option<String>,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let read_u64 = |name: &str, default: u64| {
            read(name)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(default)
        };
        Self {
            graph_token: read("ODM_GRAPH_TOKEN"),
            graph_base_url: read("ODM_GRAPH_BASE_URL"),
            google_token: read("ODM_GOOGLE_TOKEN"),
            google_base_url: read("ODM_GOOGLE_BASE_URL"),
            domain: read("ODM_DOMAIN"),
            timeout: Duration::from_secs(read_u64("ODM_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)),
            max_attempts: u32::try_from(read_u64("ODM_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS))
                .unwrap_or(u32::MAX),
        }
    }

    /// Appends the configured domain to bare account names.
    pub fn qualify(&self, name: &str) -> String {
        match &self.domain {
            Some(domain) if !name.contains('@') => format!("{name}@{domain}"),
            _ => name.to_string(),
        }
    }

    pub fn graph_client(&self) -> anyhow::Result<GraphClient> {
        let token = self
            .graph_token
            .as_deref()
            .context("ODM_GRAPH_TOKEN is not set")?;
        let client = match &self.graph_base_url {
            Some(base) => GraphClient::with_base_url(base, token)?,
            None => GraphClient::new(token)?,
        };
        Ok(client
            .with_timeout(self.timeout)?
            .with_retry(Backoff::remote_default(), self.max_attempts))
    }

    pub fn google_client(&self) -> anyhow::Result<GoogleDriveClient> {
        let token = self
            .google_token
            .as_deref()
            .context("ODM_GOOGLE_TOKEN is not set")?;
        let client = match &self.google_base_url {
            Some(base) => GoogleDriveClient::with_base_url(base, token)?,
            None => GoogleDriveClient::new(token)?,
        };
        Ok(client
            .with_timeout(self.timeout)?
            .with_retry(Backoff::remote_default(), self.max_attempts))
    }
}
