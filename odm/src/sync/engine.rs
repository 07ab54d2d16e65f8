use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use odm_core::{DriveError, GraphClient, Lookup, RemoteDriveClient, UploadTarget};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, error, info, warn};

use super::clean::clean_filetree;
use super::paths::{PathError, expand_path, local_path};
use super::permissions::PermissionReplicator;
use super::transfer::{TransferClient, TransferError};
use super::verify::{DiffScope, verify_file};
use crate::snapshot::{Item, ItemKind, Snapshot};

pub const DOWNLOAD_ATTEMPTS: u32 = 3;
const MIB: f64 = 1024.0 * 1024.0;
/// Throughput assumed by the download estimate, in bytes per second.
const ESTIMATE_BYTES_PER_SEC: u64 = 24 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no upload user or group given")]
    MissingUploadTarget,
    #[error("unable to find destination container for {target}: {source}")]
    Container {
        target: UploadTarget,
        #[source]
        source: DriveError,
    },
    #[error("destination folder {0} does not exist")]
    MissingUploadPath(String),
    #[error("failed to resolve destination folder {path}: {source}")]
    UploadPath {
        path: String,
        #[source]
        source: DriveError,
    },
    #[error("unsupported action {0}")]
    UnsupportedAction(&'static str),
    #[error("failed to read exclusion list {path}: {source}")]
    Exclusions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("item has no source drive id")]
    MissingDriveId,
    #[error("gave up after {0} attempts")]
    AttemptsExhausted(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Upload,
    VerifyUpload,
}

impl UploadMode {
    fn creates(self) -> bool {
        self == UploadMode::Upload
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<H> {
    Unresolved,
    Resolved(H),
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dest_root: PathBuf,
    pub exclude: HashSet<String>,
    pub limit: Option<String>,
    pub diff: DiffScope,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub matched: u64,
    pub bytes: u64,
    pub verified: u64,
    pub transferred: u64,
    pub skipped: u64,
    pub failures: u64,
    pub shared: u64,
    pub share_failures: u64,
    pub removed: u64,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures == 0
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn mebibytes(&self) -> f64 {
        self.bytes as f64 / MIB
    }

    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs(self.matched + self.bytes / ESTIMATE_BYTES_PER_SEC)
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

pub struct TransferEngine<'a> {
    snapshot: &'a Snapshot,
    options: RunOptions,
}

impl<'a> TransferEngine<'a> {
    pub fn new(snapshot: &'a Snapshot, options: RunOptions) -> Self {
        Self { snapshot, options }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Applies exclusion, prefix limit and malware filters in that order.
    /// Returns the item's display path when it should be processed.
    fn select(&self, id: &str, item: &Item, report: &mut RunReport) -> Option<String> {
        let item_path = match expand_path(self.snapshot, id, false) {
            Ok(path) => path,
            Err(err) => {
                warn!(item = id, "{err}");
                report.failures += 1;
                return None;
            }
        };

        if self.options.exclude.contains(&item_path) {
            debug!(path = %item_path, "excluded");
            return None;
        }
        if let Some(limit) = &self.options.limit
            && !item_path.starts_with(limit.as_str())
        {
            return None;
        }
        debug!(path = %item_path, "working on item");
        if item.is_malware() {
            info!(path = %item_path, "tagged as malware and cannot be processed");
            report.skipped += 1;
            return None;
        }

        report.matched += 1;
        report.bytes += item.size.unwrap_or(0);
        Some(item_path)
    }

    fn log_summary(&self, report: &RunReport, started: Instant) {
        info!(
            "{:.2} MiB across {} items, elapsed time {}",
            report.mebibytes(),
            report.matched,
            format_duration(started.elapsed())
        );
    }

    pub fn estimate(&self) -> RunReport {
        let mut report = RunReport::default();
        for (id, item) in self.snapshot.files() {
            self.select(id, item, &mut report);
        }
        info!(
            "{:.2} MiB across {} items, estimated time {}",
            report.mebibytes(),
            report.matched,
            format_duration(report.estimated_duration())
        );
        report
    }

    pub fn list_filenames<W: Write>(&self, out: &mut W) -> io::Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport::default();
        for (id, item) in self.snapshot.files() {
            if let Some(item_path) = self.select(id, item, &mut report) {
                writeln!(out, "{item_path}")?;
            }
        }
        out.flush()?;
        self.log_summary(&report, started);
        Ok(report)
    }

    pub async fn verify(&self) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::default();
        for (id, item) in self.snapshot.files() {
            let Some(item_path) = self.select(id, item, &mut report) else {
                continue;
            };
            match self.verify_item(id, item).await {
                Ok(true) => {
                    info!(path = %item_path, "verified");
                    report.verified += 1;
                }
                Ok(false) => {
                    warn!(path = %item_path, "failed to verify");
                    report.failures += 1;
                }
                Err(err) => {
                    warn!(path = %item_path, "failed to verify: {err}");
                    report.failures += 1;
                }
            }
        }
        self.log_summary(&report, started);
        report
    }

    async fn verify_item(&self, id: &str, item: &Item) -> Result<bool, ItemError> {
        let dest = local_path(&self.options.dest_root, self.snapshot, id)?;
        Ok(verify_file(&dest, self.options.diff.expected(item), true).await?)
    }

    pub async fn download(&self, source: &GraphClient, transfer: &TransferClient) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::default();
        for (id, item) in self.snapshot.files() {
            let Some(item_path) = self.select(id, item, &mut report) else {
                continue;
            };
            match self.download_item(id, item, source, transfer).await {
                Ok(true) => {
                    debug!(path = %item_path, "already present");
                    report.verified += 1;
                }
                Ok(false) => report.transferred += 1,
                Err(err) => {
                    warn!(path = %item_path, "failed to download: {err}");
                    report.failures += 1;
                }
            }
        }
        self.log_summary(&report, started);
        report
    }

    async fn download_item(
        &self,
        id: &str,
        item: &Item,
        source: &GraphClient,
        transfer: &TransferClient,
    ) -> Result<bool, ItemError> {
        let dest = local_path(&self.options.dest_root, self.snapshot, id)?;
        if verify_file(&dest, self.options.diff.expected(item), false).await? {
            return Ok(true);
        }

        let drive_id = item.drive_id().ok_or(ItemError::MissingDriveId)?;
        info!(path = %dest.display(), "downloading");

        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            let location = match source.download_location(drive_id, id).await {
                Ok(Some(location)) => location,
                Ok(None) => {
                    warn!(path = %dest.display(), attempt, "no download location");
                    continue;
                }
                Err(err) => {
                    warn!(path = %dest.display(), attempt, "failed to fetch download location: {err}");
                    continue;
                }
            };

            match transfer
                .download_to_path(&location, &dest, item.declared_hash())
                .await
            {
                Ok(_) => {
                    set_modified(&dest, item).await?;
                    return Ok(false);
                }
                Err(TransferError::IntegrityMismatch { expected, actual }) => {
                    info!(path = %dest.display(), attempt, %expected, %actual, "hash mismatch");
                }
                Err(err) => {
                    warn!(path = %dest.display(), attempt, "download attempt failed: {err}");
                }
            }
        }

        Err(ItemError::AttemptsExhausted(DOWNLOAD_ATTEMPTS))
    }

    pub fn clean_filetree(&self) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::default();
        let mut keep = HashSet::new();
        for (id, item) in self.snapshot.files() {
            match expand_path(self.snapshot, id, true) {
                Ok(path) => {
                    report.matched += 1;
                    report.bytes += item.size.unwrap_or(0);
                    keep.insert(path);
                }
                Err(err) => warn!(item = id, "{err}"),
            }
        }

        let cleaned = clean_filetree(&self.options.dest_root, &keep);
        report.removed = cleaned.removed;
        report.failures += cleaned.failures;
        self.log_summary(&report, started);
        report
    }

    pub async fn resolve_destination<C: RemoteDriveClient>(
        client: &C,
        target: &UploadTarget,
        upload_path: Option<&str>,
        mode: UploadMode,
    ) -> Result<C::Handle, EngineError> {
        let mut handle = client
            .container_root(target, mode.creates())
            .await
            .map_err(|source| EngineError::Container {
                target: target.clone(),
                source,
            })?;

        let Some(upload_path) = upload_path else {
            return Ok(handle);
        };
        for segment in upload_path.split('/').filter(|s| !s.is_empty()) {
            let lookup = client
                .get_or_create_folder(&handle, segment, mode.creates())
                .await
                .map_err(|source| EngineError::UploadPath {
                    path: upload_path.to_string(),
                    source,
                })?;
            handle = lookup
                .into_handle()
                .ok_or_else(|| EngineError::MissingUploadPath(upload_path.to_string()))?;
        }
        Ok(handle)
    }

    pub async fn upload<C: RemoteDriveClient>(
        &self,
        client: &C,
        root: C::Handle,
        mode: UploadMode,
        replicator: &PermissionReplicator,
    ) -> RunReport {
        let started = Instant::now();
        let mut run = UploadRun::new(self, client, root, mode, replicator);
        run.run().await;
        self.log_summary(&run.report, started);
        run.report
    }
}

struct UploadRun<'e, 'a, C: RemoteDriveClient> {
    engine: &'e TransferEngine<'a>,
    client: &'e C,
    root: C::Handle,
    mode: UploadMode,
    replicator: &'e PermissionReplicator,
    resolutions: HashMap<&'a str, Resolution<C::Handle>>,
    report: RunReport,
}

impl<'e, 'a, C: RemoteDriveClient> UploadRun<'e, 'a, C> {
    fn new(
        engine: &'e TransferEngine<'a>,
        client: &'e C,
        root: C::Handle,
        mode: UploadMode,
        replicator: &'e PermissionReplicator,
    ) -> Self {
        Self {
            engine,
            client,
            root,
            mode,
            replicator,
            resolutions: HashMap::new(),
            report: RunReport::default(),
        }
    }

    async fn run(&mut self) {
        let snapshot: &'a Snapshot = self.engine.snapshot;
        for (id, item) in snapshot.files() {
            if self.engine.select(id, item, &mut self.report).is_none() {
                continue;
            }
            self.process_leaf(id).await;
        }
    }

    fn resolution(&self, id: &str) -> Resolution<C::Handle> {
        self.resolutions
            .get(id)
            .cloned()
            .unwrap_or(Resolution::Unresolved)
    }

    /// Resolves the unresolved ancestry of `leaf_id` root-first, then the
    /// leaf itself, and drops the leaf's entry afterwards.
    async fn process_leaf(&mut self, leaf_id: &'a str) {
        let snapshot: &'a Snapshot = self.engine.snapshot;
        let mut pending: Vec<&'a str> = Vec::new();
        let mut current = leaf_id;

        loop {
            if self.resolutions.contains_key(current) {
                break;
            }
            let Some(item) = snapshot.get(current) else {
                warn!(item = leaf_id, "ancestor {current} is not in the snapshot");
                self.report.failures += 1;
                return;
            };
            let Some(parent) = item.parent_id() else {
                if current == leaf_id {
                    warn!(item = leaf_id, "file has no parent folder");
                    self.report.failures += 1;
                    return;
                }
                self.resolutions
                    .insert(current, Resolution::Resolved(self.root.clone()));
                break;
            };
            pending.push(current);
            if pending.len() > snapshot.len() {
                warn!(item = leaf_id, "ancestry loops back on itself");
                self.report.failures += 1;
                return;
            }
            current = parent;
        }

        while let Some(step) = pending.pop() {
            self.resolve_step(step, step == leaf_id).await;
        }
        self.resolutions.remove(leaf_id);
    }

    async fn resolve_step(&mut self, id: &'a str, is_leaf: bool) {
        let snapshot: &'a Snapshot = self.engine.snapshot;
        let Some(item) = snapshot.get(id) else {
            return;
        };
        let Some(parent_id) = item.parent_id() else {
            return;
        };
        let step_path = expand_path(snapshot, id, false).unwrap_or_else(|_| item.name.clone());

        let parent = match self.resolution(parent_id) {
            Resolution::Resolved(handle) => handle,
            Resolution::Skipped => {
                debug!(path = %step_path, "parent was skipped");
                self.resolutions.insert(id, Resolution::Skipped);
                if is_leaf {
                    self.report.skipped += 1;
                }
                return;
            }
            Resolution::Failed | Resolution::Unresolved => {
                info!(path = %step_path, "parent does not exist at destination");
                self.resolutions.insert(id, Resolution::Failed);
                if is_leaf {
                    self.report.failures += 1;
                }
                return;
            }
        };

        let handle = match item.kind() {
            ItemKind::Package => {
                if item.package_type() != Some("oneNote") {
                    info!(
                        path = %step_path,
                        package = item.package_type().unwrap_or("unknown"),
                        "skipping unsupported package"
                    );
                    self.resolutions.insert(id, Resolution::Skipped);
                    return;
                }
                let lookup = self
                    .client
                    .get_or_create_notebook(&parent, &item.name, self.mode.creates())
                    .await;
                match self.container(id, &step_path, "notebook", lookup) {
                    Some(handle) => handle,
                    None => return,
                }
            }
            ItemKind::Folder => {
                let lookup = self
                    .client
                    .get_or_create_folder(&parent, &item.name, self.mode.creates())
                    .await;
                match self.container(id, &step_path, "folder", lookup) {
                    Some(handle) => handle,
                    None => return,
                }
            }
            ItemKind::File => match self.file(id, item, &parent, &step_path).await {
                Some(handle) => handle,
                None => return,
            },
        };

        if self.mode == UploadMode::Upload {
            let summary = self
                .replicator
                .replicate(self.client, &handle, &step_path, &item.permissions)
                .await;
            self.report.shared += summary.applied;
            self.report.share_failures += summary.failed;
        }
        self.resolutions.insert(id, Resolution::Resolved(handle));
    }

    fn container(
        &mut self,
        id: &'a str,
        step_path: &str,
        kind: &str,
        lookup: Result<Lookup<C::Handle>, DriveError>,
    ) -> Option<C::Handle> {
        let failed = match self.mode {
            UploadMode::Upload => Resolution::Skipped,
            UploadMode::VerifyUpload => Resolution::Failed,
        };
        match lookup {
            Ok(lookup) => {
                if let Some(handle) = lookup.into_handle() {
                    return Some(handle);
                }
                match self.mode {
                    UploadMode::Upload => error!(path = %step_path, "{kind} missing after creation"),
                    UploadMode::VerifyUpload => {
                        info!(path = %step_path, "{kind} does not exist at destination")
                    }
                }
            }
            Err(err) => error!(path = %step_path, "failed to resolve {kind}: {err}"),
        }
        self.resolutions.insert(id, failed);
        self.report.failures += 1;
        None
    }

    async fn file(
        &mut self,
        id: &'a str,
        item: &Item,
        parent: &C::Handle,
        step_path: &str,
    ) -> Option<C::Handle> {
        let source = match local_path(&self.engine.options.dest_root, self.engine.snapshot, id) {
            Ok(source) => source,
            Err(err) => {
                warn!(path = %step_path, "{err}");
                self.resolutions.insert(id, Resolution::Failed);
                self.report.failures += 1;
                return None;
            }
        };

        match self.mode {
            UploadMode::Upload => match self.client.upload_file(parent, &source, &item.name).await {
                Ok(handle) => {
                    info!(path = %step_path, "uploaded");
                    self.report.transferred += 1;
                    Some(handle)
                }
                Err(err) => {
                    error!(path = %step_path, "failed to upload: {err}");
                    self.resolutions.insert(id, Resolution::Failed);
                    self.report.failures += 1;
                    None
                }
            },
            UploadMode::VerifyUpload => {
                match self
                    .client
                    .verify_remote_file(parent, &source, &item.name)
                    .await
                {
                    Ok(true) => {
                        info!(path = %step_path, "verified");
                        self.report.verified += 1;
                    }
                    Ok(false) => {
                        warn!(path = %step_path, "failed to verify");
                        self.report.failures += 1;
                    }
                    Err(err) => {
                        warn!(path = %step_path, "failed to verify: {err}");
                        self.report.failures += 1;
                    }
                }
                None
            }
        }
    }
}

async fn set_modified(dest: &Path, item: &Item) -> io::Result<()> {
    let Some(value) = item.modified() else {
        return Ok(());
    };
    let modified = match OffsetDateTime::parse(value, &Rfc3339) {
        Ok(parsed) => SystemTime::from(parsed),
        Err(err) => {
            warn!(path = %dest.display(), value, "unparseable modification time: {err}");
            return Ok(());
        }
    };
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(dest)
        .await?
        .into_std()
        .await;
    file.set_modified(modified)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
