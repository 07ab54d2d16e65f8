use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::drive::{DriveError, Lookup, RemoteDriveClient, UploadTarget};
use crate::quickxor::hash_file;

const SHARE_LOG: &str = ".odm-shares.jsonl";

// Grants go to a JSON-lines log at the root.
#[derive(Debug, Clone)]
pub struct LocalDriveClient {
    root: PathBuf,
}

#[derive(Debug, Serialize)]
struct ShareRecord<'a> {
    path: &'a Path,
    address: &'a str,
    roles: &'a [String],
}

impl LocalDriveClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn share_log(&self) -> PathBuf {
        self.root.join(SHARE_LOG)
    }

    async fn directory_lookup(
        &self,
        parent: &Path,
        name: &str,
        create: bool,
    ) -> Result<Lookup<PathBuf>, DriveError> {
        let path = parent.join(checked_name(name)?);
        if tokio::fs::metadata(&path).await.is_ok_and(|meta| meta.is_dir()) {
            return Ok(Lookup::Found(path));
        }
        if !create {
            return Ok(Lookup::NotFound);
        }
        tokio::fs::create_dir_all(&path).await?;
        debug!(path = %path.display(), "created directory");
        Ok(Lookup::Created(path))
    }
}

impl RemoteDriveClient for LocalDriveClient {
    type Handle = PathBuf;

    async fn container_root(
        &self,
        target: &UploadTarget,
        create: bool,
    ) -> Result<PathBuf, DriveError> {
        let bucket = match target {
            UploadTarget::User(_) => "users",
            UploadTarget::Group(_) => "groups",
        };
        let path = self.root.join(bucket).join(checked_name(target.name())?);
        if tokio::fs::metadata(&path).await.is_ok_and(|meta| meta.is_dir()) {
            return Ok(path);
        }
        if !create {
            return Err(DriveError::MissingContainer(target.to_string()));
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    async fn get_or_create_folder(
        &self,
        parent: &PathBuf,
        name: &str,
        create: bool,
    ) -> Result<Lookup<PathBuf>, DriveError> {
        self.directory_lookup(parent, name, create).await
    }

    async fn get_or_create_notebook(
        &self,
        parent: &PathBuf,
        name: &str,
        create: bool,
    ) -> Result<Lookup<PathBuf>, DriveError> {
        self.directory_lookup(parent, name, create).await
    }

    async fn upload_file(
        &self,
        parent: &PathBuf,
        source: &Path,
        name: &str,
    ) -> Result<PathBuf, DriveError> {
        let target = parent.join(checked_name(name)?);
        if same_content(source, &target).await? {
            debug!(path = %target.display(), "checksums match");
            return Ok(target);
        }

        tokio::fs::create_dir_all(parent).await?;
        let partial = target.with_file_name(format!("{name}.partial"));
        tokio::fs::copy(source, &partial).await?;
        tokio::fs::rename(&partial, &target).await?;
        info!(path = %target.display(), "copied");
        Ok(target)
    }

    async fn verify_remote_file(
        &self,
        parent: &PathBuf,
        source: &Path,
        name: &str,
    ) -> Result<bool, DriveError> {
        let target = parent.join(checked_name(name)?);
        Ok(same_content(source, &target).await?)
    }

    async fn share(
        &self,
        target: &PathBuf,
        address: &str,
        roles: &[String],
    ) -> Result<(), DriveError> {
        let record = ShareRecord {
            path: target.strip_prefix(&self.root).unwrap_or(target),
            address,
            roles,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        tokio::fs::create_dir_all(&self.root).await?;
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.share_log())
            .await?;
        log.write_all(&line).await?;
        log.flush().await?;
        Ok(())
    }
}

fn checked_name(name: &str) -> io::Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unusable name {name:?}"),
        ));
    }
    Ok(name)
}

async fn same_content(source: &Path, target: &Path) -> io::Result<bool> {
    let Ok(target_meta) = tokio::fs::metadata(target).await else {
        return Ok(false);
    };
    let source_meta = tokio::fs::metadata(source).await?;
    if !target_meta.is_file() || target_meta.len() != source_meta.len() {
        return Ok(false);
    }
    Ok(hash_file(source).await? == hash_file(target).await?)
}
