use std::fmt;
use std::path::Path;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("response carried no location header")]
    MissingLocation,
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("upload session expired {sessions} times")]
    SessionRestartsExhausted { sessions: u32 },
    #[error("unexpected upload status {0}")]
    UnexpectedStatus(StatusCode),
    #[error("{0} is not available on this destination")]
    MissingContainer(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<H> {
    Found(H),
    Created(H),
    NotFound,
}

impl<H> Lookup<H> {
    pub fn into_handle(self) -> Option<H> {
        match self {
            Lookup::Found(handle) | Lookup::Created(handle) => Some(handle),
            Lookup::NotFound => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    User(String),
    Group(String),
}

impl UploadTarget {
    pub fn name(&self) -> &str {
        match self {
            UploadTarget::User(name) | UploadTarget::Group(name) => name,
        }
    }
}

impl fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadTarget::User(name) => write!(f, "user {name}"),
            UploadTarget::Group(name) => write!(f, "group {name}"),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait RemoteDriveClient {
    type Handle: Clone + fmt::Debug;

    async fn container_root(
        &self,
        target: &UploadTarget,
        create: bool,
    ) -> Result<Self::Handle, DriveError>;

    async fn get_or_create_folder(
        &self,
        parent: &Self::Handle,
        name: &str,
        create: bool,
    ) -> Result<Lookup<Self::Handle>, DriveError>;

    async fn get_or_create_notebook(
        &self,
        parent: &Self::Handle,
        name: &str,
        create: bool,
    ) -> Result<Lookup<Self::Handle>, DriveError>;

    async fn upload_file(
        &self,
        parent: &Self::Handle,
        source: &Path,
        name: &str,
    ) -> Result<Self::Handle, DriveError>;

    async fn verify_remote_file(
        &self,
        parent: &Self::Handle,
        source: &Path,
        name: &str,
    ) -> Result<bool, DriveError>;

    async fn share(
        &self,
        target: &Self::Handle,
        address: &str,
        roles: &[String],
    ) -> Result<(), DriveError>;
}
