use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Body, Client, Response, StatusCode, redirect};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::drive::{DriveError, Lookup, RemoteDriveClient, UploadTarget};
use crate::graph::parse_base;
use crate::http::{RetryPolicy, api_error, json_response};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "files(id,name,md5Checksum,size)";
const MAX_UPLOAD_SESSIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    /// Google reports sizes as decimal strings.
    #[serde(default)]
    pub size: Option<String>,
}

impl DriveFile {
    fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            md5_checksum: None,
            size: None,
        }
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_deref().and_then(|v| v.parse().ok())
    }
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct SharedDrive {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SharedDriveList {
    #[serde(default)]
    drives: Vec<SharedDrive>,
}

enum SessionStart {
    Unchanged(DriveFile),
    Session(Url),
}

enum SessionOutcome {
    Complete(DriveFile),
    Expired,
}

enum SessionProgress {
    Complete(DriveFile),
    Resume(u64),
    Expired,
    Unavailable(StatusCode),
}

#[derive(Clone)]
pub struct GoogleDriveClient {
    http: Client,
    base_url: Url,
    token: String,
    retry: RetryPolicy,
}

impl GoogleDriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            base_url: parse_base(base_url)?,
            token: token.into(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, DriveError> {
        self.http = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(self)
    }

    pub fn with_retry(mut self, backoff: Backoff, max_attempts: u32) -> Self {
        self.retry = RetryPolicy {
            backoff,
            max_attempts,
        };
        self
    }

    pub async fn find_item(
        &self,
        name: &str,
        parent: Option<&str>,
        folder: bool,
    ) -> Result<Option<DriveFile>, DriveError> {
        let query = item_query(name, parent, folder);
        let request = self
            .http
            .get(self.endpoint("drive/v3/files")?)
            .bearer_auth(&self.token)
            .query(&[
                ("q", query.as_str()),
                ("fields", FILE_FIELDS),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ]);
        let list: FileList = json_response(self.retry.send(request).await?).await?;
        Ok(list.files.into_iter().next())
    }

    pub async fn create_folder(&self, parent: &str, name: &str) -> Result<DriveFile, DriveError> {
        let request = self
            .http
            .post(self.endpoint("drive/v3/files")?)
            .bearer_auth(&self.token)
            .query(&[("supportsAllDrives", "true")])
            .json(&json!({
                "name": name,
                "mimeType": FOLDER_MIME_TYPE,
                "parents": [parent],
            }));
        json_response(self.retry.send(request).await?).await
    }

    async fn folder_lookup(
        &self,
        parent: &DriveFile,
        name: &str,
        create: bool,
    ) -> Result<Lookup<DriveFile>, DriveError> {
        if let Some(existing) = self.find_item(name, Some(&parent.id), true).await? {
            debug!(name, "folder already exists");
            return Ok(Lookup::Found(existing));
        }
        if !create {
            return Ok(Lookup::NotFound);
        }
        Ok(Lookup::Created(self.create_folder(&parent.id, name).await?))
    }

    async fn open_upload_session(
        &self,
        parent: &DriveFile,
        source: &Path,
        name: &str,
        size: u64,
    ) -> Result<SessionStart, DriveError> {
        let existing = self.find_item(name, Some(&parent.id), false).await?;
        let request = match existing {
            Some(file) => {
                debug!(name, "file already exists");
                if let Some(remote_md5) = file.md5_checksum.as_deref()
                    && remote_md5 == md5_file(source).await?
                {
                    debug!(name, "checksums match");
                    return Ok(SessionStart::Unchanged(file));
                }
                debug!(name, "overwriting file");
                self.http
                    .patch(self.endpoint(&format!("upload/drive/v3/files/{}", file.id))?)
                    .json(&json!({}))
            }
            None => self
                .http
                .post(self.endpoint("upload/drive/v3/files")?)
                .json(&json!({
                    "name": name,
                    "parents": [parent.id],
                })),
        };
        let request = request
            .bearer_auth(&self.token)
            .query(&[("uploadType", "resumable"), ("supportsAllDrives", "true")])
            .header("X-Upload-Content-Length", size.to_string());

        let response = self.retry.send(request).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(DriveError::MissingLocation)?;
        Ok(SessionStart::Session(Url::parse(location)?))
    }

    async fn drive_session(
        &self,
        session: &Url,
        source: &Path,
        size: u64,
    ) -> Result<SessionOutcome, DriveError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut offset = 0u64;
        let mut failures = 0u32;

        loop {
            let file = open_at(source, offset).await?;
            let status = match self.put_range(session, file, offset, size).await {
                Ok(response) => match response.status() {
                    status if status.is_success() => {
                        return Ok(SessionOutcome::Complete(json_response(response).await?));
                    }
                    StatusCode::PERMANENT_REDIRECT => {
                        let received = received_offset(&response);
                        let progressed = received > offset;
                        offset = received;
                        if progressed {
                            debug!(offset, "upload incomplete, resuming");
                            failures = 0;
                            continue;
                        }
                        failures += 1;
                        StatusCode::PERMANENT_REDIRECT
                    }
                    StatusCode::NOT_FOUND => return Ok(SessionOutcome::Expired),
                    status if status == StatusCode::FORBIDDEN || status.is_server_error() => {
                        failures += 1;
                        status
                    }
                    status => return Err(DriveError::UnexpectedStatus(status)),
                },
                Err(err) if err.is_timeout() || err.is_connect() || err.is_body() => {
                    warn!("upload request failed: {err}");
                    failures += 1;
                    StatusCode::REQUEST_TIMEOUT
                }
                Err(err) => return Err(err.into()),
            };

            if failures >= max_attempts {
                return Err(DriveError::RetriesExhausted { attempts: failures });
            }
            let delay = self.retry.backoff.sleep(failures).await;
            warn!(
                %status,
                attempt = failures,
                "upload interrupted, slept for {:.1}s",
                delay.as_secs_f64()
            );

            match self.session_progress(session, size).await? {
                SessionProgress::Complete(file) => return Ok(SessionOutcome::Complete(file)),
                SessionProgress::Expired => return Ok(SessionOutcome::Expired),
                SessionProgress::Resume(received) => offset = received,
                SessionProgress::Unavailable(status) => {
                    debug!(%status, offset, "session status unavailable, retrying same offset");
                }
            }
        }
    }

    async fn put_range(
        &self,
        session: &Url,
        file: tokio::fs::File,
        offset: u64,
        size: u64,
    ) -> Result<Response, reqwest::Error> {
        let remaining = size.saturating_sub(offset);
        let content_range = if remaining == 0 {
            format!("bytes */{size}")
        } else {
            format!("bytes {}-{}/{}", offset, size - 1, size)
        };
        let body = Body::wrap_stream(ReaderStream::new(file.take(remaining)));

        self.http
            .put(session.clone())
            .header(CONTENT_RANGE, content_range)
            .header(CONTENT_LENGTH, remaining)
            .body(body)
            .send()
            .await
    }

    async fn session_progress(
        &self,
        session: &Url,
        size: u64,
    ) -> Result<SessionProgress, DriveError> {
        let response = match self
            .http
            .put(session.clone())
            .header(CONTENT_RANGE, format!("bytes */{size}"))
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() || err.is_connect() => {
                return Ok(SessionProgress::Unavailable(StatusCode::REQUEST_TIMEOUT));
            }
            Err(err) => return Err(err.into()),
        };

        Ok(match response.status() {
            status if status.is_success() => SessionProgress::Complete(json_response(response).await?),
            StatusCode::PERMANENT_REDIRECT => SessionProgress::Resume(received_offset(&response)),
            StatusCode::NOT_FOUND => SessionProgress::Expired,
            status => SessionProgress::Unavailable(status),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }
}

impl RemoteDriveClient for GoogleDriveClient {
    type Handle = DriveFile;

    // The bearer token picks the account: a user target maps to that
    // account's root whatever name it carries. Shared drives are never created.
    async fn container_root(
        &self,
        target: &UploadTarget,
        _create: bool,
    ) -> Result<DriveFile, DriveError> {
        match target {
            UploadTarget::User(name) => {
                debug!(user = %name, "using the token owner's root folder");
                Ok(DriveFile::with_id("root"))
            }
            UploadTarget::Group(name) => {
                let query = format!("name = '{}'", escape_query(name));
                let request = self
                    .http
                    .get(self.endpoint("drive/v3/drives")?)
                    .bearer_auth(&self.token)
                    .query(&[("q", query.as_str()), ("useDomainAdminAccess", "true")]);
                let list: SharedDriveList = json_response(self.retry.send(request).await?).await?;
                list.drives
                    .into_iter()
                    .next()
                    .map(|drive| DriveFile::with_id(drive.id))
                    .ok_or_else(|| DriveError::MissingContainer(target.to_string()))
            }
        }
    }

    async fn get_or_create_folder(
        &self,
        parent: &DriveFile,
        name: &str,
        create: bool,
    ) -> Result<Lookup<DriveFile>, DriveError> {
        self.folder_lookup(parent, name, create).await
    }

    /// Drive has no notebook type; notebooks land as plain folders holding their sections.
    async fn get_or_create_notebook(
        &self,
        parent: &DriveFile,
        name: &str,
        create: bool,
    ) -> Result<Lookup<DriveFile>, DriveError> {
        self.folder_lookup(parent, name, create).await
    }

    async fn upload_file(
        &self,
        parent: &DriveFile,
        source: &Path,
        name: &str,
    ) -> Result<DriveFile, DriveError> {
        let size = tokio::fs::metadata(source).await?.len();
        for session_number in 1..=MAX_UPLOAD_SESSIONS {
            let session = match self.open_upload_session(parent, source, name, size).await? {
                SessionStart::Unchanged(existing) => return Ok(existing),
                SessionStart::Session(session) => session,
            };
            match self.drive_session(&session, source, size).await? {
                SessionOutcome::Complete(file) => {
                    info!(name, size, "uploaded");
                    return Ok(file);
                }
                SessionOutcome::Expired => {
                    warn!(name, session_number, "upload session expired, starting over");
                }
            }
        }
        Err(DriveError::SessionRestartsExhausted {
            sessions: MAX_UPLOAD_SESSIONS,
        })
    }

    async fn verify_remote_file(
        &self,
        parent: &DriveFile,
        source: &Path,
        name: &str,
    ) -> Result<bool, DriveError> {
        let Some(remote) = self.find_item(name, Some(&parent.id), false).await? else {
            info!(name, "not found at destination");
            return Ok(false);
        };
        let local_size = tokio::fs::metadata(source).await?.len();
        if let Some(remote_size) = remote.size_bytes()
            && remote_size != local_size
        {
            info!(name, expected = local_size, got = remote_size, "wrong size at destination");
            return Ok(false);
        }
        let local_md5 = md5_file(source).await?;
        if remote.md5_checksum.as_deref() != Some(local_md5.as_str()) {
            info!(name, expected = %local_md5, got = ?remote.md5_checksum, "wrong checksum at destination");
            return Ok(false);
        }
        Ok(true)
    }

    async fn share(
        &self,
        target: &DriveFile,
        address: &str,
        roles: &[String],
    ) -> Result<(), DriveError> {
        let endpoint = self.endpoint(&format!("drive/v3/files/{}/permissions", target.id))?;
        for role in roles {
            let request = self
                .http
                .post(endpoint.clone())
                .bearer_auth(&self.token)
                .query(&[
                    ("sendNotificationEmail", "false"),
                    ("supportsAllDrives", "true"),
                ])
                .json(&json!({
                    "type": "user",
                    "role": drive_role(role),
                    "emailAddress": address,
                }));
            let response = self.retry.send(request).await?;
            if !response.status().is_success() {
                return Err(api_error(response).await);
            }
        }
        Ok(())
    }
}

fn item_query(name: &str, parent: Option<&str>, folder: bool) -> String {
    let mime = if folder { "=" } else { "!=" };
    let mut query = format!(
        "name = '{}' and trashed = false and mimeType {mime} '{FOLDER_MIME_TYPE}'",
        escape_query(name)
    );
    if let Some(parent) = parent {
        query.push_str(&format!(" and '{}' in parents", escape_query(parent)));
    }
    query
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn drive_role(role: &str) -> &str {
    match role {
        "read" => "reader",
        "write" => "writer",
        other => other,
    }
}

/// Next byte offset from a `Range: bytes=0-N` header; no header means nothing was kept.
fn received_offset(response: &Response) -> u64 {
    response
        .headers()
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit_once('-'))
        .and_then(|(_, last)| last.trim().parse::<u64>().ok())
        .map_or(0, |last| last + 1)
}

async fn open_at(source: &Path, offset: u64) -> std::io::Result<tokio::fs::File> {
    let mut file = tokio::fs::File::open(source).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

async fn md5_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        ctx.consume(&buf[..read]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_query_escapes_quotes_and_scopes_parent() {
        assert_eq!(
            item_query("Bob's notes", Some("abc"), false),
            "name = 'Bob\\'s notes' and trashed = false and mimeType != \
             'application/vnd.google-apps.folder' and 'abc' in parents"
        );
    }

    #[test]
    fn maps_graph_roles_to_drive_roles() {
        assert_eq!(drive_role("read"), "reader");
        assert_eq!(drive_role("write"), "writer");
        assert_eq!(drive_role("commenter"), "commenter");
    }

    #[test]
    fn drive_file_parses_string_size() {
        let file: DriveFile =
            serde_json::from_str(r#"{"id":"x","size":"42","md5Checksum":"abc"}"#).unwrap();
        assert_eq!(file.size_bytes(), Some(42));
        assert_eq!(file.md5_checksum.as_deref(), Some("abc"));
    }
}
