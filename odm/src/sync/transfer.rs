use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::{Stream, StreamExt};
use odm_core::QuickXorHash;
use reqwest::Client;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
}

#[derive(Clone)]
pub struct TransferClient {
    http: Client,
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_http(Client::new())
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransferError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_http(http))
    }

    pub fn with_http(http: Client) -> Self {
        Self { http }
    }

    pub async fn download_to_path(
        &self,
        location: &Url,
        target: &Path,
        expected_hash: Option<&str>,
    ) -> Result<String, TransferError> {
        let response = self
            .http
            .get(location.clone())
            .send()
            .await?
            .error_for_status()?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut hasher = QuickXorHash::new();
        let written = match write_body(response.bytes_stream(), &mut file, &mut hasher).await {
            Ok(()) => file.sync_all().await.map_err(TransferError::from),
            Err(err) => Err(err),
        };
        drop(file);
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }

        let actual = hasher.finalize();
        if let Some(expected) = expected_hash
            && actual != expected
        {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(TransferError::IntegrityMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        tokio::fs::rename(partial, target).await?;
        Ok(actual)
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_body<S, B, W>(
    body: S,
    out: &mut W,
    hasher: &mut QuickXorHash,
) -> Result<(), TransferError>
where
    S: Stream<Item = Result<B, reqwest::Error>>,
    B: AsRef<[u8]>,
    W: AsyncWrite + Unpin,
{
    let mut body = std::pin::pin!(body);
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        out.write_all(chunk.as_ref()).await?;
        hasher.update(chunk.as_ref());
    }
    out.flush().await?;
    Ok(())
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    target.with_file_name(name)
}
