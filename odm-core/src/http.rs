use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::backoff::Backoff;
use crate::drive::DriveError;

pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) backoff: Backoff,
    pub(crate) max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::remote_default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

pub(crate) fn is_throttled(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

impl RetryPolicy {
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Response, DriveError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            let Some(this_try) = request.try_clone() else {
                return Ok(request.send().await?);
            };
            attempt += 1;
            match this_try.send().await {
                Ok(response) if is_throttled(response.status()) => {
                    if attempt >= max_attempts {
                        return Err(api_error(response).await);
                    }
                    let delay = self.backoff.sleep(attempt).await;
                    warn!(
                        status = %response.status(),
                        attempt,
                        "throttled, slept for {:.1}s",
                        delay.as_secs_f64()
                    );
                }
                Ok(response) => return Ok(response),
                Err(err) if err.is_timeout() => {
                    if attempt >= max_attempts {
                        return Err(DriveError::RetriesExhausted { attempts: attempt });
                    }
                    let delay = self.backoff.sleep(attempt).await;
                    warn!(attempt, "timed out, slept for {:.1}s", delay.as_secs_f64());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

pub(crate) async fn api_error(response: Response) -> DriveError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    DriveError::Api { status, body }
}

pub(crate) async fn json_response<T: DeserializeOwned>(response: Response) -> Result<T, DriveError> {
    if response.status().is_success() {
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    } else {
        Err(api_error(response).await)
    }
}
