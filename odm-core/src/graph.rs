use std::time::Duration;

use reqwest::header::LOCATION;
use reqwest::{Client, StatusCode, redirect};
use tracing::debug;
use url::Url;

use crate::backoff::Backoff;
use crate::drive::DriveError;
use crate::http::{RetryPolicy, api_error};

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0/";

#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: Url,
    token: String,
    retry: RetryPolicy,
}

impl GraphClient {
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

    /// Pre-authenticated download URL for an item, or `None` if the item is gone.
    pub async fn download_location(
        &self,
        drive_id: &str,
        item_id: &str,
    ) -> Result<Option<Url>, DriveError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["drives", drive_id, "items", item_id, "content"]);

        let response = self
            .retry
            .send(self.http.get(url).bearer_auth(&self.token))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_redirection() => {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or(DriveError::MissingLocation)?;
                debug!(drive_id, item_id, "resolved download location");
                Ok(Some(Url::parse(location)?))
            }
            _ => Err(api_error(response).await),
        }
    }
}

pub(crate) fn parse_base(base_url: &str) -> Result<Url, DriveError> {
    if base_url.ends_with('/') {
        Ok(Url::parse(base_url)?)
    } else {
        Ok(Url::parse(&format!("{base_url}/"))?)
    }
}
