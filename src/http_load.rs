use std::time::Instant;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Duration};
use url::Url;

use crate::types::{Location, OrderId};

/// Maximum number of response-body bytes kept in an error detail.
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success { status: u16 },
    Error { status: Option<u16>, detail: String },
    Timeout,
}

/// Result of one location POST, measured from dispatch to completion or abort.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpAttempt {
    pub latency_ms: u64,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to build HTTP client: {source}")]
    Client { source: reqwest::Error },
    #[error("cannot derive endpoint {path} from base url {base}: {source}")]
    Endpoint {
        base: String,
        path: String,
        source: url::ParseError,
    },
}

/// Issues `POST {base}/api/orders/{orderId}/location` with a hard client-side timeout.
#[derive(Clone, Debug)]
pub struct LocationPoster {
    client: Client,
    endpoint: Url,
    token: Option<String>,
    timeout: Duration,
}

impl LocationPoster {
    /// Builds a poster for one order.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when the client cannot be built or the endpoint URL is
    /// invalid.
    pub fn new(
        base_url: &Url,
        order_id: &OrderId,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .build()
            .map_err(|source| ProbeError::Client { source })?;
        let endpoint = api_endpoint(base_url, &format!("api/orders/{order_id}/location"))?;
        Ok(Self {
            client,
            endpoint,
            token,
            timeout,
        })
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Sends one location update. Never fails: every attempt is classified.
    pub async fn post(&self, location: Location) -> HttpAttempt {
        let started = Instant::now();
        let outcome = match time::timeout(self.timeout, self.send(location)).await {
            Ok(outcome) => outcome,
            Err(_) => AttemptOutcome::Timeout,
        };
        HttpAttempt {
            latency_ms: elapsed_ms(started),
            outcome,
        }
    }

    async fn send(&self, location: Location) -> AttemptOutcome {
        let mut request = self.client.post(self.endpoint.clone()).json(&location);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                return AttemptOutcome::Error {
                    status: None,
                    detail: error.to_string(),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            return AttemptOutcome::Success {
                status: status.as_u16(),
            };
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|error| format!("<unreadable body: {error}>"));
        AttemptOutcome::Error {
            status: Some(status.as_u16()),
            detail: truncate(body),
        }
    }
}

/// Joins `path` onto `base`, keeping any path prefix the base URL already carries.
///
/// # Errors
///
/// Returns [`ProbeError::Endpoint`] when the joined URL does not parse.
pub fn api_endpoint(base: &Url, path: &str) -> Result<Url, ProbeError> {
    let mut prefix = base.clone();
    if !prefix.path().ends_with('/') {
        let with_slash = format!("{}/", prefix.path());
        prefix.set_path(&with_slash);
    }
    prefix.join(path).map_err(|source| ProbeError::Endpoint {
        base: base.to_string(),
        path: path.to_owned(),
        source,
    })
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    let millis = started.elapsed().as_millis().min(u128::from(u64::MAX));
    u64::try_from(millis).map_or(u64::MAX, |value| value)
}

fn truncate(mut body: String) -> String {
    if let Some((idx, _)) = body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        body.truncate(idx);
        body.push('…');
    }
    body
}
