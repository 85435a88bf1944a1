use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;

/// Short-lived TURN credentials handed out by the API server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
}

/// A listener's connection waits on this request, so it must not hang.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct TurnClient {
    http: reqwest::Client,
    endpoint: String,
}

impl TurnClient {
    pub fn new(api_server: &str) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: turn_endpoint(api_server),
        })
    }

    pub async fn fetch(&self) -> Result<TurnCredentials> {
        debug!(endpoint = %self.endpoint, "requesting TURN credentials");
        let creds = self
            .http
            .post(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .json::<TurnCredentials>()
            .await?;
        Ok(creds)
    }
}

fn turn_endpoint(api_server: &str) -> String {
    format!("{}/turn", api_server.trim_end_matches('/'))
}
