// SPDX-License-Identifier: Apache-2.0

//! `GardenerClient`: a thin `reqwest` wrapper implementing
//! `gardener_core::Coordinator` against the coordinator's HTTP surface.
//!
//! Each call wraps its request in a short exponential backoff so a
//! transient connection blip doesn't surface as a failed poll cycle; the
//! retry budget is deliberately small since the coordinator surface itself
//! is best-effort (a non-2xx `next_job` response means "no work", not an
//! error worth retrying past the outer poll loop).

use std::time::Duration;

use async_trait::async_trait;
use gardener_core::{Coordinator, GardenerError, Job, JobState};
use serde::Deserialize;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct GardenerClient {
    http: reqwest::Client,
    base: String,
}

impl GardenerClient {
    pub fn new(base_addr: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client config is static and always valid");
        Self {
            http,
            base: base_addr.trim_end_matches('/').to_string(),
        }
    }

    fn backoff() -> backoff::ExponentialBackoff {
        let mut b = backoff::ExponentialBackoff::default();
        b.max_elapsed_time = Some(Duration::from_secs(10));
        b.initial_interval = Duration::from_millis(100);
        b
    }
}

#[derive(Deserialize)]
struct JobWithTarget {
    #[serde(flatten)]
    job: Job,
}

#[async_trait]
impl Coordinator for GardenerClient {
    async fn next_job(&self) -> Result<Option<Job>, GardenerError> {
        let url = format!("{}/v2/job/next", self.base);
        let response = backoff::future::retry(Self::backoff(), || async {
            self.http
                .post(&url)
                .send()
                .await
                .map_err(|err| backoff::Error::transient(GardenerError::Transient(err.to_string())))
        })
        .await?;

        if !response.status().is_success() {
            return Ok(None);
        }
        let parsed: JobWithTarget = response
            .json()
            .await
            .map_err(|err| GardenerError::InvalidInput(format!("malformed job payload: {err}")))?;
        Ok(Some(parsed.job))
    }

    async fn heartbeat(&self, job_id: &str) -> Result<(), GardenerError> {
        let url = format!("{}/v2/job/heartbeat", self.base);
        let response = self
            .http
            .post(&url)
            .query(&[("id", job_id)])
            .send()
            .await
            .map_err(|err| GardenerError::Transient(err.to_string()))?;
        if !response.status().is_success() {
            tracing::debug!(job_id, status = %response.status(), "heartbeat rejected");
        }
        Ok(())
    }

    async fn update(&self, job_id: &str, state: JobState, detail: &str) -> Result<(), GardenerError> {
        let url = format!("{}/v2/job/update", self.base);
        let response = self
            .http
            .post(&url)
            .query(&[("id", job_id), ("state", &state.to_string()), ("detail", &detail.to_string())])
            .send()
            .await
            .map_err(|err| GardenerError::Transient(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GardenerError::Transient(format!("update rejected with status {}", response.status())));
        }
        Ok(())
    }
}

impl From<backoff::Error<GardenerError>> for GardenerError {
    fn from(err: backoff::Error<GardenerError>) -> Self {
        match err {
            backoff::Error::Permanent(e) => e,
            backoff::Error::Transient { err, .. } => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_slash_from_base() {
        let client = GardenerClient::new("http://localhost:9000/");
        assert_eq!(client.base, "http://localhost:9000");
    }
}
