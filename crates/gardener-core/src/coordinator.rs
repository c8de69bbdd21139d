// SPDX-License-Identifier: Apache-2.0

//! Capability boundary for the external coordinator ("Gardener"). The
//! concrete HTTP implementation lives in `gardener-worker`; `JobExecutor`
//! and `Poller` only depend on this trait, which keeps the job execution
//! subsystem testable against an in-process fake.

use async_trait::async_trait;

use crate::{errors::GardenerError, model::Job};

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// `POST {base}/v2/job/next`. A non-2xx response is "no work", not an
    /// error: implementations return `Ok(None)` for it.
    async fn next_job(&self) -> Result<Option<Job>, GardenerError>;

    /// `POST {base}/v2/job/heartbeat?id={jobID}`. Best-effort; callers
    /// never treat a failure here as job failure.
    async fn heartbeat(&self, job_id: &str) -> Result<(), GardenerError>;

    /// `POST {base}/v2/job/update?id={jobID}&state={state}&detail={detail}`.
    async fn update(&self, job_id: &str, state: crate::model::JobState, detail: &str) -> Result<(), GardenerError>;
}
