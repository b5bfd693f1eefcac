// This file is part of wallet-analyzer.
// Copyright (C) 2025 Wallet Analyzer Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Queue runtime: bounded worker pools claiming jobs from a [JobStore], with lease heartbeats,
//! retry with backoff, delayed promotion, dead-lettering and progress events. Retry decisions
//! belong here; workers only raise [JobError]s.

use crate::domain::{
    Job, JobCompleted, JobError, JobFailed, JobId, JobProgressed, JobStore, NewJob, Publisher,
    QueueName, unix_millis,
};
use anyhow::{Context, bail};
use futures::future::try_join_all;
use log::{debug, info, warn};
use metrics::counter;
use serde::Deserialize;
use std::{
    error::Error as StdError,
    future::Future,
    num::NonZeroUsize,
    time::{Duration, Instant},
};
use tokio::{task, time::sleep};
use uuid::Uuid;

const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);
const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// Per-queue worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub concurrency: NonZeroUsize,

    /// Upper bound for a single job attempt; must not exceed `visibility_timeout`.
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,

    /// Lease duration for claimed jobs.
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,

    pub backoff: BackoffConfig,

    #[serde(with = "humantime_serde", default = "poll_interval_default")]
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,

    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

impl BackoffConfig {
    /// Delay before the next attempt, given the number of the attempt that just failed.
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,

            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(failed_attempt.saturating_sub(1).min(16));
                self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
            }
        }
    }
}

fn poll_interval_default() -> Duration {
    Duration::from_millis(500)
}

/// Handed to job handlers: progress reporting, cancellation checks, child submission and
/// awaiting, all tied to the current attempt's ownership token.
#[derive(Clone)]
pub struct JobContext<S, P> {
    job_id: JobId,
    queue: QueueName,
    owner_token: Uuid,
    store: S,
    publisher: P,
}

impl<S, P> JobContext<S, P>
where
    S: JobStore,
    P: Publisher,
{
    pub fn new(job_id: JobId, queue: QueueName, owner_token: Uuid, store: S, publisher: P) -> Self {
        Self {
            job_id,
            queue,
            owner_token,
            store,
            publisher,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Token of the current attempt, also used as lock ownership token by handlers.
    pub fn owner_token(&self) -> Uuid {
        self.owner_token
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record and publish progress. Values are clamped to be non-decreasing within the attempt.
    pub async fn progress(&mut self, value: u8) -> Result<(), JobError> {
        self.store
            .record_progress(&self.job_id, self.owner_token, value)
            .await
            .map_err(JobError::storage)?;

        let event = JobProgressed {
            job_id: self.job_id.clone(),
            queue: self.queue,
            value,
            timestamp: unix_millis(),
        };
        if let Err(error) = self.publisher.publish(&event).await {
            warn!(job_id:% = self.job_id, error:% = error; "cannot publish progress event");
        }

        Ok(())
    }

    /// Cancellation check to be called between suspension points. Fails with
    /// [JobError::Cancelled] if cancellation was requested or the attempt lost its lease.
    pub async fn ensure_active(&self) -> Result<(), JobError> {
        let job = self
            .store
            .get(&self.job_id)
            .await
            .map_err(JobError::storage)?;

        match job {
            Some(job) if job.cancel_requested => Err(JobError::Cancelled),
            Some(job) if job.owner_token != Some(self.owner_token) => Err(JobError::Cancelled),
            Some(_) => Ok(()),
            None => Err(JobError::Cancelled),
        }
    }

    /// Submit a child job of the current job; idempotent like any submission.
    pub async fn submit_child(&self, new_job: NewJob) -> Result<Job, JobError> {
        self.store
            .submit(new_job.with_parent(self.job_id.clone()))
            .await
            .map_err(JobError::storage)
    }

    /// Await the given jobs reaching a terminal state, or the deadline, whichever comes first.
    /// The returned records may still be non-terminal on deadline; callers decide what that
    /// means. Checks for cancellation between polls.
    pub async fn await_terminal(
        &self,
        ids: &[JobId],
        deadline: Instant,
        poll_interval: Duration,
    ) -> Result<Vec<Job>, JobError> {
        loop {
            self.ensure_active().await?;

            let mut jobs = Vec::with_capacity(ids.len());
            for id in ids {
                let job = self
                    .store
                    .get(id)
                    .await
                    .map_err(JobError::storage)?
                    .ok_or_else(|| JobError::DataInvariant(format!("job {id} does not exist")))?;
                jobs.push(job);
            }

            if jobs.iter().all(Job::is_terminal) || Instant::now() >= deadline {
                return Ok(jobs);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(poll_interval.min(remaining)).await;
        }
    }

    /// Cancel a job and its descendants; publishes terminal events for the jobs which were
    /// still queued or delayed. Active ones are flagged and end cooperatively.
    pub async fn cancel(&mut self, id: &JobId) -> Result<(), JobError> {
        let now = unix_millis();
        let cancelled = self
            .store
            .request_cancel(id, now)
            .await
            .map_err(JobError::storage)?;

        for job_id in cancelled {
            let event = JobFailed {
                job_id,
                queue: self.queue,
                error: "cancelled".to_string(),
                timestamp: now,
            };
            if let Err(error) = self.publisher.publish(&event).await {
                warn!(error:% = error; "cannot publish cancellation event");
            }
        }

        Ok(())
    }
}

/// Run the worker pool for one queue: `concurrency` claim loops plus a maintenance loop
/// promoting delayed jobs and reaping expired leases. Runs until a task fails or panics.
pub async fn run<S, P, H, Fut>(
    queue: QueueName,
    config: QueueConfig,
    store: S,
    publisher: P,
    handler: H,
) -> anyhow::Result<()>
where
    S: JobStore,
    P: Publisher,
    H: Fn(Job, JobContext<S, P>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    if config.job_timeout > config.visibility_timeout {
        bail!(
            "job timeout {:?} exceeds visibility timeout {:?} for queue {queue}",
            config.job_timeout,
            config.visibility_timeout
        );
    }

    info!(
        queue:%,
        concurrency = config.concurrency.get();
        "starting queue workers"
    );

    let mut tasks = Vec::with_capacity(config.concurrency.get() + 1);

    for _ in 0..config.concurrency.get() {
        tasks.push(task::spawn(claim_loop(
            queue,
            config.clone(),
            store.clone(),
            publisher.clone(),
            handler.clone(),
        )));
    }

    tasks.push(task::spawn(maintenance_loop(
        queue,
        config.clone(),
        store.clone(),
        publisher.clone(),
    )));

    try_join_all(tasks)
        .await
        .with_context(|| format!("queue worker for {queue} panicked"))?;

    Ok(())
}

async fn claim_loop<S, P, H, Fut>(
    queue: QueueName,
    config: QueueConfig,
    store: S,
    publisher: P,
    handler: H,
) where
    S: JobStore,
    P: Publisher,
    H: Fn(Job, JobContext<S, P>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    loop {
        let owner_token = Uuid::new_v4();
        let claimed = store
            .claim(queue, owner_token, config.visibility_timeout, unix_millis())
            .await;

        match claimed {
            Ok(Some(job)) => {
                process_job(
                    job,
                    owner_token,
                    &config,
                    store.clone(),
                    publisher.clone(),
                    &handler,
                )
                .await;
            }

            Ok(None) => sleep(config.poll_interval).await,

            Err(error) => {
                warn!(queue:%, error:% = error; "cannot claim job");
                sleep(config.poll_interval).await;
            }
        }
    }
}

async fn process_job<S, P, H, Fut>(
    job: Job,
    owner_token: Uuid,
    config: &QueueConfig,
    store: S,
    mut publisher: P,
    handler: &H,
) where
    S: JobStore,
    P: Publisher,
    H: Fn(Job, JobContext<S, P>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send,
{
    let started = Instant::now();
    let job_id = job.id.clone();
    let queue = job.queue;
    let attempt = job.attempts;

    debug!(job_id:%, kind:% = job.kind, attempt; "job claimed");
    counter!("analyzer_jobs_claimed_total", "queue" => queue.as_str()).increment(1);

    let heartbeat_task = task::spawn(heartbeat_loop(
        store.clone(),
        job_id.clone(),
        owner_token,
        config.visibility_timeout,
    ));

    let ctx = JobContext {
        job_id: job_id.clone(),
        queue,
        owner_token,
        store: store.clone(),
        publisher: publisher.clone(),
    };

    let outcome = match tokio::time::timeout(config.job_timeout, handler(job.clone(), ctx)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(JobError::Timeout(config.job_timeout)),
    };
    heartbeat_task.abort();

    let now = unix_millis();

    match outcome {
        Ok(result) => {
            match store.complete(&job_id, owner_token, result.clone(), now).await {
                Ok(true) => {
                    let duration_ms = started.elapsed().as_millis() as u64;

                    publish_or_warn(
                        &mut publisher,
                        &JobProgressed {
                            job_id: job_id.clone(),
                            queue,
                            value: 100,
                            timestamp: now,
                        },
                    )
                    .await;
                    publish_or_warn(
                        &mut publisher,
                        &JobCompleted {
                            job_id: job_id.clone(),
                            queue,
                            result,
                            duration_ms,
                            timestamp: now,
                        },
                    )
                    .await;

                    counter!("analyzer_jobs_completed_total", "queue" => queue.as_str())
                        .increment(1);
                    info!(job_id:%, kind:% = job.kind, duration_ms; "job completed");
                }

                Ok(false) => warn!(job_id:%; "job no longer owned, dropping result"),

                Err(error) => warn!(job_id:%, error:% = error; "cannot complete job"),
            }
        }

        Err(job_error) => {
            let error = error_chain(&job_error);
            let retry = job_error.is_retriable() && attempt < job.max_attempts;
            let retry_at = retry.then(|| now + config.backoff.delay(attempt).as_millis() as i64);

            match store.fail(&job_id, owner_token, &error, retry_at, now).await {
                Ok(true) if retry => {
                    counter!("analyzer_jobs_retried_total", "queue" => queue.as_str())
                        .increment(1);
                    warn!(job_id:%, attempt, error; "job attempt failed, will retry");
                }

                Ok(true) => {
                    publish_or_warn(
                        &mut publisher,
                        &JobFailed {
                            job_id: job_id.clone(),
                            queue,
                            error: error.clone(),
                            timestamp: now,
                        },
                    )
                    .await;

                    counter!("analyzer_jobs_dead_total", "queue" => queue.as_str()).increment(1);
                    warn!(job_id:%, attempt, error; "job dead");
                }

                Ok(false) => warn!(job_id:%; "job no longer owned, dropping failure"),

                Err(error) => warn!(job_id:%, error:% = error; "cannot fail job"),
            }
        }
    }
}

async fn heartbeat_loop<S>(store: S, job_id: JobId, owner_token: Uuid, lease: Duration)
where
    S: JobStore,
{
    let period = (lease / 3).max(MIN_HEARTBEAT);

    loop {
        sleep(period).await;

        match store
            .extend_lease(&job_id, owner_token, lease, unix_millis())
            .await
        {
            Ok(true) => {}
            Ok(false) => break,
            Err(error) => warn!(job_id:%, error:% = error; "cannot extend job lease"),
        }
    }
}

async fn maintenance_loop<S, P>(queue: QueueName, config: QueueConfig, store: S, mut publisher: P)
where
    S: JobStore,
    P: Publisher,
{
    loop {
        sleep(config.poll_interval).await;
        let now = unix_millis();

        if let Err(error) = store.promote_delayed(queue, now).await {
            warn!(queue:%, error:% = error; "cannot promote delayed jobs");
        }

        match store.reap_expired(queue, now).await {
            Ok(outcome) => {
                if outcome.requeued > 0 {
                    warn!(queue:%, requeued = outcome.requeued; "requeued jobs with expired leases");
                }

                for job_id in outcome.dead {
                    let error = match store.get(&job_id).await {
                        Ok(Some(job)) => job.error.unwrap_or_else(|| "lease expired".to_string()),
                        _ => "lease expired".to_string(),
                    };

                    publish_or_warn(
                        &mut publisher,
                        &JobFailed {
                            job_id,
                            queue,
                            error,
                            timestamp: now,
                        },
                    )
                    .await;
                    counter!("analyzer_jobs_dead_total", "queue" => queue.as_str()).increment(1);
                }
            }

            Err(error) => warn!(queue:%, error:% = error; "cannot reap expired jobs"),
        }
    }
}

async fn publish_or_warn<P, E>(publisher: &mut P, event: &E)
where
    P: Publisher,
    E: crate::domain::Event,
{
    if let Err(error) = publisher.publish(event).await {
        warn!(error:% = error; "cannot publish job event");
    }
}

fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(error) = source {
        message.push_str(": ");
        message.push_str(&error.to_string());
        source = error.source();
    }

    message
}
