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

use crate::domain::{Job, JobId, JobState, JobStore, NewJob, QueueName, ReapOutcome, unix_millis};
use parking_lot::Mutex;
use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Duration};
use uuid::Uuid;

/// In-memory job store, mainly for tests and examples. Single-process only.
#[derive(Debug, Clone, Default)]
pub struct InMemJobStore {
    jobs: Arc<Mutex<HashMap<JobId, Job>>>,
}

impl JobStore for InMemJobStore {
    type Error = Infallible;

    async fn submit(&self, new_job: NewJob) -> Result<Job, Self::Error> {
        let mut jobs = self.jobs.lock();

        if let Some(existing) = jobs.get(&new_job.id) {
            if existing.state != JobState::Dead {
                return Ok(existing.clone());
            }
        }

        let job = Job {
            id: new_job.id.clone(),
            queue: new_job.queue,
            kind: new_job.kind,
            payload: new_job.payload,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: new_job.max_attempts,
            progress: 0,
            created_at: unix_millis(),
            started_at: None,
            finished_at: None,
            run_at: None,
            visible_until: None,
            owner_token: None,
            parent_id: new_job.parent_id,
            cancel_requested: false,
            result: None,
            error: None,
        };
        jobs.insert(new_job.id, job.clone());

        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, Self::Error> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    async fn claim(
        &self,
        queue: QueueName,
        owner_token: Uuid,
        lease: Duration,
        now: i64,
    ) -> Result<Option<Job>, Self::Error> {
        let mut jobs = self.jobs.lock();

        let candidate = jobs
            .values()
            .filter(|job| job.queue == queue && job.state == JobState::Queued)
            .min_by_key(|job| (job.created_at, job.id.clone()))
            .map(|job| job.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).expect("candidate job exists");
        job.state = JobState::Active;
        job.attempts += 1;
        job.progress = 0;
        job.started_at = Some(now);
        job.visible_until = Some(now + lease.as_millis() as i64);
        job.owner_token = Some(owner_token);
        job.error = None;

        Ok(Some(job.clone()))
    }

    async fn extend_lease(
        &self,
        id: &JobId,
        owner_token: Uuid,
        lease: Duration,
        now: i64,
    ) -> Result<bool, Self::Error> {
        let mut jobs = self.jobs.lock();

        match jobs.get_mut(id) {
            Some(job) if job.state == JobState::Active && job.owner_token == Some(owner_token) => {
                job.visible_until = Some(now + lease.as_millis() as i64);
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    async fn record_progress(
        &self,
        id: &JobId,
        owner_token: Uuid,
        value: u8,
    ) -> Result<bool, Self::Error> {
        let mut jobs = self.jobs.lock();

        match jobs.get_mut(id) {
            Some(job) if job.state == JobState::Active && job.owner_token == Some(owner_token) => {
                job.progress = job.progress.max(value.min(100));
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: &JobId,
        owner_token: Uuid,
        result: serde_json::Value,
        now: i64,
    ) -> Result<bool, Self::Error> {
        let mut jobs = self.jobs.lock();

        match jobs.get_mut(id) {
            Some(job) if job.state == JobState::Active && job.owner_token == Some(owner_token) => {
                job.state = JobState::Completed;
                job.progress = 100;
                job.result = Some(result);
                job.finished_at = Some(now);
                job.owner_token = None;
                job.visible_until = None;
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        id: &JobId,
        owner_token: Uuid,
        error: &str,
        retry_at: Option<i64>,
        now: i64,
    ) -> Result<bool, Self::Error> {
        let mut jobs = self.jobs.lock();

        match jobs.get_mut(id) {
            Some(job) if job.state == JobState::Active && job.owner_token == Some(owner_token) => {
                job.error = Some(error.to_string());
                job.owner_token = None;
                job.visible_until = None;

                match retry_at {
                    Some(run_at) => {
                        job.state = JobState::Delayed;
                        job.run_at = Some(run_at);
                    }

                    None => {
                        job.state = JobState::Dead;
                        job.finished_at = Some(now);
                    }
                }

                Ok(true)
            }

            _ => Ok(false),
        }
    }

    async fn request_cancel(&self, id: &JobId, now: i64) -> Result<Vec<JobId>, Self::Error> {
        let mut jobs = self.jobs.lock();

        let mut subtree = vec![id.clone()];
        let mut index = 0;
        while index < subtree.len() {
            let parent = subtree[index].clone();
            let children = jobs
                .values()
                .filter(|job| job.parent_id.as_ref() == Some(&parent))
                .map(|job| job.id.clone())
                .collect::<Vec<_>>();
            subtree.extend(children);
            index += 1;
        }

        let mut cancelled = Vec::new();
        for id in subtree {
            let Some(job) = jobs.get_mut(&id) else {
                continue;
            };

            match job.state {
                JobState::Active => job.cancel_requested = true,

                JobState::Queued | JobState::Delayed => {
                    job.state = JobState::Dead;
                    job.error = Some("cancelled".to_string());
                    job.finished_at = Some(now);
                    job.run_at = None;
                    job.cancel_requested = true;
                    cancelled.push(id);
                }

                JobState::Completed | JobState::Dead => {}
            }
        }

        Ok(cancelled)
    }

    async fn children(&self, parent_id: &JobId) -> Result<Vec<Job>, Self::Error> {
        let jobs = self.jobs.lock();

        let mut children = jobs
            .values()
            .filter(|job| job.parent_id.as_ref() == Some(parent_id))
            .cloned()
            .collect::<Vec<_>>();
        children.sort_by_key(|job| (job.created_at, job.id.clone()));

        Ok(children)
    }

    async fn promote_delayed(&self, queue: QueueName, now: i64) -> Result<u64, Self::Error> {
        let mut jobs = self.jobs.lock();
        let mut promoted = 0;

        for job in jobs.values_mut() {
            if job.queue == queue
                && job.state == JobState::Delayed
                && job.run_at.is_some_and(|run_at| run_at <= now)
            {
                job.state = JobState::Queued;
                job.run_at = None;
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    async fn reap_expired(&self, queue: QueueName, now: i64) -> Result<ReapOutcome, Self::Error> {
        let mut jobs = self.jobs.lock();
        let mut outcome = ReapOutcome::default();

        for job in jobs.values_mut() {
            let expired = job.queue == queue
                && job.state == JobState::Active
                && job.visible_until.is_some_and(|until| until < now);
            if !expired {
                continue;
            }

            job.owner_token = None;
            job.visible_until = None;

            if job.attempts >= job.max_attempts || job.cancel_requested {
                job.state = JobState::Dead;
                job.error = Some(
                    if job.cancel_requested {
                        "cancelled"
                    } else {
                        "job lease expired"
                    }
                    .to_string(),
                );
                job.finished_at = Some(now);
                outcome.dead.push(job.id.clone());
            } else {
                job.state = JobState::Queued;
                job.progress = 0;
                job.started_at = None;
                outcome.requeued += 1;
            }
        }

        Ok(outcome)
    }
}
