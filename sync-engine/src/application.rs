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

use crate::domain::{Provider, storage::Storage, sync::sync_wallet};
use analyzer_common::{
    domain::{
        BalanceReport, FetchBalanceJob, Job, JobError, JobKind, JobStore, LockKey, LockStore,
        Publisher, QueueName, SyncWalletJob, unix_seconds,
    },
    queue::{self, JobContext, QueueConfig},
};
use anyhow::Context;
use log::warn;
use serde::Deserialize;
use std::time::Duration;
use tokio::{select, signal::unix::Signal, task};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub queue: QueueConfig,

    /// Added on top of the job timeout for the sync lock TTL.
    #[serde(with = "humantime_serde", default = "lock_margin_default")]
    pub lock_margin: Duration,
}

fn lock_margin_default() -> Duration {
    Duration::from_secs(30)
}

pub async fn run(
    config: Config,
    storage: impl Storage,
    provider: impl Provider,
    job_store: impl JobStore,
    lock_store: impl LockStore,
    publisher: impl Publisher,
    mut sigterm: Signal,
) -> anyhow::Result<()> {
    let Config { queue, lock_margin } = config;
    let lock_ttl = queue.job_timeout + lock_margin;

    let handler = {
        let storage = storage.clone();
        let provider = provider.clone();
        let lock_store = lock_store.clone();

        move |job, ctx| {
            let storage = storage.clone();
            let provider = provider.clone();
            let lock_store = lock_store.clone();

            async move { handle_job(job, ctx, storage, provider, lock_store, lock_ttl).await }
        }
    };

    let workers_task = task::spawn(queue::run(
        QueueName::WalletOperations,
        queue,
        job_store,
        publisher,
        handler,
    ));

    select! {
        result = workers_task => result
            .context("workers_task panicked")
            .and_then(|r| r.context("workers_task failed")),

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            Ok(())
        }
    }
}

async fn handle_job<S, P, JS, PB, L>(
    job: Job,
    ctx: JobContext<JS, PB>,
    storage: S,
    provider: P,
    lock_store: L,
    lock_ttl: Duration,
) -> Result<serde_json::Value, JobError>
where
    S: Storage,
    P: Provider,
    JS: JobStore,
    PB: Publisher,
    L: LockStore,
{
    match job.kind {
        JobKind::SyncWallet => {
            handle_sync(job, ctx, storage, provider, lock_store, lock_ttl).await
        }

        JobKind::FetchBalance => handle_fetch_balance(job, ctx, storage, provider).await,

        other => Err(JobError::Validation(format!(
            "unexpected job kind {other} on {}",
            QueueName::WalletOperations
        ))),
    }
}

/// Run a wallet sync under the wallet's sync lock.
async fn handle_sync<S, P, JS, PB, L>(
    job: Job,
    mut ctx: JobContext<JS, PB>,
    storage: S,
    provider: P,
    lock_store: L,
    lock_ttl: Duration,
) -> Result<serde_json::Value, JobError>
where
    S: Storage,
    P: Provider,
    JS: JobStore,
    PB: Publisher,
    L: LockStore,
{
    let SyncWalletJob {
        wallet_address,
        options,
        ..
    } = job
        .payload()
        .map_err(|error| JobError::Validation(error.to_string()))?;

    ctx.progress(5).await?;

    let key = LockKey::sync(&wallet_address);
    let token = ctx.owner_token();

    let acquired = lock_store
        .acquire(&key, token, lock_ttl)
        .await
        .map_err(JobError::storage)?;
    if !acquired {
        return Err(JobError::LockContention(key.as_str().to_owned()));
    }

    let result = sync_wallet(&wallet_address, &options, &provider, &storage, unix_seconds()).await;

    if let Err(error) = lock_store.release(&key, token).await {
        warn!(key:% = key, error:% = error; "cannot release sync lock");
    }

    let report = result?;
    ctx.progress(90).await?;

    serde_json::to_value(&report).map_err(JobError::storage)
}

/// Fetch and persist the wallet's token balances; the report is the job result so dependent
/// flows can consume it.
async fn handle_fetch_balance<S, P, JS, PB>(
    job: Job,
    mut ctx: JobContext<JS, PB>,
    storage: S,
    provider: P,
) -> Result<serde_json::Value, JobError>
where
    S: Storage,
    P: Provider,
    JS: JobStore,
    PB: Publisher,
{
    let FetchBalanceJob { wallet_address, .. } = job
        .payload()
        .map_err(|error| JobError::Validation(error.to_string()))?;

    ctx.progress(10).await?;

    let balances = provider
        .token_balances(&wallet_address)
        .await
        .map_err(JobError::from)?;

    storage
        .save_balances(&wallet_address, &balances, unix_seconds())
        .await
        .map_err(JobError::storage)?;

    ctx.progress(90).await?;

    let report = BalanceReport {
        wallet_address,
        balances,
    };
    serde_json::to_value(&report).map_err(JobError::storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::testing::{MockProvider, MockStorage, address, records};
    use analyzer_common::{
        domain::{JobState, SyncOptions, TokenBalance},
        infra::{
            job_store::in_mem::InMemJobStore, lock_store::in_mem::InMemLockStore,
            pub_sub::in_mem::InMemPubSub,
        },
        queue::{BackoffConfig, BackoffStrategy},
    };
    use assert_matches::assert_matches;
    use std::{
        num::NonZeroUsize,
        sync::Arc,
        time::Instant,
    };
    use tokio::time::sleep;
    use uuid::Uuid;

    fn queue_config() -> QueueConfig {
        QueueConfig {
            concurrency: NonZeroUsize::new(2).expect("non-zero"),
            job_timeout: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(10),
            backoff: BackoffConfig {
                strategy: BackoffStrategy::Fixed,
                base_delay: Duration::from_millis(50),
            },
            poll_interval: Duration::from_millis(20),
        }
    }

    fn sync_job(request_id: &str) -> SyncWalletJob {
        SyncWalletJob {
            wallet_address: address(),
            options: SyncOptions::default(),
            request_id: request_id.to_string(),
        }
    }

    async fn wait_for<F>(store: &InMemJobStore, id: &analyzer_common::domain::JobId, predicate: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(10);

        loop {
            let job = store
                .get(id)
                .await
                .expect("in-mem store is infallible")
                .expect("job exists");
            if predicate(&job) {
                return job;
            }

            assert!(Instant::now() < deadline, "timed out waiting for job condition");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_handle_sync_lock_contention() {
        let storage = MockStorage::default();
        let provider = MockProvider::default();
        let job_store = InMemJobStore::default();
        let lock_store = InMemLockStore::default();
        let pub_sub = InMemPubSub::default();

        // Another holder owns the sync lock.
        let other = Uuid::new_v4();
        assert!(
            lock_store
                .acquire(&LockKey::sync(&address()), other, Duration::from_secs(60))
                .await
                .expect("in-mem store is infallible")
        );

        let job = job_store
            .submit(sync_job("r1").to_new_job().expect("payload serializes"))
            .await
            .expect("in-mem store is infallible");
        let ctx = JobContext::new(
            job.id.clone(),
            QueueName::WalletOperations,
            Uuid::new_v4(),
            job_store.clone(),
            pub_sub.clone(),
        );

        let result = handle_job(
            job,
            ctx,
            storage,
            provider,
            lock_store,
            Duration::from_secs(60),
        )
        .await;
        assert_matches!(result, Err(JobError::LockContention(key)) if key.ends_with(":sync"));
    }

    #[tokio::test]
    async fn test_sync_contention_retried_until_lock_freed() {
        let storage = MockStorage::default();
        let provider = MockProvider {
            newer: Arc::new(vec![records(5, 10_000, "a")]),
            ..Default::default()
        };
        let job_store = InMemJobStore::default();
        let lock_store = InMemLockStore::default();
        let pub_sub = InMemPubSub::default();

        let foreign = Uuid::new_v4();
        let key = LockKey::sync(&address());
        assert!(
            lock_store
                .acquire(&key, foreign, Duration::from_secs(60))
                .await
                .expect("in-mem store is infallible")
        );

        let job = job_store
            .submit(sync_job("r1").to_new_job().expect("payload serializes"))
            .await
            .expect("in-mem store is infallible");

        let runtime = task::spawn(queue::run(
            QueueName::WalletOperations,
            queue_config(),
            job_store.clone(),
            pub_sub.clone(),
            {
                let storage = storage.clone();
                let provider = provider.clone();
                let lock_store = lock_store.clone();
                move |job, ctx| {
                    let storage = storage.clone();
                    let provider = provider.clone();
                    let lock_store = lock_store.clone();
                    async move {
                        handle_job(job, ctx, storage, provider, lock_store, Duration::from_secs(5))
                            .await
                    }
                }
            },
        ));

        // First attempt fails with lock contention and is backed off.
        let delayed = wait_for(&job_store, &job.id, |job| job.state == JobState::Delayed).await;
        assert_eq!(delayed.attempts, 1);
        assert!(
            delayed
                .error
                .as_deref()
                .expect("error recorded")
                .contains("lock contention")
        );

        // Once the lock is freed the retry succeeds.
        assert!(
            lock_store
                .release(&key, foreign)
                .await
                .expect("in-mem store is infallible")
        );

        let completed = wait_for(&job_store, &job.id, |job| job.state == JobState::Completed).await;
        assert!(completed.attempts >= 2);

        let wallet = storage
            .get_wallet(&address())
            .await
            .expect("storage works")
            .expect("wallet exists");
        assert!(wallet.last_successful_fetch_at.is_some());
        assert_eq!(wallet.newest_processed_signature.as_deref(), Some("a0000"));

        // The lock is free again after the sync.
        assert!(
            !lock_store
                .locked(&key)
                .await
                .expect("in-mem store is infallible")
        );

        runtime.abort();
    }

    #[tokio::test]
    async fn test_handle_fetch_balance() {
        let storage = MockStorage::default();
        let provider = MockProvider {
            balances: Arc::new(vec![TokenBalance {
                token_address: "So11111111111111111111111111111111111111112"
                    .parse()
                    .expect("valid mint"),
                amount: 12.5,
            }]),
            ..Default::default()
        };
        let job_store = InMemJobStore::default();
        let pub_sub = InMemPubSub::default();

        let payload = FetchBalanceJob {
            wallet_address: address(),
            request_id: "r1".to_string(),
        };
        let job = job_store
            .submit(payload.to_new_job().expect("payload serializes"))
            .await
            .expect("in-mem store is infallible");
        let ctx = JobContext::new(
            job.id.clone(),
            QueueName::WalletOperations,
            Uuid::new_v4(),
            job_store.clone(),
            pub_sub.clone(),
        );

        let result = handle_fetch_balance(job, ctx, storage.clone(), provider)
            .await
            .expect("balance fetch succeeds");
        let report = serde_json::from_value::<BalanceReport>(result).expect("report deserializes");
        assert_eq!(report.balances.len(), 1);
        assert_eq!(storage.balances.lock().get(&address()).map(Vec::len), Some(1));
    }
}
