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

use crate::domain::{
    BehaviorProfile, MetadataSource, PnlSummary, compute_behavior, compute_pnl, storage::Storage,
};
use analyzer_common::{
    domain::{
        AnalyzeBehaviorJob, AnalyzePnlJob, BalanceReport, DashboardAnalysisJob,
        EnrichTokenBalancesJob, FetchBalanceJob, Job, JobError, JobId, JobKind, JobStore, LockKey,
        LockStore, Publisher, QueueName, SyncOptions, SyncReport, SyncWalletJob, TimeRange,
        TokenAddress, WalletAddress, WalletStatus, classify_wallet, unix_seconds,
    },
    queue::{self, JobContext, QueueConfig},
};
use anyhow::Context;
use futures::{StreamExt, TryStreamExt, stream};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    time::{Duration, Instant},
};
use tokio::{select, signal::unix::Signal, task};
use uuid::Uuid;

const ENRICH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub analysis_queue: QueueConfig,
    pub enrichment_queue: QueueConfig,

    /// Added on top of the respective timeout for lock TTLs.
    #[serde(with = "humantime_serde", default = "lock_margin_default")]
    pub lock_margin: Duration,

    /// Bounded wait for the balance fetch result at the enrichment step.
    #[serde(with = "humantime_serde", default = "balance_wait_default")]
    pub balance_wait: Duration,

    #[serde(with = "humantime_serde", default = "child_poll_interval_default")]
    pub child_poll_interval: Duration,
}

fn lock_margin_default() -> Duration {
    Duration::from_secs(30)
}

fn balance_wait_default() -> Duration {
    Duration::from_secs(2)
}

fn child_poll_interval_default() -> Duration {
    Duration::from_millis(250)
}

/// Settings shared by all handlers of this service.
#[derive(Debug, Clone, Copy)]
struct FlowSettings {
    lock_ttl: Duration,
    lock_margin: Duration,
    balance_wait: Duration,
    child_poll_interval: Duration,
}

pub async fn run(
    config: Config,
    storage: impl Storage,
    metadata_source: impl MetadataSource,
    job_store: impl JobStore,
    lock_store: impl LockStore,
    publisher: impl Publisher,
    mut sigterm: Signal,
) -> anyhow::Result<()> {
    let Config {
        analysis_queue,
        enrichment_queue,
        lock_margin,
        balance_wait,
        child_poll_interval,
    } = config;

    let settings = FlowSettings {
        lock_ttl: analysis_queue.job_timeout + lock_margin,
        lock_margin,
        balance_wait,
        child_poll_interval,
    };

    let analysis_task = task::spawn(queue::run(
        QueueName::AnalysisOperations,
        analysis_queue,
        job_store.clone(),
        publisher.clone(),
        {
            let storage = storage.clone();
            let lock_store = lock_store.clone();
            move |job, ctx| {
                let storage = storage.clone();
                let lock_store = lock_store.clone();
                async move { handle_analysis_job(job, ctx, storage, lock_store, settings).await }
            }
        },
    ));

    let enrichment_task = task::spawn(queue::run(
        QueueName::EnrichmentOperations,
        enrichment_queue,
        job_store.clone(),
        publisher.clone(),
        {
            let storage = storage.clone();
            let metadata_source = metadata_source.clone();
            move |job, ctx| {
                let storage = storage.clone();
                let metadata_source = metadata_source.clone();
                async move { handle_enrichment_job(job, ctx, storage, metadata_source).await }
            }
        },
    ));

    select! {
        result = analysis_task => result
            .context("analysis_task panicked")
            .and_then(|r| r.context("analysis_task failed")),

        result = enrichment_task => result
            .context("enrichment_task panicked")
            .and_then(|r| r.context("enrichment_task failed")),

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            Ok(())
        }
    }
}

async fn handle_analysis_job<S, JS, PB, L>(
    job: Job,
    ctx: JobContext<JS, PB>,
    storage: S,
    lock_store: L,
    settings: FlowSettings,
) -> Result<serde_json::Value, JobError>
where
    S: Storage,
    JS: JobStore,
    PB: Publisher,
    L: LockStore,
{
    match job.kind {
        JobKind::AnalyzePnl => handle_pnl(job, ctx, storage, lock_store, settings).await,

        JobKind::AnalyzeBehavior => handle_behavior(job, ctx, storage, lock_store, settings).await,

        JobKind::DashboardWalletAnalysis => {
            handle_dashboard(job, ctx, storage, lock_store, settings).await
        }

        other => Err(JobError::Validation(format!(
            "unexpected job kind {other} on {}",
            QueueName::AnalysisOperations
        ))),
    }
}

async fn handle_enrichment_job<S, M, JS, PB>(
    job: Job,
    ctx: JobContext<JS, PB>,
    storage: S,
    metadata_source: M,
) -> Result<serde_json::Value, JobError>
where
    S: Storage,
    M: MetadataSource,
    JS: JobStore,
    PB: Publisher,
{
    match job.kind {
        JobKind::EnrichTokenBalances => handle_enrich(job, ctx, storage, metadata_source).await,

        other => Err(JobError::Validation(format!(
            "unexpected job kind {other} on {}",
            QueueName::EnrichmentOperations
        ))),
    }
}

/// `analyze-pnl` result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlOutcome {
    pub skipped: bool,
    pub summary: Option<PnlSummary>,
}

/// `dashboard-wallet-analysis` result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardReport {
    pub wallet_address: WalletAddress,
    pub sync: Option<SyncReport>,
    pub pnl: PnlOutcome,
    pub behavior: BehaviorProfile,
    pub enrichment_job_id: Option<JobId>,
}

async fn handle_pnl<S, JS, PB, L>(
    job: Job,
    mut ctx: JobContext<JS, PB>,
    storage: S,
    lock_store: L,
    settings: FlowSettings,
) -> Result<serde_json::Value, JobError>
where
    S: Storage,
    JS: JobStore,
    PB: Publisher,
    L: LockStore,
{
    let AnalyzePnlJob {
        wallet_address,
        force_refresh,
        ..
    } = job
        .payload()
        .map_err(|error| JobError::Validation(error.to_string()))?;

    ctx.progress(5).await?;

    let key = LockKey::pnl(&wallet_address);
    let token = ctx.owner_token();
    acquire_or_contend(&lock_store, &key, token, settings.lock_ttl).await?;

    ctx.progress(20).await?;
    let result = run_pnl(&storage, &mut ctx, &wallet_address, force_refresh, 40, 90).await;
    release_or_warn(&lock_store, &key, token).await;

    serde_json::to_value(&result?).map_err(JobError::storage)
}

async fn handle_behavior<S, JS, PB, L>(
    job: Job,
    mut ctx: JobContext<JS, PB>,
    storage: S,
    lock_store: L,
    settings: FlowSettings,
) -> Result<serde_json::Value, JobError>
where
    S: Storage,
    JS: JobStore,
    PB: Publisher,
    L: LockStore,
{
    let AnalyzeBehaviorJob {
        wallet_address,
        time_range,
        exclude_mints,
        ..
    } = job
        .payload()
        .map_err(|error| JobError::Validation(error.to_string()))?;

    ctx.progress(5).await?;

    let key = LockKey::behavior(&wallet_address);
    let token = ctx.owner_token();
    acquire_or_contend(&lock_store, &key, token, settings.lock_ttl).await?;

    ctx.progress(20).await?;
    let result = run_behavior(
        &storage,
        &mut ctx,
        &wallet_address,
        time_range.as_ref(),
        &exclude_mints,
        40,
        90,
    )
    .await;
    release_or_warn(&lock_store, &key, token).await;

    serde_json::to_value(&result?).map_err(JobError::storage)
}

/// The composite dashboard flow: classify staleness, run sync and balance fetch as parallel
/// child jobs, await sync, run PNL then behavior sequentially, submit enrichment without
/// awaiting it.
async fn handle_dashboard<S, JS, PB, L>(
    job: Job,
    mut ctx: JobContext<JS, PB>,
    storage: S,
    lock_store: L,
    settings: FlowSettings,
) -> Result<serde_json::Value, JobError>
where
    S: Storage,
    JS: JobStore,
    PB: Publisher,
    L: LockStore,
{
    let payload: DashboardAnalysisJob = job
        .payload()
        .map_err(|error| JobError::Validation(error.to_string()))?;
    let deadline = Instant::now() + payload.timeout;

    // The record must still match its deterministic ID; a mismatch means a corrupted
    // submission.
    let expected = payload.to_new_job().map_err(JobError::storage)?;
    if expected.id != job.id {
        return Err(JobError::Validation(format!(
            "job id {} does not match payload id {}",
            job.id, expected.id
        )));
    }

    ctx.progress(5).await?;

    let key = LockKey::dashboard_analysis(&payload.wallet_address);
    let token = ctx.owner_token();
    let lock_ttl = payload.timeout + settings.lock_margin;
    acquire_or_contend(&lock_store, &key, token, lock_ttl).await?;

    let mut enrichment_child = None;
    let result = dashboard_flow(
        &payload,
        deadline,
        &mut ctx,
        &storage,
        &lock_store,
        settings,
        &mut enrichment_child,
    )
    .await;

    // A failed flow must not leave its enrichment child behind.
    if result.is_err()
        && let Some(enrichment_id) = &enrichment_child
    {
        if let Err(error) = ctx.cancel(enrichment_id).await {
            warn!(enrichment_id:%, error:% = error; "cannot cancel enrichment child");
        }
    }

    release_or_warn(&lock_store, &key, token).await;

    let report = result?;
    info!(
        wallet_address:% = report.wallet_address,
        sync:? = report.sync,
        pnl_skipped = report.pnl.skipped;
        "dashboard analysis done"
    );

    serde_json::to_value(&report).map_err(JobError::storage)
}

#[allow(clippy::too_many_arguments)]
async fn dashboard_flow<S, JS, PB, L>(
    payload: &DashboardAnalysisJob,
    deadline: Instant,
    ctx: &mut JobContext<JS, PB>,
    storage: &S,
    lock_store: &L,
    settings: FlowSettings,
    enrichment_child: &mut Option<JobId>,
) -> Result<DashboardReport, JobError>
where
    S: Storage,
    JS: JobStore,
    PB: Publisher,
    L: LockStore,
{
    let address = &payload.wallet_address;
    let token = ctx.owner_token();

    // Staleness classification decides whether a sync is planned at all.
    ctx.progress(10).await?;
    let now = unix_seconds();
    let wallet = storage.get_wallet(address).await.map_err(JobError::storage)?;
    let status = classify_wallet(wallet.as_ref(), now);
    let plan_sync = payload.force_refresh || status != WalletStatus::Fresh;

    // Launch sync and balance fetch in parallel as child jobs on wallet-operations.
    ctx.progress(15).await?;
    let sync_child = if plan_sync {
        let sync_job = SyncWalletJob {
            wallet_address: address.clone(),
            options: SyncOptions {
                smart_fetch: true,
                force_refresh: payload.force_refresh,
                ..Default::default()
            },
            request_id: payload.request_id.clone(),
        };
        let child = ctx
            .submit_child(sync_job.to_new_job().map_err(JobError::storage)?)
            .await?;
        Some(child.id)
    } else {
        None
    };

    let balance_job = FetchBalanceJob {
        wallet_address: address.clone(),
        request_id: payload.request_id.clone(),
    };
    let balance_child = ctx
        .submit_child(balance_job.to_new_job().map_err(JobError::storage)?)
        .await?;

    // Sync completion is required before any analysis runs.
    ctx.progress(25).await?;
    let sync = match &sync_child {
        Some(sync_id) => {
            let jobs = ctx
                .await_terminal(
                    std::slice::from_ref(sync_id),
                    deadline,
                    settings.child_poll_interval,
                )
                .await?;
            let sync_job = &jobs[0];

            if !sync_job.is_terminal() {
                return Err(JobError::Timeout(payload.timeout));
            }
            if !sync_job.succeeded() {
                return Err(JobError::ChildFailure(sync_job.id.clone()));
            }

            sync_job
                .result
                .clone()
                .map(serde_json::from_value::<SyncReport>)
                .transpose()
                .map_err(|error| {
                    JobError::DataInvariant(format!("malformed sync report: {error}"))
                })?
        }

        None => None,
    };

    // PNL, then behavior, strictly sequentially: both read-modify-write per-wallet analysis
    // rows.
    ctx.progress(40).await?;
    let pnl_key = LockKey::pnl(address);
    acquire_or_contend(lock_store, &pnl_key, token, settings.lock_ttl).await?;
    let pnl = run_pnl(storage, ctx, address, payload.force_refresh, 45, 55).await;
    release_or_warn(lock_store, &pnl_key, token).await;
    let pnl = pnl?;

    ctx.progress(60).await?;
    let behavior_key = LockKey::behavior(address);
    acquire_or_contend(lock_store, &behavior_key, token, settings.lock_ttl).await?;
    let behavior = run_behavior(storage, ctx, address, None, &[], 65, 75).await;
    release_or_warn(lock_store, &behavior_key, token).await;
    let behavior = behavior?;

    ctx.progress(80).await?;

    // Enrichment is fire-and-forget: collect token addresses from the balance fetch (if it is
    // done within a small bounded wait) and the just-written analysis results.
    let enrichment_job_id = if payload.enrich_metadata {
        let mut tokens = BTreeSet::new();

        let balance_deadline = (Instant::now() + settings.balance_wait).min(deadline);
        let jobs = ctx
            .await_terminal(
                &[balance_child.id.clone()],
                balance_deadline,
                settings.child_poll_interval,
            )
            .await?;
        if let Some(result) = jobs[0].result.clone().filter(|_| jobs[0].succeeded()) {
            let report = serde_json::from_value::<BalanceReport>(result).map_err(|error| {
                JobError::DataInvariant(format!("malformed balance report: {error}"))
            })?;
            tokens.extend(report.balances.into_iter().map(|b| b.token_address));
        }

        tokens.extend(
            storage
                .get_result_tokens(address)
                .await
                .map_err(JobError::storage)?,
        );

        if tokens.is_empty() {
            None
        } else {
            let enrich_job = EnrichTokenBalancesJob {
                wallet_address: address.clone(),
                token_addresses: tokens.into_iter().collect(),
                request_id: payload.request_id.clone(),
            };
            let child = ctx
                .submit_child(enrich_job.to_new_job().map_err(JobError::storage)?)
                .await?;
            *enrichment_child = Some(child.id.clone());
            Some(child.id)
        }
    } else {
        None
    };

    ctx.progress(85).await?;

    Ok(DashboardReport {
        wallet_address: address.clone(),
        sync,
        pnl,
        behavior,
        enrichment_job_id,
    })
}

/// PNL over the local store, honoring the analysis freshness window unless forced.
async fn run_pnl<S, JS, PB>(
    storage: &S,
    ctx: &mut JobContext<JS, PB>,
    address: &WalletAddress,
    force_refresh: bool,
    loaded_anchor: u8,
    saved_anchor: u8,
) -> Result<PnlOutcome, JobError>
where
    S: Storage,
    JS: JobStore,
    PB: Publisher,
{
    let now = unix_seconds();
    let wallet = storage.get_wallet(address).await.map_err(JobError::storage)?;

    if let Some(wallet) = &wallet
        && wallet.analysis_current(now)
        && !force_refresh
    {
        info!(address:%; "analysis current, skipping PNL");
        return Ok(PnlOutcome {
            skipped: true,
            summary: None,
        });
    }

    let records = storage
        .get_transactions(address)
        .await
        .map_err(JobError::storage)?;
    ctx.progress(loaded_anchor).await?;

    let summary = compute_pnl(address, &records);
    storage
        .save_pnl_results(address, &summary.tokens, now)
        .await
        .map_err(JobError::storage)?;
    storage
        .set_last_analyzed(address, now)
        .await
        .map_err(JobError::storage)?;
    ctx.progress(saved_anchor).await?;

    Ok(PnlOutcome {
        skipped: false,
        summary: Some(summary),
    })
}

/// Behavior always runs; its cost is amortized.
async fn run_behavior<S, JS, PB>(
    storage: &S,
    ctx: &mut JobContext<JS, PB>,
    address: &WalletAddress,
    time_range: Option<&TimeRange>,
    exclude_mints: &[TokenAddress],
    loaded_anchor: u8,
    saved_anchor: u8,
) -> Result<BehaviorProfile, JobError>
where
    S: Storage,
    JS: JobStore,
    PB: Publisher,
{
    let records = storage
        .get_transactions(address)
        .await
        .map_err(JobError::storage)?;
    ctx.progress(loaded_anchor).await?;

    let profile = compute_behavior(address, &records, time_range, exclude_mints);
    storage
        .save_behavior_profile(&profile, unix_seconds())
        .await
        .map_err(JobError::storage)?;
    ctx.progress(saved_anchor).await?;

    Ok(profile)
}

/// Fetch metadata for every token with bounded concurrency and persist it. Failures only ever
/// fail this enrichment job, never its parent.
async fn handle_enrich<S, M, JS, PB>(
    job: Job,
    mut ctx: JobContext<JS, PB>,
    storage: S,
    metadata_source: M,
) -> Result<serde_json::Value, JobError>
where
    S: Storage,
    M: MetadataSource,
    JS: JobStore,
    PB: Publisher,
{
    let EnrichTokenBalancesJob {
        token_addresses, ..
    } = job
        .payload()
        .map_err(|error| JobError::Validation(error.to_string()))?;

    ctx.progress(10).await?;

    let metadata = stream::iter(token_addresses)
        .map(|token| {
            let metadata_source = metadata_source.clone();
            async move { metadata_source.token_metadata(&token).await }
        })
        .buffer_unordered(ENRICH_CONCURRENCY)
        .try_collect::<Vec<_>>()
        .await
        .map_err(JobError::from)?;

    storage
        .save_token_metadata(&metadata, unix_seconds())
        .await
        .map_err(JobError::storage)?;

    ctx.progress(90).await?;

    Ok(serde_json::json!({ "enriched": metadata.len() }))
}

async fn acquire_or_contend<L>(
    lock_store: &L,
    key: &LockKey,
    token: Uuid,
    ttl: Duration,
) -> Result<(), JobError>
where
    L: LockStore,
{
    let acquired = lock_store
        .acquire(key, token, ttl)
        .await
        .map_err(JobError::storage)?;

    if acquired {
        Ok(())
    } else {
        Err(JobError::LockContention(key.as_str().to_owned()))
    }
}

async fn release_or_warn<L>(lock_store: &L, key: &LockKey, token: Uuid)
where
    L: LockStore,
{
    match lock_store.release(key, token).await {
        Ok(true) => {}
        Ok(false) => warn!(key:% = key; "lock was no longer held on release"),
        Err(error) => warn!(key:% = key, error:% = error; "cannot release lock"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::testing::{MockMetadataSource, MockStorage, address, mint, record};
    use analyzer_common::{
        domain::{FlowDirection, JobState, SyncStatus, WalletState},
        infra::{
            job_store::in_mem::InMemJobStore, lock_store::in_mem::InMemLockStore,
            pub_sub::in_mem::InMemPubSub,
        },
        queue::{BackoffConfig, BackoffStrategy},
    };
    use assert_matches::assert_matches;
    use std::num::NonZeroUsize;
    use tokio::time::sleep;

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

    fn settings() -> FlowSettings {
        FlowSettings {
            lock_ttl: Duration::from_secs(5),
            lock_margin: Duration::from_secs(5),
            balance_wait: Duration::from_secs(2),
            child_poll_interval: Duration::from_millis(25),
        }
    }

    fn dashboard_job(request_id: &str, enrich_metadata: bool) -> DashboardAnalysisJob {
        DashboardAnalysisJob {
            wallet_address: address(),
            force_refresh: false,
            enrich_metadata,
            timeout: Duration::from_secs(8),
            failure_threshold: None,
            request_id: request_id.to_string(),
        }
    }

    /// Simulates the sync engine on wallet-operations: a sync writes wallet state and two
    /// transactions, a balance fetch reports one token balance.
    async fn stub_wallet_job(
        job: Job,
        storage: MockStorage,
        fail_sync: bool,
    ) -> Result<serde_json::Value, JobError> {
        match job.kind {
            JobKind::SyncWallet => {
                if fail_sync {
                    return Err(JobError::UpstreamPermanent("provider rejected request".into()));
                }

                let payload: SyncWalletJob = job
                    .payload()
                    .map_err(|error| JobError::Validation(error.to_string()))?;
                let address = payload.wallet_address;

                let mut wallet = WalletState::new(address.clone());
                wallet.newest_processed_signature = Some("s2".to_string());
                wallet.newest_processed_timestamp = Some(2_000);
                wallet.oldest_processed_timestamp = Some(1_000);
                wallet.last_successful_fetch_at = Some(unix_seconds());
                storage.wallets.lock().insert(address.clone(), wallet);

                storage.transactions.lock().insert(
                    address,
                    vec![
                        record("s1", 1_000, FlowDirection::In, 100.0, 2.0),
                        record("s2", 2_000, FlowDirection::Out, 50.0, 3.0),
                    ],
                );

                serde_json::to_value(SyncReport {
                    status: SyncStatus::Synced,
                    fetched: 2,
                    local_count: 2,
                })
                .map_err(JobError::storage)
            }

            JobKind::FetchBalance => {
                let payload: FetchBalanceJob = job
                    .payload()
                    .map_err(|error| JobError::Validation(error.to_string()))?;

                serde_json::to_value(BalanceReport {
                    wallet_address: payload.wallet_address,
                    balances: vec![analyzer_common::domain::TokenBalance {
                        token_address: mint(),
                        amount: 5.0,
                    }],
                })
                .map_err(JobError::storage)
            }

            other => Err(JobError::Validation(format!("unexpected kind {other}"))),
        }
    }

    struct Harness {
        storage: MockStorage,
        job_store: InMemJobStore,
        lock_store: InMemLockStore,
        tasks: Vec<task::JoinHandle<anyhow::Result<()>>>,
    }

    impl Harness {
        fn start(storage: MockStorage, fail_sync: bool) -> Self {
            let job_store = InMemJobStore::default();
            let lock_store = InMemLockStore::default();
            let pub_sub = InMemPubSub::default();
            let mut tasks = Vec::new();

            tasks.push(task::spawn(queue::run(
                QueueName::WalletOperations,
                queue_config(),
                job_store.clone(),
                pub_sub.clone(),
                {
                    let storage = storage.clone();
                    move |job, _ctx: JobContext<InMemJobStore, InMemPubSub>| {
                        let storage = storage.clone();
                        async move { stub_wallet_job(job, storage, fail_sync).await }
                    }
                },
            )));

            tasks.push(task::spawn(queue::run(
                QueueName::AnalysisOperations,
                queue_config(),
                job_store.clone(),
                pub_sub.clone(),
                {
                    let storage = storage.clone();
                    let lock_store = lock_store.clone();
                    move |job, ctx| {
                        let storage = storage.clone();
                        let lock_store = lock_store.clone();
                        async move {
                            handle_analysis_job(job, ctx, storage, lock_store, settings()).await
                        }
                    }
                },
            )));

            tasks.push(task::spawn(queue::run(
                QueueName::EnrichmentOperations,
                queue_config(),
                job_store.clone(),
                pub_sub.clone(),
                {
                    let storage = storage.clone();
                    move |job, ctx| {
                        let storage = storage.clone();
                        let metadata_source = MockMetadataSource::default();
                        async move {
                            handle_enrichment_job(job, ctx, storage, metadata_source).await
                        }
                    }
                },
            )));

            Self {
                storage,
                job_store,
                lock_store,
                tasks,
            }
        }

        async fn wait_terminal(&self, id: &JobId) -> Job {
            let deadline = Instant::now() + Duration::from_secs(15);

            loop {
                let job = self
                    .job_store
                    .get(id)
                    .await
                    .expect("in-mem store is infallible")
                    .expect("job exists");
                if job.is_terminal() {
                    return job;
                }

                assert!(Instant::now() < deadline, "timed out waiting for terminal state");
                sleep(Duration::from_millis(10)).await;
            }
        }

        fn stop(self) {
            for task in self.tasks {
                task.abort();
            }
        }
    }

    #[tokio::test]
    async fn test_dashboard_fresh_wallet_runs_full_flow() {
        let harness = Harness::start(MockStorage::default(), false);

        let job = harness
            .job_store
            .submit(
                dashboard_job("r1", true)
                    .to_new_job()
                    .expect("payload serializes"),
            )
            .await
            .expect("in-mem store is infallible");

        let done = harness.wait_terminal(&job.id).await;
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.progress, 100);

        let report: DashboardReport =
            serde_json::from_value(done.result.expect("result recorded"))
                .expect("report deserializes");
        assert_matches!(&report.sync, Some(sync) => {
            assert_eq!(sync.status, SyncStatus::Synced);
            assert_eq!(sync.local_count, 2);
        });
        assert!(!report.pnl.skipped);
        assert_eq!(report.behavior.total_trades, 2);

        // The enrichment child was submitted, runs independently and persists metadata.
        let enrichment_id = report.enrichment_job_id.expect("enrichment submitted");
        let enrichment = harness.wait_terminal(&enrichment_id).await;
        assert_eq!(enrichment.state, JobState::Completed);
        assert!(harness.storage.token_metadata.lock().contains_key(&mint()));

        // Sync child, balance child and enrichment child are tracked as children.
        let children = harness
            .job_store
            .children(&job.id)
            .await
            .expect("in-mem store is infallible");
        assert_eq!(children.len(), 3);

        // No dashboard lock is held after completion.
        assert!(
            !harness
                .lock_store
                .locked(&LockKey::dashboard_analysis(&address()))
                .await
                .expect("in-mem store is infallible")
        );

        harness.stop();
    }

    #[tokio::test]
    async fn test_dashboard_skips_sync_and_pnl_when_fresh() {
        let now = unix_seconds();
        let mut wallet = WalletState::new(address());
        wallet.last_successful_fetch_at = Some(now - 60);
        wallet.last_analyzed_end_ts = Some(now - 60);
        let storage = MockStorage::default().with_wallet(wallet).with_transactions(
            &address(),
            vec![record("s1", 1_000, FlowDirection::In, 100.0, 2.0)],
        );

        let harness = Harness::start(storage, false);

        let job = harness
            .job_store
            .submit(
                dashboard_job("r2", false)
                    .to_new_job()
                    .expect("payload serializes"),
            )
            .await
            .expect("in-mem store is infallible");

        let done = harness.wait_terminal(&job.id).await;
        assert_eq!(done.state, JobState::Completed);

        let report: DashboardReport =
            serde_json::from_value(done.result.expect("result recorded"))
                .expect("report deserializes");
        assert_eq!(report.sync, None);
        assert!(report.pnl.skipped);
        assert_eq!(report.behavior.total_trades, 1);
        assert_eq!(report.enrichment_job_id, None);

        // Only the balance fetch was spawned.
        let children = harness
            .job_store
            .children(&job.id)
            .await
            .expect("in-mem store is infallible");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].kind, JobKind::FetchBalance);

        harness.stop();
    }

    #[tokio::test]
    async fn test_dashboard_duplicate_submission_resolves_to_same_job() {
        let harness = Harness::start(MockStorage::default(), false);

        let first = harness
            .job_store
            .submit(
                dashboard_job("r3", false)
                    .to_new_job()
                    .expect("payload serializes"),
            )
            .await
            .expect("in-mem store is infallible");
        let second = harness
            .job_store
            .submit(
                dashboard_job("r3", false)
                    .to_new_job()
                    .expect("payload serializes"),
            )
            .await
            .expect("in-mem store is infallible");
        assert_eq!(first.id, second.id);

        let done = harness.wait_terminal(&first.id).await;
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts, 1);

        harness.stop();
    }

    #[tokio::test]
    async fn test_dashboard_fails_on_sync_child_failure() {
        let harness = Harness::start(MockStorage::default(), true);

        let job = harness
            .job_store
            .submit(
                dashboard_job("r4", true)
                    .to_new_job()
                    .expect("payload serializes"),
            )
            .await
            .expect("in-mem store is infallible");

        let done = harness.wait_terminal(&job.id).await;
        assert_eq!(done.state, JobState::Dead);
        assert!(
            done.error
                .as_deref()
                .expect("error recorded")
                .contains("child job")
        );

        // The lock is released on the failure path too.
        assert!(
            !harness
                .lock_store
                .locked(&LockKey::dashboard_analysis(&address()))
                .await
                .expect("in-mem store is infallible")
        );

        harness.stop();
    }

    #[tokio::test]
    async fn test_pnl_handler_skips_when_analysis_current() {
        let now = unix_seconds();
        let mut wallet = WalletState::new(address());
        wallet.last_analyzed_end_ts = Some(now - 60);
        let storage = MockStorage::default().with_wallet(wallet);

        let job_store = InMemJobStore::default();
        let lock_store = InMemLockStore::default();
        let pub_sub = InMemPubSub::default();

        let payload = AnalyzePnlJob {
            wallet_address: address(),
            force_refresh: false,
            request_id: "r5".to_string(),
        };
        let job = job_store
            .submit(payload.to_new_job().expect("payload serializes"))
            .await
            .expect("in-mem store is infallible");
        let ctx = JobContext::new(
            job.id.clone(),
            QueueName::AnalysisOperations,
            Uuid::new_v4(),
            job_store.clone(),
            pub_sub.clone(),
        );

        let result = handle_pnl(job, ctx, storage.clone(), lock_store, settings())
            .await
            .expect("pnl succeeds");
        let outcome: PnlOutcome = serde_json::from_value(result).expect("outcome deserializes");
        assert!(outcome.skipped);
        assert!(storage.pnl_results.lock().is_empty());
    }
}
