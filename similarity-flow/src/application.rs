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

use crate::domain::{FeatureVector, build_vector, pairwise, storage::Storage};
use analyzer_common::{
    domain::{
        DashboardAnalysisJob, Job, JobError, JobId, JobKind, JobStore, Publisher, QueueName,
        SimilarityFlowJob, WalletAddress, unix_seconds,
    },
    queue::{self, JobContext, QueueConfig},
};
use anyhow::Context;
use log::{info, warn};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};
use tokio::{select, signal::unix::Signal, task};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub queue: QueueConfig,

    #[serde(with = "humantime_serde", default = "child_poll_interval_default")]
    pub child_poll_interval: Duration,
}

fn child_poll_interval_default() -> Duration {
    Duration::from_millis(250)
}

pub async fn run(
    config: Config,
    storage: impl Storage,
    job_store: impl JobStore,
    publisher: impl Publisher,
    mut sigterm: Signal,
) -> anyhow::Result<()> {
    let Config {
        queue,
        child_poll_interval,
    } = config;

    let workers_task = task::spawn(queue::run(
        QueueName::SimilarityOperations,
        queue,
        job_store,
        publisher,
        {
            let storage = storage.clone();
            move |job, ctx| {
                let storage = storage.clone();
                async move { handle_job(job, ctx, storage, child_poll_interval).await }
            }
        },
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

async fn handle_job<S, JS, PB>(
    job: Job,
    ctx: JobContext<JS, PB>,
    storage: S,
    child_poll_interval: Duration,
) -> Result<serde_json::Value, JobError>
where
    S: Storage,
    JS: JobStore,
    PB: Publisher,
{
    match job.kind {
        JobKind::SimilarityFlow => handle_similarity(job, ctx, storage, child_poll_interval).await,

        other => Err(JobError::Validation(format!(
            "unexpected job kind {other} on {}",
            QueueName::SimilarityOperations
        ))),
    }
}

/// The fan-out/fan-in similarity flow: one dashboard analysis child per wallet, a barrier with
/// flow timeout, a success-ratio gate, then deterministic vector aggregation and pairwise
/// scoring.
async fn handle_similarity<S, JS, PB>(
    job: Job,
    mut ctx: JobContext<JS, PB>,
    storage: S,
    child_poll_interval: Duration,
) -> Result<serde_json::Value, JobError>
where
    S: Storage,
    JS: JobStore,
    PB: Publisher,
{
    let payload: SimilarityFlowJob = job
        .payload()
        .map_err(|error| JobError::Validation(error.to_string()))?;
    let wallets = validate(&payload)?;
    let deadline = Instant::now() + payload.timeout;

    ctx.progress(5).await?;

    // Fan-out: one preparation child per wallet, never force-refreshing and never enriching.
    let mut children = Vec::with_capacity(wallets.len());
    for wallet in &wallets {
        let child_payload = DashboardAnalysisJob {
            wallet_address: wallet.clone(),
            force_refresh: false,
            enrich_metadata: false,
            timeout: payload.timeout,
            failure_threshold: None,
            request_id: payload.request_id.clone(),
        };
        let child = ctx
            .submit_child(child_payload.to_new_job().map_err(JobError::storage)?)
            .await?;
        children.push(child.id);
    }

    ctx.progress(15).await?;

    // Barrier: every child terminal or the flow deadline, whichever comes first.
    let child_jobs = ctx
        .await_terminal(&children, deadline, child_poll_interval)
        .await?;

    for child in child_jobs.iter().filter(|child| !child.is_terminal()) {
        if let Err(error) = ctx.cancel(&child.id).await {
            warn!(child_id:% = child.id, error:% = error; "cannot cancel child job");
        }
    }

    ctx.progress(60).await?;

    let (successful, failed): (Vec<_>, Vec<_>) = wallets
        .iter()
        .zip(&child_jobs)
        .partition(|(_, child)| child.succeeded());
    let successful = successful
        .into_iter()
        .map(|(wallet, _)| wallet.clone())
        .collect::<Vec<_>>();
    let failed = failed
        .into_iter()
        .map(|(wallet, _)| wallet.clone())
        .collect::<Vec<_>>();

    let success_ratio = successful.len() as f64 / wallets.len() as f64;
    if success_ratio < payload.failure_threshold {
        info!(
            success_ratio,
            failure_threshold = payload.failure_threshold,
            failed:? = failed;
            "similarity flow below threshold"
        );
        return Err(JobError::InsufficientInputs { failed });
    }

    // Aggregate: deterministic feature vectors from repository reads.
    let mut vectors: BTreeMap<WalletAddress, FeatureVector> = BTreeMap::new();
    for wallet in &successful {
        ctx.ensure_active().await?;

        let flows = storage
            .token_flows(wallet, payload.time_range.as_ref())
            .await
            .map_err(JobError::storage)?;
        vectors.insert(wallet.clone(), build_vector(&flows, payload.vector_type));
    }

    ctx.progress(80).await?;

    let report = pairwise(&vectors, payload.vector_type);
    info!(
        wallets = report.wallets.len(),
        pairs = report.pairs.len(),
        completed_at = unix_seconds();
        "similarity flow done"
    );

    ctx.progress(90).await?;

    serde_json::to_value(&report).map_err(JobError::storage)
}

/// Shape-check and deduplicate the wallet addresses; a flow needs at least two distinct wallets
/// and a threshold within `[0, 1]`.
fn validate(payload: &SimilarityFlowJob) -> Result<Vec<WalletAddress>, JobError> {
    let mut wallets = payload.wallet_addresses.clone();
    wallets.sort_unstable();
    wallets.dedup();

    if wallets.len() < 2 {
        return Err(JobError::Validation(
            "similarity needs at least 2 distinct wallet addresses".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&payload.failure_threshold) {
        return Err(JobError::Validation(format!(
            "failure threshold {} outside [0, 1]",
            payload.failure_threshold
        )));
    }

    Ok(wallets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TokenFlow;
    use analyzer_common::{
        domain::{FlowDirection, JobState, TimeRange, VectorType},
        infra::{job_store::in_mem::InMemJobStore, pub_sub::in_mem::InMemPubSub},
        queue::{BackoffConfig, BackoffStrategy},
    };
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};
    use tokio::time::sleep;
    use uuid::Uuid;

    const WALLET_A: &str = "2x3N9tHoNvUZwFQpgb3T1V6DcLYtT3HZVEs2GeE7wZq9";
    const WALLET_B: &str = "4Nd1mYvDgHcwXvLEvFrMvGdL7ZjPQQsjLsg8jW3hQyi1";
    const WALLET_C: &str = "7fUAJdStEuGbc3sM84cKRL6yYaaSstyLSU4ve5oovLS7";
    const MINT: &str = "So11111111111111111111111111111111111111112";

    fn wallet(s: &str) -> WalletAddress {
        s.parse().expect("valid address")
    }

    #[derive(Clone, Default)]
    struct MockStorage {
        flows: Arc<Mutex<HashMap<WalletAddress, Vec<TokenFlow>>>>,
    }

    impl Storage for MockStorage {
        async fn token_flows(
            &self,
            address: &WalletAddress,
            _time_range: Option<&TimeRange>,
        ) -> Result<Vec<TokenFlow>, sqlx::Error> {
            Ok(self.flows.lock().get(address).cloned().unwrap_or_default())
        }
    }

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

    fn flow_job(wallets: &[&str], threshold: f64, request_id: &str) -> SimilarityFlowJob {
        SimilarityFlowJob {
            wallet_addresses: wallets.iter().map(|w| wallet(w)).collect(),
            vector_type: VectorType::Capital,
            time_range: None,
            failure_threshold: threshold,
            timeout: Duration::from_secs(8),
            request_id: request_id.to_string(),
        }
    }

    /// Stub for analysis-operations which completes or fails dashboard children by wallet.
    fn spawn_analysis_stub(
        job_store: InMemJobStore,
        pub_sub: InMemPubSub,
        failing: Vec<WalletAddress>,
    ) -> task::JoinHandle<anyhow::Result<()>> {
        task::spawn(queue::run(
            QueueName::AnalysisOperations,
            queue_config(),
            job_store,
            pub_sub,
            move |job: Job, _ctx: JobContext<InMemJobStore, InMemPubSub>| {
                let failing = failing.clone();
                async move {
                    let payload: DashboardAnalysisJob = job
                        .payload()
                        .map_err(|error| JobError::Validation(error.to_string()))?;

                    if failing.contains(&payload.wallet_address) {
                        Err(JobError::UpstreamPermanent("wallet history unavailable".into()))
                    } else {
                        Ok(serde_json::json!({ "ok": true }))
                    }
                }
            },
        ))
    }

    async fn wait_terminal(store: &InMemJobStore, id: &JobId) -> Job {
        let deadline = Instant::now() + Duration::from_secs(15);

        loop {
            let job = store
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

    #[test]
    fn test_validate() {
        assert_matches!(
            validate(&flow_job(&[WALLET_A], 0.5, "r1")),
            Err(JobError::Validation(_))
        );
        assert_matches!(
            validate(&flow_job(&[WALLET_A, WALLET_A], 0.5, "r1")),
            Err(JobError::Validation(_))
        );
        assert_matches!(
            validate(&flow_job(&[WALLET_A, WALLET_B], 1.5, "r1")),
            Err(JobError::Validation(_))
        );

        let wallets =
            validate(&flow_job(&[WALLET_B, WALLET_A], 0.5, "r1")).expect("valid payload");
        assert_eq!(wallets, vec![wallet(WALLET_A), wallet(WALLET_B)]);
    }

    #[tokio::test]
    async fn test_similarity_flow_completes() {
        let storage = MockStorage::default();
        {
            let mut flows = storage.flows.lock();
            for w in [WALLET_A, WALLET_B] {
                flows.insert(
                    wallet(w),
                    vec![TokenFlow {
                        token_address: MINT.parse().expect("valid mint"),
                        direction: FlowDirection::In,
                        sol_volume: 2.0,
                        token_volume: 100.0,
                        trade_count: 2,
                    }],
                );
            }
        }

        let job_store = InMemJobStore::default();
        let pub_sub = InMemPubSub::default();

        let analysis_stub = spawn_analysis_stub(job_store.clone(), pub_sub.clone(), vec![]);
        let similarity_task = task::spawn(queue::run(
            QueueName::SimilarityOperations,
            queue_config(),
            job_store.clone(),
            pub_sub.clone(),
            {
                let storage = storage.clone();
                move |job, ctx| {
                    let storage = storage.clone();
                    async move { handle_job(job, ctx, storage, Duration::from_millis(25)).await }
                }
            },
        ));

        let job = job_store
            .submit(
                flow_job(&[WALLET_A, WALLET_B], 0.8, "r1")
                    .to_new_job()
                    .expect("payload serializes"),
            )
            .await
            .expect("in-mem store is infallible");

        let done = wait_terminal(&job_store, &job.id).await;
        assert_eq!(done.state, JobState::Completed);

        let report: crate::domain::SimilarityReport =
            serde_json::from_value(done.result.expect("result recorded"))
                .expect("report deserializes");
        assert_eq!(report.wallets.len(), 2);
        assert_eq!(report.pairs.len(), 1);
        // Identical capital vectors score 1.
        assert!((report.pairs[0].score - 1.0).abs() < 1e-9);

        // Children were tracked on the flow job.
        let children = job_store
            .children(&job.id)
            .await
            .expect("in-mem store is infallible");
        assert_eq!(children.len(), 2);

        analysis_stub.abort();
        similarity_task.abort();
    }

    #[tokio::test]
    async fn test_similarity_flow_below_threshold() {
        let storage = MockStorage::default();
        let job_store = InMemJobStore::default();
        let pub_sub = InMemPubSub::default();

        // C fails; 2 of 3 is below the 0.8 threshold.
        let analysis_stub =
            spawn_analysis_stub(job_store.clone(), pub_sub.clone(), vec![wallet(WALLET_C)]);
        let similarity_task = task::spawn(queue::run(
            QueueName::SimilarityOperations,
            queue_config(),
            job_store.clone(),
            pub_sub.clone(),
            {
                let storage = storage.clone();
                move |job, ctx| {
                    let storage = storage.clone();
                    async move { handle_job(job, ctx, storage, Duration::from_millis(25)).await }
                }
            },
        ));

        let job = job_store
            .submit(
                flow_job(&[WALLET_A, WALLET_B, WALLET_C], 0.8, "r4")
                    .to_new_job()
                    .expect("payload serializes"),
            )
            .await
            .expect("in-mem store is infallible");

        let done = wait_terminal(&job_store, &job.id).await;
        assert_eq!(done.state, JobState::Dead);

        let error = done.error.expect("error recorded");
        assert!(error.contains("insufficient successful inputs"));
        assert!(error.contains(WALLET_C));
        assert!(!error.contains(WALLET_A));

        analysis_stub.abort();
        similarity_task.abort();
    }

    #[tokio::test]
    async fn test_similarity_rejects_direct_invalid_payload() {
        let storage = MockStorage::default();
        let job_store = InMemJobStore::default();
        let pub_sub = InMemPubSub::default();

        let job = job_store
            .submit(
                flow_job(&[WALLET_A], 0.5, "r9")
                    .to_new_job()
                    .expect("payload serializes"),
            )
            .await
            .expect("in-mem store is infallible");
        let ctx = JobContext::new(
            job.id.clone(),
            QueueName::SimilarityOperations,
            Uuid::new_v4(),
            job_store.clone(),
            pub_sub.clone(),
        );

        let result = handle_job(job, ctx, storage, Duration::from_millis(25)).await;
        assert_matches!(result, Err(JobError::Validation(_)));
    }
}
