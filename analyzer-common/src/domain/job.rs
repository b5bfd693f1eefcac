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

use crate::{
    domain::{TimeRange, TokenAddress, TokenBalance, WalletAddress},
    error::BoxError,
};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{error::Error as StdError, time::Duration};
use thiserror::Error;
use uuid::Uuid;

/// Queue names are stable constants; every job kind is pinned to one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    #[display("wallet-operations")]
    WalletOperations,

    #[display("analysis-operations")]
    AnalysisOperations,

    #[display("enrichment-operations")]
    EnrichmentOperations,

    #[display("similarity-operations")]
    SimilarityOperations,
}

impl QueueName {
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueueName::WalletOperations => "wallet-operations",
            QueueName::AnalysisOperations => "analysis-operations",
            QueueName::EnrichmentOperations => "enrichment-operations",
            QueueName::SimilarityOperations => "similarity-operations",
        }
    }
}

impl std::str::FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wallet-operations" => Ok(QueueName::WalletOperations),
            "analysis-operations" => Ok(QueueName::AnalysisOperations),
            "enrichment-operations" => Ok(QueueName::EnrichmentOperations),
            "similarity-operations" => Ok(QueueName::SimilarityOperations),
            other => Err(format!("unknown queue name {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    #[display("sync-wallet")]
    SyncWallet,

    #[display("fetch-balance")]
    FetchBalance,

    #[display("analyze-pnl")]
    AnalyzePnl,

    #[display("analyze-behavior")]
    AnalyzeBehavior,

    #[display("dashboard-wallet-analysis")]
    DashboardWalletAnalysis,

    #[display("enrich-token-balances")]
    EnrichTokenBalances,

    #[display("similarity-flow")]
    SimilarityFlow,
}

impl JobKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobKind::SyncWallet => "sync-wallet",
            JobKind::FetchBalance => "fetch-balance",
            JobKind::AnalyzePnl => "analyze-pnl",
            JobKind::AnalyzeBehavior => "analyze-behavior",
            JobKind::DashboardWalletAnalysis => "dashboard-wallet-analysis",
            JobKind::EnrichTokenBalances => "enrich-token-balances",
            JobKind::SimilarityFlow => "similarity-flow",
        }
    }

    pub const fn queue(&self) -> QueueName {
        match self {
            JobKind::SyncWallet | JobKind::FetchBalance => QueueName::WalletOperations,

            JobKind::AnalyzePnl | JobKind::AnalyzeBehavior | JobKind::DashboardWalletAnalysis => {
                QueueName::AnalysisOperations
            }

            JobKind::EnrichTokenBalances => QueueName::EnrichmentOperations,

            JobKind::SimilarityFlow => QueueName::SimilarityOperations,
        }
    }

    pub const fn default_max_attempts(&self) -> u32 {
        match self {
            JobKind::SyncWallet | JobKind::FetchBalance => 3,
            JobKind::AnalyzePnl | JobKind::AnalyzeBehavior => 3,
            JobKind::DashboardWalletAnalysis => 2,
            JobKind::EnrichTokenBalances => 2,
            JobKind::SimilarityFlow => 1,
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync-wallet" => Ok(JobKind::SyncWallet),
            "fetch-balance" => Ok(JobKind::FetchBalance),
            "analyze-pnl" => Ok(JobKind::AnalyzePnl),
            "analyze-behavior" => Ok(JobKind::AnalyzeBehavior),
            "dashboard-wallet-analysis" => Ok(JobKind::DashboardWalletAnalysis),
            "enrich-token-balances" => Ok(JobKind::EnrichTokenBalances),
            "similarity-flow" => Ok(JobKind::SimilarityFlow),
            other => Err(format!("unknown job kind {other}")),
        }
    }
}

/// Deterministic job identifier: the SHA-256 of the canonical string
/// `{kind}:{wallet_or_flow_key}:{request_id}`, truncated to 16 bytes and hex encoded. Two
/// submissions producing the same canonical string resolve to the same job record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn deterministic(kind: JobKind, key: &str, request_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str());
        hasher.update(":");
        hasher.update(key);
        hasher.update(":");
        hasher.update(request_id);
        let digest = hasher.finalize();

        Self(const_hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Job lifecycle. `Completed` and `Dead` are terminal; `Dead` covers failed attempts beyond
/// retry, non-retriable failures and cancellation, with the cause kept in [Job::error].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    #[display("queued")]
    Queued,

    #[display("active")]
    Active,

    #[display("delayed")]
    Delayed,

    #[display("completed")]
    Completed,

    #[display("dead")]
    Dead,
}

impl JobState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("unknown job state {other}")),
        }
    }
}

/// Persisted job record. Instants are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: u8,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub run_at: Option<i64>,
    pub visible_until: Option<i64>,
    pub owner_token: Option<Uuid>,
    pub parent_id: Option<JobId>,
    pub cancel_requested: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn succeeded(&self) -> bool {
        self.state == JobState::Completed
    }

    /// Deserialize the payload into the given type.
    pub fn payload<P>(&self) -> Result<P, serde_json::Error>
    where
        P: serde::de::DeserializeOwned,
    {
        serde_json::from_value(self.payload.clone())
    }
}

/// Job submission data; see [JobStore::submit].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub queue: QueueName,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub parent_id: Option<JobId>,
}

impl NewJob {
    pub fn new<P>(
        kind: JobKind,
        key: &str,
        request_id: &str,
        payload: &P,
    ) -> Result<Self, serde_json::Error>
    where
        P: Serialize,
    {
        Ok(Self {
            id: JobId::deterministic(kind, key, request_id),
            queue: kind.queue(),
            kind,
            payload: serde_json::to_value(payload)?,
            max_attempts: kind.default_max_attempts(),
            parent_id: None,
        })
    }

    pub fn with_parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Result of reaping expired leases; see [JobStore::reap_expired].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    /// Jobs returned to `queued`.
    pub requeued: u64,

    /// Jobs dead-lettered because their attempts were exhausted or cancellation was requested.
    pub dead: Vec<JobId>,
}

/// Job store abstraction: persistence, deduplication and the atomic state transitions of the job
/// state machine. All instants passed in are unix milliseconds provided by the caller.
#[trait_variant::make(Send)]
pub trait JobStore
where
    Self: Clone + Send + Sync + 'static,
{
    type Error: StdError + Send + Sync + 'static;

    /// Submit a job, idempotent on its deterministic ID: if a job with the same ID exists and is
    /// not dead, the existing record is returned unchanged; a dead record is reset and requeued.
    async fn submit(&self, new_job: NewJob) -> Result<Job, Self::Error>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>, Self::Error>;

    /// Claim the oldest queued job of the queue by atomic state swap to `active`, leasing it to
    /// `owner_token` until `now + lease`. Increments the attempt counter and resets progress.
    async fn claim(
        &self,
        queue: QueueName,
        owner_token: Uuid,
        lease: Duration,
        now: i64,
    ) -> Result<Option<Job>, Self::Error>;

    /// Extend the lease of an active job; returns false if the job is no longer owned.
    async fn extend_lease(
        &self,
        id: &JobId,
        owner_token: Uuid,
        lease: Duration,
        now: i64,
    ) -> Result<bool, Self::Error>;

    /// Record progress for an active owned job; values never decrease within an attempt.
    async fn record_progress(
        &self,
        id: &JobId,
        owner_token: Uuid,
        value: u8,
    ) -> Result<bool, Self::Error>;

    /// Transition an active owned job to `completed` with progress 100 and the given result.
    /// Returns false if the job is no longer owned, in which case nothing is written.
    async fn complete(
        &self,
        id: &JobId,
        owner_token: Uuid,
        result: serde_json::Value,
        now: i64,
    ) -> Result<bool, Self::Error>;

    /// Transition an active owned job to `delayed` (to be requeued at `retry_at`) or, if
    /// `retry_at` is `None`, to `dead`. Returns false if the job is no longer owned.
    async fn fail(
        &self,
        id: &JobId,
        owner_token: Uuid,
        error: &str,
        retry_at: Option<i64>,
        now: i64,
    ) -> Result<bool, Self::Error>;

    /// Request cancellation for the job and all its descendants. Jobs still `queued` or `delayed`
    /// are transitioned to `dead` right away and returned; `active` ones are only flagged and
    /// must be ended by their worker or the reaper.
    async fn request_cancel(&self, id: &JobId, now: i64) -> Result<Vec<JobId>, Self::Error>;

    async fn children(&self, parent_id: &JobId) -> Result<Vec<Job>, Self::Error>;

    /// Requeue `delayed` jobs whose `run_at` has passed.
    async fn promote_delayed(&self, queue: QueueName, now: i64) -> Result<u64, Self::Error>;

    /// Handle `active` jobs whose lease has expired: requeue them, or dead-letter them if their
    /// attempts are exhausted or cancellation was requested.
    async fn reap_expired(&self, queue: QueueName, now: i64) -> Result<ReapOutcome, Self::Error>;
}

/// Worker-level job failure. The queue runtime maps these onto the job state machine: retriable
/// errors are backed off and requeued while attempts remain, everything else dead-letters the
/// job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("lock contention on {0}")]
    LockContention(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient upstream failure")]
    UpstreamTransient(#[source] BoxError),

    #[error("permanent upstream failure")]
    UpstreamPermanent(#[source] BoxError),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("insufficient successful inputs, failed: {}", display_addresses(.failed))]
    InsufficientInputs { failed: Vec<WalletAddress> },

    #[error("data invariant violated: {0}")]
    DataInvariant(String),

    #[error("required child job {0} failed")]
    ChildFailure(JobId),

    #[error("cancelled")]
    Cancelled,

    #[error("storage failure")]
    Storage(#[source] BoxError),
}

impl JobError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            JobError::LockContention(_)
                | JobError::Timeout(_)
                | JobError::UpstreamTransient(_)
                | JobError::Storage(_)
        )
    }

    pub fn storage<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        JobError::Storage(Box::new(error))
    }
}

fn display_addresses(addresses: &[WalletAddress]) -> String {
    addresses
        .iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `sync-wallet` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncWalletJob {
    pub wallet_address: WalletAddress,
    pub options: SyncOptions,
    pub request_id: String,
}

impl SyncWalletJob {
    pub fn to_new_job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::new(
            JobKind::SyncWallet,
            self.wallet_address.as_str(),
            &self.request_id,
            self,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub fetch_all: bool,
    pub skip_api: bool,
    pub fetch_older: bool,
    pub max_signatures: usize,
    pub smart_fetch: bool,
    pub force_refresh: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            fetch_all: false,
            skip_api: false,
            fetch_older: false,
            max_signatures: 200,
            smart_fetch: false,
            force_refresh: false,
        }
    }
}

/// `sync-wallet` result payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub fetched: u64,
    pub local_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    Synced,
    AlreadyCurrent,
    Skipped,
}

/// `fetch-balance` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchBalanceJob {
    pub wallet_address: WalletAddress,
    pub request_id: String,
}

impl FetchBalanceJob {
    pub fn to_new_job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::new(
            JobKind::FetchBalance,
            self.wallet_address.as_str(),
            &self.request_id,
            self,
        )
    }
}

/// `fetch-balance` result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceReport {
    pub wallet_address: WalletAddress,
    pub balances: Vec<TokenBalance>,
}

/// `analyze-pnl` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzePnlJob {
    pub wallet_address: WalletAddress,
    #[serde(default)]
    pub force_refresh: bool,
    pub request_id: String,
}

impl AnalyzePnlJob {
    pub fn to_new_job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::new(
            JobKind::AnalyzePnl,
            self.wallet_address.as_str(),
            &self.request_id,
            self,
        )
    }
}

/// `analyze-behavior` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeBehaviorJob {
    pub wallet_address: WalletAddress,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub exclude_mints: Vec<TokenAddress>,
    pub request_id: String,
}

impl AnalyzeBehaviorJob {
    pub fn to_new_job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::new(
            JobKind::AnalyzeBehavior,
            self.wallet_address.as_str(),
            &self.request_id,
            self,
        )
    }
}

/// `dashboard-wallet-analysis` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardAnalysisJob {
    pub wallet_address: WalletAddress,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub enrich_metadata: bool,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Accepted for interface compatibility with flow jobs; unused by the single-wallet flow.
    #[serde(default)]
    pub failure_threshold: Option<f64>,
    pub request_id: String,
}

impl DashboardAnalysisJob {
    pub fn to_new_job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::new(
            JobKind::DashboardWalletAnalysis,
            self.wallet_address.as_str(),
            &self.request_id,
            self,
        )
    }
}

/// `enrich-token-balances` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichTokenBalancesJob {
    pub wallet_address: WalletAddress,
    pub token_addresses: Vec<TokenAddress>,
    pub request_id: String,
}

impl EnrichTokenBalancesJob {
    pub fn to_new_job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::new(
            JobKind::EnrichTokenBalances,
            self.wallet_address.as_str(),
            &self.request_id,
            self,
        )
    }
}

/// `similarity-flow` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityFlowJob {
    pub wallet_addresses: Vec<WalletAddress>,
    pub vector_type: VectorType,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    pub failure_threshold: f64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub request_id: String,
}

impl SimilarityFlowJob {
    /// The flow key is the sorted, deduplicated list of wallet addresses, so the same set of
    /// wallets submitted in any order resolves to the same flow.
    pub fn flow_key(&self) -> String {
        let mut addresses = self
            .wallet_addresses
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>();
        addresses.sort_unstable();
        addresses.dedup();
        addresses.join(",")
    }

    pub fn to_new_job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::new(
            JobKind::SimilarityFlow,
            &self.flow_key(),
            &self.request_id,
            self,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VectorType {
    /// Per-token net SOL deployed.
    Capital,

    /// Per-token trade counts.
    Activity,
}
