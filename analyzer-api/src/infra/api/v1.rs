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

use crate::infra::api::AppState;
use analyzer_common::domain::{
    AnalyzeBehaviorJob, AnalyzePnlJob, DashboardAnalysisJob, FetchBalanceJob, Job, JobCompleted,
    JobFailed, JobId, JobProgressed, JobStore, LockKey, LockStore, QueueName, SimilarityFlowJob,
    Subscriber, SyncOptions, SyncWalletJob, TimeRange, VectorType, WalletAddress, WalletState,
    WalletStatus, classify_wallet, unix_seconds,
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post},
};
use fastrace::trace;
use futures::{Stream, StreamExt, stream};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, future::ready, time::Duration};

pub fn make_app<SB>() -> Router<AppState<SB>>
where
    SB: Subscriber,
{
    Router::new()
        .route("/jobs/dashboard-analysis", post(submit_dashboard::<SB>))
        .route("/jobs/pnl", post(submit_pnl::<SB>))
        .route("/jobs/behavior", post(submit_behavior::<SB>))
        .route("/jobs/sync", post(submit_sync::<SB>))
        .route("/jobs/balance", post(submit_balance::<SB>))
        .route("/jobs/similarity", post(submit_similarity::<SB>))
        .route("/jobs/{id}", get(get_job::<SB>))
        .route("/jobs/{id}/events", get(job_events::<SB>))
        .route("/queues/{queue}/events", get(queue_events::<SB>))
        .route("/wallets/status", post(wallet_status::<SB>))
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("resource is locked: {0}")]
    Locked(String),

    #[error("not found")]
    NotFound,

    #[error("internal error")]
    Internal(#[source] sqlx::Error),
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        ApiError::Internal(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Locked(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(error) => {
                warn!(error:% = error; "internal API error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    job_id: String,
    state: String,
}

fn submit_response(job: Job) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id.as_str().to_owned(),
            state: job.state.as_str().to_owned(),
        }),
    )
        .into_response()
}

fn parse_address(address: &str) -> Result<WalletAddress, ApiError> {
    address
        .parse()
        .map_err(|error: analyzer_common::domain::InvalidAddress| {
            ApiError::Validation(error.to_string())
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DashboardAnalysisRequest {
    wallet_address: String,

    #[serde(default)]
    force_refresh: bool,

    #[serde(default)]
    enrich_metadata: bool,

    #[serde(default = "dashboard_timeout_default")]
    timeout_secs: u64,

    request_id: String,
}

fn dashboard_timeout_default() -> u64 {
    900
}

async fn submit_dashboard<SB>(
    State(state): State<AppState<SB>>,
    Json(request): Json<DashboardAnalysisRequest>,
) -> Result<Response, ApiError>
where
    SB: Subscriber,
{
    let wallet_address = parse_address(&request.wallet_address)?;

    // Contention observable at submission time answers 503 without enqueueing.
    let key = LockKey::dashboard_analysis(&wallet_address);
    if state.lock_store.locked(&key).await? {
        return Err(ApiError::Locked(key.as_str().to_owned()));
    }

    let payload = DashboardAnalysisJob {
        wallet_address,
        force_refresh: request.force_refresh,
        enrich_metadata: request.enrich_metadata,
        timeout: Duration::from_secs(request.timeout_secs),
        failure_threshold: None,
        request_id: request.request_id,
    };
    let new_job = payload
        .to_new_job()
        .map_err(|error| ApiError::Validation(error.to_string()))?;

    Ok(submit_response(state.job_store.submit(new_job).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PnlRequest {
    wallet_address: String,

    #[serde(default)]
    force_refresh: bool,

    request_id: String,
}

async fn submit_pnl<SB>(
    State(state): State<AppState<SB>>,
    Json(request): Json<PnlRequest>,
) -> Result<Response, ApiError>
where
    SB: Subscriber,
{
    let payload = AnalyzePnlJob {
        wallet_address: parse_address(&request.wallet_address)?,
        force_refresh: request.force_refresh,
        request_id: request.request_id,
    };
    let new_job = payload
        .to_new_job()
        .map_err(|error| ApiError::Validation(error.to_string()))?;

    Ok(submit_response(state.job_store.submit(new_job).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BehaviorRequest {
    wallet_address: String,

    #[serde(default)]
    time_range: Option<TimeRange>,

    #[serde(default)]
    exclude_mints: Vec<String>,

    request_id: String,
}

async fn submit_behavior<SB>(
    State(state): State<AppState<SB>>,
    Json(request): Json<BehaviorRequest>,
) -> Result<Response, ApiError>
where
    SB: Subscriber,
{
    let exclude_mints = request
        .exclude_mints
        .iter()
        .map(|mint| {
            mint.parse()
                .map_err(|error: analyzer_common::domain::InvalidAddress| {
                    ApiError::Validation(error.to_string())
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let payload = AnalyzeBehaviorJob {
        wallet_address: parse_address(&request.wallet_address)?,
        time_range: request.time_range,
        exclude_mints,
        request_id: request.request_id,
    };
    let new_job = payload
        .to_new_job()
        .map_err(|error| ApiError::Validation(error.to_string()))?;

    Ok(submit_response(state.job_store.submit(new_job).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    wallet_address: String,

    #[serde(default)]
    options: SyncOptions,

    request_id: String,
}

async fn submit_sync<SB>(
    State(state): State<AppState<SB>>,
    Json(request): Json<SyncRequest>,
) -> Result<Response, ApiError>
where
    SB: Subscriber,
{
    let payload = SyncWalletJob {
        wallet_address: parse_address(&request.wallet_address)?,
        options: request.options,
        request_id: request.request_id,
    };
    let new_job = payload
        .to_new_job()
        .map_err(|error| ApiError::Validation(error.to_string()))?;

    Ok(submit_response(state.job_store.submit(new_job).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceRequest {
    wallet_address: String,
    request_id: String,
}

async fn submit_balance<SB>(
    State(state): State<AppState<SB>>,
    Json(request): Json<BalanceRequest>,
) -> Result<Response, ApiError>
where
    SB: Subscriber,
{
    let payload = FetchBalanceJob {
        wallet_address: parse_address(&request.wallet_address)?,
        request_id: request.request_id,
    };
    let new_job = payload
        .to_new_job()
        .map_err(|error| ApiError::Validation(error.to_string()))?;

    Ok(submit_response(state.job_store.submit(new_job).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimilarityRequest {
    wallet_addresses: Vec<String>,
    vector_type: VectorType,

    #[serde(default)]
    time_range: Option<TimeRange>,

    failure_threshold: f64,

    #[serde(default = "similarity_timeout_default")]
    timeout_secs: u64,

    request_id: String,
}

fn similarity_timeout_default() -> u64 {
    1_800
}

async fn submit_similarity<SB>(
    State(state): State<AppState<SB>>,
    Json(request): Json<SimilarityRequest>,
) -> Result<Response, ApiError>
where
    SB: Subscriber,
{
    let mut wallet_addresses = request
        .wallet_addresses
        .iter()
        .map(|address| parse_address(address))
        .collect::<Result<Vec<_>, _>>()?;
    wallet_addresses.sort_unstable();
    wallet_addresses.dedup();

    if wallet_addresses.len() < 2 {
        return Err(ApiError::Validation(
            "similarity needs at least 2 distinct wallet addresses".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&request.failure_threshold) {
        return Err(ApiError::Validation(format!(
            "failure threshold {} outside [0, 1]",
            request.failure_threshold
        )));
    }

    let payload = SimilarityFlowJob {
        wallet_addresses,
        vector_type: request.vector_type,
        time_range: request.time_range,
        failure_threshold: request.failure_threshold,
        timeout: Duration::from_secs(request.timeout_secs),
        request_id: request.request_id,
    };
    let new_job = payload
        .to_new_job()
        .map_err(|error| ApiError::Validation(error.to_string()))?;

    Ok(submit_response(state.job_store.submit(new_job).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobDto {
    id: String,
    queue: String,
    kind: String,
    state: String,
    progress: u8,
    attempts: u32,
    max_attempts: u32,
    created_at: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,

    children_ids: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[trace]
async fn get_job<SB>(
    State(state): State<AppState<SB>>,
    Path(id): Path<String>,
) -> Result<Json<JobDto>, ApiError>
where
    SB: Subscriber,
{
    let id = JobId::from(id);
    let job = state.job_store.get(&id).await?.ok_or(ApiError::NotFound)?;
    let children_ids = state
        .job_store
        .children(&id)
        .await?
        .into_iter()
        .map(|child| child.id.as_str().to_owned())
        .collect();

    Ok(Json(JobDto {
        id: job.id.as_str().to_owned(),
        queue: job.queue.as_str().to_owned(),
        kind: job.kind.as_str().to_owned(),
        state: job.state.as_str().to_owned(),
        progress: job.progress,
        attempts: job.attempts,
        max_attempts: job.max_attempts,
        created_at: job.created_at,
        started_at: job.started_at,
        finished_at: job.finished_at,
        parent_id: job.parent_id.map(|id| id.as_str().to_owned()),
        children_ids,
        result: job.result,
        error: job.error,
    }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressEventDto {
    job_id: String,
    queue: String,
    kind: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,

    timestamp: i64,
}

impl From<JobProgressed> for ProgressEventDto {
    fn from(event: JobProgressed) -> Self {
        Self {
            job_id: event.job_id.as_str().to_owned(),
            queue: event.queue.as_str().to_owned(),
            kind: "progress",
            value: Some(event.value),
            payload: None,
            error: None,
            timestamp: event.timestamp,
        }
    }
}

impl From<JobCompleted> for ProgressEventDto {
    fn from(event: JobCompleted) -> Self {
        Self {
            job_id: event.job_id.as_str().to_owned(),
            queue: event.queue.as_str().to_owned(),
            kind: "completed",
            value: Some(100),
            payload: Some(event.result),
            error: None,
            timestamp: event.timestamp,
        }
    }
}

impl From<JobFailed> for ProgressEventDto {
    fn from(event: JobFailed) -> Self {
        Self {
            job_id: event.job_id.as_str().to_owned(),
            queue: event.queue.as_str().to_owned(),
            kind: "failed",
            value: None,
            payload: None,
            error: Some(event.error),
            timestamp: event.timestamp,
        }
    }
}

/// All job events of the subscriber, merged across the three topics. Decode failures are
/// dropped; delivery to HTTP clients stays at-least-once overall.
fn all_events<SB>(subscriber: SB) -> impl Stream<Item = ProgressEventDto> + Send + use<SB>
where
    SB: Subscriber,
{
    let progressed = subscriber
        .clone()
        .subscribe::<JobProgressed>()
        .filter_map(|event| ready(event.ok()))
        .map(ProgressEventDto::from);
    let completed = subscriber
        .clone()
        .subscribe::<JobCompleted>()
        .filter_map(|event| ready(event.ok()))
        .map(ProgressEventDto::from);
    let failed = subscriber
        .subscribe::<JobFailed>()
        .filter_map(|event| ready(event.ok()))
        .map(ProgressEventDto::from);

    stream::select(progressed, stream::select(completed, failed))
}

fn to_sse(
    events: impl Stream<Item = ProgressEventDto> + Send,
) -> impl Stream<Item = Result<SseEvent, Infallible>> + Send {
    events.filter_map(|event| {
        ready(match SseEvent::default().json_data(&event) {
            Ok(event) => Some(Ok(event)),
            Err(error) => {
                warn!(error:% = error; "cannot serialize SSE event");
                None
            }
        })
    })
}

async fn job_events<SB>(
    State(state): State<AppState<SB>>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>>
where
    SB: Subscriber,
{
    let events =
        all_events(state.subscriber.clone()).filter(move |event| ready(event.job_id == id));

    Sse::new(to_sse(events)).keep_alive(KeepAlive::default())
}

async fn queue_events<SB>(
    State(state): State<AppState<SB>>,
    Path(queue): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError>
where
    SB: Subscriber,
{
    let queue = queue
        .parse::<QueueName>()
        .map_err(ApiError::Validation)?;
    let events = all_events(state.subscriber.clone())
        .filter(move |event| ready(event.queue == queue.as_str()));

    Ok(Sse::new(to_sse(events)).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletStatusRequest {
    addresses: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WalletStatusResponse {
    statuses: Vec<WalletStatusEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WalletStatusEntry {
    wallet_address: String,
    status: WalletStatus,
}

#[trace]
async fn wallet_status<SB>(
    State(state): State<AppState<SB>>,
    Json(request): Json<WalletStatusRequest>,
) -> Result<Json<WalletStatusResponse>, ApiError>
where
    SB: Subscriber,
{
    let now = unix_seconds();
    let mut statuses = Vec::with_capacity(request.addresses.len());

    for address in &request.addresses {
        let wallet_address = parse_address(address)?;

        let row = sqlx::query_as::<_, (Option<i64>,)>(
            "SELECT last_successful_fetch_at FROM wallets WHERE address = $1",
        )
        .bind(wallet_address.as_str())
        .fetch_optional(&*state.pool)
        .await?;

        let wallet = row.map(|(last_successful_fetch_at,)| WalletState {
            last_successful_fetch_at,
            ..WalletState::new(wallet_address.clone())
        });

        statuses.push(WalletStatusEntry {
            wallet_address: wallet_address.into(),
            status: classify_wallet(wallet.as_ref(), now),
        });
    }

    Ok(Json(WalletStatusResponse { statuses }))
}

#[cfg(all(test, feature = "standalone", not(feature = "cloud")))]
mod tests {
    use crate::infra::api::{AppState, make_app};
    use analyzer_common::{
        domain::{JobState, LockKey, LockStore},
        infra::{
            job_store::SqlJobStore,
            lock_store::SqlLockStore,
            migrations,
            pool::{Pool, sqlite},
            pub_sub::in_mem::InMemPubSub,
        },
    };
    use anyhow::Context;
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode, header},
    };
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    const ADDR: &str = "4Nd1mYvDgHcwXvLEvFrMvGdL7ZjPQQsjLsg8jW3hQyi1";

    async fn app() -> anyhow::Result<(Router, AppState<InMemPubSub>)> {
        let pool = Pool::new(sqlite::Config {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            busy_timeout: Duration::from_secs(5),
        })
        .await
        .context("create SQLite pool")?;
        migrations::run(&pool).await.context("run migrations")?;

        let state = AppState {
            job_store: SqlJobStore::new(pool.clone()),
            lock_store: SqlLockStore::new(pool.clone()),
            pool,
            subscriber: InMemPubSub::default(),
        };

        Ok((make_app(state.clone(), 64 * 1_024), state))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request can be built")
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_024 * 1_024)
            .await
            .expect("body can be read");
        serde_json::from_slice(&bytes).expect("body is JSON")
    }

    #[tokio::test]
    async fn test_submit_dashboard_and_get_job() -> anyhow::Result<()> {
        let (app, _state) = app().await?;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/jobs/dashboard-analysis",
                serde_json::json!({
                    "walletAddress": ADDR,
                    "enrichMetadata": true,
                    "requestId": "r1",
                }),
            ))
            .await
            .expect("request is handled");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = response_json(response).await;
        let job_id = body["jobId"].as_str().expect("job id present").to_owned();
        assert_eq!(body["state"], "queued");

        // Idempotent resubmission yields the same job.
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/jobs/dashboard-analysis",
                serde_json::json!({
                    "walletAddress": ADDR,
                    "enrichMetadata": true,
                    "requestId": "r1",
                }),
            ))
            .await
            .expect("request is handled");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = response_json(response).await;
        assert_eq!(body["jobId"], job_id.as_str());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/jobs/{job_id}"))
                    .body(Body::empty())
                    .expect("request can be built"),
            )
            .await
            .expect("request is handled");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["id"], job_id.as_str());
        assert_eq!(body["state"], JobState::Queued.as_str());
        assert_eq!(body["progress"], 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_address() -> anyhow::Result<()> {
        let (app, _state) = app().await?;

        let response = app
            .oneshot(post_json(
                "/api/v1/jobs/dashboard-analysis",
                serde_json::json!({
                    "walletAddress": "not-base58!",
                    "requestId": "r1",
                }),
            ))
            .await
            .expect("request is handled");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        Ok(())
    }

    #[tokio::test]
    async fn test_submit_dashboard_locked_answers_503() -> anyhow::Result<()> {
        let (app, state) = app().await?;

        let address = ADDR.parse().expect("valid address");
        assert!(
            state
                .lock_store
                .acquire(
                    &LockKey::dashboard_analysis(&address),
                    Uuid::new_v4(),
                    Duration::from_secs(60),
                )
                .await?
        );

        let response = app
            .oneshot(post_json(
                "/api/v1/jobs/dashboard-analysis",
                serde_json::json!({
                    "walletAddress": ADDR,
                    "requestId": "r1",
                }),
            ))
            .await
            .expect("request is handled");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        Ok(())
    }

    #[tokio::test]
    async fn test_submit_similarity_validation() -> anyhow::Result<()> {
        let (app, _state) = app().await?;

        // A single wallet, even repeated, is rejected.
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/jobs/similarity",
                serde_json::json!({
                    "walletAddresses": [ADDR, ADDR],
                    "vectorType": "capital",
                    "failureThreshold": 0.8,
                    "requestId": "r4",
                }),
            ))
            .await
            .expect("request is handled");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json(
                "/api/v1/jobs/similarity",
                serde_json::json!({
                    "walletAddresses": [
                        ADDR,
                        "2x3N9tHoNvUZwFQpgb3T1V6DcLYtT3HZVEs2GeE7wZq9",
                    ],
                    "vectorType": "capital",
                    "failureThreshold": 0.8,
                    "requestId": "r4",
                }),
            ))
            .await
            .expect("request is handled");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        Ok(())
    }

    #[tokio::test]
    async fn test_wallet_status() -> anyhow::Result<()> {
        let (app, state) = app().await?;

        let now = analyzer_common::domain::unix_seconds();
        sqlx::query("INSERT INTO wallets (address, last_successful_fetch_at) VALUES ($1, $2)")
            .bind(ADDR)
            .bind(now - 60)
            .execute(&*state.pool)
            .await?;

        let response = app
            .oneshot(post_json(
                "/api/v1/wallets/status",
                serde_json::json!({
                    "addresses": [
                        ADDR,
                        "2x3N9tHoNvUZwFQpgb3T1V6DcLYtT3HZVEs2GeE7wZq9",
                    ],
                }),
            ))
            .await
            .expect("request is handled");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_json(response).await;
        assert_eq!(body["statuses"][0]["walletAddress"], ADDR);
        assert_eq!(body["statuses"][0]["status"], "FRESH");
        assert_eq!(body["statuses"][1]["status"], "MISSING");

        Ok(())
    }
}
