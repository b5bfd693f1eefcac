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
    PageRequest, Provider,
    storage::{NewestMark, Storage},
};
use analyzer_common::domain::{JobError, SyncOptions, SyncReport, SyncStatus, WalletAddress};
use fastrace::trace;
use futures::TryStreamExt;
use log::{debug, info};
use std::pin::pin;

/// Bring the wallet's local transaction store up to date per the given options. The caller must
/// hold the wallet's sync lock; `now` is the current unix time in seconds.
#[trace]
pub async fn sync_wallet<P, S>(
    address: &WalletAddress,
    options: &SyncOptions,
    provider: &P,
    storage: &S,
    now: i64,
) -> Result<SyncReport, JobError>
where
    P: Provider,
    S: Storage,
{
    let wallet = storage
        .ensure_wallet(address)
        .await
        .map_err(JobError::storage)?;
    wallet
        .verify_watermarks()
        .map_err(|error| JobError::DataInvariant(error.to_string()))?;

    if options.skip_api {
        let local_count = storage
            .count_transactions(address)
            .await
            .map_err(JobError::storage)?;

        return Ok(SyncReport {
            status: SyncStatus::Skipped,
            fetched: 0,
            local_count,
        });
    }

    if wallet.sync_current(now) && !options.force_refresh {
        let local_count = storage
            .count_transactions(address)
            .await
            .map_err(JobError::storage)?;
        debug!(address:%; "wallet already current, skipping sync");

        return Ok(SyncReport {
            status: SyncStatus::AlreadyCurrent,
            fetched: 0,
            local_count,
        });
    }

    let report = if options.smart_fetch {
        smart_fetch(address, options, provider, storage, now).await?
    } else {
        standard_fetch(address, options, provider, storage, now).await?
    };

    info!(
        address:%,
        status:? = report.status,
        fetched = report.fetched,
        local_count = report.local_count;
        "wallet synced"
    );

    Ok(report)
}

/// Full fetch up to the signature cap for new wallets and `fetch_older` runs, incremental fetch
/// down to the previously newest signature otherwise.
async fn standard_fetch<P, S>(
    address: &WalletAddress,
    options: &SyncOptions,
    provider: &P,
    storage: &S,
    now: i64,
) -> Result<SyncReport, JobError>
where
    P: Provider,
    S: Storage,
{
    let wallet = storage
        .ensure_wallet(address)
        .await
        .map_err(JobError::storage)?;

    let cap = (!options.fetch_all).then_some(options.max_signatures);
    let initial = wallet.newest_processed_signature.is_none();

    let request = if initial || options.fetch_older {
        PageRequest {
            page_size: options.batch_size,
            max_signatures: cap,
            ..Default::default()
        }
    } else {
        PageRequest {
            page_size: options.batch_size,
            max_signatures: cap,
            stop_at_signature: wallet.newest_processed_signature.clone(),
            newest_ts: wallet.newest_processed_timestamp,
            ..Default::default()
        }
    };

    let summary = run_phase(address, provider, storage, request).await?;
    storage
        .update_watermarks(address, summary.newest.as_ref(), summary.oldest_ts, now)
        .await
        .map_err(JobError::storage)?;

    let local_count = storage
        .count_transactions(address)
        .await
        .map_err(JobError::storage)?;

    Ok(SyncReport {
        status: SyncStatus::Synced,
        fetched: summary.fetched,
        local_count,
    })
}

/// Two-phase fetch targeting `max_signatures` locally stored transactions: phase A tops up newer
/// history, phase B backfills older history for the remainder, skipped when phase A already got
/// the store past three quarters of the target.
async fn smart_fetch<P, S>(
    address: &WalletAddress,
    options: &SyncOptions,
    provider: &P,
    storage: &S,
    now: i64,
) -> Result<SyncReport, JobError>
where
    P: Provider,
    S: Storage,
{
    let target = options.max_signatures as u64;

    let initial_count = storage
        .count_transactions(address)
        .await
        .map_err(JobError::storage)?;
    if initial_count >= target {
        return Ok(SyncReport {
            status: SyncStatus::AlreadyCurrent,
            fetched: 0,
            local_count: initial_count,
        });
    }

    let wallet = storage
        .ensure_wallet(address)
        .await
        .map_err(JobError::storage)?;

    // Phase A: newer history, stopping at the previous newest signature.
    let request = PageRequest {
        page_size: options.batch_size,
        max_signatures: Some(options.max_signatures),
        stop_at_signature: wallet.newest_processed_signature.clone(),
        newest_ts: wallet.newest_processed_timestamp,
        ..Default::default()
    };
    let newer = run_phase(address, provider, storage, request).await?;
    storage
        .update_watermarks(address, newer.newest.as_ref(), newer.oldest_ts, now)
        .await
        .map_err(JobError::storage)?;

    let count = storage
        .count_transactions(address)
        .await
        .map_err(JobError::storage)?;
    if count > target * 3 / 4 {
        debug!(address:%, count; "phase A sufficient, skipping backfill");

        return Ok(SyncReport {
            status: SyncStatus::Synced,
            fetched: newer.fetched,
            local_count: count,
        });
    }

    // Phase B: backfill older history for the remainder.
    let need = (target - count) as usize;
    let wallet = storage
        .ensure_wallet(address)
        .await
        .map_err(JobError::storage)?;

    let request = PageRequest {
        page_size: options.batch_size,
        max_signatures: Some(need),
        until_older_than_ts: wallet.oldest_processed_timestamp,
        ..Default::default()
    };
    let older = run_phase(address, provider, storage, request).await?;
    storage
        .update_watermarks(address, older.newest.as_ref(), older.oldest_ts, now)
        .await
        .map_err(JobError::storage)?;

    let local_count = storage
        .count_transactions(address)
        .await
        .map_err(JobError::storage)?;

    Ok(SyncReport {
        status: SyncStatus::Synced,
        fetched: newer.fetched + older.fetched,
        local_count,
    })
}

#[derive(Debug, Default)]
struct PhaseSummary {
    fetched: u64,
    newest: Option<NewestMark>,
    oldest_ts: Option<i64>,
}

/// Drain one run of the paged iterator, persisting every page. Pages are newest first, so the
/// first transaction seen is the phase's newest and the last one its oldest.
async fn run_phase<P, S>(
    address: &WalletAddress,
    provider: &P,
    storage: &S,
    request: PageRequest,
) -> Result<PhaseSummary, JobError>
where
    P: Provider,
    S: Storage,
{
    let pages = provider.transaction_pages(address.clone(), request);
    let mut pages = pin!(pages);
    let mut summary = PhaseSummary::default();

    while let Some(page) = pages.try_next().await? {
        let Some(first) = page.first() else {
            continue;
        };

        if summary.newest.is_none() {
            summary.newest = Some(NewestMark {
                signature: first.signature.clone(),
                timestamp: first.timestamp,
            });
        }
        summary.oldest_ts = page.last().map(|record| record.timestamp);

        summary.fetched += storage
            .save_transactions(&page)
            .await
            .map_err(JobError::storage)?;
    }

    Ok(summary)
}
