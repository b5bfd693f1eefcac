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

use analyzer_common::{
    domain::{JobError, TokenBalance, TransactionRecord, WalletAddress},
    error::BoxError,
};
use futures::Stream;
use thiserror::Error;

/// Upstream provider abstraction: a paged iterator over a wallet's transaction history plus
/// point lookups for token balances.
///
/// Pages are ordered newest first by the stable total order `(timestamp desc, signature desc)`,
/// with the signature compared lexicographically. The stream honors all bounds of the
/// [PageRequest] and ends when the history or a bound is exhausted.
#[trait_variant::make(Send)]
pub trait Provider
where
    Self: Clone + Send + Sync + 'static,
{
    fn transaction_pages(
        &self,
        address: WalletAddress,
        request: PageRequest,
    ) -> impl Stream<Item = Result<Vec<TransactionRecord>, ProviderError>> + Send;

    async fn token_balances(
        &self,
        address: &WalletAddress,
    ) -> Result<Vec<TokenBalance>, ProviderError>;
}

/// Bounds for one run of the paged iterator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub page_size: usize,

    /// Hard upper bound on emitted transactions.
    pub max_signatures: Option<usize>,

    /// Stop (exclusive) when this signature is reached.
    pub stop_at_signature: Option<String>,

    /// Stop once timestamps at or before this are crossed; used together with
    /// `stop_at_signature` for incremental fetches.
    pub newest_ts: Option<i64>,

    /// Only yield transactions strictly older than this, newest first within that window.
    pub until_older_than_ts: Option<i64>,
}

/// Provider failure, classified for retriability at the source: rate limits, timeouts and server
/// errors are transient; invalid requests are permanent.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider failure")]
    Transient(#[source] BoxError),

    #[error("permanent provider failure")]
    Permanent(#[source] BoxError),
}

impl From<ProviderError> for JobError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Transient(source) => JobError::UpstreamTransient(source),
            ProviderError::Permanent(source) => JobError::UpstreamPermanent(source),
        }
    }
}
