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

use crate::domain::{PageRequest, Provider, ProviderError};
use analyzer_common::domain::{
    FlowDirection, TokenBalance, TransactionRecord, WalletAddress,
};
use async_stream::stream;
use futures::Stream;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// HTTP adapter for an indexing provider exposing a wallet's transaction history newest first
/// by `(timestamp desc, signature desc)`, paged with a `before` signature cursor.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    /// Create a new provider client with the given configuration.
    pub fn new(config: Config) -> Result<Self, Error> {
        let Config {
            base_url,
            api_key,
            request_timeout,
        } = config;

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(Error::BuildClient)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    async fn fetch_page(
        &self,
        address: &WalletAddress,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WireTransaction>, ProviderError> {
        let url = format!("{}/v1/wallets/{address}/transactions", self.base_url);

        let mut request = self
            .client
            .get(url)
            .header("x-api-key", &self.api_key)
            .query(&[("limit", limit.to_string())]);
        if let Some(before) = before {
            request = request.query(&[("before", before)]);
        }

        let response = request.send().await.map_err(transient)?;
        let response = classify_status(response)?;

        response.json::<Vec<WireTransaction>>().await.map_err(transient)
    }
}

impl Provider for HttpProvider {
    fn transaction_pages(
        &self,
        address: WalletAddress,
        request: PageRequest,
    ) -> impl Stream<Item = Result<Vec<TransactionRecord>, ProviderError>> + Send {
        let provider = self.clone();
        let page_size = request.page_size.max(1);
        let cap = request.max_signatures.unwrap_or(usize::MAX);

        stream! {
            let mut before: Option<String> = None;
            let mut emitted = 0_usize;

            'pages: loop {
                let page = match provider.fetch_page(&address, before.as_deref(), page_size).await {
                    Ok(page) => page,
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                };

                let last_page = page.len() < page_size;
                let Some(last) = page.last() else {
                    break;
                };
                before = Some(last.signature.clone());

                let mut records = Vec::with_capacity(page.len());
                for transaction in page {
                    // Incremental stop: the previously newest transaction is reached.
                    if request.stop_at_signature.as_deref() == Some(transaction.signature.as_str())
                        || request
                            .newest_ts
                            .is_some_and(|newest| transaction.timestamp <= newest)
                    {
                        if !records.is_empty() {
                            yield Ok(records);
                        }
                        break 'pages;
                    }

                    // Backfill window: skip forward to strictly older transactions.
                    if request
                        .until_older_than_ts
                        .is_some_and(|until| transaction.timestamp >= until)
                    {
                        continue;
                    }

                    records.push(transaction.into_record(&address));
                    emitted += 1;

                    if emitted >= cap {
                        yield Ok(records);
                        break 'pages;
                    }
                }

                if !records.is_empty() {
                    yield Ok(records);
                }

                if last_page {
                    break;
                }
            }

            debug!(address:%, emitted; "transaction pages drained");
        }
    }

    async fn token_balances(
        &self,
        address: &WalletAddress,
    ) -> Result<Vec<TokenBalance>, ProviderError> {
        let url = format!("{}/v1/wallets/{address}/balances", self.base_url);

        let response = self
            .client
            .get(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(transient)?;
        let response = classify_status(response)?;

        let balances = response
            .json::<Vec<WireBalance>>()
            .await
            .map_err(transient)?;

        Ok(balances
            .into_iter()
            .map(|balance| TokenBalance {
                token_address: balance.token_address,
                amount: balance.amount,
            })
            .collect())
    }
}

/// Rate limits, server errors and transport failures are transient; other client errors are
/// permanent.
fn classify_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let error = response.error_for_status().expect_err("status is an error");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(ProviderError::Transient(Box::new(error)))
    } else {
        Err(ProviderError::Permanent(Box::new(error)))
    }
}

fn transient(error: reqwest::Error) -> ProviderError {
    ProviderError::Transient(Box::new(error))
}

#[derive(Debug, Deserialize)]
struct WireTransaction {
    signature: String,
    timestamp: i64,
    token_address: analyzer_common::domain::TokenAddress,
    direction: FlowDirection,
    token_amount: f64,
    sol_amount: f64,
}

impl WireTransaction {
    fn into_record(self, address: &WalletAddress) -> TransactionRecord {
        TransactionRecord {
            wallet_address: address.clone(),
            signature: self.signature,
            timestamp: self.timestamp,
            token_address: self.token_address,
            direction: self.direction,
            token_amount: self.token_amount,
            sol_amount: self.sol_amount,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireBalance {
    token_address: analyzer_common::domain::TokenAddress,
    amount: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot build HTTP client")]
    BuildClient(#[source] reqwest::Error),
}

/// Configuration settings for [HttpProvider].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub base_url: String,
    pub api_key: String,

    #[serde(with = "humantime_serde", default = "request_timeout_default")]
    pub request_timeout: Duration,
}

fn request_timeout_default() -> Duration {
    Duration::from_secs(30)
}
