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

//! Mock provider and storage shared by the tests of this crate.

use crate::domain::{
    PageRequest, Provider, ProviderError,
    storage::{NewestMark, Storage},
};
use analyzer_common::domain::{
    FlowDirection, TokenBalance, TransactionRecord, WalletAddress, WalletState,
};
use futures::{Stream, stream};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

pub const ADDR: &str = "4Nd1mYvDgHcwXvLEvFrMvGdL7ZjPQQsjLsg8jW3hQyi1";
pub const MINT: &str = "So11111111111111111111111111111111111111112";

pub fn address() -> WalletAddress {
    ADDR.parse().expect("valid address")
}

/// `count` records with timestamps descending from `newest_ts`, one second apart.
pub fn records(count: usize, newest_ts: i64, sig_prefix: &str) -> Vec<TransactionRecord> {
    (0..count)
        .map(|i| TransactionRecord {
            wallet_address: address(),
            signature: format!("{sig_prefix}{i:04}"),
            timestamp: newest_ts - i as i64,
            token_address: MINT.parse().expect("valid mint"),
            direction: FlowDirection::In,
            token_amount: 10.0,
            sol_amount: 0.5,
        })
        .collect()
}

/// Serves `newer` pages for plain requests and `older` pages for backfill requests, applying the
/// request's signature cap. Every request is recorded for assertions.
#[derive(Clone, Default)]
pub struct MockProvider {
    pub newer: Arc<Vec<Vec<TransactionRecord>>>,
    pub older: Arc<Vec<Vec<TransactionRecord>>>,
    pub balances: Arc<Vec<TokenBalance>>,
    pub requests: Arc<Mutex<Vec<PageRequest>>>,
}

impl Provider for MockProvider {
    fn transaction_pages(
        &self,
        _address: WalletAddress,
        request: PageRequest,
    ) -> impl Stream<Item = Result<Vec<TransactionRecord>, ProviderError>> + Send {
        let pages = if request.until_older_than_ts.is_some() {
            self.older.as_ref().clone()
        } else {
            self.newer.as_ref().clone()
        };

        let cap = request.max_signatures.unwrap_or(usize::MAX);
        self.requests.lock().push(request);

        let mut remaining = cap;
        let pages = pages
            .into_iter()
            .map(move |page| {
                let page = page.into_iter().take(remaining).collect::<Vec<_>>();
                remaining -= page.len();
                page
            })
            .filter(|page| !page.is_empty())
            .map(Ok)
            .collect::<Vec<_>>();

        stream::iter(pages)
    }

    async fn token_balances(
        &self,
        _address: &WalletAddress,
    ) -> Result<Vec<TokenBalance>, ProviderError> {
        Ok(self.balances.as_ref().clone())
    }
}

/// In-memory [Storage] with the same watermark guard semantics as the sqlx implementation.
#[derive(Clone, Default)]
pub struct MockStorage {
    pub wallets: Arc<Mutex<HashMap<WalletAddress, WalletState>>>,
    pub transactions: Arc<Mutex<HashMap<(WalletAddress, String), TransactionRecord>>>,
    pub balances: Arc<Mutex<HashMap<WalletAddress, Vec<TokenBalance>>>>,
}

impl Storage for MockStorage {
    async fn ensure_wallet(&self, address: &WalletAddress) -> Result<WalletState, sqlx::Error> {
        Ok(self
            .wallets
            .lock()
            .entry(address.clone())
            .or_insert_with(|| WalletState::new(address.clone()))
            .clone())
    }

    async fn get_wallet(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<WalletState>, sqlx::Error> {
        Ok(self.wallets.lock().get(address).cloned())
    }

    async fn save_transactions(&self, records: &[TransactionRecord]) -> Result<u64, sqlx::Error> {
        let mut transactions = self.transactions.lock();
        let mut inserted = 0;

        for record in records {
            let key = (record.wallet_address.clone(), record.signature.clone());
            if !transactions.contains_key(&key) {
                transactions.insert(key, record.clone());
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn count_transactions(&self, address: &WalletAddress) -> Result<u64, sqlx::Error> {
        Ok(self
            .transactions
            .lock()
            .keys()
            .filter(|(a, _)| a == address)
            .count() as u64)
    }

    async fn update_watermarks(
        &self,
        address: &WalletAddress,
        newest: Option<&NewestMark>,
        oldest_ts: Option<i64>,
        fetched_at: i64,
    ) -> Result<(), sqlx::Error> {
        let mut wallets = self.wallets.lock();
        let wallet = wallets
            .entry(address.clone())
            .or_insert_with(|| WalletState::new(address.clone()));

        if let Some(newest) = newest
            && wallet
                .newest_processed_timestamp
                .is_none_or(|ts| newest.timestamp >= ts)
        {
            wallet.newest_processed_signature = Some(newest.signature.clone());
            wallet.newest_processed_timestamp = Some(newest.timestamp);
        }

        if let Some(oldest) = oldest_ts
            && wallet
                .oldest_processed_timestamp
                .is_none_or(|ts| oldest < ts)
        {
            wallet.oldest_processed_timestamp = Some(oldest);
        }

        wallet.last_successful_fetch_at = Some(fetched_at);

        Ok(())
    }

    async fn save_balances(
        &self,
        address: &WalletAddress,
        balances: &[TokenBalance],
        _fetched_at: i64,
    ) -> Result<(), sqlx::Error> {
        self.balances
            .lock()
            .insert(address.clone(), balances.to_vec());
        Ok(())
    }
}
