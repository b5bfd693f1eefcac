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

//! Mock storage and metadata source shared by the tests of this crate.

use crate::domain::{
    BehaviorProfile, MetadataError, MetadataSource, PnlTokenResult, storage::Storage,
};
use analyzer_common::domain::{
    FlowDirection, TokenAddress, TokenMetadata, TransactionRecord, WalletAddress, WalletState,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

pub const ADDR: &str = "4Nd1mYvDgHcwXvLEvFrMvGdL7ZjPQQsjLsg8jW3hQyi1";
pub const MINT: &str = "So11111111111111111111111111111111111111112";

pub fn address() -> WalletAddress {
    ADDR.parse().expect("valid address")
}

pub fn mint() -> TokenAddress {
    MINT.parse().expect("valid mint")
}

pub fn record(
    signature: &str,
    timestamp: i64,
    direction: FlowDirection,
    token_amount: f64,
    sol_amount: f64,
) -> TransactionRecord {
    TransactionRecord {
        wallet_address: address(),
        signature: signature.to_string(),
        timestamp,
        token_address: mint(),
        direction,
        token_amount,
        sol_amount,
    }
}

pub fn record_for_mint(
    signature: &str,
    timestamp: i64,
    direction: FlowDirection,
    token_address: TokenAddress,
) -> TransactionRecord {
    TransactionRecord {
        token_address,
        ..record(signature, timestamp, direction, 1.0, 0.1)
    }
}

#[derive(Clone, Default)]
pub struct MockStorage {
    pub wallets: Arc<Mutex<HashMap<WalletAddress, WalletState>>>,
    pub transactions: Arc<Mutex<HashMap<WalletAddress, Vec<TransactionRecord>>>>,
    pub pnl_results: Arc<Mutex<HashMap<WalletAddress, Vec<PnlTokenResult>>>>,
    pub behavior_profiles: Arc<Mutex<HashMap<WalletAddress, BehaviorProfile>>>,
    pub token_metadata: Arc<Mutex<HashMap<TokenAddress, TokenMetadata>>>,
}

impl MockStorage {
    pub fn with_wallet(self, wallet: WalletState) -> Self {
        self.wallets.lock().insert(wallet.address.clone(), wallet);
        self
    }

    pub fn with_transactions(self, address: &WalletAddress, records: Vec<TransactionRecord>) -> Self {
        self.transactions.lock().insert(address.clone(), records);
        self
    }
}

impl Storage for MockStorage {
    async fn get_wallet(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<WalletState>, sqlx::Error> {
        Ok(self.wallets.lock().get(address).cloned())
    }

    async fn get_transactions(
        &self,
        address: &WalletAddress,
    ) -> Result<Vec<TransactionRecord>, sqlx::Error> {
        let mut records = self
            .transactions
            .lock()
            .get(address)
            .cloned()
            .unwrap_or_default();
        records.sort_by(|a, b| {
            (a.timestamp, a.signature.clone()).cmp(&(b.timestamp, b.signature.clone()))
        });

        Ok(records)
    }

    async fn save_pnl_results(
        &self,
        address: &WalletAddress,
        results: &[PnlTokenResult],
        _computed_at: i64,
    ) -> Result<(), sqlx::Error> {
        self.pnl_results
            .lock()
            .insert(address.clone(), results.to_vec());
        Ok(())
    }

    async fn save_behavior_profile(
        &self,
        profile: &BehaviorProfile,
        _computed_at: i64,
    ) -> Result<(), sqlx::Error> {
        self.behavior_profiles
            .lock()
            .insert(profile.wallet_address.clone(), profile.clone());
        Ok(())
    }

    async fn set_last_analyzed(
        &self,
        address: &WalletAddress,
        analyzed_at: i64,
    ) -> Result<(), sqlx::Error> {
        let mut wallets = self.wallets.lock();
        let wallet = wallets
            .entry(address.clone())
            .or_insert_with(|| WalletState::new(address.clone()));
        wallet.last_analyzed_end_ts = Some(analyzed_at);

        Ok(())
    }

    async fn get_result_tokens(
        &self,
        address: &WalletAddress,
    ) -> Result<Vec<TokenAddress>, sqlx::Error> {
        let mut tokens = self
            .pnl_results
            .lock()
            .get(address)
            .map(|results| {
                results
                    .iter()
                    .map(|result| result.token_address.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        tokens.sort();
        tokens.dedup();

        Ok(tokens)
    }

    async fn save_token_metadata(
        &self,
        metadata: &[TokenMetadata],
        _enriched_at: i64,
    ) -> Result<(), sqlx::Error> {
        let mut token_metadata = self.token_metadata.lock();
        for entry in metadata {
            token_metadata.insert(entry.token_address.clone(), entry.clone());
        }

        Ok(())
    }
}

/// Yields metadata for every token; fails for tokens listed in `failing`.
#[derive(Clone, Default)]
pub struct MockMetadataSource {
    pub failing: Arc<Vec<TokenAddress>>,
}

impl MetadataSource for MockMetadataSource {
    async fn token_metadata(
        &self,
        token: &TokenAddress,
    ) -> Result<TokenMetadata, MetadataError> {
        if self.failing.contains(token) {
            return Err(MetadataError::Transient(
                format!("metadata unavailable for {token}").into(),
            ));
        }

        Ok(TokenMetadata {
            token_address: token.clone(),
            symbol: Some("TOK".to_string()),
            name: Some("Token".to_string()),
            decimals: Some(9),
        })
    }
}
