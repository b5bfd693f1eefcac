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

use crate::domain::{BehaviorProfile, PnlTokenResult};
use analyzer_common::domain::{
    TokenAddress, TokenMetadata, TransactionRecord, WalletAddress, WalletState,
};

/// Storage abstraction for analysis inputs and results.
#[trait_variant::make(Send)]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    async fn get_wallet(&self, address: &WalletAddress)
    -> Result<Option<WalletState>, sqlx::Error>;

    /// All locally stored transactions of the wallet, ordered by `(timestamp, signature)`.
    async fn get_transactions(
        &self,
        address: &WalletAddress,
    ) -> Result<Vec<TransactionRecord>, sqlx::Error>;

    /// Replace the wallet's per-token PNL results.
    async fn save_pnl_results(
        &self,
        address: &WalletAddress,
        results: &[PnlTokenResult],
        computed_at: i64,
    ) -> Result<(), sqlx::Error>;

    /// Upsert the wallet's behavior profile.
    async fn save_behavior_profile(
        &self,
        profile: &BehaviorProfile,
        computed_at: i64,
    ) -> Result<(), sqlx::Error>;

    /// Record the end of a successful analysis run; input to the staleness policy.
    async fn set_last_analyzed(
        &self,
        address: &WalletAddress,
        analyzed_at: i64,
    ) -> Result<(), sqlx::Error>;

    /// Token addresses present in the wallet's stored analysis results.
    async fn get_result_tokens(
        &self,
        address: &WalletAddress,
    ) -> Result<Vec<TokenAddress>, sqlx::Error>;

    /// Upsert enriched token metadata.
    async fn save_token_metadata(
        &self,
        metadata: &[TokenMetadata],
        enriched_at: i64,
    ) -> Result<(), sqlx::Error>;
}
