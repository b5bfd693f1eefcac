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

use analyzer_common::domain::{TokenBalance, TransactionRecord, WalletAddress, WalletState};

/// Newest transaction of a sync phase: signature and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewestMark {
    pub signature: String,
    pub timestamp: i64,
}

/// Storage abstraction for wallet state and the local transaction store.
#[trait_variant::make(Send)]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Get the wallet state, creating the wallet on first contact.
    async fn ensure_wallet(&self, address: &WalletAddress) -> Result<WalletState, sqlx::Error>;

    async fn get_wallet(&self, address: &WalletAddress)
    -> Result<Option<WalletState>, sqlx::Error>;

    /// Upsert transactions by `(wallet_address, signature)`, silently skipping duplicates.
    /// Returns the number of newly inserted rows.
    async fn save_transactions(&self, records: &[TransactionRecord]) -> Result<u64, sqlx::Error>;

    async fn count_transactions(&self, address: &WalletAddress) -> Result<u64, sqlx::Error>;

    /// Advance the wallet watermarks after a sync phase. The newest watermark only ever moves
    /// forward and the oldest only backward; `last_successful_fetch_at` is always set.
    async fn update_watermarks(
        &self,
        address: &WalletAddress,
        newest: Option<&NewestMark>,
        oldest_ts: Option<i64>,
        fetched_at: i64,
    ) -> Result<(), sqlx::Error>;

    /// Replace the stored token balances of the wallet.
    async fn save_balances(
        &self,
        address: &WalletAddress,
        balances: &[TokenBalance],
        fetched_at: i64,
    ) -> Result<(), sqlx::Error>;
}
