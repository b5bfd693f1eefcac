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

use derive_more::{AsRef, Display, Into};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A wallet has to be synced again once its last successful fetch is this old.
pub const SYNC_FRESHNESS_WINDOW: Duration = Duration::from_secs(300);

/// PNL analysis is skipped as long as the last analysis is younger than this.
pub const ANALYSIS_FRESHNESS_WINDOW: Duration = Duration::from_secs(600);

/// On-chain account address in base58 form, validated for shape only.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, AsRef, Into, Serialize, Deserialize,
)]
#[serde(try_from = "String")]
#[as_ref(str)]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = InvalidAddress;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        validate_base58(&s)?;
        Ok(Self(s))
    }
}

impl std::str::FromStr for WalletAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_owned().try_into()
    }
}

/// Token mint address; same base58 shape as [WalletAddress].
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, AsRef, Into, Serialize, Deserialize,
)]
#[serde(try_from = "String")]
#[as_ref(str)]
pub struct TokenAddress(String);

impl TokenAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TokenAddress {
    type Error = InvalidAddress;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        validate_base58(&s)?;
        Ok(Self(s))
    }
}

impl std::str::FromStr for TokenAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_owned().try_into()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid base58 address: {0}")]
pub struct InvalidAddress(String);

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

fn validate_base58(s: &str) -> Result<(), InvalidAddress> {
    let valid = (32..=44).contains(&s.len()) && s.chars().all(|c| BASE58_ALPHABET.contains(c));
    if valid {
        Ok(())
    } else {
        Err(InvalidAddress(s.to_owned()))
    }
}

/// Per-wallet sync watermarks and analysis timestamps. Timestamps are unix seconds. Only the sync
/// engine mutates the `*_processed_*` and `last_successful_fetch_at` fields, under the wallet's
/// sync lock; only the analysis coordinator mutates `last_analyzed_end_ts`, under the wallet's
/// analysis lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletState {
    pub address: WalletAddress,
    pub newest_processed_signature: Option<String>,
    pub newest_processed_timestamp: Option<i64>,
    pub oldest_processed_timestamp: Option<i64>,
    pub last_successful_fetch_at: Option<i64>,
    pub last_analyzed_end_ts: Option<i64>,
}

impl WalletState {
    pub fn new(address: WalletAddress) -> Self {
        Self {
            address,
            newest_processed_signature: None,
            newest_processed_timestamp: None,
            oldest_processed_timestamp: None,
            last_successful_fetch_at: None,
            last_analyzed_end_ts: None,
        }
    }

    /// The last successful fetch is younger than [SYNC_FRESHNESS_WINDOW].
    pub fn sync_current(&self, now: i64) -> bool {
        self.last_successful_fetch_at
            .is_some_and(|at| now - at < SYNC_FRESHNESS_WINDOW.as_secs() as i64)
    }

    /// The last analysis is younger than [ANALYSIS_FRESHNESS_WINDOW].
    pub fn analysis_current(&self, now: i64) -> bool {
        self.last_analyzed_end_ts
            .is_some_and(|at| now - at < ANALYSIS_FRESHNESS_WINDOW.as_secs() as i64)
    }

    /// Verify `oldest_processed_timestamp <= newest_processed_timestamp` whenever both are set.
    pub fn verify_watermarks(&self) -> Result<(), InconsistentWalletState> {
        match (
            self.oldest_processed_timestamp,
            self.newest_processed_timestamp,
        ) {
            (Some(oldest), Some(newest)) if oldest > newest => Err(InconsistentWalletState {
                address: self.address.clone(),
                oldest,
                newest,
            }),

            _ => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
#[error("wallet {address} has oldest processed timestamp {oldest} after newest {newest}")]
pub struct InconsistentWalletState {
    pub address: WalletAddress,
    pub oldest: i64,
    pub newest: i64,
}

/// Wallet freshness as reported to controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletStatus {
    Fresh,
    Stale,
    Missing,
}

/// Classify a wallet by the age of its last successful fetch.
pub fn classify_wallet(state: Option<&WalletState>, now: i64) -> WalletStatus {
    match state {
        None => WalletStatus::Missing,
        Some(state) if state.sync_current(now) => WalletStatus::Fresh,
        Some(_) => WalletStatus::Stale,
    }
}

/// Direction of a token flow relative to the wallet: `In` acquires the token (buy), `Out`
/// disposes of it (sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowDirection {
    In,
    Out,
}

impl FlowDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowDirection::In => "in",
            FlowDirection::Out => "out",
        }
    }
}

impl std::str::FromStr for FlowDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(FlowDirection::In),
            "out" => Ok(FlowDirection::Out),
            other => Err(format!("invalid flow direction {other}")),
        }
    }
}

/// Normalized transaction row, unique by `(wallet_address, signature)`. Amounts are denominated
/// in token units and SOL respectively; `timestamp` is unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub wallet_address: WalletAddress,
    pub signature: String,
    pub timestamp: i64,
    pub token_address: TokenAddress,
    pub direction: FlowDirection,
    pub token_amount: f64,
    pub sol_amount: f64,
}

/// Token account balance of a wallet at fetch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub token_address: TokenAddress,
    pub amount: f64,
}

/// Token metadata collected by enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub token_address: TokenAddress,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub decimals: Option<u8>,
}

/// Closed time range in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: i64,
    pub to: i64,
}

impl TimeRange {
    pub fn contains(&self, timestamp: i64) -> bool {
        self.from <= timestamp && timestamp <= self.to
    }
}
