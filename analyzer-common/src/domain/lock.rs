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

use crate::domain::WalletAddress;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{error::Error as StdError, time::Duration};
use uuid::Uuid;

/// Key of an advisory per-wallet lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub struct LockKey(String);

impl LockKey {
    pub fn sync(address: &WalletAddress) -> Self {
        Self(format!("wallet:{address}:sync"))
    }

    pub fn pnl(address: &WalletAddress) -> Self {
        Self(format!("wallet:{address}:pnl"))
    }

    pub fn behavior(address: &WalletAddress) -> Self {
        Self(format!("wallet:{address}:behavior"))
    }

    pub fn dashboard_analysis(address: &WalletAddress) -> Self {
        Self(format!("wallet:{address}:dashboard-analysis"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Distributed advisory locks with ownership tokens and TTL. At any instant at most one valid
/// `(key, token)` pair exists per key; holders must not outlive their TTL without extending.
#[trait_variant::make(Send)]
pub trait LockStore
where
    Self: Clone + Send + Sync + 'static,
{
    type Error: StdError + Send + Sync + 'static;

    /// Atomic set-if-absent with expiry; true only if the lock was newly taken.
    async fn acquire(&self, key: &LockKey, token: Uuid, ttl: Duration)
    -> Result<bool, Self::Error>;

    /// Compare-and-delete: releases only if `token` still owns the key, so a holder cannot
    /// release another's lock after its own expiry.
    async fn release(&self, key: &LockKey, token: Uuid) -> Result<bool, Self::Error>;

    /// Refresh the expiry while `token` still owns the key.
    async fn extend(&self, key: &LockKey, token: Uuid, ttl: Duration)
    -> Result<bool, Self::Error>;

    /// Whether an unexpired lock exists for the key. Read-only probe used at submission time.
    async fn locked(&self, key: &LockKey) -> Result<bool, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_keys() {
        let address = "4Nd1mYvDgHcwXvLEvFrMvGdL7ZjPQQsjLsg8jW3hQyi1"
            .parse::<WalletAddress>()
            .expect("valid address");

        assert_eq!(
            LockKey::sync(&address).as_str(),
            "wallet:4Nd1mYvDgHcwXvLEvFrMvGdL7ZjPQQsjLsg8jW3hQyi1:sync"
        );
        assert_eq!(
            LockKey::dashboard_analysis(&address).as_str(),
            "wallet:4Nd1mYvDgHcwXvLEvFrMvGdL7ZjPQQsjLsg8jW3hQyi1:dashboard-analysis"
        );
    }
}
