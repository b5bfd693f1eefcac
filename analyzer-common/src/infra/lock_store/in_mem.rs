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

use crate::domain::{LockKey, LockStore, unix_millis};
use parking_lot::Mutex;
use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Duration};
use uuid::Uuid;

/// In-memory lock store, mainly for tests and examples. Single-process only.
#[derive(Debug, Clone, Default)]
pub struct InMemLockStore {
    locks: Arc<Mutex<HashMap<LockKey, (Uuid, i64)>>>,
}

impl LockStore for InMemLockStore {
    type Error = Infallible;

    async fn acquire(
        &self,
        key: &LockKey,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        let now = unix_millis();
        let mut locks = self.locks.lock();

        let held = locks
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > now);
        if held {
            return Ok(false);
        }

        locks.insert(key.clone(), (token, now + ttl.as_millis() as i64));
        Ok(true)
    }

    async fn release(&self, key: &LockKey, token: Uuid) -> Result<bool, Self::Error> {
        let mut locks = self.locks.lock();

        let owned = locks.get(key).is_some_and(|(owner, _)| *owner == token);
        if owned {
            locks.remove(key);
        }

        Ok(owned)
    }

    async fn extend(&self, key: &LockKey, token: Uuid, ttl: Duration) -> Result<bool, Self::Error> {
        let now = unix_millis();
        let mut locks = self.locks.lock();

        match locks.get_mut(key) {
            Some((owner, expires_at)) if *owner == token && *expires_at > now => {
                *expires_at = now + ttl.as_millis() as i64;
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    async fn locked(&self, key: &LockKey) -> Result<bool, Self::Error> {
        let now = unix_millis();
        Ok(self
            .locks
            .lock()
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > now))
    }
}
