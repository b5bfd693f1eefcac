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

use crate::domain::{Event, Publisher, Subscriber};
use async_stream::stream;
use dashmap::DashMap;
use futures::Stream;
use log::warn;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

const CHANNEL_CAPACITY: usize = 1_024;

/// In-process pub/sub over broadcast channels, one per topic. Used by the standalone build and
/// tests. Slow subscribers may lose messages; delivery is at-least-once for keeping up ones.
#[derive(Debug, Clone, Default)]
pub struct InMemPubSub {
    topics: Arc<DashMap<&'static str, broadcast::Sender<String>>>,
}

impl InMemPubSub {
    fn sender(&self, topic: &'static str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Publisher for InMemPubSub {
    type Error = serde_json::Error;

    async fn publish<E>(&mut self, event: &E) -> Result<(), Self::Error>
    where
        E: Event,
    {
        let message = serde_json::to_string(event)?;

        // A send error just means there are currently no subscribers.
        let _ = self.sender(E::TOPIC).send(message);

        Ok(())
    }
}

impl Subscriber for InMemPubSub {
    type Error = serde_json::Error;

    fn subscribe<E>(&self) -> impl Stream<Item = Result<E, Self::Error>> + Send + 'static
    where
        E: Event,
    {
        let receiver = self.sender(E::TOPIC).subscribe();

        stream! {
            let mut messages = BroadcastStream::new(receiver);

            while let Some(message) = messages.next().await {
                match message {
                    Ok(message) => yield serde_json::from_str::<E>(&message),

                    // Lagged; skip lost messages and keep going.
                    Err(error) => {
                        warn!(topic = E::TOPIC, error:% = error; "subscriber lagging");
                    }
                }
            }
        }
    }
}
