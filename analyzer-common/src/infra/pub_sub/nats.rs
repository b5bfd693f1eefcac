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
use async_nats::{Client, ConnectError, ConnectOptions, PublishError, SubscribeError};
use async_stream::stream;
use futures::{Stream, StreamExt};
use log::warn;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

const SUBJECT_PREFIX: &str = "analyzer";

/// NATS based pub/sub implementation, one subject per event topic.
#[derive(Clone)]
pub struct NatsPubSub {
    client: Client,
}

impl NatsPubSub {
    /// Create a new pub/sub instance with the given configuration.
    pub async fn new(config: Config) -> Result<Self, ConnectError> {
        let Config {
            url,
            username,
            password,
        } = config;

        let options = ConnectOptions::new()
            .user_and_password(username, password.expose_secret().to_owned());
        let client = options.connect(url).await?;

        Ok(Self { client })
    }
}

fn subject<E>() -> String
where
    E: Event,
{
    format!("{SUBJECT_PREFIX}.{}", E::TOPIC)
}

impl Publisher for NatsPubSub {
    type Error = NatsPubSubError;

    async fn publish<E>(&mut self, event: &E) -> Result<(), Self::Error>
    where
        E: Event,
    {
        let payload = serde_json::to_vec(event)?;

        self.client
            .publish(subject::<E>(), payload.into())
            .await
            .map_err(NatsPubSubError::Publish)
    }
}

impl Subscriber for NatsPubSub {
    type Error = NatsPubSubError;

    fn subscribe<E>(&self) -> impl Stream<Item = Result<E, Self::Error>> + Send + 'static
    where
        E: Event,
    {
        let client = self.client.clone();

        stream! {
            let messages = client.subscribe(subject::<E>()).await;

            let mut messages = match messages {
                Ok(messages) => messages,
                Err(error) => {
                    yield Err(NatsPubSubError::Subscribe(error));
                    return;
                }
            };

            while let Some(message) = messages.next().await {
                match serde_json::from_slice::<E>(&message.payload) {
                    Ok(event) => yield Ok(event),

                    // Malformed events are skipped, not fatal.
                    Err(error) => {
                        warn!(topic = E::TOPIC, error:% = error; "cannot deserialize event");
                    }
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum NatsPubSubError {
    #[error("cannot serialize event")]
    Serialize(#[from] serde_json::Error),

    #[error("cannot publish event")]
    Publish(#[source] PublishError),

    #[error("cannot subscribe to subject")]
    Subscribe(#[source] SubscribeError),
}

/// Configuration settings for [NatsPubSub].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub url: String,
    pub username: String,
    pub password: SecretString,
}
