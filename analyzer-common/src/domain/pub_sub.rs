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

use crate::domain::{JobId, QueueName};
use futures::Stream;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{convert::Infallible, error::Error as StdError};

/// An event which can be published and subscribed to under its topic.
pub trait Event
where
    Self: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    const TOPIC: &'static str;
}

/// Publisher abstraction. Delivery is at-least-once; subscribers must tolerate duplicates.
#[trait_variant::make(Send)]
pub trait Publisher
where
    Self: Clone + Send + Sync + 'static,
{
    type Error: StdError + Send + Sync + 'static;

    async fn publish<E>(&mut self, event: &E) -> Result<(), Self::Error>
    where
        E: Event;
}

/// Subscriber abstraction. Subscription streams own their resources and outlive the borrow.
pub trait Subscriber
where
    Self: Clone + Send + Sync + 'static,
{
    type Error: StdError + Send + Sync + 'static;

    fn subscribe<E>(&self) -> impl Stream<Item = Result<E, Self::Error>> + Send + 'static + use<Self, E>
    where
        E: Event;
}

/// Progress update for an active job attempt. Values are best-effort monotonic per job; events
/// may be duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgressed {
    pub job_id: JobId,
    pub queue: QueueName,
    pub value: u8,
    pub timestamp: i64,
}

impl Event for JobProgressed {
    const TOPIC: &'static str = "job-progressed";
}

/// Terminal success event, published after the completed job record is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: JobId,
    pub queue: QueueName,
    pub result: serde_json::Value,
    pub duration_ms: u64,
    pub timestamp: i64,
}

impl Event for JobCompleted {
    const TOPIC: &'static str = "job-completed";
}

/// Terminal failure event, published after the dead job record is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailed {
    pub job_id: JobId,
    pub queue: QueueName,
    pub error: String,
    pub timestamp: i64,
}

impl Event for JobFailed {
    const TOPIC: &'static str = "job-failed";
}

/// No-op subscriber yielding no events, e.g. for services without subscriptions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSubscriber;

impl Subscriber for NoopSubscriber {
    type Error = Infallible;

    fn subscribe<E>(&self) -> impl Stream<Item = Result<E, Self::Error>> + Send + 'static
    where
        E: Event,
    {
        futures::stream::pending()
    }
}
